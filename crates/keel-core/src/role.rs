use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of each worker in the multi-agent system.
///
/// The set is closed: every role maps to exactly one policy, and adding a
/// role forces every policy table to be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Writes and modifies source code.
    Coder,
    /// Runs tests inside sandboxed containers.
    Tester,
    /// Reviews changes; read-only.
    Critic,
    /// Gathers external information over allowlisted HTTP.
    Researcher,
    /// Produces design documents.
    Architect,
    /// Operates the running system (deploys, rollbacks).
    Admin,
}

impl Role {
    /// Every role, in declaration order.
    pub const ALL: [Role; 6] = [
        Role::Coder,
        Role::Tester,
        Role::Critic,
        Role::Researcher,
        Role::Architect,
        Role::Admin,
    ];

    /// The lowercase name used in config and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Coder => "coder",
            Role::Tester => "tester",
            Role::Critic => "critic",
            Role::Researcher => "researcher",
            Role::Architect => "architect",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a role tag does not name a known role.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid role '{0}'")]
pub struct InvalidRole(pub String);

impl FromStr for Role {
    type Err = InvalidRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| InvalidRole(s.to_string()))
    }
}
