use crate::policy::{Policy, ResourceLimits};
use keel_core::{Role, ToolKind};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Patterns denied for every role, whatever its configured policy says.
///
/// Matched against [`keel_core::ToolCall::literal`], so a git call reads
/// `git push --force origin main` and a shell call reads
/// `shell exec <command>`.
const BASELINE_DENIED: &[&str] = &[
    // Irreversible history rewrites, through the git tool or a shell.
    // Long options match any abbreviation git would accept.
    r"\bgit\s+push\b.*\s(--(f|fo|for|forc|force(-\S*)?|m(i(r(r(or?)?)?)?)?|d(e(l(e(te?)?)?)?)?|pru(ne?)?)|-[a-zA-Z]*[fd][a-zA-Z]*)(\s|=|$)",
    // Forced (`+ref`) and deleting (`:ref`) refspecs.
    r"\bgit\s+push\b.*\s\+\S",
    r"\bgit\s+push\b.*\s:\S",
    r"\bgit\s+(filter-branch|filter-repo)\b",
    r"\bgit\s+reflog\s+(expire|delete)\b",
    r"\bgit\s+update-ref\s+-d\b",
    r"\bgit\s+gc\b.*--prune=now",
    // Processes that bind listening sockets.
    r"^(shell|container)\s.*\b(nc|ncat|netcat)\b[^|;&]*\s(-[a-zA-Z]*l|--listen)",
    r"^(shell|container)\s.*\bsocat\b.*(TCP|UDP)[46]?-LISTEN",
    r"^(shell|container)\s.*\bpython[0-9.]*\s+-m\s+(http\.server|SimpleHTTPServer)",
    r"^(shell|container)\s.*\bphp\s+-S\b",
    r"^(shell|container)\s.*\b(sshd|telnetd|inetd|httpd)\b",
    r"^(shell|container)\s.*\bssh\b.*\s-[a-zA-Z]*R\s",
    r"^(shell|container|script)\s.*\.(listen|bind)\s*\(",
    // Destructive system commands.
    r"\brm\s+-[a-zA-Z]*(rf|fr)[a-zA-Z]*\s+/(\*|\s|$)",
    r"\bmkfs(\.\w+)?\b",
    r"\bdd\s+if=",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
];

/// Outbound network access from a shell, denied to roles that must not
/// reach the network.
const NO_NETWORK: &[&str] = &[
    r"^(shell|script)\s.*\b(curl|wget|nc|ncat|netcat|socat|scp|sftp|ssh|rsync|ftp|telnet)\b",
    r"^(shell|script)\s.*/dev/(tcp|udp)/",
    r"^shell\s.*\bopenssl\s+s_client\b",
    // Interpreter one-liners can open sockets without naming a client.
    r"^shell\s.*\b(python[0-9.]*\s+(-\S+\s+)*-[a-zA-Z]*c|perl\s+(-\S+\s+)*-[a-zA-Z]*[eE]|ruby\s+(-\S+\s+)*-[a-zA-Z]*e|node\s+(-\S+\s+)*(-e|--eval|-p|--print)|php\s+(-\S+\s+)*-r)\b",
    // Nested shells and eval hide the real command from these patterns.
    r"^shell\s.*(\|\s*(sh|bash|zsh|dash|ksh)\b|\b(sh|bash|zsh|dash|ksh)\s+-[a-zA-Z]*c\b|\beval\b)",
];

/// The baseline denied patterns appended to every compiled policy.
pub fn baseline_denied_patterns() -> &'static [&'static str] {
    BASELINE_DENIED
}

/// The built-in role -> policy table.
pub fn default_policies() -> BTreeMap<Role, Policy> {
    Role::ALL
        .into_iter()
        .map(|role| (role, default_policy(role)))
        .collect()
}

/// The built-in policy for one role.
pub fn default_policy(role: Role) -> Policy {
    match role {
        Role::Coder => coder_policy(),
        Role::Tester => tester_policy(),
        Role::Critic => critic_policy(),
        Role::Researcher => researcher_policy(),
        Role::Architect => architect_policy(),
        Role::Admin => admin_policy(),
    }
}

fn coder_policy() -> Policy {
    Policy {
        allowed_tools: tools(&[ToolKind::Fs, ToolKind::Shell, ToolKind::Git, ToolKind::Script]),
        allowed_subcommands: subcommands(&[
            (
                ToolKind::Fs,
                &["read", "write", "append", "list", "mkdir", "exists"],
            ),
            (ToolKind::Shell, &["exec"]),
            (
                ToolKind::Git,
                &[
                    "status", "diff", "log", "show", "add", "commit", "branch", "checkout",
                    "switch", "stash", "restore", "rev-parse",
                ],
            ),
            (ToolKind::Script, &["run"]),
        ]),
        denied_patterns: no_network(),
        network_allowlist: Vec::new(),
        write_roots: roots(&["/workspace", "/code"]),
        resource_limits: ResourceLimits {
            cpus: 1.0,
            memory_mb: 1024,
            timeout_ms: 120_000,
        },
    }
}

fn tester_policy() -> Policy {
    Policy {
        // No host shell: tests run in the container tool.
        allowed_tools: tools(&[
            ToolKind::Fs,
            ToolKind::Git,
            ToolKind::Container,
            ToolKind::Script,
        ]),
        allowed_subcommands: subcommands(&[
            (ToolKind::Fs, &["read", "list", "exists"]),
            (ToolKind::Git, &["status", "diff", "log", "show"]),
            (ToolKind::Container, &["run"]),
            (ToolKind::Script, &["run"]),
        ]),
        denied_patterns: no_network(),
        network_allowlist: Vec::new(),
        write_roots: Vec::new(),
        resource_limits: ResourceLimits {
            cpus: 2.0,
            memory_mb: 2048,
            timeout_ms: 300_000,
        },
    }
}

fn critic_policy() -> Policy {
    Policy {
        allowed_tools: tools(&[ToolKind::Fs, ToolKind::Git]),
        allowed_subcommands: subcommands(&[
            (ToolKind::Fs, &["read", "list", "exists"]),
            (ToolKind::Git, &["status", "diff", "log", "show", "blame"]),
        ]),
        denied_patterns: Vec::new(),
        network_allowlist: Vec::new(),
        write_roots: Vec::new(),
        resource_limits: ResourceLimits {
            cpus: 0.5,
            memory_mb: 256,
            timeout_ms: 30_000,
        },
    }
}

fn researcher_policy() -> Policy {
    Policy {
        allowed_tools: tools(&[ToolKind::Fs, ToolKind::Http]),
        allowed_subcommands: subcommands(&[
            (ToolKind::Fs, &["read", "list", "exists"]),
            (ToolKind::Http, &["get", "head"]),
        ]),
        denied_patterns: Vec::new(),
        network_allowlist: [
            "docs.rs",
            "crates.io",
            "doc.rust-lang.org",
            "github.com",
            "raw.githubusercontent.com",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect(),
        write_roots: Vec::new(),
        resource_limits: ResourceLimits {
            cpus: 0.5,
            memory_mb: 256,
            timeout_ms: 30_000,
        },
    }
}

fn architect_policy() -> Policy {
    Policy {
        allowed_tools: tools(&[ToolKind::Fs, ToolKind::Git]),
        allowed_subcommands: subcommands(&[
            (ToolKind::Fs, &["read", "list", "exists", "write", "mkdir"]),
            (ToolKind::Git, &["status", "diff", "log", "show"]),
        ]),
        denied_patterns: Vec::new(),
        network_allowlist: Vec::new(),
        write_roots: roots(&["/workspace/docs"]),
        resource_limits: ResourceLimits {
            cpus: 0.5,
            memory_mb: 256,
            timeout_ms: 30_000,
        },
    }
}

fn admin_policy() -> Policy {
    Policy {
        allowed_tools: tools(&ToolKind::ALL),
        allowed_subcommands: subcommands(&[
            (ToolKind::Fs, &["*"]),
            (ToolKind::Shell, &["exec"]),
            (ToolKind::Git, &["*"]),
            (ToolKind::Container, &["*"]),
            (ToolKind::Http, &["*"]),
            (ToolKind::Script, &["*"]),
        ]),
        denied_patterns: Vec::new(),
        network_allowlist: vec!["*".to_string()],
        write_roots: roots(&["/workspace", "/code", "/srv/keel"]),
        resource_limits: ResourceLimits {
            cpus: 2.0,
            memory_mb: 2048,
            timeout_ms: 600_000,
        },
    }
}

fn no_network() -> Vec<String> {
    NO_NETWORK.iter().map(|p| (*p).to_string()).collect()
}

fn tools(kinds: &[ToolKind]) -> std::collections::BTreeSet<ToolKind> {
    kinds.iter().copied().collect()
}

fn subcommands(entries: &[(ToolKind, &[&str])]) -> BTreeMap<ToolKind, Vec<String>> {
    entries
        .iter()
        .map(|(tool, ops)| (*tool, ops.iter().map(|o| (*o).to_string()).collect()))
        .collect()
}

fn roots(paths: &[&str]) -> Vec<PathBuf> {
    paths.iter().map(PathBuf::from).collect()
}
