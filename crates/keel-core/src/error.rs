use thiserror::Error;

/// A convenience `Result` alias using [`KeelError`].
pub type KeelResult<T> = Result<T, KeelError>;

/// Top-level error type for the Keel platform.
///
/// Each variant corresponds to a subsystem that can produce errors. Errors
/// returned by tools are infrastructure failures; application-level failures
/// travel inside a [`ToolResult`](crate::ToolResult) instead.
#[derive(Error, Debug)]
pub enum KeelError {
    /// The task graph rejected an operation.
    #[error("Graph error: {0}")]
    Graph(String),

    /// The scheduler actor is gone or rejected a command.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Policy configuration could not be compiled.
    #[error("Policy error: {0}")]
    Policy(String),

    /// A tool failed before it could produce a result.
    #[error("Tool error: {0}")]
    Tool(String),

    /// The container runtime is unavailable or misbehaved.
    #[error("Container error: {0}")]
    Container(String),

    /// The self-improvement controller rejected an operation.
    #[error("Improvement error: {0}")]
    Improvement(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_prefixes_subsystem() {
        let err = KeelError::Policy("bad regex".into());
        assert_eq!(err.to_string(), "Policy error: bad regex");
    }

    #[test]
    fn test_io_error_converts() {
        fn open() -> KeelResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(open(), Err(KeelError::Io(_))));
    }
}
