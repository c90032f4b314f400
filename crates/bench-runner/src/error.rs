use thiserror::Error;

pub type Result<T> = std::result::Result<T, CollectError>;

#[derive(Debug, Error)]
pub enum CollectError {
    /// An external command exited non-zero.
    #[error("command `{command}` failed with status {status}\nstdout: {stdout}\nstderr: {stderr}")]
    Command {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    /// An external command could not be launched at all.
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The metrics backend answered, but not with success.
    #[error("metrics backend error: {0}")]
    Backend(String),

    #[error("metrics backend transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metric `{metric}` missing from {context}")]
    MissingMetric { metric: String, context: String },

    #[error("cleanup of {context} failed: {message}")]
    Cleanup { context: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse output of {what}: {message}")]
    Parse { what: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{mechanism} trial {trial} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        mechanism: String,
        trial: u32,
        attempts: u32,
        #[source]
        source: Box<CollectError>,
    },
}

impl CollectError {
    /// Whether the attempt loop may retry the trial after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollectError::Command { .. }
            | CollectError::Spawn { .. }
            | CollectError::Backend(_)
            | CollectError::Http(_)
            | CollectError::MissingMetric { .. }
            | CollectError::Cleanup { .. }
            | CollectError::Parse { .. }
            | CollectError::Io(_) => true,
            CollectError::Config(_)
            | CollectError::Csv(_)
            | CollectError::RetriesExhausted { .. } => false,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        CollectError::Config(message.into())
    }

    pub(crate) fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        CollectError::Parse {
            what: what.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_and_missing_metric_errors_are_retryable() {
        let err = CollectError::Command {
            command: "docker rm x".to_string(),
            status: "1".to_string(),
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert!(err.is_retryable());
        let err = CollectError::MissingMetric {
            metric: "instructions".to_string(),
            context: "container trial 1".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn config_errors_abort_immediately() {
        assert!(!CollectError::config("trials must be positive").is_retryable());
    }

    #[test]
    fn command_error_message_carries_captured_output() {
        let err = CollectError::Command {
            command: "cgcreate -g memory:custom".to_string(),
            status: "96".to_string(),
            stdout: "out".to_string(),
            stderr: "cgroup exists".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cgcreate -g memory:custom"), "{}", msg);
        assert!(msg.contains("cgroup exists"), "{}", msg);
    }
}
