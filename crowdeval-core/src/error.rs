//! Error types for the crowdeval-core crate.

use thiserror::Error;

/// Top-level error type for pipeline operations.
///
/// Every variant is terminal for the run that produced it; nothing in the
/// pipeline retries.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A dataset record is malformed or incomplete. `record` identifies the
    /// offending row as `<source>#<index>`.
    #[error("Data format error in {record}: {message}")]
    DataFormat { record: String, message: String },

    /// Out-of-memory or storage-full while training or evaluating.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The checkpoint path is invalid or incompatible with the requested model.
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub fn data_format(record: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataFormat {
            record: record.into(),
            message: message.into(),
        }
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Classify an IO failure: a full disk is resource exhaustion, anything
    /// else stays a plain IO error.
    pub fn from_write_failure(err: std::io::Error) -> Self {
        if is_storage_full(&err) {
            Self::ResourceExhausted(format!("storage full: {err}"))
        } else {
            Self::Io(err)
        }
    }

    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DataFormat { .. } => 2,
            Self::ModelLoad(_) => 3,
            Self::ResourceExhausted(_) => 4,
            _ => 1,
        }
    }
}

fn is_storage_full(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    // ENOSPC on unix
    err.raw_os_error() == Some(28)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_format_display_names_record() {
        let err = PipelineError::data_format("train.csv#3", "missing field `observed_count`");
        let msg = err.to_string();
        assert!(msg.contains("train.csv#3"));
        assert!(msg.contains("observed_count"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(PipelineError::model_load("x").exit_code(), 3);
        assert_eq!(PipelineError::resource_exhausted("oom").exit_code(), 4);
        assert_eq!(PipelineError::training("x").exit_code(), 1);
    }

    #[test]
    fn test_storage_full_classification() {
        let err = std::io::Error::from_raw_os_error(28);
        assert!(matches!(
            PipelineError::from_write_failure(err),
            PipelineError::ResourceExhausted(_)
        ));
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            PipelineError::from_write_failure(err),
            PipelineError::Io(_)
        ));
    }
}
