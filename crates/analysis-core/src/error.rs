use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A required collaborator or setting is missing or out of range.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Insufficient data: have {have} bars, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A feed, executor, indicator or persistence call failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// A component produced output that breaks its contract.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    pub fn collaborator(collaborator: &'static str, err: impl std::fmt::Display) -> Self {
        EngineError::Collaborator {
            collaborator,
            message: err.to_string(),
        }
    }
}
