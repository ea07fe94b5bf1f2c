use analysis_core::EngineError;
use thiserror::Error;

use crate::state::LoopState;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Cannot {action} a decision loop that is {state}")]
    InvalidTransition {
        action: &'static str,
        state: LoopState,
    },
}

impl AgentError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, AgentError::Engine(EngineError::Configuration(_)))
    }
}
