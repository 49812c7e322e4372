use super::command::CommandParseError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The caller asked for something malformed; nothing was changed
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<CommandParseError> for EngineError {
    fn from(e: CommandParseError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn device_not_found(id: &str) -> Self {
        EngineError::NotFound(format!("device '{}'", id))
    }
}
