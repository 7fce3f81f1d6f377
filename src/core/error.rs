use thiserror::Error;

use crate::ai_provider::ProviderError;
use crate::core::letter::LetterStatus;

#[derive(Error, Debug)]
pub enum LetterError {
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Letter not found: {0}")]
    NotFound(String),

    #[error("Letter already exists: {0}")]
    Duplicate(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: LetterStatus, to: LetterStatus },

    #[error("Daily request limit reached for {user_id} ({limit} per day)")]
    RateLimited { user_id: String, limit: u32 },

    #[error("Affinity {current} is below the required {required}")]
    AffinityTooLow { current: u8, required: u8 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, LetterError>;
