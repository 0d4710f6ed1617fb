use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider {provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error("Provider {provider} timed out after {timeout_ms}ms")]
    Timeout {
        provider: &'static str,
        timeout_ms: u64,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid alert transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        Error::Provider {
            provider,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
