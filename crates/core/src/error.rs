use thiserror::Error;

/// Shared error type used across all ledger crates.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to generate a unique referral code after {0} attempts")]
    CodeGenerationExhausted(u32),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Invalid payment status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] eyre::Error),
}

impl AppError {
    /// Whether the caller should retry the whole operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Database(_))
    }
}
