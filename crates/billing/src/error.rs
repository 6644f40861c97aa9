//! Billing error types

use thiserror::Error;

/// Entitlement and store-integration errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid product: {0}")]
    InvalidProduct(String),

    #[error("Receipt invalid: {0}")]
    ReceiptInvalid(String),

    #[error("Store service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Store authentication failed: {0}")]
    AuthFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Subscription belongs to another user: {0}")]
    IdentityMismatch(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the same request may succeed if simply tried again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable(_) | Self::ConcurrentModification(_) | Self::Database(_)
        )
    }

    /// Whether the caller sent something that will never succeed as-is
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidProduct(_)
                | Self::ReceiptInvalid(_)
                | Self::NotFound(_)
                | Self::IdentityMismatch(_)
                | Self::InvalidInput(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // 23505 = unique_violation: another writer created the same row first
            if db_err.code().as_deref() == Some("23505") {
                return BillingError::ConcurrentModification(db_err.message().to_string());
            }
        }
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::ServiceUnavailable(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for BillingError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        BillingError::ReceiptInvalid(format!("signature verification failed: {err}"))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
