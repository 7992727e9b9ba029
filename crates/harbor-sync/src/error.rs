use harbor_email::ProviderError;
use harbor_security::SecurityError;
use harbor_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("security error: {0}")]
    Security(#[from] SecurityError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid account: {0}")]
    InvalidAccount(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
