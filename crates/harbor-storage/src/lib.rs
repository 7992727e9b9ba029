mod error;
mod mail;
mod storage;

pub use error::StorageError;
pub use mail::{MessageState, ReconcileStats};
pub use storage::Storage;
