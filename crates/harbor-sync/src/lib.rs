mod error;
mod orchestrator;
mod service;

pub use error::SyncError;
pub use orchestrator::{SyncOrchestrator, SyncOutcome, SyncPhase, SyncProgress};
pub use service::{MailService, SendRequest, SendRequestAttachment, ThreadDetail};
