mod error;
mod keychain;
mod oauth;

pub use error::SecurityError;
pub use keychain::{SecretKey, SecretStore};
pub use oauth::{OAuthPkceSession, OAuthTokenResult, OAuthWorkflow};
