use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("provider session is not connected")]
    NotConnected,
    #[error("sync cursor rejected: {0}")]
    CursorInvalid(String),
    #[error("send rejected: {0}")]
    Send(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("mail parse error: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("invalid data: {0}")]
    Data(String),
}

impl ProviderError {
    /// Errors after which no further call on the same session can succeed.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Auth(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Connection(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Self::Data(format!("unexpected response body: {err}"))
        } else {
            Self::Connection(err.to_string())
        }
    }
}

impl From<harbor_security::SecurityError> for ProviderError {
    fn from(err: harbor_security::SecurityError) -> Self {
        Self::Auth(err.to_string())
    }
}

impl From<imap::Error> for ProviderError {
    fn from(err: imap::Error) -> Self {
        match err {
            imap::Error::No(response) => Self::Data(format!("imap server refused: {}", response.information)),
            imap::Error::Bad(response) => Self::Data(format!("imap server rejected command: {}", response.information)),
            other => Self::Connection(format!("imap error: {other}")),
        }
    }
}
