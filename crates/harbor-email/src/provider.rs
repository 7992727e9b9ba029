use crate::{GmailAuth, GmailProvider, GraphAuth, GraphProvider, ImapProvider, ProviderError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use harbor_core::{
    Account, MailAddress, MailFolder, OAuthCredentials, ProviderKind, SyncCursor, SyncResult,
};
use harbor_security::{OAuthPkceSession, OAuthWorkflow};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Tokens expiring within this window are refreshed before use.
const TOKEN_REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub initial_sync_limit: u32,
    pub incremental_page_limit: u32,
    pub request_timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            initial_sync_limit: 100,
            incremental_page_limit: 10,
            request_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// Identity of the message being answered, resolved from the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyContext {
    pub external_id: String,
    pub thread_external_id: String,
    pub message_id_header: Option<String>,
    pub references: Option<String>,
}

impl ReplyContext {
    /// `References` for the reply: the parent's chain followed by the parent's own id.
    pub fn references_header(&self) -> Option<String> {
        let chain = self
            .references
            .iter()
            .chain(self.message_id_header.iter())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>();

        if chain.is_empty() {
            None
        } else {
            Some(chain.join(" "))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendParams {
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<OutgoingAttachment>,
    pub reply_to: Option<ReplyContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationFailure {
    pub external_id: String,
    pub reason: String,
}

/// Per-id outcome of a batch mutation. Ids are processed independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<MutationFailure>,
}

impl MutationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn record(&mut self, external_id: &str, outcome: Result<(), ProviderError>) -> Result<(), ProviderError> {
        match outcome {
            Ok(()) => {
                self.succeeded.push(external_id.to_string());
                Ok(())
            }
            Err(err) if err.is_session_fatal() => Err(err),
            Err(err) => {
                tracing::warn!(%external_id, error = %err, "mutation failed for message");
                self.failed.push(MutationFailure {
                    external_id: external_id.to_string(),
                    reason: err.to_string(),
                });
                Ok(())
            }
        }
    }
}

/// Runs `op` for every id in order and collects a [`MutationReport`]. A session-fatal
/// error stops the batch and is returned instead.
pub(crate) async fn for_each_message<F, Fut>(
    external_ids: &[String],
    op: F,
) -> Result<MutationReport, ProviderError>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProviderError>> + Send,
{
    let mut report = MutationReport::default();
    for external_id in external_ids {
        let outcome = op(external_id.clone()).await;
        report.record(external_id, outcome)?;
    }
    Ok(report)
}

/// Tokens and identity returned by a completed OAuth consent.
#[derive(Debug, Clone)]
pub struct OAuthGrant {
    pub credentials: OAuthCredentials,
    pub email_address: String,
    pub display_name: String,
}

#[async_trait]
pub trait MailProvider: Send {
    fn kind(&self) -> ProviderKind;

    /// Opens the session. OAuth adapters refresh an expiring token here and
    /// return the new credentials so the caller can persist them.
    async fn connect(&mut self) -> Result<Option<OAuthCredentials>, ProviderError>;

    /// Idempotent; never fails.
    async fn disconnect(&mut self);

    async fn perform_initial_sync(&mut self) -> Result<SyncResult, ProviderError>;

    /// Changes since `cursor`. Returns `CursorInvalid` when the provider no longer
    /// honours the cursor.
    async fn fetch_changes(&mut self, cursor: &SyncCursor) -> Result<SyncResult, ProviderError>;

    async fn perform_incremental_sync(
        &mut self,
        cursor: &SyncCursor,
    ) -> Result<SyncResult, ProviderError> {
        match self.fetch_changes(cursor).await {
            Err(ProviderError::CursorInvalid(reason)) => {
                tracing::warn!(
                    provider = %self.kind(),
                    %reason,
                    "sync cursor rejected, falling back to initial sync"
                );
                self.perform_initial_sync().await
            }
            other => other,
        }
    }

    async fn get_folders(&mut self) -> Result<Vec<MailFolder>, ProviderError>;

    /// Returns the provider id of the sent message.
    async fn send_message(&mut self, params: &SendParams) -> Result<String, ProviderError>;

    async fn mark_as_read(
        &mut self,
        external_ids: &[String],
        read: bool,
    ) -> Result<MutationReport, ProviderError>;

    async fn mark_as_starred(
        &mut self,
        external_ids: &[String],
        starred: bool,
    ) -> Result<MutationReport, ProviderError>;

    async fn move_to_folder(
        &mut self,
        external_ids: &[String],
        folder_id: &str,
    ) -> Result<MutationReport, ProviderError>;

    async fn delete_messages(
        &mut self,
        external_ids: &[String],
        permanent: bool,
    ) -> Result<MutationReport, ProviderError>;

    async fn archive_messages(
        &mut self,
        external_ids: &[String],
    ) -> Result<MutationReport, ProviderError>;
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn get_auth_url(&self) -> Result<OAuthPkceSession, ProviderError>;

    async fn handle_callback(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<OAuthGrant, ProviderError>;
}

/// Picks the adapter for an account. The orchestrator depends on this seam only.
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, account: &Account) -> Result<Box<dyn MailProvider>, ProviderError>;

    fn oauth_provider(&self, kind: ProviderKind) -> Result<Box<dyn OAuthProvider>, ProviderError> {
        Err(ProviderError::Auth(format!("no oauth client available for {kind}")))
    }
}

#[derive(Debug, Clone)]
pub struct ProviderFactory {
    http: reqwest::Client,
    settings: ProviderSettings,
    google: Option<OAuthWorkflow>,
    microsoft: Option<OAuthWorkflow>,
}

impl ProviderFactory {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            http,
            settings,
            google: None,
            microsoft: None,
        })
    }

    pub fn with_google_oauth(mut self, workflow: OAuthWorkflow) -> Self {
        self.google = Some(workflow);
        self
    }

    pub fn with_microsoft_oauth(mut self, workflow: OAuthWorkflow) -> Self {
        self.microsoft = Some(workflow);
        self
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn create(&self, account: &Account) -> Result<Box<dyn MailProvider>, ProviderError> {
        if !account.credentials_match_provider() {
            return Err(ProviderError::Data(format!(
                "account {} holds credentials that do not match provider {}",
                account.id, account.provider
            )));
        }

        match account.provider {
            ProviderKind::GraphWork | ProviderKind::GraphPersonal => {
                let credentials = oauth_credentials(account)?;
                Ok(Box::new(GraphProvider::new(
                    account.id,
                    account.provider,
                    credentials,
                    self.microsoft.clone(),
                    self.http.clone(),
                    self.settings.clone(),
                )))
            }
            ProviderKind::Gmail => {
                let credentials = oauth_credentials(account)?;
                Ok(Box::new(GmailProvider::new(
                    account.id,
                    credentials,
                    self.google.clone(),
                    self.http.clone(),
                    self.settings.clone(),
                )))
            }
            ProviderKind::Imap => {
                let credentials = account.imap_credentials().cloned().ok_or_else(|| {
                    ProviderError::Connection("imap account has no server credentials".to_string())
                })?;
                Ok(Box::new(ImapProvider::new(
                    account.id,
                    account.email_address.clone(),
                    credentials,
                    self.settings.clone(),
                )))
            }
        }
    }
}

impl ProviderResolver for ProviderFactory {
    fn resolve(&self, account: &Account) -> Result<Box<dyn MailProvider>, ProviderError> {
        self.create(account)
    }

    fn oauth_provider(&self, kind: ProviderKind) -> Result<Box<dyn OAuthProvider>, ProviderError> {
        let missing = || ProviderError::Auth(format!("oauth client for {kind} is not configured"));
        match kind {
            ProviderKind::GraphWork | ProviderKind::GraphPersonal => {
                let workflow = self.microsoft.clone().ok_or_else(missing)?;
                Ok(Box::new(GraphAuth::new(workflow, self.http.clone())))
            }
            ProviderKind::Gmail => {
                let workflow = self.google.clone().ok_or_else(missing)?;
                Ok(Box::new(GmailAuth::new(workflow, self.http.clone())))
            }
            ProviderKind::Imap => Err(ProviderError::Auth(
                "imap accounts authenticate with a password".to_string(),
            )),
        }
    }
}

fn oauth_credentials(account: &Account) -> Result<OAuthCredentials, ProviderError> {
    account
        .oauth_credentials()
        .cloned()
        .ok_or_else(|| ProviderError::Auth(format!("account {} has no oauth tokens", account.id)))
}

/// Returns refreshed credentials when the current token is expired or about to expire,
/// `None` when it is still usable.
pub(crate) async fn refresh_if_expired(
    credentials: &OAuthCredentials,
    workflow: Option<&OAuthWorkflow>,
) -> Result<Option<OAuthCredentials>, ProviderError> {
    let now = Utc::now();
    if !credentials.is_expired(now, ChronoDuration::seconds(TOKEN_REFRESH_SKEW_SECS)) {
        return Ok(None);
    }

    let refresh_token = credentials.refresh_token.clone().ok_or_else(|| {
        ProviderError::Auth("access token expired and no refresh token is stored".to_string())
    })?;
    let workflow = workflow.ok_or_else(|| {
        ProviderError::Auth("access token expired and no oauth client is configured".to_string())
    })?;

    let refreshed = workflow.refresh(&refresh_token).await?;
    Ok(Some(refreshed.into_credentials(Some(refresh_token), now)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::{Credentials, ImapCredentials, ServerEndpoint};

    #[test]
    fn reply_references_append_parent_id() {
        let context = ReplyContext {
            external_id: "m-1".to_string(),
            thread_external_id: "t-1".to_string(),
            message_id_header: Some("<b@x>".to_string()),
            references: Some("<a@x>".to_string()),
        };
        assert_eq!(context.references_header().as_deref(), Some("<a@x> <b@x>"));
    }

    #[test]
    fn fatal_errors_abort_the_batch() {
        let mut report = MutationReport::default();
        assert!(report.record("1", Ok(())).is_ok());
        assert!(report
            .record("2", Err(ProviderError::NotFound("gone".to_string())))
            .is_ok());
        assert!(report.record("3", Err(ProviderError::NotConnected)).is_err());

        assert_eq!(report.succeeded, vec!["1"]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn valid_token_is_not_refreshed() {
        let credentials = OAuthCredentials {
            access_token: "token".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        };
        assert!(refresh_if_expired(&credentials, None).await.expect("no refresh").is_none());
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_is_auth_error() {
        let credentials = OAuthCredentials {
            access_token: "token".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() - ChronoDuration::minutes(5)),
        };
        assert!(matches!(
            refresh_if_expired(&credentials, None).await,
            Err(ProviderError::Auth(_))
        ));
    }

    #[test]
    fn factory_selects_adapter_by_provider() {
        let factory = ProviderFactory::new(ProviderSettings::default()).expect("factory");
        let account = Account::new(
            ProviderKind::Imap,
            "ada@example.org",
            "Ada",
            Credentials::Imap(ImapCredentials {
                imap: ServerEndpoint {
                    host: "imap.example.org".to_string(),
                    port: 993,
                    username: "ada".to_string(),
                    password: "pw".to_string(),
                },
                smtp: None,
            }),
        );
        let provider = factory.resolve(&account).expect("imap adapter");
        assert_eq!(provider.kind(), ProviderKind::Imap);

        let mut mismatched = account.clone();
        mismatched.provider = ProviderKind::Gmail;
        assert!(factory.resolve(&mismatched).is_err());
        assert!(factory.oauth_provider(ProviderKind::Gmail).is_err());
    }
}
