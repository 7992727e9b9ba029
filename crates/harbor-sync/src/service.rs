use crate::{SyncError, SyncOrchestrator, SyncOutcome, SyncProgress};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use harbor_core::{
    Account, Credentials, FolderType, LocalChange, MailAddress, MailFolder, MailMessage,
    ProviderKind, SearchResult, Thread, ThreadQuery,
};
use harbor_email::normalize::parse_address;
use harbor_email::{
    MailProvider, MutationReport, OutgoingAttachment, ProviderError, ProviderResolver,
    ReplyContext, SendParams,
};
use harbor_security::OAuthPkceSession;
use harbor_storage::{MessageState, ReconcileStats, Storage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

const SEARCH_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequestAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub content_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub account_id: Uuid,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub is_html: bool,
    #[serde(default)]
    pub attachments: Vec<SendRequestAttachment>,
    /// Local id of the message being answered.
    pub reply_to_message_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadDetail {
    pub thread: Thread,
    pub messages: Vec<MailMessage>,
}

#[derive(Debug, Clone)]
enum RemoteMutation {
    Read(bool),
    Starred(bool),
    Move(String),
    Delete { permanent: bool },
    Archive,
}

impl RemoteMutation {
    async fn forward(
        &self,
        provider: &mut dyn MailProvider,
        external_ids: &[String],
    ) -> Result<MutationReport, ProviderError> {
        match self {
            Self::Read(read) => provider.mark_as_read(external_ids, *read).await,
            Self::Starred(starred) => provider.mark_as_starred(external_ids, *starred).await,
            Self::Move(folder_id) => provider.move_to_folder(external_ids, folder_id).await,
            Self::Delete { permanent } => provider.delete_messages(external_ids, *permanent).await,
            Self::Archive => provider.archive_messages(external_ids).await,
        }
    }
}

/// Entry points used by the UI layer. Reads go straight to the store; writes are
/// applied locally first and then forwarded to the account's provider.
#[derive(Clone)]
pub struct MailService {
    storage: Storage,
    orchestrator: SyncOrchestrator,
}

impl MailService {
    pub fn new(storage: Storage, resolver: Arc<dyn ProviderResolver>) -> Self {
        let orchestrator = SyncOrchestrator::new(storage.clone(), resolver);
        Self {
            storage,
            orchestrator,
        }
    }

    pub fn with_orchestrator(orchestrator: SyncOrchestrator) -> Self {
        Self {
            storage: orchestrator.storage().clone(),
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub async fn sync_account(
        &self,
        account_id: Uuid,
        progress: Option<UnboundedSender<SyncProgress>>,
    ) -> Result<ReconcileStats, SyncError> {
        self.orchestrator.sync_account(account_id, progress).await
    }

    pub async fn sync_all(&self) -> Result<Vec<SyncOutcome>, SyncError> {
        self.orchestrator.sync_all().await
    }

    pub async fn list_threads(&self, query: &ThreadQuery) -> Result<SearchResult<Thread>, SyncError> {
        Ok(self.storage.list_threads(query).await?)
    }

    pub async fn get_thread(&self, thread_id: Uuid) -> Result<ThreadDetail, SyncError> {
        let thread = self
            .storage
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("thread {thread_id}")))?;
        let messages = self.storage.list_thread_messages(thread_id).await?;
        Ok(ThreadDetail { thread, messages })
    }

    pub async fn search(&self, text: &str, account_id: Option<Uuid>) -> Result<Vec<Thread>, SyncError> {
        Ok(self.storage.search_threads(text, account_id, SEARCH_LIMIT).await?)
    }

    pub async fn list_folders(&self, account_id: Uuid) -> Result<Vec<MailFolder>, SyncError> {
        Ok(self.storage.list_folders(account_id).await?)
    }

    /// Pulls the folder list from the provider and replaces the stored one.
    pub async fn refresh_folders(&self, account_id: Uuid) -> Result<Vec<MailFolder>, SyncError> {
        let account = self.load_account(account_id).await?;
        let mut provider = self.open_provider(&account).await?;
        let folders = provider.get_folders().await;
        provider.disconnect().await;

        let folders = folders?;
        self.storage.replace_folders(account_id, &folders).await?;
        tracing::debug!(%account_id, count = folders.len(), "folders refreshed");
        Ok(folders)
    }

    pub async fn send_message(&self, request: &SendRequest) -> Result<String, SyncError> {
        let account = self.load_account(request.account_id).await?;
        let params = self.build_send_params(&account, request).await?;

        let mut provider = self.open_provider(&account).await?;
        let sent = provider.send_message(&params).await;
        provider.disconnect().await;

        let provider_id = sent?;
        tracing::info!(account_id = %account.id, provider = %account.provider, "message sent");
        Ok(provider_id)
    }

    pub async fn mark_as_read(
        &self,
        account_id: Uuid,
        external_ids: &[String],
        read: bool,
    ) -> Result<MutationReport, SyncError> {
        self.mutate(account_id, external_ids, LocalChange::MarkRead(read), RemoteMutation::Read(read))
            .await
    }

    pub async fn mark_as_starred(
        &self,
        account_id: Uuid,
        external_ids: &[String],
        starred: bool,
    ) -> Result<MutationReport, SyncError> {
        self.mutate(
            account_id,
            external_ids,
            LocalChange::MarkStarred(starred),
            RemoteMutation::Starred(starred),
        )
        .await
    }

    /// `folder_id` is the provider folder id as stored by [`MailService::refresh_folders`].
    pub async fn move_to_folder(
        &self,
        account_id: Uuid,
        external_ids: &[String],
        folder_id: &str,
    ) -> Result<MutationReport, SyncError> {
        let folder_type = self
            .storage
            .list_folders(account_id)
            .await?
            .into_iter()
            .find(|folder| folder.remote_id == folder_id)
            .map(|folder| folder.folder_type)
            .unwrap_or(FolderType::Custom);

        self.mutate(
            account_id,
            external_ids,
            LocalChange::MoveTo(folder_type),
            RemoteMutation::Move(folder_id.to_string()),
        )
        .await
    }

    pub async fn delete_messages(
        &self,
        account_id: Uuid,
        external_ids: &[String],
        permanent: bool,
    ) -> Result<MutationReport, SyncError> {
        let change = if permanent {
            LocalChange::Purge
        } else {
            LocalChange::Trash
        };
        self.mutate(account_id, external_ids, change, RemoteMutation::Delete { permanent })
            .await
    }

    pub async fn archive_messages(
        &self,
        account_id: Uuid,
        external_ids: &[String],
    ) -> Result<MutationReport, SyncError> {
        self.mutate(account_id, external_ids, LocalChange::Archive, RemoteMutation::Archive)
            .await
    }

    pub fn begin_oauth(&self, provider: ProviderKind) -> Result<OAuthPkceSession, SyncError> {
        let oauth = self.orchestrator.resolver().oauth_provider(provider)?;
        Ok(oauth.get_auth_url()?)
    }

    /// Exchanges the consent code and stores the account, creating it on first sign-in.
    pub async fn complete_oauth(
        &self,
        provider: ProviderKind,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<Account, SyncError> {
        let oauth = self.orchestrator.resolver().oauth_provider(provider)?;
        let grant = oauth.handle_callback(code, pkce_verifier).await?;

        let account = match self.storage.find_account_by_email(&grant.email_address).await? {
            Some(existing) if existing.provider != provider => {
                return Err(SyncError::InvalidAccount(format!(
                    "{} is already connected through {}",
                    grant.email_address, existing.provider
                )));
            }
            Some(mut existing) => {
                existing.display_name = grant.display_name;
                existing.credentials = Credentials::OAuth(grant.credentials);
                existing.is_active = true;
                existing
            }
            None => Account::new(
                provider,
                grant.email_address,
                grant.display_name,
                Credentials::OAuth(grant.credentials),
            ),
        };

        self.storage.upsert_account(&account).await?;
        tracing::info!(account_id = %account.id, %provider, "oauth account connected");
        Ok(account)
    }

    async fn load_account(&self, account_id: Uuid) -> Result<Account, SyncError> {
        self.storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("account {account_id}")))
    }

    /// Resolves and connects the account's adapter, persisting refreshed tokens.
    async fn open_provider(&self, account: &Account) -> Result<Box<dyn MailProvider>, SyncError> {
        let mut provider = self.orchestrator.resolver().resolve(account)?;
        match provider.connect().await {
            Ok(Some(refreshed)) => {
                self.storage
                    .update_account_credentials(account.id, &Credentials::OAuth(refreshed))
                    .await?;
                Ok(provider)
            }
            Ok(None) => Ok(provider),
            Err(err) => {
                provider.disconnect().await;
                Err(err.into())
            }
        }
    }

    /// Applies `change` locally, forwards `remote` to the provider and rolls the local
    /// edit back for every id the provider did not accept. Holds the account's sync
    /// guard throughout so a sync pass never interleaves with the edit and its rollback.
    async fn mutate(
        &self,
        account_id: Uuid,
        external_ids: &[String],
        change: LocalChange,
        remote: RemoteMutation,
    ) -> Result<MutationReport, SyncError> {
        if external_ids.is_empty() {
            return Ok(MutationReport::default());
        }
        let _guard = self.orchestrator.lock_account(account_id).await;
        let account = self.load_account(account_id).await?;

        // Purged rows cannot be restored, so they are only dropped once the provider agreed.
        let purge = matches!(change, LocalChange::Purge);
        let previous = if purge {
            Vec::new()
        } else {
            let previous = self.storage.message_states(account_id, external_ids).await?;
            self.storage.apply_local_change(account_id, external_ids, &change).await?;
            previous
        };

        let report = match self.forward(&account, external_ids, &remote).await {
            Ok(report) => report,
            Err(err) => {
                self.roll_back(account_id, &previous, |_| true).await;
                return Err(err);
            }
        };

        if purge && !report.succeeded.is_empty() {
            self.storage
                .apply_local_change(account_id, &report.succeeded, &change)
                .await?;
        }
        if !report.is_complete() {
            tracing::warn!(
                %account_id,
                failed = report.failed.len(),
                succeeded = report.succeeded.len(),
                "mutation partially applied"
            );
            self.roll_back(account_id, &previous, |external_id| {
                report.failed.iter().any(|failure| failure.external_id == external_id)
            })
            .await;
        }
        Ok(report)
    }

    async fn forward(
        &self,
        account: &Account,
        external_ids: &[String],
        remote: &RemoteMutation,
    ) -> Result<MutationReport, SyncError> {
        let mut provider = self.open_provider(account).await?;
        let forwarded = remote.forward(provider.as_mut(), external_ids).await;
        provider.disconnect().await;
        Ok(forwarded?)
    }

    /// Restores captured states for the ids `rejected` selects. A failed restore is
    /// logged; the provider error that caused it is what the caller reports.
    async fn roll_back<F>(&self, account_id: Uuid, previous: &[MessageState], rejected: F)
    where
        F: Fn(&str) -> bool,
    {
        let states = previous
            .iter()
            .filter(|state| rejected(&state.external_id))
            .cloned()
            .collect::<Vec<_>>();
        if states.is_empty() {
            return;
        }

        match self.storage.restore_message_states(account_id, &states).await {
            Ok(restored) => tracing::debug!(%account_id, restored, "local edit rolled back"),
            Err(err) => tracing::error!(%account_id, error = %err, "could not roll back local edit"),
        }
    }

    async fn build_send_params(
        &self,
        account: &Account,
        request: &SendRequest,
    ) -> Result<SendParams, SyncError> {
        let reply_to = match request.reply_to_message_id {
            Some(message_id) => Some(self.reply_context(account.id, message_id).await?),
            None => None,
        };

        let attachments = request
            .attachments
            .iter()
            .map(|attachment| {
                let content = STANDARD
                    .decode(attachment.content_base64.as_bytes())
                    .map_err(|err| {
                        SyncError::InvalidRequest(format!(
                            "attachment {} is not valid base64: {err}",
                            attachment.file_name
                        ))
                    })?;
                Ok(OutgoingAttachment {
                    file_name: attachment.file_name.clone(),
                    mime_type: attachment.mime_type.clone(),
                    content,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        let params = SendParams {
            from: MailAddress::new(&account.email_address, Some(account.display_name.clone())),
            to: parse_recipients(&request.to)?,
            cc: parse_recipients(&request.cc)?,
            bcc: parse_recipients(&request.bcc)?,
            subject: request.subject.clone(),
            body: request.body.clone(),
            is_html: request.is_html,
            attachments,
            reply_to,
        };

        if params.to.is_empty() && params.cc.is_empty() && params.bcc.is_empty() {
            return Err(SyncError::InvalidRequest("message has no recipients".to_string()));
        }
        Ok(params)
    }

    async fn reply_context(&self, account_id: Uuid, message_id: Uuid) -> Result<ReplyContext, SyncError> {
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .filter(|message| message.account_id == account_id)
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
        let thread = self
            .storage
            .get_thread(message.thread_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("thread {}", message.thread_id)))?;

        Ok(ReplyContext {
            external_id: message.external_id,
            thread_external_id: thread.external_id,
            message_id_header: message.message_id_header,
            references: message.references,
        })
    }
}

fn parse_recipients(raw: &[String]) -> Result<Vec<MailAddress>, SyncError> {
    raw.iter()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            parse_address(value)
                .filter(|address| address.address.contains('@'))
                .ok_or_else(|| SyncError::InvalidRequest(format!("invalid recipient '{value}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipients_are_normalized() {
        let parsed = parse_recipients(&[
            "\"Grace\" <Grace@Navy.MIL>".to_string(),
            " ".to_string(),
            "ada@example.org".to_string(),
        ])
        .expect("recipients");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].address, "grace@navy.mil");
        assert_eq!(parsed[0].name.as_deref(), Some("Grace"));
    }

    #[test]
    fn recipient_without_domain_is_rejected() {
        assert!(matches!(
            parse_recipients(&["nobody".to_string()]),
            Err(SyncError::InvalidRequest(_))
        ));
    }
}
