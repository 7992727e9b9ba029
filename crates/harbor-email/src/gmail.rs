use crate::compose::{build_mime, generate_message_id};
use crate::http::{expect_success, read_json};
use crate::normalize::{build_message, parse_rfc822, MessageParts};
use crate::provider::{for_each_message, refresh_if_expired};
use crate::{
    folder_type_for_gmail_label, MailProvider, MutationReport, OAuthGrant, OAuthProvider,
    ProviderError, ProviderSettings, SendParams,
};
use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use harbor_core::{
    labels, MailFolder, MailMessage, MessageFlags, OAuthCredentials, ProviderKind, SyncCursor,
    SyncResult, ThreadBundle,
};
use harbor_security::{OAuthPkceSession, OAuthWorkflow};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

const GMAIL_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailProfile {
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailThreadList {
    threads: Option<Vec<GmailThreadRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailThreadRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailThread {
    id: String,
    messages: Option<Vec<GmailMessageMeta>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageMeta {
    id: String,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    internal_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRaw {
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistoryList {
    history: Option<Vec<GmailHistoryRecord>>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistoryRecord {
    id: String,
    #[serde(default)]
    messages: Vec<GmailMessageRef>,
    #[serde(default)]
    messages_added: Vec<GmailHistoryChange>,
    #[serde(default)]
    messages_deleted: Vec<GmailHistoryChange>,
    #[serde(default)]
    labels_added: Vec<GmailHistoryChange>,
    #[serde(default)]
    labels_removed: Vec<GmailHistoryChange>,
}

#[derive(Debug, Deserialize)]
struct GmailHistoryChange {
    message: GmailMessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageRef {
    id: String,
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailLabelList {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailLabel {
    id: String,
    name: Option<String>,
    messages_total: Option<u32>,
    messages_unread: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailSendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    email: Option<String>,
    name: Option<String>,
}

/// Changes collected from one or more history pages.
#[derive(Debug, Default, PartialEq)]
struct HistoryDigest {
    thread_ids: Vec<String>,
    deleted_message_ids: Vec<String>,
    last_record_id: Option<String>,
}

impl HistoryDigest {
    fn absorb(&mut self, records: Vec<GmailHistoryRecord>) {
        let mut seen: HashSet<String> = self.thread_ids.iter().cloned().collect();

        for record in records {
            let touched = record
                .messages
                .iter()
                .chain(record.messages_added.iter().map(|change| &change.message))
                .chain(record.messages_deleted.iter().map(|change| &change.message))
                .chain(record.labels_added.iter().map(|change| &change.message))
                .chain(record.labels_removed.iter().map(|change| &change.message));

            for message in touched {
                if let Some(thread_id) = &message.thread_id {
                    if seen.insert(thread_id.clone()) {
                        self.thread_ids.push(thread_id.clone());
                    }
                }
            }

            self.deleted_message_ids.extend(
                record
                    .messages_deleted
                    .into_iter()
                    .map(|change| change.message.id),
            );
            self.last_record_id = Some(record.id);
        }
    }
}

pub struct GmailProvider {
    account_id: Uuid,
    credentials: OAuthCredentials,
    workflow: Option<OAuthWorkflow>,
    http: reqwest::Client,
    settings: ProviderSettings,
    connected: bool,
}

impl GmailProvider {
    pub fn new(
        account_id: Uuid,
        credentials: OAuthCredentials,
        workflow: Option<OAuthWorkflow>,
        http: reqwest::Client,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            account_id,
            credentials,
            workflow,
            http,
            settings,
            connected: false,
        }
    }

    fn token(&self) -> Result<&str, ProviderError> {
        if !self.connected {
            return Err(ProviderError::NotConnected);
        }
        Ok(&self.credentials.access_token)
    }

    async fn current_history_id(&self) -> Result<String, ProviderError> {
        let response = self
            .http
            .get(format!("{GMAIL_BASE}/profile"))
            .bearer_auth(self.token()?)
            .send()
            .await?;
        let profile: GmailProfile = read_json(response, "gmail profile").await?;
        Ok(profile.history_id)
    }

    /// Fetches a conversation with every message in raw form. `None` when Gmail no
    /// longer knows the thread or none of its messages could be read.
    async fn fetch_thread(&self, thread_id: &str) -> Result<Option<ThreadBundle>, ProviderError> {
        let token = self.token()?;
        let response = self
            .http
            .get(format!("{GMAIL_BASE}/threads/{thread_id}"))
            .bearer_auth(token)
            .query(&[("format", "minimal")])
            .send()
            .await?;
        let thread: GmailThread = match read_json(response, "gmail get thread").await {
            Err(ProviderError::NotFound(_)) => return Ok(None),
            other => other?,
        };

        let mut messages = Vec::new();
        for meta in thread.messages.unwrap_or_default() {
            let response = self
                .http
                .get(format!("{GMAIL_BASE}/messages/{}", meta.id))
                .bearer_auth(token)
                .query(&[("format", "raw")])
                .send()
                .await?;
            let payload: GmailMessageRaw = match read_json(response, "gmail get message").await {
                Err(ProviderError::NotFound(_)) => {
                    tracing::debug!(message_id = %meta.id, "gmail message vanished during fetch");
                    continue;
                }
                other => other?,
            };
            let Some(raw) = payload.raw else {
                continue;
            };
            messages.push(gmail_message_to_mail(self.account_id, meta, &raw)?);
        }

        Ok(ThreadBundle::assemble(self.account_id, thread.id, messages))
    }

    async fn modify_labels(
        &self,
        external_id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(format!("{GMAIL_BASE}/messages/{external_id}/modify"))
            .bearer_auth(self.token()?)
            .json(&json!({ "addLabelIds": add, "removeLabelIds": remove }))
            .send()
            .await?;
        expect_success(response, "gmail modify labels").await?;
        Ok(())
    }

    async fn trash_or_delete(&self, external_id: &str, permanent: bool) -> Result<(), ProviderError> {
        let request = if permanent {
            self.http.delete(format!("{GMAIL_BASE}/messages/{external_id}"))
        } else {
            self.http.post(format!("{GMAIL_BASE}/messages/{external_id}/trash"))
        };
        let response = request.bearer_auth(self.token()?).send().await?;
        expect_success(response, "gmail delete message").await?;
        Ok(())
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn connect(&mut self) -> Result<Option<OAuthCredentials>, ProviderError> {
        let refreshed = refresh_if_expired(&self.credentials, self.workflow.as_ref()).await?;
        if let Some(credentials) = &refreshed {
            self.credentials = credentials.clone();
            tracing::debug!(account_id = %self.account_id, "refreshed gmail access token");
        }
        self.connected = true;
        Ok(refreshed)
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn perform_initial_sync(&mut self) -> Result<SyncResult, ProviderError> {
        // Captured first so changes made while listing are replayed on the next pass.
        let history_id = self.current_history_id().await?;

        let response = self
            .http
            .get(format!("{GMAIL_BASE}/threads"))
            .bearer_auth(self.token()?)
            .query(&[
                ("labelIds", labels::INBOX.to_string()),
                ("maxResults", self.settings.initial_sync_limit.max(1).to_string()),
            ])
            .send()
            .await?;
        let list: GmailThreadList = read_json(response, "gmail list threads").await?;

        let mut result = SyncResult::new(SyncCursor::new(history_id));
        result.has_more = list.next_page_token.is_some();
        for thread in list.threads.unwrap_or_default() {
            if let Some(bundle) = self.fetch_thread(&thread.id).await? {
                result.threads.push(bundle);
            }
        }

        Ok(result)
    }

    async fn fetch_changes(&mut self, cursor: &SyncCursor) -> Result<SyncResult, ProviderError> {
        let start = cursor.as_str();
        if start.is_empty() || !start.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(ProviderError::CursorInvalid(format!(
                "'{start}' is not a gmail history id"
            )));
        }

        let mut digest = HistoryDigest::default();
        let mut page_token: Option<String> = None;
        let mut latest_history_id = None;
        let mut has_more = false;
        let page_limit = self.settings.incremental_page_limit.max(1);

        for page in 0..page_limit {
            let mut query = vec![("startHistoryId", start.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self
                .http
                .get(format!("{GMAIL_BASE}/history"))
                .bearer_auth(self.token()?)
                .query(&query)
                .send()
                .await?;
            let list: GmailHistoryList = match read_json(response, "gmail history").await {
                Err(ProviderError::NotFound(reason)) => {
                    return Err(ProviderError::CursorInvalid(reason));
                }
                other => other?,
            };

            digest.absorb(list.history.unwrap_or_default());
            latest_history_id = list.history_id.or(latest_history_id);

            match list.next_page_token {
                Some(token) if page + 1 < page_limit => page_token = Some(token),
                Some(_) => {
                    has_more = true;
                    break;
                }
                None => break,
            }
        }

        // A partial walk resumes after the last record seen, not at the mailbox head.
        let next_cursor = if has_more {
            digest.last_record_id.clone().or(latest_history_id)
        } else {
            latest_history_id
        }
        .unwrap_or_else(|| start.to_string());

        let mut result = SyncResult::new(SyncCursor::new(next_cursor));
        result.has_more = has_more;
        result.deleted_message_ids = digest.deleted_message_ids;

        for thread_id in digest.thread_ids {
            match self.fetch_thread(&thread_id).await? {
                Some(bundle) => result.threads.push(bundle),
                None => result.deleted_thread_ids.push(thread_id),
            }
        }

        Ok(result)
    }

    async fn get_folders(&mut self) -> Result<Vec<MailFolder>, ProviderError> {
        let response = self
            .http
            .get(format!("{GMAIL_BASE}/labels"))
            .bearer_auth(self.token()?)
            .send()
            .await?;
        let payload: GmailLabelList = read_json(response, "gmail list labels").await?;

        Ok(payload
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| {
                let name = label.name.unwrap_or_else(|| label.id.clone());
                let parent_id = name
                    .rsplit_once('/')
                    .map(|(parent, _)| parent.to_string());
                MailFolder {
                    account_id: self.account_id,
                    folder_type: folder_type_for_gmail_label(&label.id),
                    remote_id: label.id,
                    display_name: name.rsplit('/').next().unwrap_or(&name).to_string(),
                    name,
                    parent_id,
                    total_count: label.messages_total.unwrap_or(0),
                    unread_count: label.messages_unread.unwrap_or(0),
                }
            })
            .collect())
    }

    async fn send_message(&mut self, params: &SendParams) -> Result<String, ProviderError> {
        let token = self.token()?;
        let message = build_mime(params, generate_message_id(&params.from))?;
        let raw = URL_SAFE_NO_PAD.encode(message.formatted());

        let mut body = json!({ "raw": raw });
        if let Some(reply) = &params.reply_to {
            body["threadId"] = json!(reply.thread_external_id);
        }

        let response = self
            .http
            .post(format!("{GMAIL_BASE}/messages/send"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let sent: GmailSendResponse = read_json(response, "gmail send")
            .await
            .map_err(|err| match err {
                ProviderError::Data(reason) | ProviderError::NotFound(reason) => {
                    ProviderError::Send(reason)
                }
                other => other,
            })?;

        tracing::info!(account_id = %self.account_id, "sent message through gmail");
        Ok(sent.id)
    }

    async fn mark_as_read(
        &mut self,
        external_ids: &[String],
        read: bool,
    ) -> Result<MutationReport, ProviderError> {
        self.token()?;
        let this = &*self;
        for_each_message(external_ids, |id| async move {
            if read {
                this.modify_labels(&id, &[], &[labels::UNREAD]).await
            } else {
                this.modify_labels(&id, &[labels::UNREAD], &[]).await
            }
        })
        .await
    }

    async fn mark_as_starred(
        &mut self,
        external_ids: &[String],
        starred: bool,
    ) -> Result<MutationReport, ProviderError> {
        self.token()?;
        let this = &*self;
        for_each_message(external_ids, |id| async move {
            if starred {
                this.modify_labels(&id, &[labels::STARRED], &[]).await
            } else {
                this.modify_labels(&id, &[], &[labels::STARRED]).await
            }
        })
        .await
    }

    async fn move_to_folder(
        &mut self,
        external_ids: &[String],
        folder_id: &str,
    ) -> Result<MutationReport, ProviderError> {
        self.token()?;
        let this = &*self;
        let remove: &[&str] = if folder_id == labels::INBOX {
            &[]
        } else {
            &[labels::INBOX]
        };
        for_each_message(external_ids, |id| async move {
            this.modify_labels(&id, &[folder_id], remove).await
        })
        .await
    }

    async fn delete_messages(
        &mut self,
        external_ids: &[String],
        permanent: bool,
    ) -> Result<MutationReport, ProviderError> {
        self.token()?;
        let this = &*self;
        for_each_message(external_ids, |id| async move {
            this.trash_or_delete(&id, permanent).await
        })
        .await
    }

    async fn archive_messages(
        &mut self,
        external_ids: &[String],
    ) -> Result<MutationReport, ProviderError> {
        self.token()?;
        let this = &*self;
        for_each_message(external_ids, |id| async move {
            this.modify_labels(&id, &[], &[labels::INBOX]).await
        })
        .await
    }
}

/// Consent flow for Google accounts.
pub struct GmailAuth {
    workflow: OAuthWorkflow,
    http: reqwest::Client,
}

impl GmailAuth {
    pub fn new(workflow: OAuthWorkflow, http: reqwest::Client) -> Self {
        Self { workflow, http }
    }
}

#[async_trait]
impl OAuthProvider for GmailAuth {
    fn get_auth_url(&self) -> Result<OAuthPkceSession, ProviderError> {
        Ok(self.workflow.begin_pkce_session()?)
    }

    async fn handle_callback(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<OAuthGrant, ProviderError> {
        let tokens = self.workflow.exchange_code(code, pkce_verifier).await?;
        let credentials = tokens.into_credentials(None, Utc::now());

        let response = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(&credentials.access_token)
            .send()
            .await?;
        let user: GoogleUserInfo = read_json(response, "google userinfo").await?;

        let email_address = user
            .email
            .ok_or_else(|| ProviderError::Data("google profile has no email".to_string()))?;
        let display_name = user.name.unwrap_or_else(|| email_address.clone());

        Ok(OAuthGrant {
            credentials,
            email_address,
            display_name,
        })
    }
}

fn decode_gmail_raw(raw: &str) -> Result<Vec<u8>, ProviderError> {
    URL_SAFE_NO_PAD
        .decode(raw.as_bytes())
        .or_else(|_| URL_SAFE.decode(raw.as_bytes()))
        .map_err(|err| ProviderError::Data(format!("invalid gmail raw payload: {err}")))
}

fn parse_internal_date(raw: &str) -> Option<DateTime<Utc>> {
    let millis = raw.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn flags_from_labels(label_ids: &[String]) -> MessageFlags {
    let has = |label: &str| label_ids.iter().any(|value| value == label);
    MessageFlags {
        read: !has(labels::UNREAD),
        starred: has(labels::STARRED),
        draft: has(labels::DRAFT),
        deleted: has(labels::TRASH),
    }
}

fn gmail_message_to_mail(
    account_id: Uuid,
    meta: GmailMessageMeta,
    raw: &str,
) -> Result<MailMessage, ProviderError> {
    let decoded = decode_gmail_raw(raw)?;
    let envelope = parse_rfc822(&decoded)?;
    let label_ids = meta.label_ids.unwrap_or_default();

    Ok(build_message(
        account_id,
        MessageParts {
            external_id: meta.id,
            envelope,
            flags: flags_from_labels(&label_ids),
            labels: label_ids,
            preview: meta.snippet,
            received_at: meta.internal_date.as_deref().and_then(parse_internal_date),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_MESSAGE: &[u8] = b"From: Ada <ada@example.org>\r\n\
To: grace@example.org\r\n\
Subject: Engine tables\r\n\
Message-ID: <tables@example.org>\r\n\
Date: Mon, 3 Jun 2024 08:00:00 +0000\r\n\
\r\n\
The tables are ready.\r\n";

    fn history(value: serde_json::Value) -> GmailHistoryList {
        serde_json::from_value(value).expect("history payload")
    }

    #[test]
    fn raw_message_is_normalized_with_gmail_labels() {
        let meta = GmailMessageMeta {
            id: "18f0a".to_string(),
            label_ids: Some(vec![
                "INBOX".to_string(),
                "UNREAD".to_string(),
                "STARRED".to_string(),
            ]),
            snippet: Some("The tables are ready.".to_string()),
            internal_date: Some("1717401660000".to_string()),
        };
        let raw = URL_SAFE_NO_PAD.encode(RAW_MESSAGE);
        let mail = gmail_message_to_mail(Uuid::nil(), meta, &raw).expect("message");

        assert_eq!(mail.external_id, "18f0a");
        assert_eq!(mail.subject, "Engine tables");
        assert!(!mail.flags.read);
        assert!(mail.flags.starred);
        assert!(mail.has_label(labels::INBOX));
        assert_eq!(mail.message_id_header.as_deref(), Some("<tables@example.org>"));
        assert_eq!(mail.received_at.timestamp_millis(), 1_717_401_660_000);
    }

    #[test]
    fn padded_raw_payload_is_accepted() {
        let padded = URL_SAFE.encode(b"ab");
        assert!(padded.ends_with('='));
        assert_eq!(decode_gmail_raw(&padded).expect("decoded"), b"ab");
    }

    #[test]
    fn history_digest_collects_threads_once_and_deletions() {
        let list = history(json!({
            "history": [
                {
                    "id": "1001",
                    "messagesAdded": [{ "message": { "id": "m1", "threadId": "t-1" } }]
                },
                {
                    "id": "1002",
                    "labelsRemoved": [{ "message": { "id": "m1", "threadId": "t-1" } }],
                    "messagesDeleted": [{ "message": { "id": "m7", "threadId": "t-42" } }]
                }
            ],
            "historyId": "1010"
        }));

        let mut digest = HistoryDigest::default();
        digest.absorb(list.history.unwrap_or_default());

        assert_eq!(digest.thread_ids, vec!["t-1", "t-42"]);
        assert_eq!(digest.deleted_message_ids, vec!["m7"]);
        assert_eq!(digest.last_record_id.as_deref(), Some("1002"));
    }

    #[test]
    fn trash_label_marks_message_deleted() {
        let flags = flags_from_labels(&["TRASH".to_string()]);
        assert!(flags.deleted);
        assert!(flags.read);
    }

    #[tokio::test]
    async fn non_numeric_cursor_is_invalid() {
        let mut provider = GmailProvider::new(
            Uuid::nil(),
            OAuthCredentials {
                access_token: "token".to_string(),
                refresh_token: None,
                expires_at: None,
            },
            None,
            reqwest::Client::new(),
            ProviderSettings::default(),
        );
        provider.connect().await.expect("connect");
        let result = provider.fetch_changes(&SyncCursor::new("delta-link")).await;
        assert!(matches!(result, Err(ProviderError::CursorInvalid(_))));
    }
}
