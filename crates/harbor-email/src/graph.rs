use crate::grouping::group_messages;
use crate::http::{expect_success, read_json};
use crate::normalize::{build_message, MessageParts, ParsedEnvelope};
use crate::provider::{for_each_message, refresh_if_expired};
use crate::{
    folder_type_for_graph_name, MailProvider, MutationReport, OAuthGrant, OAuthProvider,
    ProviderError, ProviderSettings, SendParams,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use harbor_core::{
    labels, MailAddress, MailFolder, MessageFlags, OAuthCredentials, ProviderKind, SyncCursor,
    SyncResult,
};
use harbor_security::{OAuthPkceSession, OAuthWorkflow};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const MESSAGE_SELECT: &str = "id,conversationId,subject,bodyPreview,body,from,toRecipients,ccRecipients,bccRecipients,replyTo,isRead,isDraft,flag,hasAttachments,internetMessageId,receivedDateTime,sentDateTime";
const MAX_FOLDER_PAGES: usize = 20;

#[derive(Debug, Deserialize)]
struct DeltaPage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    conversation_id: Option<String>,
    subject: Option<String>,
    body_preview: Option<String>,
    body: Option<GraphBody>,
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    cc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    bcc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    reply_to: Vec<GraphRecipient>,
    is_read: Option<bool>,
    is_draft: Option<bool>,
    flag: Option<GraphFlag>,
    has_attachments: Option<bool>,
    internet_message_id: Option<String>,
    received_date_time: Option<String>,
    sent_date_time: Option<String>,
    #[serde(rename = "@removed")]
    removed: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFlag {
    flag_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderPage {
    #[serde(default)]
    value: Vec<GraphFolder>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: Option<String>,
    parent_folder_id: Option<String>,
    total_item_count: Option<u32>,
    unread_item_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CreatedItem {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    mail: Option<String>,
    user_principal_name: Option<String>,
    display_name: Option<String>,
}

/// Microsoft Graph adapter for work/school and personal accounts.
pub struct GraphProvider {
    account_id: Uuid,
    kind: ProviderKind,
    credentials: OAuthCredentials,
    workflow: Option<OAuthWorkflow>,
    http: reqwest::Client,
    settings: ProviderSettings,
    connected: bool,
}

impl GraphProvider {
    pub fn new(
        account_id: Uuid,
        kind: ProviderKind,
        credentials: OAuthCredentials,
        workflow: Option<OAuthWorkflow>,
        http: reqwest::Client,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            account_id,
            kind,
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

    async fn get_delta_page(&self, url: &str) -> Result<DeltaPage, ProviderError> {
        let response = self.http.get(url).bearer_auth(self.token()?).send().await?;
        read_json(response, "graph delta").await
    }

    fn assemble(&self, pages: Vec<GraphMessage>, cursor: SyncCursor, has_more: bool) -> SyncResult {
        let mut result = SyncResult::new(cursor);
        result.has_more = has_more;

        let mut keyed = Vec::new();
        for message in pages {
            if message.removed.is_some() {
                result.deleted_message_ids.push(message.id);
                continue;
            }
            let key = message
                .conversation_id
                .clone()
                .unwrap_or_else(|| message.id.clone());
            keyed.push((key, graph_message_to_mail(self.account_id, message)));
        }

        result.threads = group_messages(self.account_id, keyed);
        result
    }

    async fn patch_message(&self, external_id: &str, body: Value) -> Result<(), ProviderError> {
        let response = self
            .http
            .patch(format!("{GRAPH_BASE}/me/messages/{external_id}"))
            .bearer_auth(self.token()?)
            .json(&body)
            .send()
            .await?;
        expect_success(response, "graph update message").await?;
        Ok(())
    }

    async fn move_message(&self, external_id: &str, destination: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(format!("{GRAPH_BASE}/me/messages/{external_id}/move"))
            .bearer_auth(self.token()?)
            .json(&json!({ "destinationId": destination }))
            .send()
            .await?;
        expect_success(response, "graph move message").await?;
        Ok(())
    }

    async fn remove_message(&self, external_id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(format!("{GRAPH_BASE}/me/messages/{external_id}"))
            .bearer_auth(self.token()?)
            .send()
            .await?;
        expect_success(response, "graph delete message").await?;
        Ok(())
    }

    async fn for_each_id<F, Fut>(
        &self,
        external_ids: &[String],
        op: F,
    ) -> Result<MutationReport, ProviderError>
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<(), ProviderError>> + Send,
    {
        self.token()?;
        for_each_message(external_ids, op).await
    }

    async fn create_draft(&self, params: &SendParams) -> Result<String, ProviderError> {
        let token = self.token()?;

        match &params.reply_to {
            Some(reply) => {
                let response = self
                    .http
                    .post(format!("{GRAPH_BASE}/me/messages/{}/createReply", reply.external_id))
                    .bearer_auth(token)
                    .json(&json!({}))
                    .send()
                    .await?;
                let draft: CreatedItem = read_json(response, "graph create reply").await?;

                let patch = draft_payload(params, false);
                self.patch_message(&draft.id, patch).await?;
                for attachment in attachment_payloads(params) {
                    let response = self
                        .http
                        .post(format!("{GRAPH_BASE}/me/messages/{}/attachments", draft.id))
                        .bearer_auth(token)
                        .json(&attachment)
                        .send()
                        .await?;
                    expect_success(response, "graph add attachment").await?;
                }
                Ok(draft.id)
            }
            None => {
                let response = self
                    .http
                    .post(format!("{GRAPH_BASE}/me/messages"))
                    .bearer_auth(token)
                    .json(&draft_payload(params, true))
                    .send()
                    .await?;
                let draft: CreatedItem = read_json(response, "graph create draft").await?;
                Ok(draft.id)
            }
        }
    }
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&mut self) -> Result<Option<OAuthCredentials>, ProviderError> {
        let refreshed = refresh_if_expired(&self.credentials, self.workflow.as_ref()).await?;
        if let Some(credentials) = &refreshed {
            self.credentials = credentials.clone();
            tracing::debug!(account_id = %self.account_id, "refreshed graph access token");
        }
        self.connected = true;
        Ok(refreshed)
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn perform_initial_sync(&mut self) -> Result<SyncResult, ProviderError> {
        let top = self.settings.initial_sync_limit.max(1);
        let url = format!(
            "{GRAPH_BASE}/me/mailFolders/inbox/messages/delta?$select={MESSAGE_SELECT}&$top={top}"
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.token()?)
            .header("Prefer", format!("odata.maxpagesize={top}"))
            .send()
            .await?;
        let page: DeltaPage = read_json(response, "graph initial delta").await?;

        let has_more = page.next_link.is_some();
        let cursor = page
            .delta_link
            .or(page.next_link)
            .ok_or_else(|| ProviderError::Data("graph delta response carried no link".to_string()))?;

        Ok(self.assemble(page.value, SyncCursor::new(cursor), has_more))
    }

    async fn fetch_changes(&mut self, cursor: &SyncCursor) -> Result<SyncResult, ProviderError> {
        if !cursor.as_str().starts_with(GRAPH_BASE) {
            return Err(ProviderError::CursorInvalid(
                "cursor is not a graph delta link".to_string(),
            ));
        }

        let mut url = cursor.as_str().to_string();
        let mut messages = Vec::new();
        let page_limit = self.settings.incremental_page_limit.max(1);

        for _ in 0..page_limit {
            let page = match self.get_delta_page(&url).await {
                Err(ProviderError::NotFound(reason)) => {
                    return Err(ProviderError::CursorInvalid(reason));
                }
                other => other?,
            };
            messages.extend(page.value);

            if let Some(delta_link) = page.delta_link {
                return Ok(self.assemble(messages, SyncCursor::new(delta_link), false));
            }
            match page.next_link {
                Some(next_link) => url = next_link,
                None => {
                    return Err(ProviderError::Data(
                        "graph delta page carried neither next nor delta link".to_string(),
                    ))
                }
            }
        }

        Ok(self.assemble(messages, SyncCursor::new(url), true))
    }

    async fn get_folders(&mut self) -> Result<Vec<MailFolder>, ProviderError> {
        let token = self.token()?.to_string();
        let mut url = format!(
            "{GRAPH_BASE}/me/mailFolders?$top=100&$select=id,displayName,parentFolderId,totalItemCount,unreadItemCount"
        );
        let mut folders = Vec::new();

        for _ in 0..MAX_FOLDER_PAGES {
            let response = self.http.get(&url).bearer_auth(&token).send().await?;
            let page: FolderPage = read_json(response, "graph list folders").await?;

            folders.extend(page.value.into_iter().map(|folder| {
                let display_name = folder.display_name.unwrap_or_else(|| folder.id.clone());
                MailFolder {
                    account_id: self.account_id,
                    folder_type: folder_type_for_graph_name(&display_name),
                    remote_id: folder.id,
                    name: display_name.clone(),
                    display_name,
                    parent_id: folder.parent_folder_id,
                    total_count: folder.total_item_count.unwrap_or(0),
                    unread_count: folder.unread_item_count.unwrap_or(0),
                }
            }));

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(folders)
    }

    async fn send_message(&mut self, params: &SendParams) -> Result<String, ProviderError> {
        let draft_id = self.create_draft(params).await.map_err(into_send_error)?;

        let response = self
            .http
            .post(format!("{GRAPH_BASE}/me/messages/{draft_id}/send"))
            .bearer_auth(self.token()?)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await?;
        expect_success(response, "graph send")
            .await
            .map_err(into_send_error)?;

        tracing::info!(account_id = %self.account_id, "sent message through graph");
        Ok(draft_id)
    }

    async fn mark_as_read(
        &mut self,
        external_ids: &[String],
        read: bool,
    ) -> Result<MutationReport, ProviderError> {
        let this = &*self;
        this.for_each_id(external_ids, |id| async move {
            this.patch_message(&id, json!({ "isRead": read })).await
        })
        .await
    }

    async fn mark_as_starred(
        &mut self,
        external_ids: &[String],
        starred: bool,
    ) -> Result<MutationReport, ProviderError> {
        let status = if starred { "flagged" } else { "notFlagged" };
        let this = &*self;
        this.for_each_id(external_ids, |id| async move {
            this.patch_message(&id, json!({ "flag": { "flagStatus": status } }))
                .await
        })
        .await
    }

    async fn move_to_folder(
        &mut self,
        external_ids: &[String],
        folder_id: &str,
    ) -> Result<MutationReport, ProviderError> {
        let this = &*self;
        this.for_each_id(external_ids, |id| async move {
            this.move_message(&id, folder_id).await
        })
        .await
    }

    async fn delete_messages(
        &mut self,
        external_ids: &[String],
        permanent: bool,
    ) -> Result<MutationReport, ProviderError> {
        let this = &*self;
        this.for_each_id(external_ids, |id| async move {
            if permanent {
                this.remove_message(&id).await
            } else {
                this.move_message(&id, "deleteditems").await
            }
        })
        .await
    }

    async fn archive_messages(
        &mut self,
        external_ids: &[String],
    ) -> Result<MutationReport, ProviderError> {
        let this = &*self;
        this.for_each_id(external_ids, |id| async move {
            this.move_message(&id, "archive").await
        })
        .await
    }
}

/// Consent flow for Microsoft accounts.
pub struct GraphAuth {
    workflow: OAuthWorkflow,
    http: reqwest::Client,
}

impl GraphAuth {
    pub fn new(workflow: OAuthWorkflow, http: reqwest::Client) -> Self {
        Self { workflow, http }
    }
}

#[async_trait]
impl OAuthProvider for GraphAuth {
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
            .get(format!("{GRAPH_BASE}/me?$select=mail,userPrincipalName,displayName"))
            .bearer_auth(&credentials.access_token)
            .send()
            .await?;
        let user: GraphUser = read_json(response, "graph profile").await?;

        let email_address = user
            .mail
            .or(user.user_principal_name)
            .ok_or_else(|| ProviderError::Data("graph profile has no mail address".to_string()))?;
        let display_name = user.display_name.unwrap_or_else(|| email_address.clone());

        Ok(OAuthGrant {
            credentials,
            email_address,
            display_name,
        })
    }
}

fn into_send_error(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::Data(reason) | ProviderError::NotFound(reason) => ProviderError::Send(reason),
        other => other,
    }
}

fn graph_message_to_mail(account_id: Uuid, message: GraphMessage) -> harbor_core::MailMessage {
    let (body_text, body_html) = match message.body {
        Some(GraphBody {
            content_type,
            content: Some(content),
        }) => {
            if content_type
                .as_deref()
                .map(|kind| kind.eq_ignore_ascii_case("html"))
                .unwrap_or(false)
            {
                (None, Some(content))
            } else {
                (Some(content), None)
            }
        }
        _ => (None, None),
    };

    let is_draft = message.is_draft.unwrap_or(false);
    let mut message_labels = vec![labels::INBOX.to_string()];
    if is_draft {
        message_labels.push(labels::DRAFT.to_string());
    }

    let envelope = ParsedEnvelope {
        from: message.from.and_then(recipient_to_address),
        to: recipients(message.to_recipients),
        cc: recipients(message.cc_recipients),
        bcc: recipients(message.bcc_recipients),
        reply_to: recipients(message.reply_to),
        subject: message.subject,
        message_id: message.internet_message_id,
        in_reply_to: None,
        references: None,
        body_text,
        body_html,
        attachments: Vec::new(),
        date: message.sent_date_time.as_deref().and_then(parse_graph_datetime),
    };

    let mut mail = build_message(
        account_id,
        MessageParts {
            external_id: message.id,
            envelope,
            flags: MessageFlags {
                read: message.is_read.unwrap_or(false),
                starred: message
                    .flag
                    .and_then(|flag| flag.flag_status)
                    .map(|status| status.eq_ignore_ascii_case("flagged"))
                    .unwrap_or(false),
                draft: is_draft,
                deleted: false,
            },
            labels: message_labels,
            preview: message.body_preview,
            received_at: message
                .received_date_time
                .as_deref()
                .and_then(parse_graph_datetime),
        },
    );
    // Graph reports attachment presence without listing them unless expanded.
    mail.has_attachments = message.has_attachments.unwrap_or(false);
    mail
}

fn recipients(list: Vec<GraphRecipient>) -> Vec<MailAddress> {
    list.into_iter().filter_map(recipient_to_address).collect()
}

fn recipient_to_address(recipient: GraphRecipient) -> Option<MailAddress> {
    let email = recipient.email_address?;
    let address = email.address.filter(|address| !address.trim().is_empty())?;
    Some(MailAddress::new(address, email.name))
}

fn parse_graph_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

fn address_payload(addresses: &[MailAddress]) -> Vec<Value> {
    addresses
        .iter()
        .map(|address| {
            json!({
                "emailAddress": {
                    "name": address.name.clone().unwrap_or_default(),
                    "address": address.address,
                }
            })
        })
        .collect()
}

fn attachment_payloads(params: &SendParams) -> Vec<Value> {
    params
        .attachments
        .iter()
        .map(|attachment| {
            json!({
                "@odata.type": "#microsoft.graph.fileAttachment",
                "name": attachment.file_name,
                "contentType": attachment.mime_type,
                "contentBytes": STANDARD.encode(&attachment.content),
            })
        })
        .collect()
}

fn draft_payload(params: &SendParams, include_attachments: bool) -> Value {
    let mut payload = json!({
        "subject": params.subject,
        "body": {
            "contentType": if params.is_html { "HTML" } else { "Text" },
            "content": params.body,
        },
        "toRecipients": address_payload(&params.to),
        "ccRecipients": address_payload(&params.cc),
        "bccRecipients": address_payload(&params.bcc),
    });
    if include_attachments && !params.attachments.is_empty() {
        payload["attachments"] = Value::Array(attachment_payloads(params));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_page() -> DeltaPage {
        serde_json::from_value(json!({
            "value": [
                {
                    "id": "AAMk-1",
                    "conversationId": "conv-a",
                    "subject": "Budget",
                    "bodyPreview": "Numbers attached",
                    "body": { "contentType": "html", "content": "<p>Numbers attached</p>" },
                    "from": { "emailAddress": { "name": "Grace", "address": "Grace@Contoso.com" } },
                    "toRecipients": [{ "emailAddress": { "address": "ada@contoso.com" } }],
                    "isRead": false,
                    "isDraft": false,
                    "flag": { "flagStatus": "flagged" },
                    "hasAttachments": true,
                    "internetMessageId": "<budget@contoso.com>",
                    "receivedDateTime": "2024-06-03T08:01:00Z",
                    "sentDateTime": "2024-06-03T08:00:30Z"
                },
                {
                    "id": "AAMk-2",
                    "conversationId": "conv-a",
                    "subject": "RE: Budget",
                    "body": { "contentType": "text", "content": "Thanks" },
                    "from": { "emailAddress": { "address": "ada@contoso.com" } },
                    "isRead": true,
                    "receivedDateTime": "2024-06-03T09:00:00Z"
                },
                { "id": "AAMk-9", "@removed": { "reason": "deleted" } }
            ],
            "@odata.deltaLink": "https://graph.microsoft.com/v1.0/me/mailFolders/inbox/messages/delta?$deltatoken=abc"
        }))
        .expect("delta page")
    }

    fn provider() -> GraphProvider {
        GraphProvider::new(
            Uuid::nil(),
            ProviderKind::GraphWork,
            OAuthCredentials {
                access_token: "token".to_string(),
                refresh_token: None,
                expires_at: None,
            },
            None,
            reqwest::Client::new(),
            ProviderSettings::default(),
        )
    }

    #[test]
    fn delta_page_groups_by_conversation_and_collects_removals() {
        let page = delta_page();
        let cursor = SyncCursor::new(page.delta_link.clone().expect("delta link"));
        let result = provider().assemble(page.value, cursor, false);

        assert_eq!(result.threads.len(), 1);
        let bundle = &result.threads[0];
        assert_eq!(bundle.thread.external_id, "conv-a");
        assert_eq!(bundle.thread.message_count, 2);
        assert_eq!(bundle.thread.unread_count, 1);
        assert!(bundle.thread.status.is_starred);
        assert!(bundle.thread.status.in_inbox);
        assert_eq!(result.deleted_message_ids, vec!["AAMk-9"]);
        assert!(result.new_cursor.as_str().contains("deltatoken"));
    }

    #[test]
    fn html_body_and_provider_preview_are_kept() {
        let page = delta_page();
        let message = page.value.into_iter().next().expect("message");
        let mail = graph_message_to_mail(Uuid::nil(), message);

        assert_eq!(mail.from.address, "grace@contoso.com");
        assert!(mail.body_text.is_none());
        assert_eq!(mail.body_html.as_deref(), Some("<p>Numbers attached</p>"));
        assert_eq!(mail.snippet, "Numbers attached");
        assert!(mail.has_attachments);
        assert!(mail.sent_at < mail.received_at);
    }

    #[tokio::test]
    async fn foreign_cursor_is_rejected_before_any_request() {
        let mut provider = provider();
        provider.connect().await.expect("connect");
        let result = provider
            .fetch_changes(&SyncCursor::new("https://evil.example.net/delta"))
            .await;
        assert!(matches!(result, Err(ProviderError::CursorInvalid(_))));
    }

    #[tokio::test]
    async fn operations_before_connect_fail() {
        let mut provider = provider();
        assert!(matches!(
            provider.perform_initial_sync().await,
            Err(ProviderError::NotConnected)
        ));
        assert!(matches!(
            provider.mark_as_read(&["AAMk-1".to_string()], true).await,
            Err(ProviderError::NotConnected)
        ));
    }

    #[test]
    fn draft_payload_marks_html_content() {
        let params = SendParams {
            from: MailAddress::new("ada@contoso.com", None),
            to: vec![MailAddress::new("grace@contoso.com", Some("Grace".to_string()))],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: "Hello".to_string(),
            body: "<b>hi</b>".to_string(),
            is_html: true,
            attachments: Vec::new(),
            reply_to: None,
        };
        let payload = draft_payload(&params, true);
        assert_eq!(payload["body"]["contentType"], "HTML");
        assert_eq!(payload["toRecipients"][0]["emailAddress"]["address"], "grace@contoso.com");
        assert!(payload.get("attachments").is_none());
    }
}
