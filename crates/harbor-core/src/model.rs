use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

/// Canonical placement labels carried on every [`MailMessage`], whatever the provider.
pub mod labels {
    pub const INBOX: &str = "INBOX";
    pub const SENT: &str = "SENT";
    pub const DRAFT: &str = "DRAFT";
    pub const TRASH: &str = "TRASH";
    pub const SPAM: &str = "SPAM";
    pub const STARRED: &str = "STARRED";
    pub const UNREAD: &str = "UNREAD";
    pub const ARCHIVE: &str = "ARCHIVE";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GraphWork,
    GraphPersonal,
    Gmail,
    Imap,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphWork => "graph_work",
            Self::GraphPersonal => "graph_personal",
            Self::Gmail => "gmail",
            Self::Imap => "imap",
        }
    }

    pub fn uses_oauth(&self) -> bool {
        !matches!(self, Self::Imap)
    }

    pub fn is_graph(&self) -> bool {
        matches!(self, Self::GraphWork | Self::GraphPersonal)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "graph_work" => Ok(Self::GraphWork),
            "graph_personal" => Ok(Self::GraphPersonal),
            "gmail" => Ok(Self::Gmail),
            "imap" => Ok(Self::Imap),
            other => Err(format!("unknown provider kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NeverSynced,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeverSynced => "never_synced",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "never_synced" => Ok(Self::NeverSynced),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

/// Provider-defined continuation token. Only the adapter that produced it may parse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProfile {
    pub client_id: String,
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    pub auth_url: Url,
    pub token_url: Url,
    pub redirect_url: Url,
    pub scopes: Vec<String>,
    /// Additional authorization parameters, e.g. `access_type=offline` for Google.
    #[serde(default)]
    pub extra_auth_params: Vec<(String, String)>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthCredentials {
    /// True when the token is expired or expires within `skew` of `now`.
    /// Tokens without a known expiry are treated as valid.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + skew,
            None => false,
        }
    }
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImapCredentials {
    pub imap: ServerEndpoint,
    pub smtp: Option<ServerEndpoint>,
}

impl ImapCredentials {
    /// SMTP settings with the IMAP username/password filled in where the SMTP side left them empty.
    pub fn smtp_endpoint(&self) -> Option<ServerEndpoint> {
        let smtp = self.smtp.as_ref()?;
        let username = if smtp.username.is_empty() {
            self.imap.username.clone()
        } else {
            smtp.username.clone()
        };
        let password = if smtp.password.is_empty() {
            self.imap.password.clone()
        } else {
            smtp.password.clone()
        };

        Some(ServerEndpoint {
            host: smtp.host.clone(),
            port: if smtp.port == 0 { 587 } else { smtp.port },
            username,
            password,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    #[serde(rename = "oauth")]
    OAuth(OAuthCredentials),
    Imap(ImapCredentials),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub email_address: String,
    pub display_name: String,
    pub credentials: Credentials,
    pub sync_cursor: Option<SyncCursor>,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        provider: ProviderKind,
        email_address: impl Into<String>,
        display_name: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider,
            email_address: email_address.into(),
            display_name: display_name.into(),
            credentials,
            sync_cursor: None,
            sync_status: SyncStatus::NeverSynced,
            last_sync_at: None,
            last_sync_error: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// OAuth providers carry OAuth tokens, IMAP carries server endpoints.
    pub fn credentials_match_provider(&self) -> bool {
        match &self.credentials {
            Credentials::OAuth(_) => self.provider.uses_oauth(),
            Credentials::Imap(_) => !self.provider.uses_oauth(),
        }
    }

    pub fn oauth_credentials(&self) -> Option<&OAuthCredentials> {
        match &self.credentials {
            Credentials::OAuth(credentials) => Some(credentials),
            Credentials::Imap(_) => None,
        }
    }

    pub fn imap_credentials(&self) -> Option<&ImapCredentials> {
        match &self.credentials {
            Credentials::Imap(credentials) => Some(credentials),
            Credentials::OAuth(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl MailAddress {
    /// Addresses are stored lowercase; the display name keeps its original case.
    pub fn new(address: impl AsRef<str>, name: Option<String>) -> Self {
        let name = name
            .map(|name| name.trim().trim_matches('"').trim().to_string())
            .filter(|name| !name.is_empty());
        Self {
            name,
            address: address.as_ref().trim().to_lowercase(),
        }
    }

    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{name} <{}>", self.address),
            None => self.address.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MessageFlags {
    pub read: bool,
    pub starred: bool,
    pub draft: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: Uuid,
    pub account_id: Uuid,
    pub external_id: String,
    pub thread_id: Uuid,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub reply_to: Vec<MailAddress>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub snippet: String,
    pub message_id_header: Option<String>,
    pub in_reply_to: Option<String>,
    /// Raw `References` header, unparsed.
    pub references: Option<String>,
    pub flags: MessageFlags,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl MailMessage {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels
            .iter()
            .any(|value| value.eq_ignore_ascii_case(label))
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.sent_at.max(self.received_at)
    }

    pub fn analysis_input(&self) -> AnalysisInput {
        AnalysisInput {
            subject: self.subject.clone(),
            body: self
                .body_text
                .clone()
                .or_else(|| self.body_html.clone())
                .unwrap_or_default(),
            from: self.from.display(),
            date: Some(self.sent_at),
        }
    }
}

/// Input shape consumed by the text-analysis service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisInput {
    pub subject: String,
    pub body: String,
    pub from: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FolderType {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    Custom,
}

impl FolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Trash => "trash",
            Self::Spam => "spam",
            Self::Archive => "archive",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for FolderType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "inbox" => Ok(Self::Inbox),
            "sent" => Ok(Self::Sent),
            "drafts" => Ok(Self::Drafts),
            "trash" => Ok(Self::Trash),
            "spam" => Ok(Self::Spam),
            "archive" => Ok(Self::Archive),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown folder type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailFolder {
    pub account_id: Uuid,
    pub remote_id: String,
    pub name: String,
    pub display_name: String,
    pub folder_type: FolderType,
    pub parent_id: Option<String>,
    pub total_count: u32,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadFilter {
    Inbox,
    Sent,
    Drafts,
    Starred,
    Archived,
    Trash,
    Spam,
    Unread,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadQuery {
    pub account_id: Option<Uuid>,
    pub filter: Option<ThreadFilter>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ThreadQuery {
    fn default() -> Self {
        Self {
            account_id: None,
            filter: None,
            since: None,
            until: None,
            text: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult<T> {
    pub total: usize,
    pub items: Vec<T>,
}

/// Local optimistic edit applied to stored messages ahead of the provider round trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocalChange {
    MarkRead(bool),
    MarkStarred(bool),
    Archive,
    Trash,
    /// Permanent removal; the store drops the message instead of editing it.
    Purge,
    MoveTo(FolderType),
}

const PLACEMENT_LABELS: &[&str] = &[
    labels::INBOX,
    labels::TRASH,
    labels::SPAM,
    labels::ARCHIVE,
];

impl LocalChange {
    pub fn apply(&self, flags: &mut MessageFlags, message_labels: &mut Vec<String>) {
        match self {
            Self::MarkRead(read) => flags.read = *read,
            Self::MarkStarred(starred) => flags.starred = *starred,
            Self::Archive => {
                message_labels.retain(|label| !label.eq_ignore_ascii_case(labels::INBOX));
            }
            Self::Trash | Self::Purge => {
                message_labels.retain(|label| !label.eq_ignore_ascii_case(labels::INBOX));
                push_label(message_labels, labels::TRASH);
                flags.deleted = true;
            }
            Self::MoveTo(folder_type) => {
                message_labels.retain(|label| {
                    !PLACEMENT_LABELS
                        .iter()
                        .any(|placement| label.eq_ignore_ascii_case(placement))
                });
                flags.deleted = matches!(folder_type, FolderType::Trash);
                let target = match folder_type {
                    FolderType::Inbox => Some(labels::INBOX),
                    FolderType::Sent => Some(labels::SENT),
                    FolderType::Drafts => Some(labels::DRAFT),
                    FolderType::Trash => Some(labels::TRASH),
                    FolderType::Spam => Some(labels::SPAM),
                    FolderType::Archive | FolderType::Custom => None,
                };
                if let Some(target) = target {
                    push_label(message_labels, target);
                }
            }
        }
    }
}

fn push_label(message_labels: &mut Vec<String>, label: &str) {
    if !message_labels
        .iter()
        .any(|existing| existing.eq_ignore_ascii_case(label))
    {
        message_labels.push(label.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imap_credentials() -> ImapCredentials {
        ImapCredentials {
            imap: ServerEndpoint {
                host: "imap.example.org".to_string(),
                port: 993,
                username: "ada".to_string(),
                password: "imap-secret".to_string(),
            },
            smtp: Some(ServerEndpoint {
                host: "smtp.example.org".to_string(),
                port: 0,
                username: String::new(),
                password: String::new(),
            }),
        }
    }

    #[test]
    fn smtp_endpoint_falls_back_to_imap_login() {
        let smtp = imap_credentials().smtp_endpoint().expect("smtp configured");
        assert_eq!(smtp.host, "smtp.example.org");
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.username, "ada");
        assert_eq!(smtp.password, "imap-secret");
    }

    #[test]
    fn credential_shape_must_match_provider() {
        let imap = Account::new(
            ProviderKind::Imap,
            "ada@example.org",
            "Ada",
            Credentials::Imap(imap_credentials()),
        );
        assert!(imap.credentials_match_provider());

        let mismatched = Account::new(
            ProviderKind::Gmail,
            "ada@example.org",
            "Ada",
            Credentials::Imap(imap_credentials()),
        );
        assert!(!mismatched.credentials_match_provider());
    }

    #[test]
    fn token_expiry_honours_skew() {
        let now = Utc::now();
        let credentials = OAuthCredentials {
            access_token: "token".to_string(),
            refresh_token: None,
            expires_at: Some(now + Duration::seconds(30)),
        };
        assert!(credentials.is_expired(now, Duration::seconds(60)));
        assert!(!credentials.is_expired(now, Duration::zero()));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let rendered = format!("{:?}", Credentials::Imap(imap_credentials()));
        assert!(!rendered.contains("imap-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn addresses_are_lowercased_but_names_keep_case() {
        let address = MailAddress::new(" Ada.Lovelace@Example.ORG ", Some("\"Ada Lovelace\"".to_string()));
        assert_eq!(address.address, "ada.lovelace@example.org");
        assert_eq!(address.name.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn credentials_serialize_with_kind_tag() {
        let json = serde_json::to_value(Credentials::OAuth(OAuthCredentials {
            access_token: "a".to_string(),
            refresh_token: Some("r".to_string()),
            expires_at: None,
        }))
        .expect("serialize credentials");
        assert_eq!(json["kind"], "oauth");
    }

    #[test]
    fn archive_and_trash_edit_placement_labels() {
        let mut flags = MessageFlags::default();
        let mut message_labels = vec!["INBOX".to_string(), "IMPORTANT".to_string()];

        LocalChange::Archive.apply(&mut flags, &mut message_labels);
        assert_eq!(message_labels, vec!["IMPORTANT"]);

        LocalChange::Trash.apply(&mut flags, &mut message_labels);
        assert!(flags.deleted);
        assert_eq!(message_labels, vec!["IMPORTANT", "TRASH"]);

        LocalChange::MoveTo(FolderType::Inbox).apply(&mut flags, &mut message_labels);
        assert!(!flags.deleted);
        assert_eq!(message_labels, vec!["IMPORTANT", "INBOX"]);
    }
}
