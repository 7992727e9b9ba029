use crate::compose::{build_mime, generate_message_id};
use crate::grouping::{conversation_key, group_messages};
use crate::normalize::{build_message, parse_rfc822, MessageParts};
use crate::{
    folder_type_for_imap_path, MailProvider, MutationReport, ProviderError, ProviderSettings,
    SendParams,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harbor_core::{
    labels, FlagUpdate, FolderType, ImapCredentials, MailAddress, MailFolder, MailMessage,
    MessageFlags, OAuthCredentials, ProviderKind, SyncCursor, SyncResult,
};
use ::imap::types::Flag;
use imap_proto::NameAttribute;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::collections::HashSet;
use uuid::Uuid;

type ImapSession = ::imap::Session<::imap::Connection>;

const INBOX: &str = "INBOX";
const FULL_FETCH: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";
const SMTPS_PORT: u16 = 465;

/// `uid_validity:last_uid` of the inbox at the end of the previous pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImapCursor {
    pub uid_validity: u32,
    pub last_uid: u32,
}

impl ImapCursor {
    pub fn parse(cursor: &SyncCursor) -> Option<Self> {
        let (validity, last) = cursor.as_str().split_once(':')?;
        Some(Self {
            uid_validity: validity.trim().parse().ok()?,
            last_uid: last.trim().parse().ok()?,
        })
    }

    pub fn to_cursor(self) -> SyncCursor {
        SyncCursor::new(format!("{}:{}", self.uid_validity, self.last_uid))
    }
}

/// Message body and metadata copied out of the blocking session.
#[derive(Debug)]
struct FetchedMessage {
    uid: u32,
    flags: MessageFlags,
    internal_date: Option<DateTime<Utc>>,
    raw: Vec<u8>,
}

#[derive(Debug, Default)]
struct InboxChanges {
    cursor: Option<ImapCursor>,
    fetched: Vec<FetchedMessage>,
    flag_updates: Vec<FlagUpdate>,
    retained: Vec<String>,
    has_more: bool,
}

pub struct ImapProvider {
    account_id: Uuid,
    email_address: String,
    credentials: ImapCredentials,
    settings: ProviderSettings,
    session: Option<ImapSession>,
}

impl ImapProvider {
    pub fn new(
        account_id: Uuid,
        email_address: String,
        credentials: ImapCredentials,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            account_id,
            email_address,
            credentials,
            settings,
            session: None,
        }
    }

    /// Runs a blocking session operation off the runtime. The session is handed back
    /// afterwards; a timed-out or panicked operation drops it and the provider reads as
    /// disconnected from then on.
    async fn with_session<T, F>(&mut self, context: &'static str, op: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, ProviderError> + Send + 'static,
    {
        let mut session = self.session.take().ok_or(ProviderError::NotConnected)?;
        let task = tokio::task::spawn_blocking(move || {
            let outcome = op(&mut session);
            (session, outcome)
        });

        match tokio::time::timeout(self.settings.request_timeout, task).await {
            Ok(Ok((session, outcome))) => {
                self.session = Some(session);
                outcome
            }
            Ok(Err(err)) => Err(ProviderError::Connection(format!("imap {context} task failed: {err}"))),
            Err(_) => Err(ProviderError::Connection(format!("imap {context} timed out"))),
        }
    }

    fn assemble(&self, fetched: Vec<FetchedMessage>) -> Result<Vec<harbor_core::ThreadBundle>, ProviderError> {
        let mut keyed = Vec::with_capacity(fetched.len());
        for message in fetched {
            let mail = fetched_to_mail(self.account_id, message)?;
            keyed.push((conversation_key(&mail), mail));
        }
        Ok(group_messages(self.account_id, keyed))
    }

    async fn run_batch<F>(
        &mut self,
        context: &'static str,
        external_ids: &[String],
        op: F,
    ) -> Result<MutationReport, ProviderError>
    where
        F: Fn(&mut ImapSession, &str) -> Result<(), ProviderError> + Send + 'static,
    {
        let ids = external_ids.to_vec();
        let outcomes = self
            .with_session(context, move |session| {
                session.select(INBOX)?;
                Ok(ids
                    .into_iter()
                    .map(|id| {
                        let outcome = parse_uid(&id).and_then(|_| op(session, &id));
                        (id, outcome)
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        let mut report = MutationReport::default();
        for (id, outcome) in outcomes {
            report.record(&id, outcome)?;
        }
        Ok(report)
    }
}

#[async_trait]
impl MailProvider for ImapProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    async fn connect(&mut self) -> Result<Option<OAuthCredentials>, ProviderError> {
        if self.session.is_some() {
            return Ok(None);
        }

        let endpoint = self.credentials.imap.clone();
        if endpoint.host.trim().is_empty() {
            return Err(ProviderError::Connection("imap host is not configured".to_string()));
        }

        let task = tokio::task::spawn_blocking(move || {
            let client = ::imap::ClientBuilder::new(endpoint.host.as_str(), endpoint.port)
                .connect()
                .map_err(|err| {
                    ProviderError::Connection(format!("could not reach {}: {err}", endpoint.host))
                })?;
            client
                .login(endpoint.username.as_str(), endpoint.password.as_str())
                .map_err(|(err, _)| ProviderError::Auth(format!("imap login rejected: {err}")))
        });

        let session = match tokio::time::timeout(self.settings.request_timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(err)) => {
                return Err(ProviderError::Connection(format!("imap connect task failed: {err}")))
            }
            Err(_) => return Err(ProviderError::Connection("imap connect timed out".to_string())),
        };

        tracing::debug!(account_id = %self.account_id, "imap session opened");
        self.session = Some(session);
        Ok(None)
    }

    async fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let task = tokio::task::spawn_blocking(move || session.logout());
        match tokio::time::timeout(self.settings.request_timeout, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => tracing::debug!(error = %err, "imap logout failed"),
            Ok(Err(err)) => tracing::debug!(error = %err, "imap logout task failed"),
            Err(_) => tracing::debug!("imap logout timed out"),
        }
    }

    async fn perform_initial_sync(&mut self) -> Result<SyncResult, ProviderError> {
        let limit = self.settings.initial_sync_limit.max(1);
        let changes = self
            .with_session("initial sync", move |session| fetch_newest(session, limit))
            .await?;

        let cursor = changes
            .cursor
            .ok_or_else(|| ProviderError::Data("inbox reported no uid validity".to_string()))?;
        let mut result = SyncResult::new(cursor.to_cursor());
        result.has_more = changes.has_more;
        result.threads = self.assemble(changes.fetched)?;
        Ok(result)
    }

    async fn fetch_changes(&mut self, cursor: &SyncCursor) -> Result<SyncResult, ProviderError> {
        let previous = ImapCursor::parse(cursor).ok_or_else(|| {
            ProviderError::CursorInvalid(format!("'{cursor}' is not an imap cursor"))
        })?;
        let batch = (self.settings.initial_sync_limit.max(1) as usize)
            .saturating_mul(self.settings.incremental_page_limit.max(1) as usize);

        let changes = self
            .with_session("incremental sync", move |session| {
                fetch_since(session, previous, batch)
            })
            .await?;

        let cursor = changes.cursor.unwrap_or(previous);
        let mut result = SyncResult::new(cursor.to_cursor());
        result.has_more = changes.has_more;
        result.flag_updates = changes.flag_updates;
        result.retained_message_ids = Some(changes.retained);
        result.threads = self.assemble(changes.fetched)?;
        Ok(result)
    }

    async fn get_folders(&mut self) -> Result<Vec<MailFolder>, ProviderError> {
        let account_id = self.account_id;
        self.with_session("list folders", move |session| {
            let names = session.list(None, Some("*"))?;
            let listed = names
                .iter()
                .filter(|name| {
                    !name
                        .attributes()
                        .iter()
                        .any(|attribute| matches!(attribute, NameAttribute::NoSelect))
                })
                .map(|name| (name.name().to_string(), name.delimiter().map(str::to_string)))
                .collect::<Vec<_>>();

            let mut folders = Vec::with_capacity(listed.len());
            for (path, delimiter) in listed {
                let (total_count, unread_count) = match session.status(&path, "(MESSAGES UNSEEN)") {
                    Ok(status) => (status.exists, status.unseen.unwrap_or(0)),
                    Err(err) => {
                        tracing::debug!(folder = %path, error = %err, "imap status failed");
                        (0, 0)
                    }
                };
                folders.push(imap_folder(account_id, path, delimiter.as_deref(), total_count, unread_count));
            }
            Ok(folders)
        })
        .await
    }

    async fn send_message(&mut self, params: &SendParams) -> Result<String, ProviderError> {
        if self.session.is_none() {
            return Err(ProviderError::NotConnected);
        }
        let smtp = self
            .credentials
            .smtp_endpoint()
            .ok_or_else(|| ProviderError::Send("no smtp server configured".to_string()))?;

        let mut params = params.clone();
        if params.from.address.is_empty() {
            params.from = MailAddress::new(&self.email_address, None);
        }
        let message_id = generate_message_id(&params.from);
        let message = build_mime(&params, message_id.clone())?;

        let relay = if smtp.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
        };
        let builder = relay.map_err(|err| {
            ProviderError::Connection(format!("invalid smtp relay {}: {err}", smtp.host))
        })?;

        let transport = builder
            .port(smtp.port)
            .credentials(SmtpCredentials::new(smtp.username, smtp.password))
            .timeout(Some(self.settings.request_timeout))
            .build();

        transport.send(message).await.map_err(|err| {
            if err.is_timeout() || err.is_transient() {
                ProviderError::Connection(format!("smtp delivery failed: {err}"))
            } else {
                ProviderError::Send(format!("smtp delivery failed: {err}"))
            }
        })?;

        tracing::info!(account_id = %self.account_id, "sent message through smtp");
        Ok(message_id)
    }

    async fn mark_as_read(
        &mut self,
        external_ids: &[String],
        read: bool,
    ) -> Result<MutationReport, ProviderError> {
        let command = if read { "+FLAGS (\\Seen)" } else { "-FLAGS (\\Seen)" };
        self.run_batch("mark read", external_ids, move |session, uid| {
            session.uid_store(uid, command)?;
            Ok(())
        })
        .await
    }

    async fn mark_as_starred(
        &mut self,
        external_ids: &[String],
        starred: bool,
    ) -> Result<MutationReport, ProviderError> {
        let command = if starred { "+FLAGS (\\Flagged)" } else { "-FLAGS (\\Flagged)" };
        self.run_batch("mark starred", external_ids, move |session, uid| {
            session.uid_store(uid, command)?;
            Ok(())
        })
        .await
    }

    async fn move_to_folder(
        &mut self,
        external_ids: &[String],
        folder_id: &str,
    ) -> Result<MutationReport, ProviderError> {
        let target = folder_id.to_string();
        self.run_batch("move", external_ids, move |session, uid| {
            move_uid(session, uid, &target)
        })
        .await
    }

    async fn delete_messages(
        &mut self,
        external_ids: &[String],
        permanent: bool,
    ) -> Result<MutationReport, ProviderError> {
        let trash = if permanent {
            None
        } else {
            self.with_session("find trash", |session| {
                find_special_folder(session, FolderType::Trash)
            })
            .await?
        };

        self.run_batch("delete", external_ids, move |session, uid| match &trash {
            Some(trash) => move_uid(session, uid, trash),
            None if permanent => expunge_uid(session, uid),
            None => {
                // No trash folder: flag only, the server expunges on its own schedule.
                session.uid_store(uid, "+FLAGS (\\Deleted)")?;
                Ok(())
            }
        })
        .await
    }

    async fn archive_messages(
        &mut self,
        external_ids: &[String],
    ) -> Result<MutationReport, ProviderError> {
        let archive = self
            .with_session("find archive", |session| {
                find_special_folder(session, FolderType::Archive)
            })
            .await?
            .ok_or_else(|| ProviderError::NotFound("server has no archive folder".to_string()))?;

        self.run_batch("archive", external_ids, move |session, uid| {
            move_uid(session, uid, &archive)
        })
        .await
    }
}

fn parse_uid(external_id: &str) -> Result<u32, ProviderError> {
    external_id
        .trim()
        .parse::<u32>()
        .map_err(|_| ProviderError::Data(format!("'{external_id}' is not an imap uid")))
}

fn flags_from_imap<'a, 'f: 'a>(flags: impl IntoIterator<Item = &'a Flag<'f>>) -> MessageFlags {
    let mut parsed = MessageFlags::default();
    for flag in flags {
        match flag {
            Flag::Seen => parsed.read = true,
            Flag::Flagged => parsed.starred = true,
            Flag::Draft => parsed.draft = true,
            Flag::Deleted => parsed.deleted = true,
            _ => {}
        }
    }
    parsed
}

fn collect_full(fetches: &::imap::types::Fetches, after_uid: u32) -> Vec<FetchedMessage> {
    fetches
        .iter()
        .filter_map(|fetch| {
            let uid = fetch.uid?;
            if uid <= after_uid {
                return None;
            }
            Some(FetchedMessage {
                uid,
                flags: flags_from_imap(fetch.flags()),
                internal_date: fetch.internal_date().map(|date| date.with_timezone(&Utc)),
                raw: fetch.body()?.to_vec(),
            })
        })
        .collect()
}

/// Newest `limit` inbox messages by sequence number.
fn fetch_newest(session: &mut ImapSession, limit: u32) -> Result<InboxChanges, ProviderError> {
    let mailbox = session.select(INBOX)?;
    let Some(uid_validity) = mailbox.uid_validity else {
        return Ok(InboxChanges::default());
    };

    let mut changes = InboxChanges::default();
    if mailbox.exists > 0 {
        let start = mailbox.exists.saturating_sub(limit) + 1;
        let fetches = session.fetch(format!("{start}:{}", mailbox.exists), FULL_FETCH)?;
        changes.fetched = collect_full(&fetches, 0);
        changes.has_more = start > 1;
    }

    let highest_fetched = changes.fetched.iter().map(|message| message.uid).max().unwrap_or(0);
    let last_uid = mailbox
        .uid_next
        .map(|next| next.saturating_sub(1))
        .unwrap_or(highest_fetched)
        .max(highest_fetched);

    changes.cursor = Some(ImapCursor {
        uid_validity,
        last_uid,
    });
    Ok(changes)
}

/// New messages above the cursor plus the flag state and presence of everything below it.
fn fetch_since(
    session: &mut ImapSession,
    previous: ImapCursor,
    batch: usize,
) -> Result<InboxChanges, ProviderError> {
    let mailbox = session.select(INBOX)?;
    if mailbox.uid_validity != Some(previous.uid_validity) {
        return Err(ProviderError::CursorInvalid(format!(
            "uid validity changed from {} to {:?}",
            previous.uid_validity, mailbox.uid_validity
        )));
    }

    let mut changes = InboxChanges::default();
    let mut retained: HashSet<String> = HashSet::new();

    if previous.last_uid > 0 && mailbox.exists > 0 {
        let known = session.uid_fetch(format!("1:{}", previous.last_uid), "(UID FLAGS)")?;
        for fetch in known.iter() {
            let Some(uid) = fetch.uid else { continue };
            if uid > previous.last_uid {
                continue;
            }
            retained.insert(uid.to_string());
            changes.flag_updates.push(FlagUpdate {
                external_id: uid.to_string(),
                flags: flags_from_imap(fetch.flags()),
            });
        }
    }

    let mut new_uids = Vec::new();
    let unseen_range = new_uid_range(previous.last_uid).filter(|_| mailbox.exists > 0);
    if let Some(range) = unseen_range {
        let listed = session.uid_fetch(range, "(UID)")?;
        new_uids = listed
            .iter()
            .filter_map(|fetch| fetch.uid)
            .filter(|uid| *uid > previous.last_uid)
            .collect::<Vec<_>>();
        new_uids.sort_unstable();
        new_uids.dedup();
    }
    retained.extend(new_uids.iter().map(u32::to_string));

    if new_uids.len() > batch {
        new_uids.truncate(batch);
        changes.has_more = true;
    }

    if !new_uids.is_empty() {
        let set = new_uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches = session.uid_fetch(set, FULL_FETCH)?;
        changes.fetched = collect_full(&fetches, previous.last_uid);
    }

    let highest_new = new_uids.last().copied().unwrap_or(previous.last_uid);
    let last_uid = if changes.has_more {
        highest_new
    } else {
        mailbox
            .uid_next
            .map(|next| next.saturating_sub(1))
            .unwrap_or(highest_new)
            .max(highest_new)
    };

    changes.cursor = Some(ImapCursor {
        uid_validity: previous.uid_validity,
        last_uid: last_uid.max(previous.last_uid),
    });
    changes.retained = retained.into_iter().collect();
    changes.retained.sort();
    Ok(changes)
}

/// UID set of everything after `last_uid`, or `None` once the UID space is exhausted.
fn new_uid_range(last_uid: u32) -> Option<String> {
    last_uid.checked_add(1).map(|first| format!("{first}:*"))
}

fn find_special_folder(
    session: &mut ImapSession,
    folder_type: FolderType,
) -> Result<Option<String>, ProviderError> {
    let names = session.list(None, Some("*"))?;
    Ok(names
        .iter()
        .find(|name| folder_type_for_imap_path(name.name(), name.delimiter()) == folder_type)
        .map(|name| name.name().to_string()))
}

fn move_uid(session: &mut ImapSession, uid: &str, target: &str) -> Result<(), ProviderError> {
    match session.uid_mv(uid, target) {
        Ok(()) => Ok(()),
        Err(::imap::Error::No(_)) | Err(::imap::Error::Bad(_)) => {
            // Servers without MOVE.
            session.uid_copy(uid, target)?;
            expunge_uid(session, uid)
        }
        Err(err) => Err(err.into()),
    }
}

fn expunge_uid(session: &mut ImapSession, uid: &str) -> Result<(), ProviderError> {
    session.uid_store(uid, "+FLAGS (\\Deleted)")?;
    if session.uid_expunge(uid).is_err() {
        session.expunge()?;
    }
    Ok(())
}

fn imap_folder(
    account_id: Uuid,
    path: String,
    delimiter: Option<&str>,
    total_count: u32,
    unread_count: u32,
) -> MailFolder {
    let (parent_id, leaf) = match delimiter.filter(|delimiter| !delimiter.is_empty()) {
        Some(delimiter) => match path.rsplit_once(delimiter) {
            Some((parent, leaf)) => (Some(parent.to_string()), leaf.to_string()),
            None => (None, path.clone()),
        },
        None => (None, path.clone()),
    };

    MailFolder {
        account_id,
        folder_type: folder_type_for_imap_path(&path, delimiter),
        remote_id: path.clone(),
        name: path,
        display_name: leaf,
        parent_id,
        total_count,
        unread_count,
    }
}

fn fetched_to_mail(account_id: Uuid, fetched: FetchedMessage) -> Result<MailMessage, ProviderError> {
    let envelope = parse_rfc822(&fetched.raw)?;
    Ok(build_message(
        account_id,
        MessageParts {
            external_id: fetched.uid.to_string(),
            envelope,
            flags: fetched.flags,
            labels: vec![labels::INBOX.to_string()],
            preview: None,
            received_at: fetched.internal_date,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::ServerEndpoint;
    use std::time::Duration;

    fn provider() -> ImapProvider {
        ImapProvider::new(
            Uuid::nil(),
            "ada@example.org".to_string(),
            ImapCredentials {
                imap: ServerEndpoint {
                    host: "imap.example.org".to_string(),
                    port: 993,
                    username: "ada".to_string(),
                    password: "pw".to_string(),
                },
                smtp: None,
            },
            ProviderSettings {
                request_timeout: Duration::from_secs(5),
                ..ProviderSettings::default()
            },
        )
    }

    fn fetched(uid: u32, raw: &str) -> FetchedMessage {
        FetchedMessage {
            uid,
            flags: MessageFlags {
                read: uid % 2 == 0,
                ..MessageFlags::default()
            },
            internal_date: None,
            raw: raw.as_bytes().to_vec(),
        }
    }

    #[test]
    fn unseen_range_stops_at_the_top_of_the_uid_space() {
        assert_eq!(new_uid_range(0).as_deref(), Some("1:*"));
        assert_eq!(new_uid_range(4_812).as_deref(), Some("4813:*"));
        assert_eq!(new_uid_range(u32::MAX - 1).as_deref(), Some("4294967295:*"));
        assert_eq!(new_uid_range(u32::MAX), None);
    }

    #[test]
    fn cursor_round_trips_and_rejects_garbage() {
        let cursor = ImapCursor {
            uid_validity: 1_700_000,
            last_uid: 42,
        };
        assert_eq!(cursor.to_cursor().as_str(), "1700000:42");
        assert_eq!(ImapCursor::parse(&cursor.to_cursor()), Some(cursor));
        assert_eq!(ImapCursor::parse(&SyncCursor::new("42")), None);
        assert_eq!(ImapCursor::parse(&SyncCursor::new("a:b")), None);
    }

    #[test]
    fn replies_join_the_root_conversation() {
        let root = "From: grace@navy.mil\r\nMessage-ID: <root@navy.mil>\r\nSubject: Cobol\r\n\r\nDraft spec\r\n";
        let reply = "From: ada@example.org\r\nMessage-ID: <r1@example.org>\r\nIn-Reply-To: <root@navy.mil>\r\nReferences: <root@navy.mil>\r\nSubject: Re: Cobol\r\n\r\nComments inline\r\n";
        let other = "From: bob@example.org\r\nSubject: Lunch\r\n\r\nNoon?\r\n";

        let bundles = provider()
            .assemble(vec![fetched(10, root), fetched(11, reply), fetched(12, other)])
            .expect("bundles");

        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].thread.external_id, "<root@navy.mil>");
        assert_eq!(bundles[0].messages.len(), 2);
        assert_eq!(bundles[1].thread.external_id, "uid:12");
        assert!(bundles.iter().all(|bundle| bundle.thread.status.in_inbox));
    }

    #[test]
    fn folder_hierarchy_uses_delimiter() {
        let folder = imap_folder(Uuid::nil(), "INBOX/Receipts".to_string(), Some("/"), 4, 1);
        assert_eq!(folder.parent_id.as_deref(), Some("INBOX"));
        assert_eq!(folder.display_name, "Receipts");
        assert_eq!(folder.folder_type, FolderType::Custom);

        let trash = imap_folder(Uuid::nil(), "Trash".to_string(), Some("/"), 0, 0);
        assert_eq!(trash.folder_type, FolderType::Trash);
        assert!(trash.parent_id.is_none());
    }

    #[test]
    fn uid_must_be_numeric() {
        assert_eq!(parse_uid(" 17 ").expect("uid"), 17);
        assert!(matches!(parse_uid("AAMk"), Err(ProviderError::Data(_))));
    }

    #[tokio::test]
    async fn calls_without_session_fail() {
        let mut provider = provider();
        assert!(matches!(
            provider.perform_initial_sync().await,
            Err(ProviderError::NotConnected)
        ));
        assert!(matches!(
            provider.mark_as_read(&["1".to_string()], true).await,
            Err(ProviderError::NotConnected)
        ));
        provider.disconnect().await;
    }

    #[tokio::test]
    async fn invalid_cursor_is_reported_before_touching_the_server() {
        let mut provider = provider();
        assert!(matches!(
            provider.fetch_changes(&SyncCursor::new("not-a-cursor")).await,
            Err(ProviderError::CursorInvalid(_))
        ));
    }
}
