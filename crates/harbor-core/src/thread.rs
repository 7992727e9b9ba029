use crate::{labels, MailMessage, MessageFlags, SyncCursor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Independent status booleans; a conversation can be in the inbox and starred at once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ThreadStatus {
    pub in_inbox: bool,
    pub is_sent: bool,
    pub is_draft: bool,
    pub is_starred: bool,
    pub is_archived: bool,
    pub is_trashed: bool,
    pub is_spam: bool,
}

impl ThreadStatus {
    pub fn from_messages(messages: &[MailMessage]) -> Self {
        let in_inbox = messages.iter().any(|m| m.has_label(labels::INBOX));
        let is_trashed = messages
            .iter()
            .any(|m| m.has_label(labels::TRASH) || m.flags.deleted);

        Self {
            in_inbox,
            is_sent: messages.iter().any(|m| m.has_label(labels::SENT)),
            is_draft: messages
                .iter()
                .any(|m| m.has_label(labels::DRAFT) || m.flags.draft),
            is_starred: messages
                .iter()
                .any(|m| m.flags.starred || m.has_label(labels::STARRED)),
            // Archived is derived: outside the inbox and not in the trash.
            is_archived: !in_inbox && !is_trashed,
            is_trashed,
            is_spam: messages.iter().any(|m| m.has_label(labels::SPAM)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub account_id: Uuid,
    pub external_id: String,
    pub subject: String,
    pub snippet: String,
    pub participants: Vec<String>,
    pub status: ThreadStatus,
    pub unread_count: u32,
    pub message_count: u32,
    pub has_attachments: bool,
    pub last_message_at: DateTime<Utc>,
}

impl Thread {
    /// Builds a thread whose aggregates reflect `messages`. Returns `None` for an empty set.
    pub fn from_messages(
        account_id: Uuid,
        external_id: impl Into<String>,
        messages: &[MailMessage],
    ) -> Option<Self> {
        let mut thread = Self {
            id: Uuid::new_v4(),
            account_id,
            external_id: external_id.into(),
            subject: String::new(),
            snippet: String::new(),
            participants: Vec::new(),
            status: ThreadStatus::default(),
            unread_count: 0,
            message_count: 0,
            has_attachments: false,
            last_message_at: Utc::now(),
        };

        thread.recompute(messages).then_some(thread)
    }

    /// Rederives every aggregate from the complete message set. Nothing is patched
    /// incrementally, so repeated calls with the same input converge on the same state.
    /// Returns `false` and leaves the thread untouched when `messages` is empty.
    pub fn recompute(&mut self, messages: &[MailMessage]) -> bool {
        let mut ordered: Vec<&MailMessage> = messages.iter().collect();
        ordered.sort_by_key(|message| message.last_activity_at());

        let Some(latest) = ordered.last() else {
            return false;
        };

        let mut seen = HashSet::new();
        let mut participants = Vec::new();
        for message in &ordered {
            let addresses = std::iter::once(&message.from)
                .chain(message.to.iter())
                .chain(message.cc.iter());
            for address in addresses {
                let normalized = address.address.trim().to_lowercase();
                if !normalized.is_empty() && seen.insert(normalized.clone()) {
                    participants.push(normalized);
                }
            }
        }

        self.subject = latest.subject.clone();
        self.snippet = latest.snippet.clone();
        self.participants = participants;
        self.status = ThreadStatus::from_messages(messages);
        self.message_count = messages.len() as u32;
        self.unread_count = messages.iter().filter(|m| !m.flags.read).count() as u32;
        self.has_attachments = messages.iter().any(|m| m.has_attachments);
        self.last_message_at = latest.last_activity_at();
        true
    }
}

/// A thread and its messages while in transit from an adapter to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadBundle {
    pub thread: Thread,
    pub messages: Vec<MailMessage>,
}

impl ThreadBundle {
    /// Builds the thread aggregate and points every message at it.
    pub fn assemble(
        account_id: Uuid,
        external_id: impl Into<String>,
        mut messages: Vec<MailMessage>,
    ) -> Option<Self> {
        let thread = Thread::from_messages(account_id, external_id, &messages)?;
        messages.sort_by_key(|message| message.received_at);
        for message in &mut messages {
            message.thread_id = thread.id;
        }
        Some(Self { thread, messages })
    }
}

/// Flag state reported by the provider for a message that is already stored locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagUpdate {
    pub external_id: String,
    pub flags: MessageFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub threads: Vec<ThreadBundle>,
    pub new_cursor: SyncCursor,
    pub has_more: bool,
    /// Provider conversation ids whose threads must be removed.
    pub deleted_thread_ids: Vec<String>,
    /// Provider message ids that must be removed; emptied threads go with them.
    #[serde(default)]
    pub deleted_message_ids: Vec<String>,
    #[serde(default)]
    pub flag_updates: Vec<FlagUpdate>,
    /// When present, the complete set of message ids still held by the provider.
    /// Locally stored messages of the account outside this set are removed.
    #[serde(default)]
    pub retained_message_ids: Option<Vec<String>>,
}

impl SyncResult {
    pub fn new(new_cursor: SyncCursor) -> Self {
        Self {
            threads: Vec::new(),
            new_cursor,
            has_more: false,
            deleted_thread_ids: Vec::new(),
            deleted_message_ids: Vec::new(),
            flag_updates: Vec::new(),
            retained_message_ids: None,
        }
    }

    pub fn message_count(&self) -> usize {
        self.threads.iter().map(|bundle| bundle.messages.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MailAddress;
    use chrono::TimeZone;

    fn message(external_id: &str, labels: &[&str], read: bool, minute: u32) -> MailMessage {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).single().expect("valid date");
        MailMessage {
            id: Uuid::new_v4(),
            account_id: Uuid::nil(),
            external_id: external_id.to_string(),
            thread_id: Uuid::nil(),
            from: MailAddress::new("Grace@Example.org", Some("Grace Hopper".to_string())),
            to: vec![MailAddress::new("ada@example.org", None)],
            cc: vec![MailAddress::new("GRACE@example.org", None)],
            bcc: Vec::new(),
            reply_to: Vec::new(),
            subject: format!("subject {external_id}"),
            body_text: Some("body".to_string()),
            body_html: None,
            snippet: format!("snippet {external_id}"),
            message_id_header: None,
            in_reply_to: None,
            references: None,
            flags: MessageFlags {
                read,
                ..MessageFlags::default()
            },
            labels: labels.iter().map(|label| label.to_string()).collect(),
            has_attachments: false,
            attachments: Vec::new(),
            sent_at: at,
            received_at: at,
        }
    }

    #[test]
    fn unread_count_is_recomputed_wholesale() {
        let mut messages = vec![
            message("m1", &["INBOX"], false, 1),
            message("m2", &["INBOX"], false, 2),
            message("m3", &["INBOX"], true, 3),
        ];
        let mut thread = Thread::from_messages(Uuid::nil(), "t-1", &messages).expect("thread");
        assert_eq!(thread.unread_count, 2);
        assert_eq!(thread.message_count, 3);

        for message in &mut messages {
            message.flags.read = true;
        }
        assert!(thread.recompute(&messages));
        assert_eq!(thread.unread_count, 0);
        assert!(thread.unread_count <= thread.message_count);
    }

    #[test]
    fn message_without_inbox_or_trash_is_archived() {
        let thread = Thread::from_messages(Uuid::nil(), "t-1", &[message("m1", &["IMPORTANT"], true, 1)])
            .expect("thread");
        assert!(thread.status.is_archived);
        assert!(!thread.status.in_inbox);
    }

    #[test]
    fn trashed_message_is_neither_inbox_nor_archived() {
        let thread = Thread::from_messages(Uuid::nil(), "t-1", &[message("m1", &["TRASH"], true, 1)])
            .expect("thread");
        assert!(thread.status.is_trashed);
        assert!(!thread.status.in_inbox);
        assert!(!thread.status.is_archived);
    }

    #[test]
    fn latest_message_drives_subject_and_timestamp() {
        let messages = vec![message("late", &["INBOX"], true, 40), message("early", &["INBOX"], true, 5)];
        let thread = Thread::from_messages(Uuid::nil(), "t-1", &messages).expect("thread");
        assert_eq!(thread.subject, "subject late");
        assert_eq!(thread.last_message_at, messages[0].received_at);
    }

    #[test]
    fn participants_are_deduplicated_case_insensitively() {
        let thread = Thread::from_messages(Uuid::nil(), "t-1", &[message("m1", &["INBOX"], true, 1)])
            .expect("thread");
        assert_eq!(thread.participants, vec!["grace@example.org", "ada@example.org"]);
    }

    #[test]
    fn empty_message_set_builds_no_thread() {
        assert!(Thread::from_messages(Uuid::nil(), "t-1", &[]).is_none());
    }

    #[test]
    fn assemble_points_messages_at_thread() {
        let bundle = ThreadBundle::assemble(
            Uuid::nil(),
            "t-9",
            vec![message("b", &["INBOX"], true, 9), message("a", &["INBOX"], true, 2)],
        )
        .expect("bundle");
        assert!(bundle.messages.iter().all(|m| m.thread_id == bundle.thread.id));
        assert_eq!(bundle.messages[0].external_id, "a");
    }
}
