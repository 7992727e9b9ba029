use crate::storage::{format_datetime, parse_datetime, parse_json, parse_uuid};
use crate::{Storage, StorageError};
use chrono::Utc;
use harbor_core::{
    LocalChange, MailMessage, MessageFlags, SearchResult, SyncResult, Thread, ThreadBundle,
    ThreadFilter, ThreadQuery, ThreadStatus,
};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::HashSet;
use uuid::Uuid;

const MAX_PAGE_SIZE: i64 = 500;

/// Flags and labels of one stored message, captured so an optimistic edit can be undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageState {
    pub external_id: String,
    pub flags: MessageFlags,
    pub labels: Vec<String>,
}

/// Counters reported by one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub threads_upserted: usize,
    pub messages_upserted: usize,
    pub threads_deleted: usize,
    pub messages_deleted: usize,
    pub flags_updated: usize,
}

impl Storage {
    /// Stores a conversation and its messages, then rederives the thread aggregates
    /// from everything stored under it. Returns the stored thread.
    pub async fn upsert_thread(
        &self,
        account_id: Uuid,
        bundle: &ThreadBundle,
    ) -> Result<Thread, StorageError> {
        let mut tx = self.begin_write().await?;
        let upserted = upsert_bundle_tx(&mut tx, account_id, bundle).await?;
        let thread = load_thread_tx(&mut tx, upserted.thread_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("thread {}", upserted.thread_id)))?;
        tx.commit().await?;
        Ok(thread)
    }

    /// Applies a provider sync result and advances the account cursor in one
    /// transaction. Any failure rolls everything back, the cursor included.
    pub async fn apply_sync_result(
        &self,
        account_id: Uuid,
        result: &SyncResult,
    ) -> Result<ReconcileStats, StorageError> {
        let mut stats = ReconcileStats::default();
        let mut touched: HashSet<Uuid> = HashSet::new();
        let mut upserted_ids: HashSet<&str> = HashSet::new();
        let mut tx = self.begin_write().await?;

        for bundle in &result.threads {
            let upserted = upsert_bundle_tx(&mut tx, account_id, bundle).await?;
            stats.threads_upserted += 1;
            stats.messages_upserted += bundle.messages.len();
            stats.threads_deleted += upserted.emptied_threads;
            upserted_ids.extend(bundle.messages.iter().map(|m| m.external_id.as_str()));
        }

        for external_id in &result.deleted_thread_ids {
            if let Some(removed_messages) =
                delete_thread_by_external_id_tx(&mut tx, account_id, external_id).await?
            {
                stats.threads_deleted += 1;
                stats.messages_deleted += removed_messages as usize;
            }
        }

        for external_id in &result.deleted_message_ids {
            if let Some(thread_id) = remove_message_tx(&mut tx, account_id, external_id).await? {
                stats.messages_deleted += 1;
                touched.insert(thread_id);
            }
        }

        for update in &result.flag_updates {
            if let Some(thread_id) =
                update_flags_tx(&mut tx, account_id, &update.external_id, &update.flags).await?
            {
                stats.flags_updated += 1;
                touched.insert(thread_id);
            }
        }

        if let Some(retained) = &result.retained_message_ids {
            let keep: HashSet<&str> = retained
                .iter()
                .map(String::as_str)
                .chain(upserted_ids.iter().copied())
                .collect();

            let stored = sqlx::query("SELECT external_id FROM mail_messages WHERE account_id = ?1")
                .bind(account_id.to_string())
                .fetch_all(&mut *tx)
                .await?;
            let mut stale = Vec::new();
            for row in stored {
                let external_id: String = row.try_get("external_id")?;
                if !keep.contains(external_id.as_str()) {
                    stale.push(external_id);
                }
            }

            for external_id in &stale {
                if let Some(thread_id) = remove_message_tx(&mut tx, account_id, external_id).await? {
                    stats.messages_deleted += 1;
                    touched.insert(thread_id);
                }
            }
        }

        for thread_id in touched {
            if recompute_thread_tx(&mut tx, thread_id).await? {
                stats.threads_deleted += 1;
            }
        }

        let now = format_datetime(&Utc::now());
        let updated = sqlx::query(
            r#"
            UPDATE accounts
            SET sync_cursor = ?2, sync_status = 'synced', last_sync_at = ?3,
                last_sync_error = NULL, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(account_id.to_string())
        .bind(result.new_cursor.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("account {account_id}")));
        }

        tx.commit().await?;

        tracing::debug!(
            %account_id,
            threads_upserted = stats.threads_upserted,
            messages_upserted = stats.messages_upserted,
            threads_deleted = stats.threads_deleted,
            messages_deleted = stats.messages_deleted,
            flags_updated = stats.flags_updated,
            "reconciled sync result"
        );

        Ok(stats)
    }

    /// Removes a thread and every message in it.
    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<bool, StorageError> {
        let mut tx = self.begin_write().await?;
        sqlx::query("DELETE FROM mail_messages WHERE thread_id = ?1")
            .bind(thread_id.to_string())
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM mail_threads WHERE id = ?1")
            .bind(thread_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed.rows_affected() > 0)
    }

    pub async fn delete_thread_by_external_id(
        &self,
        account_id: Uuid,
        external_id: &str,
    ) -> Result<bool, StorageError> {
        let mut tx = self.begin_write().await?;
        let removed = delete_thread_by_external_id_tx(&mut tx, account_id, external_id).await?;
        tx.commit().await?;
        Ok(removed.is_some())
    }

    pub async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>, StorageError> {
        let row = sqlx::query("SELECT * FROM mail_threads WHERE id = ?1")
            .bind(thread_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_thread).transpose()
    }

    pub async fn find_thread_by_external_id(
        &self,
        account_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Thread>, StorageError> {
        let row = sqlx::query("SELECT * FROM mail_threads WHERE account_id = ?1 AND external_id = ?2")
            .bind(account_id.to_string())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_thread).transpose()
    }

    /// Messages of a thread, oldest first.
    pub async fn list_thread_messages(
        &self,
        thread_id: Uuid,
    ) -> Result<Vec<MailMessage>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM mail_messages WHERE thread_id = ?1 ORDER BY received_at ASC, external_id ASC",
        )
        .bind(thread_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn get_message(&self, message_id: Uuid) -> Result<Option<MailMessage>, StorageError> {
        let row = sqlx::query("SELECT * FROM mail_messages WHERE id = ?1")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_message).transpose()
    }

    pub async fn find_message(
        &self,
        account_id: Uuid,
        external_id: &str,
    ) -> Result<Option<MailMessage>, StorageError> {
        let row = sqlx::query("SELECT * FROM mail_messages WHERE account_id = ?1 AND external_id = ?2")
            .bind(account_id.to_string())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_message).transpose()
    }

    /// Threads ordered newest first. `total` counts every match, not just the page.
    pub async fn list_threads(
        &self,
        query: &ThreadQuery,
    ) -> Result<SearchResult<Thread>, StorageError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM mail_threads t WHERE 1 = 1");
        push_thread_predicates(&mut count, query);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("total")?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT t.* FROM mail_threads t WHERE 1 = 1");
        push_thread_predicates(&mut select, query);
        select
            .push(" ORDER BY t.last_message_at DESC, t.id ASC LIMIT ")
            .push_bind(query.limit.clamp(1, MAX_PAGE_SIZE))
            .push(" OFFSET ")
            .push_bind(query.offset.max(0));

        let items = select
            .build()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(row_to_thread)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SearchResult {
            total: total.max(0) as usize,
            items,
        })
    }

    /// Substring search over subjects, snippets, participants and message bodies.
    pub async fn search_threads(
        &self,
        text: &str,
        account_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Thread>, StorageError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query = ThreadQuery {
            account_id,
            text: Some(text.trim().to_string()),
            limit,
            ..ThreadQuery::default()
        };
        Ok(self.list_threads(&query).await?.items)
    }

    /// Optimistic local edit ahead of the provider call. Returns how many stored
    /// messages were changed; unknown ids are skipped.
    pub async fn apply_local_change(
        &self,
        account_id: Uuid,
        external_ids: &[String],
        change: &LocalChange,
    ) -> Result<usize, StorageError> {
        let mut touched = HashSet::new();
        let mut changed = 0;
        let mut tx = self.begin_write().await?;

        for external_id in external_ids {
            if matches!(change, LocalChange::Purge) {
                if let Some(thread_id) = remove_message_tx(&mut tx, account_id, external_id).await? {
                    touched.insert(thread_id);
                    changed += 1;
                }
                continue;
            }

            let row = sqlx::query(
                "SELECT * FROM mail_messages WHERE account_id = ?1 AND external_id = ?2",
            )
            .bind(account_id.to_string())
            .bind(external_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(row) = row else {
                continue;
            };
            let mut message = row_to_message(row)?;
            change.apply(&mut message.flags, &mut message.labels);

            write_message_state_tx(&mut tx, message.id, &message.flags, &message.labels).await?;

            touched.insert(message.thread_id);
            changed += 1;
        }

        for thread_id in touched {
            recompute_thread_tx(&mut tx, thread_id).await?;
        }

        tx.commit().await?;
        Ok(changed)
    }

    /// Current flags and labels of the given messages; unknown ids are skipped.
    pub async fn message_states(
        &self,
        account_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<MessageState>, StorageError> {
        let mut states = Vec::with_capacity(external_ids.len());
        for external_id in external_ids {
            if let Some(message) = self.find_message(account_id, external_id).await? {
                states.push(MessageState {
                    external_id: message.external_id,
                    flags: message.flags,
                    labels: message.labels,
                });
            }
        }
        Ok(states)
    }

    /// Writes captured states back and recomputes the affected threads. Messages
    /// removed since the capture are skipped. Returns how many were restored.
    pub async fn restore_message_states(
        &self,
        account_id: Uuid,
        states: &[MessageState],
    ) -> Result<usize, StorageError> {
        let mut touched = HashSet::new();
        let mut restored = 0;
        let mut tx = self.begin_write().await?;

        for state in states {
            let row = sqlx::query(
                "SELECT id, thread_id FROM mail_messages WHERE account_id = ?1 AND external_id = ?2",
            )
            .bind(account_id.to_string())
            .bind(&state.external_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(row) = row else {
                continue;
            };
            let message_id = parse_uuid(&row.try_get::<String, _>("id")?, "mail_messages.id")?;
            let thread_id =
                parse_uuid(&row.try_get::<String, _>("thread_id")?, "mail_messages.thread_id")?;

            write_message_state_tx(&mut tx, message_id, &state.flags, &state.labels).await?;
            touched.insert(thread_id);
            restored += 1;
        }

        for thread_id in touched {
            recompute_thread_tx(&mut tx, thread_id).await?;
        }

        tx.commit().await?;
        Ok(restored)
    }
}

async fn write_message_state_tx(
    conn: &mut SqliteConnection,
    message_id: Uuid,
    flags: &MessageFlags,
    labels: &[String],
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        UPDATE mail_messages
        SET is_read = ?2, is_starred = ?3, is_draft = ?4, is_deleted = ?5,
            labels_json = ?6, updated_at = ?7
        WHERE id = ?1
        "#,
    )
    .bind(message_id.to_string())
    .bind(flags.read)
    .bind(flags.starred)
    .bind(flags.draft)
    .bind(flags.deleted)
    .bind(serde_json::to_string(labels)?)
    .bind(format_datetime(&Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

struct UpsertedBundle {
    thread_id: Uuid,
    /// Threads left without messages after messages moved away from them.
    emptied_threads: usize,
}

async fn upsert_bundle_tx(
    conn: &mut SqliteConnection,
    account_id: Uuid,
    bundle: &ThreadBundle,
) -> Result<UpsertedBundle, StorageError> {
    if bundle.messages.is_empty() {
        return Err(StorageError::Data(format!(
            "thread {} carries no messages",
            bundle.thread.external_id
        )));
    }
    if bundle.thread.account_id != account_id
        || bundle.messages.iter().any(|m| m.account_id != account_id)
    {
        return Err(StorageError::Data(format!(
            "thread {} does not belong to account {account_id}",
            bundle.thread.external_id
        )));
    }

    let now = format_datetime(&Utc::now());
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM mail_threads WHERE account_id = ?1 AND external_id = ?2")
            .bind(account_id.to_string())
            .bind(&bundle.thread.external_id)
            .fetch_optional(&mut *conn)
            .await?;

    let thread_id = match existing {
        Some(raw) => parse_uuid(&raw, "mail_threads.id")?,
        None => {
            insert_thread_tx(conn, &bundle.thread, &now).await?;
            bundle.thread.id
        }
    };

    let mut previous_threads = HashSet::new();
    for message in &bundle.messages {
        let previous: Option<String> = sqlx::query_scalar(
            "SELECT thread_id FROM mail_messages WHERE account_id = ?1 AND external_id = ?2",
        )
        .bind(account_id.to_string())
        .bind(&message.external_id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(raw) = previous {
            let previous_id = parse_uuid(&raw, "mail_messages.thread_id")?;
            if previous_id != thread_id {
                previous_threads.insert(previous_id);
            }
        }

        upsert_message_tx(conn, thread_id, message, &now).await?;
    }

    recompute_thread_tx(conn, thread_id).await?;

    let mut emptied_threads = 0;
    for previous_id in previous_threads {
        if recompute_thread_tx(conn, previous_id).await? {
            emptied_threads += 1;
        }
    }

    Ok(UpsertedBundle {
        thread_id,
        emptied_threads,
    })
}

async fn insert_thread_tx(
    conn: &mut SqliteConnection,
    thread: &Thread,
    now: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO mail_threads (
          id, account_id, external_id, subject, snippet, participants_json,
          in_inbox, is_sent, is_draft, is_starred, is_archived, is_trashed, is_spam,
          unread_count, message_count, has_attachments, last_message_at, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)
        "#,
    )
    .bind(thread.id.to_string())
    .bind(thread.account_id.to_string())
    .bind(&thread.external_id)
    .bind(&thread.subject)
    .bind(&thread.snippet)
    .bind(serde_json::to_string(&thread.participants)?)
    .bind(thread.status.in_inbox)
    .bind(thread.status.is_sent)
    .bind(thread.status.is_draft)
    .bind(thread.status.is_starred)
    .bind(thread.status.is_archived)
    .bind(thread.status.is_trashed)
    .bind(thread.status.is_spam)
    .bind(i64::from(thread.unread_count))
    .bind(i64::from(thread.message_count))
    .bind(thread.has_attachments)
    .bind(format_datetime(&thread.last_message_at))
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn upsert_message_tx(
    conn: &mut SqliteConnection,
    thread_id: Uuid,
    message: &MailMessage,
    now: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO mail_messages (
          id, account_id, thread_id, external_id, from_json, to_json, cc_json, bcc_json,
          reply_to_json, subject, body_text, body_html, snippet, message_id_header,
          in_reply_to, references_header, labels_json, attachments_json, is_read,
          is_starred, is_draft, is_deleted, has_attachments, sent_at, received_at,
          created_at, updated_at
        ) VALUES (
          ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
          ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?26
        )
        ON CONFLICT(account_id, external_id) DO UPDATE SET
          thread_id = excluded.thread_id,
          from_json = excluded.from_json,
          to_json = excluded.to_json,
          cc_json = excluded.cc_json,
          bcc_json = excluded.bcc_json,
          reply_to_json = excluded.reply_to_json,
          subject = excluded.subject,
          body_text = excluded.body_text,
          body_html = excluded.body_html,
          snippet = excluded.snippet,
          message_id_header = excluded.message_id_header,
          in_reply_to = excluded.in_reply_to,
          references_header = excluded.references_header,
          labels_json = excluded.labels_json,
          attachments_json = excluded.attachments_json,
          is_read = excluded.is_read,
          is_starred = excluded.is_starred,
          is_draft = excluded.is_draft,
          is_deleted = excluded.is_deleted,
          has_attachments = excluded.has_attachments,
          sent_at = excluded.sent_at,
          received_at = excluded.received_at,
          updated_at = excluded.updated_at
        "#,
    )
    .bind(message.id.to_string())
    .bind(message.account_id.to_string())
    .bind(thread_id.to_string())
    .bind(&message.external_id)
    .bind(serde_json::to_string(&message.from)?)
    .bind(serde_json::to_string(&message.to)?)
    .bind(serde_json::to_string(&message.cc)?)
    .bind(serde_json::to_string(&message.bcc)?)
    .bind(serde_json::to_string(&message.reply_to)?)
    .bind(&message.subject)
    .bind(&message.body_text)
    .bind(&message.body_html)
    .bind(&message.snippet)
    .bind(&message.message_id_header)
    .bind(&message.in_reply_to)
    .bind(&message.references)
    .bind(serde_json::to_string(&message.labels)?)
    .bind(serde_json::to_string(&message.attachments)?)
    .bind(message.flags.read)
    .bind(message.flags.starred)
    .bind(message.flags.draft)
    .bind(message.flags.deleted)
    .bind(message.has_attachments)
    .bind(format_datetime(&message.sent_at))
    .bind(format_datetime(&message.received_at))
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Rederives a thread's aggregates from its stored messages. A thread left without
/// messages is deleted; returns `true` in that case.
async fn recompute_thread_tx(
    conn: &mut SqliteConnection,
    thread_id: Uuid,
) -> Result<bool, StorageError> {
    let messages = sqlx::query("SELECT * FROM mail_messages WHERE thread_id = ?1")
        .bind(thread_id.to_string())
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(row_to_message)
        .collect::<Result<Vec<_>, _>>()?;

    if messages.is_empty() {
        let removed = sqlx::query("DELETE FROM mail_threads WHERE id = ?1")
            .bind(thread_id.to_string())
            .execute(&mut *conn)
            .await?;
        return Ok(removed.rows_affected() > 0);
    }

    let Some(mut thread) = load_thread_tx(conn, thread_id).await? else {
        return Err(StorageError::NotFound(format!("thread {thread_id}")));
    };
    thread.recompute(&messages);

    sqlx::query(
        r#"
        UPDATE mail_threads
        SET subject = ?2, snippet = ?3, participants_json = ?4,
            in_inbox = ?5, is_sent = ?6, is_draft = ?7, is_starred = ?8,
            is_archived = ?9, is_trashed = ?10, is_spam = ?11,
            unread_count = ?12, message_count = ?13, has_attachments = ?14,
            last_message_at = ?15, updated_at = ?16
        WHERE id = ?1
        "#,
    )
    .bind(thread.id.to_string())
    .bind(&thread.subject)
    .bind(&thread.snippet)
    .bind(serde_json::to_string(&thread.participants)?)
    .bind(thread.status.in_inbox)
    .bind(thread.status.is_sent)
    .bind(thread.status.is_draft)
    .bind(thread.status.is_starred)
    .bind(thread.status.is_archived)
    .bind(thread.status.is_trashed)
    .bind(thread.status.is_spam)
    .bind(i64::from(thread.unread_count))
    .bind(i64::from(thread.message_count))
    .bind(thread.has_attachments)
    .bind(format_datetime(&thread.last_message_at))
    .bind(format_datetime(&Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(false)
}

async fn load_thread_tx(
    conn: &mut SqliteConnection,
    thread_id: Uuid,
) -> Result<Option<Thread>, StorageError> {
    let row = sqlx::query("SELECT * FROM mail_threads WHERE id = ?1")
        .bind(thread_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.map(row_to_thread).transpose()
}

/// Returns the number of messages removed with the thread, or `None` when no such thread exists.
async fn delete_thread_by_external_id_tx(
    conn: &mut SqliteConnection,
    account_id: Uuid,
    external_id: &str,
) -> Result<Option<u64>, StorageError> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM mail_threads WHERE account_id = ?1 AND external_id = ?2")
            .bind(account_id.to_string())
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(thread_id) = existing else {
        return Ok(None);
    };

    let messages = sqlx::query("DELETE FROM mail_messages WHERE thread_id = ?1")
        .bind(&thread_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM mail_threads WHERE id = ?1")
        .bind(&thread_id)
        .execute(&mut *conn)
        .await?;

    Ok(Some(messages.rows_affected()))
}

/// Deletes one message and returns the thread it belonged to. The caller recomputes that thread.
async fn remove_message_tx(
    conn: &mut SqliteConnection,
    account_id: Uuid,
    external_id: &str,
) -> Result<Option<Uuid>, StorageError> {
    let thread_id: Option<String> = sqlx::query_scalar(
        "SELECT thread_id FROM mail_messages WHERE account_id = ?1 AND external_id = ?2",
    )
    .bind(account_id.to_string())
    .bind(external_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(thread_id) = thread_id else {
        return Ok(None);
    };

    sqlx::query("DELETE FROM mail_messages WHERE account_id = ?1 AND external_id = ?2")
        .bind(account_id.to_string())
        .bind(external_id)
        .execute(&mut *conn)
        .await?;

    parse_uuid(&thread_id, "mail_messages.thread_id").map(Some)
}

async fn update_flags_tx(
    conn: &mut SqliteConnection,
    account_id: Uuid,
    external_id: &str,
    flags: &MessageFlags,
) -> Result<Option<Uuid>, StorageError> {
    let thread_id: Option<String> = sqlx::query_scalar(
        "SELECT thread_id FROM mail_messages WHERE account_id = ?1 AND external_id = ?2",
    )
    .bind(account_id.to_string())
    .bind(external_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(thread_id) = thread_id else {
        return Ok(None);
    };

    sqlx::query(
        r#"
        UPDATE mail_messages
        SET is_read = ?3, is_starred = ?4, is_draft = ?5, is_deleted = ?6, updated_at = ?7
        WHERE account_id = ?1 AND external_id = ?2
        "#,
    )
    .bind(account_id.to_string())
    .bind(external_id)
    .bind(flags.read)
    .bind(flags.starred)
    .bind(flags.draft)
    .bind(flags.deleted)
    .bind(format_datetime(&Utc::now()))
    .execute(&mut *conn)
    .await?;

    parse_uuid(&thread_id, "mail_messages.thread_id").map(Some)
}

fn push_thread_predicates(builder: &mut QueryBuilder<'_, Sqlite>, query: &ThreadQuery) {
    if let Some(account_id) = query.account_id {
        builder.push(" AND t.account_id = ").push_bind(account_id.to_string());
    }

    if let Some(filter) = query.filter {
        builder.push(match filter {
            ThreadFilter::Inbox => " AND t.in_inbox = 1",
            ThreadFilter::Sent => " AND t.is_sent = 1",
            ThreadFilter::Drafts => " AND t.is_draft = 1",
            ThreadFilter::Starred => " AND t.is_starred = 1 AND t.is_trashed = 0",
            ThreadFilter::Archived => " AND t.is_archived = 1",
            ThreadFilter::Trash => " AND t.is_trashed = 1",
            ThreadFilter::Spam => " AND t.is_spam = 1",
            ThreadFilter::Unread => " AND t.unread_count > 0 AND t.is_trashed = 0",
        });
    }

    if let Some(since) = &query.since {
        builder.push(" AND t.last_message_at >= ").push_bind(format_datetime(since));
    }
    if let Some(until) = &query.until {
        builder.push(" AND t.last_message_at < ").push_bind(format_datetime(until));
    }

    if let Some(text) = query.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = format!("%{}%", escape_like(text));
        builder
            .push(" AND (t.subject LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR t.snippet LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR t.participants_json LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR EXISTS (SELECT 1 FROM mail_messages m WHERE m.thread_id = t.id AND (m.body_text LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR m.from_json LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')))");
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn row_to_thread(row: SqliteRow) -> Result<Thread, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let account_raw: String = row.try_get("account_id")?;
    let participants_raw: String = row.try_get("participants_json")?;
    let last_message_raw: String = row.try_get("last_message_at")?;
    let unread_count: i64 = row.try_get("unread_count")?;
    let message_count: i64 = row.try_get("message_count")?;

    Ok(Thread {
        id: parse_uuid(&id_raw, "mail_threads.id")?,
        account_id: parse_uuid(&account_raw, "mail_threads.account_id")?,
        external_id: row.try_get("external_id")?,
        subject: row.try_get("subject")?,
        snippet: row.try_get("snippet")?,
        participants: parse_json(&participants_raw, "mail_threads.participants_json")?,
        status: ThreadStatus {
            in_inbox: row.try_get("in_inbox")?,
            is_sent: row.try_get("is_sent")?,
            is_draft: row.try_get("is_draft")?,
            is_starred: row.try_get("is_starred")?,
            is_archived: row.try_get("is_archived")?,
            is_trashed: row.try_get("is_trashed")?,
            is_spam: row.try_get("is_spam")?,
        },
        unread_count: unread_count.max(0) as u32,
        message_count: message_count.max(0) as u32,
        has_attachments: row.try_get("has_attachments")?,
        last_message_at: parse_datetime(&last_message_raw, "mail_threads.last_message_at")?,
    })
}

fn row_to_message(row: SqliteRow) -> Result<MailMessage, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let account_raw: String = row.try_get("account_id")?;
    let thread_raw: String = row.try_get("thread_id")?;
    let from_raw: String = row.try_get("from_json")?;
    let to_raw: String = row.try_get("to_json")?;
    let cc_raw: String = row.try_get("cc_json")?;
    let bcc_raw: String = row.try_get("bcc_json")?;
    let reply_to_raw: String = row.try_get("reply_to_json")?;
    let labels_raw: String = row.try_get("labels_json")?;
    let attachments_raw: String = row.try_get("attachments_json")?;
    let sent_raw: String = row.try_get("sent_at")?;
    let received_raw: String = row.try_get("received_at")?;

    Ok(MailMessage {
        id: parse_uuid(&id_raw, "mail_messages.id")?,
        account_id: parse_uuid(&account_raw, "mail_messages.account_id")?,
        external_id: row.try_get("external_id")?,
        thread_id: parse_uuid(&thread_raw, "mail_messages.thread_id")?,
        from: parse_json(&from_raw, "mail_messages.from_json")?,
        to: parse_json(&to_raw, "mail_messages.to_json")?,
        cc: parse_json(&cc_raw, "mail_messages.cc_json")?,
        bcc: parse_json(&bcc_raw, "mail_messages.bcc_json")?,
        reply_to: parse_json(&reply_to_raw, "mail_messages.reply_to_json")?,
        subject: row.try_get("subject")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        snippet: row.try_get("snippet")?,
        message_id_header: row.try_get("message_id_header")?,
        in_reply_to: row.try_get("in_reply_to")?,
        references: row.try_get("references_header")?,
        flags: MessageFlags {
            read: row.try_get("is_read")?,
            starred: row.try_get("is_starred")?,
            draft: row.try_get("is_draft")?,
            deleted: row.try_get("is_deleted")?,
        },
        labels: parse_json(&labels_raw, "mail_messages.labels_json")?,
        has_attachments: row.try_get("has_attachments")?,
        attachments: parse_json(&attachments_raw, "mail_messages.attachments_json")?,
        sent_at: parse_datetime(&sent_raw, "mail_messages.sent_at")?,
        received_at: parse_datetime(&received_raw, "mail_messages.received_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use harbor_core::{
        Account, Credentials, FlagUpdate, MailAddress, OAuthCredentials, ProviderKind,
        SyncCursor, SyncStatus,
    };

    async fn storage_with_account() -> (Storage, Account) {
        let storage = Storage::in_memory().await.expect("storage");
        let account = Account::new(
            ProviderKind::Gmail,
            "ada@example.org",
            "Ada",
            Credentials::OAuth(OAuthCredentials {
                access_token: "token".to_string(),
                refresh_token: None,
                expires_at: None,
            }),
        );
        storage.upsert_account(&account).await.expect("account");
        (storage, account)
    }

    fn message(account_id: Uuid, external_id: &str, labels: &[&str], read: bool, minute: u32) -> MailMessage {
        let at = Utc
            .with_ymd_and_hms(2024, 6, 3, 8, minute, 0)
            .single()
            .expect("valid date");
        MailMessage {
            id: Uuid::new_v4(),
            account_id,
            external_id: external_id.to_string(),
            thread_id: Uuid::nil(),
            from: MailAddress::new("grace@example.org", Some("Grace".to_string())),
            to: vec![MailAddress::new("ada@example.org", None)],
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: Vec::new(),
            subject: format!("Quarterly report {external_id}"),
            body_text: Some(format!("numbers for {external_id}")),
            body_html: None,
            snippet: format!("numbers for {external_id}"),
            message_id_header: Some(format!("<{external_id}@example.org>")),
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

    fn bundle(account_id: Uuid, thread: &str, messages: Vec<MailMessage>) -> ThreadBundle {
        ThreadBundle::assemble(account_id, thread, messages).expect("bundle")
    }

    #[tokio::test]
    async fn upserting_same_bundle_twice_is_idempotent() {
        let (storage, account) = storage_with_account().await;
        let first = bundle(
            account.id,
            "t-1",
            vec![
                message(account.id, "m-1", &["INBOX"], false, 1),
                message(account.id, "m-2", &["INBOX"], true, 2),
            ],
        );

        let stored = storage.upsert_thread(account.id, &first).await.expect("first upsert");
        let again = bundle(account.id, "t-1", first.messages.clone());
        let restored = storage.upsert_thread(account.id, &again).await.expect("second upsert");

        assert_eq!(stored.id, restored.id);
        assert_eq!(restored.message_count, 2);
        assert_eq!(restored.unread_count, 1);
        let listed = storage
            .list_threads(&ThreadQuery::default())
            .await
            .expect("list");
        assert_eq!(listed.total, 1);
        assert_eq!(
            storage.list_thread_messages(stored.id).await.expect("messages").len(),
            2
        );
    }

    #[tokio::test]
    async fn incremental_message_joins_thread_and_updates_aggregates() {
        let (storage, account) = storage_with_account().await;
        storage
            .upsert_thread(
                account.id,
                &bundle(account.id, "t-1", vec![message(account.id, "m-1", &["INBOX"], true, 1)]),
            )
            .await
            .expect("initial");

        let thread = storage
            .upsert_thread(
                account.id,
                &bundle(account.id, "t-1", vec![message(account.id, "m-2", &["INBOX"], false, 9)]),
            )
            .await
            .expect("delta");

        assert_eq!(thread.message_count, 2);
        assert_eq!(thread.unread_count, 1);
        assert_eq!(thread.subject, "Quarterly report m-2");
    }

    #[tokio::test]
    async fn message_moving_threads_empties_the_old_one() {
        let (storage, account) = storage_with_account().await;
        let m1 = message(account.id, "m-1", &["INBOX"], true, 1);
        storage
            .upsert_thread(account.id, &bundle(account.id, "t-old", vec![m1.clone()]))
            .await
            .expect("old");
        storage
            .upsert_thread(account.id, &bundle(account.id, "t-new", vec![m1]))
            .await
            .expect("new");

        assert!(storage
            .find_thread_by_external_id(account.id, "t-old")
            .await
            .expect("query")
            .is_none());
        let moved = storage
            .find_message(account.id, "m-1")
            .await
            .expect("query")
            .expect("message kept");
        let new_thread = storage
            .find_thread_by_external_id(account.id, "t-new")
            .await
            .expect("query")
            .expect("thread");
        assert_eq!(moved.thread_id, new_thread.id);
    }

    #[tokio::test]
    async fn sync_result_applies_deletions_and_advances_cursor() {
        let (storage, account) = storage_with_account().await;
        let mut initial = SyncResult::new(SyncCursor::new("100"));
        initial.threads = vec![
            bundle(account.id, "t-41", vec![message(account.id, "m-1", &["INBOX"], false, 1)]),
            bundle(account.id, "t-42", vec![message(account.id, "m-2", &["INBOX"], false, 2)]),
        ];
        storage.apply_sync_result(account.id, &initial).await.expect("initial");

        let mut delta = SyncResult::new(SyncCursor::new("200"));
        delta.deleted_thread_ids = vec!["t-42".to_string(), "t-unknown".to_string()];
        delta.flag_updates = vec![FlagUpdate {
            external_id: "m-1".to_string(),
            flags: MessageFlags {
                read: true,
                starred: true,
                ..MessageFlags::default()
            },
        }];
        let stats = storage.apply_sync_result(account.id, &delta).await.expect("delta");

        assert_eq!(stats.threads_deleted, 1);
        assert_eq!(stats.messages_deleted, 1);
        assert_eq!(stats.flags_updated, 1);

        let remaining = storage
            .find_thread_by_external_id(account.id, "t-41")
            .await
            .expect("query")
            .expect("kept");
        assert_eq!(remaining.unread_count, 0);
        assert!(remaining.status.is_starred);

        let account = storage.get_account(account.id).await.expect("query").expect("account");
        assert_eq!(account.sync_cursor, Some(SyncCursor::new("200")));
        assert_eq!(account.sync_status, SyncStatus::Synced);
        assert!(account.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn failed_reconcile_rolls_back_cursor_and_threads() {
        let (storage, account) = storage_with_account().await;
        let mut initial = SyncResult::new(SyncCursor::new("100"));
        initial.threads = vec![bundle(account.id, "t-1", vec![message(account.id, "m-1", &["INBOX"], false, 1)])];
        storage.apply_sync_result(account.id, &initial).await.expect("initial");

        let mut broken = SyncResult::new(SyncCursor::new("200"));
        broken.threads = vec![
            bundle(account.id, "t-2", vec![message(account.id, "m-2", &["INBOX"], false, 2)]),
            ThreadBundle {
                thread: bundle(account.id, "t-3", vec![message(account.id, "m-3", &["INBOX"], false, 3)]).thread,
                messages: Vec::new(),
            },
        ];
        assert!(matches!(
            storage.apply_sync_result(account.id, &broken).await,
            Err(StorageError::Data(_))
        ));

        let account = storage.get_account(account.id).await.expect("query").expect("account");
        assert_eq!(account.sync_cursor, Some(SyncCursor::new("100")));
        assert!(storage
            .find_thread_by_external_id(account.id, "t-2")
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn retained_ids_prune_messages_missing_on_server() {
        let (storage, account) = storage_with_account().await;
        let mut initial = SyncResult::new(SyncCursor::new("7:3"));
        initial.threads = vec![
            bundle(
                account.id,
                "uid:1",
                vec![
                    message(account.id, "1", &["INBOX"], true, 1),
                    message(account.id, "2", &["INBOX"], true, 2),
                ],
            ),
            bundle(account.id, "uid:3", vec![message(account.id, "3", &["INBOX"], true, 3)]),
        ];
        storage.apply_sync_result(account.id, &initial).await.expect("initial");

        let mut delta = SyncResult::new(SyncCursor::new("7:4"));
        delta.threads = vec![bundle(account.id, "uid:4", vec![message(account.id, "4", &["INBOX"], false, 4)])];
        delta.retained_message_ids = Some(vec!["1".to_string()]);
        let stats = storage.apply_sync_result(account.id, &delta).await.expect("delta");

        assert_eq!(stats.messages_deleted, 2);
        assert_eq!(stats.threads_deleted, 1);
        assert!(storage.find_message(account.id, "4").await.expect("query").is_some());
        let first = storage
            .find_thread_by_external_id(account.id, "uid:1")
            .await
            .expect("query")
            .expect("thread");
        assert_eq!(first.message_count, 1);
    }

    #[tokio::test]
    async fn list_threads_filters_by_status_and_text() {
        let (storage, account) = storage_with_account().await;
        let mut result = SyncResult::new(SyncCursor::new("1"));
        result.threads = vec![
            bundle(account.id, "t-inbox", vec![message(account.id, "m-1", &["INBOX"], false, 1)]),
            bundle(account.id, "t-archived", vec![message(account.id, "m-2", &["IMPORTANT"], true, 2)]),
            bundle(account.id, "t-trash", vec![message(account.id, "m-3", &["TRASH"], true, 3)]),
        ];
        storage.apply_sync_result(account.id, &result).await.expect("sync");

        let inbox = storage
            .list_threads(&ThreadQuery {
                account_id: Some(account.id),
                filter: Some(ThreadFilter::Inbox),
                ..ThreadQuery::default()
            })
            .await
            .expect("inbox");
        assert_eq!(inbox.total, 1);
        assert_eq!(inbox.items[0].external_id, "t-inbox");

        let archived = storage
            .list_threads(&ThreadQuery {
                filter: Some(ThreadFilter::Archived),
                ..ThreadQuery::default()
            })
            .await
            .expect("archived");
        assert_eq!(archived.items.len(), 1);
        assert_eq!(archived.items[0].external_id, "t-archived");

        let page = storage
            .list_threads(&ThreadQuery {
                limit: 1,
                ..ThreadQuery::default()
            })
            .await
            .expect("page");
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].external_id, "t-trash");

        let hits = storage
            .search_threads("numbers for m-2", Some(account.id), 10)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert!(storage.search_threads("100%", None, 10).await.expect("search").is_empty());
    }

    #[tokio::test]
    async fn local_archive_moves_thread_out_of_inbox() {
        let (storage, account) = storage_with_account().await;
        storage
            .upsert_thread(
                account.id,
                &bundle(account.id, "t-1", vec![message(account.id, "m-1", &["INBOX"], false, 1)]),
            )
            .await
            .expect("upsert");

        let changed = storage
            .apply_local_change(
                account.id,
                &["m-1".to_string(), "missing".to_string()],
                &LocalChange::Archive,
            )
            .await
            .expect("archive");
        assert_eq!(changed, 1);

        let thread = storage
            .find_thread_by_external_id(account.id, "t-1")
            .await
            .expect("query")
            .expect("thread");
        assert!(thread.status.is_archived);
        assert!(!thread.status.in_inbox);

        storage
            .apply_local_change(account.id, &["m-1".to_string()], &LocalChange::Purge)
            .await
            .expect("purge");
        assert!(storage.get_thread(thread.id).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn restoring_captured_state_undoes_local_trash() {
        let (storage, account) = storage_with_account().await;
        storage
            .upsert_thread(
                account.id,
                &bundle(account.id, "t-1", vec![message(account.id, "m-1", &["INBOX"], false, 1)]),
            )
            .await
            .expect("upsert");

        let ids = vec!["m-1".to_string(), "missing".to_string()];
        let before = storage.message_states(account.id, &ids).await.expect("capture");
        assert_eq!(before.len(), 1);

        storage
            .apply_local_change(account.id, &ids, &LocalChange::Trash)
            .await
            .expect("trash");
        let trashed = storage
            .find_thread_by_external_id(account.id, "t-1")
            .await
            .expect("query")
            .expect("thread");
        assert!(trashed.status.is_trashed);

        let restored = storage
            .restore_message_states(account.id, &before)
            .await
            .expect("restore");
        assert_eq!(restored, 1);

        let message = storage
            .find_message(account.id, "m-1")
            .await
            .expect("query")
            .expect("message");
        assert_eq!(message.labels, vec!["INBOX"]);
        assert!(!message.flags.deleted);

        let thread = storage
            .find_thread_by_external_id(account.id, "t-1")
            .await
            .expect("query")
            .expect("thread");
        assert!(thread.status.in_inbox);
        assert!(!thread.status.is_trashed);
        assert_eq!(thread.unread_count, 1);
    }

    #[tokio::test]
    async fn deleting_account_cascades_to_mail() {
        let (storage, account) = storage_with_account().await;
        let thread = storage
            .upsert_thread(
                account.id,
                &bundle(account.id, "t-1", vec![message(account.id, "m-1", &["INBOX"], false, 1)]),
            )
            .await
            .expect("upsert");

        assert!(storage.delete_account(account.id).await.expect("delete"));
        assert!(storage.get_thread(thread.id).await.expect("query").is_none());
        assert!(storage.find_message(account.id, "m-1").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn rejects_bundle_for_another_account() {
        let (storage, account) = storage_with_account().await;
        let foreign = bundle(Uuid::new_v4(), "t-1", vec![message(Uuid::new_v4(), "m-1", &["INBOX"], false, 1)]);
        assert!(matches!(
            storage.upsert_thread(account.id, &foreign).await,
            Err(StorageError::Data(_))
        ));
    }
}
