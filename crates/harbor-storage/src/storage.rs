use crate::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use harbor_core::{Account, Credentials, FolderType, MailFolder, SyncCursor, SyncStatus};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Local store gateway. Cheap to clone; every clone shares one connection pool
/// and one writer slot.
#[derive(Clone)]
pub struct Storage {
    pub(crate) pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

/// Write transaction holding the store's writer slot until commit or drop.
///
/// SQLite allows one writer at a time, and a deferred transaction that read before
/// another connection committed cannot upgrade to a write lock (`SQLITE_BUSY`
/// regardless of the busy timeout). Every write goes through the slot instead.
pub(crate) struct WriteTx {
    tx: Transaction<'static, Sqlite>,
    _writer: OwnedMutexGuard<()>,
}

impl WriteTx {
    pub(crate) async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Deref for WriteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for WriteTx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}

impl Storage {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30))
            .pragma("temp_store", "memory")
            .pragma("cache_size", "-20000");

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(path = %db_path.display(), "opened mail store");

        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database with migrations applied. A single pinned
    /// connection keeps the schema alive for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) async fn writer(&self) -> OwnedMutexGuard<()> {
        self.writer.clone().lock_owned().await
    }

    pub(crate) async fn begin_write(&self) -> Result<WriteTx, StorageError> {
        let writer = self.writer().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTx {
            tx,
            _writer: writer,
        })
    }

    /// Inserts or updates account identity and credentials. Sync state columns are
    /// only written on insert; afterwards the sync bookkeeping methods own them.
    pub async fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        if !account.credentials_match_provider() {
            return Err(StorageError::Data(format!(
                "credentials for account {} do not match provider {}",
                account.id, account.provider
            )));
        }

        let _writer = self.writer().await;
        sqlx::query(
            r#"
            INSERT INTO accounts (
              id, provider, email_address, display_name, credentials_json,
              sync_cursor, sync_status, last_sync_at, last_sync_error, is_active,
              created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
              provider = excluded.provider,
              email_address = excluded.email_address,
              display_name = excluded.display_name,
              credentials_json = excluded.credentials_json,
              is_active = excluded.is_active,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(account.id.to_string())
        .bind(account.provider.as_str())
        .bind(&account.email_address)
        .bind(&account.display_name)
        .bind(serde_json::to_string(&account.credentials)?)
        .bind(account.sync_cursor.as_ref().map(SyncCursor::as_str))
        .bind(account.sync_status.as_str())
        .bind(account.last_sync_at.as_ref().map(format_datetime))
        .bind(&account.last_sync_error)
        .bind(account.is_active)
        .bind(format_datetime(&account.created_at))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?1")
            .bind(account_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_account).transpose()
    }

    pub async fn find_account_by_email(
        &self,
        email_address: &str,
    ) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE lower(email_address) = lower(?1)")
            .bind(email_address)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_account).transpose()
    }

    pub async fn list_accounts(&self, active_only: bool) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM accounts
            WHERE (?1 = 0 OR is_active = 1)
            ORDER BY created_at ASC, email_address ASC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_account).collect()
    }

    /// Removes the account; threads, messages and folders go with it.
    pub async fn delete_account(&self, account_id: Uuid) -> Result<bool, StorageError> {
        let _writer = self.writer().await;
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(account_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_account_active(
        &self,
        account_id: Uuid,
        is_active: bool,
    ) -> Result<(), StorageError> {
        let _writer = self.writer().await;
        let result = sqlx::query("UPDATE accounts SET is_active = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(account_id.to_string())
            .bind(is_active)
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool)
            .await?;

        ensure_account_updated(result.rows_affected(), account_id)
    }

    /// Writes refreshed credentials so concurrent readers never see the stale token.
    pub async fn update_account_credentials(
        &self,
        account_id: Uuid,
        credentials: &Credentials,
    ) -> Result<(), StorageError> {
        let _writer = self.writer().await;
        let result = sqlx::query(
            "UPDATE accounts SET credentials_json = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(account_id.to_string())
        .bind(serde_json::to_string(credentials)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool)
        .await?;

        ensure_account_updated(result.rows_affected(), account_id)
    }

    pub async fn mark_sync_started(&self, account_id: Uuid) -> Result<(), StorageError> {
        let _writer = self.writer().await;
        let result = sqlx::query("UPDATE accounts SET sync_status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(account_id.to_string())
            .bind(SyncStatus::Syncing.as_str())
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool)
            .await?;

        ensure_account_updated(result.rows_affected(), account_id)
    }

    /// Flags the account as failed and keeps the message for display. The cursor is left alone.
    pub async fn record_sync_failure(
        &self,
        account_id: Uuid,
        error: &str,
    ) -> Result<(), StorageError> {
        let _writer = self.writer().await;
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET sync_status = ?2, last_sync_error = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(account_id.to_string())
        .bind(SyncStatus::Error.as_str())
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool)
        .await?;

        ensure_account_updated(result.rows_affected(), account_id)
    }

    /// Replaces the cached folder list of an account.
    pub async fn replace_folders(
        &self,
        account_id: Uuid,
        folders: &[MailFolder],
    ) -> Result<(), StorageError> {
        let now = format_datetime(&Utc::now());
        let mut tx = self.begin_write().await?;

        sqlx::query("DELETE FROM mail_folders WHERE account_id = ?1")
            .bind(account_id.to_string())
            .execute(&mut *tx)
            .await?;

        for folder in folders {
            sqlx::query(
                r#"
                INSERT INTO mail_folders (
                  account_id, remote_id, name, display_name, folder_type,
                  parent_id, total_count, unread_count, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(account_id, remote_id) DO UPDATE SET
                  name = excluded.name,
                  display_name = excluded.display_name,
                  folder_type = excluded.folder_type,
                  parent_id = excluded.parent_id,
                  total_count = excluded.total_count,
                  unread_count = excluded.unread_count,
                  updated_at = excluded.updated_at
                "#,
            )
            .bind(account_id.to_string())
            .bind(&folder.remote_id)
            .bind(&folder.name)
            .bind(&folder.display_name)
            .bind(folder.folder_type.as_str())
            .bind(&folder.parent_id)
            .bind(i64::from(folder.total_count))
            .bind(i64::from(folder.unread_count))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_folders(&self, account_id: Uuid) -> Result<Vec<MailFolder>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mail_folders
            WHERE account_id = ?1
            ORDER BY CASE folder_type WHEN 'custom' THEN 1 ELSE 0 END, display_name ASC
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_folder).collect()
    }

    /// First folder of the given type, used to resolve Trash/Archive targets.
    pub async fn find_folder_by_type(
        &self,
        account_id: Uuid,
        folder_type: FolderType,
    ) -> Result<Option<MailFolder>, StorageError> {
        let row = sqlx::query(
            "SELECT * FROM mail_folders WHERE account_id = ?1 AND folder_type = ?2 LIMIT 1",
        )
        .bind(account_id.to_string())
        .bind(folder_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_folder).transpose()
    }
}

fn ensure_account_updated(rows_affected: u64, account_id: Uuid) -> Result<(), StorageError> {
    if rows_affected == 0 {
        return Err(StorageError::NotFound(format!("account {account_id}")));
    }
    Ok(())
}

fn row_to_account(row: SqliteRow) -> Result<Account, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let provider_raw: String = row.try_get("provider")?;
    let credentials_raw: String = row.try_get("credentials_json")?;
    let cursor_raw: Option<String> = row.try_get("sync_cursor")?;
    let status_raw: String = row.try_get("sync_status")?;
    let last_sync_raw: Option<String> = row.try_get("last_sync_at")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;

    Ok(Account {
        id: parse_uuid(&id_raw, "accounts.id")?,
        provider: provider_raw.parse().map_err(StorageError::Data)?,
        email_address: row.try_get("email_address")?,
        display_name: row.try_get("display_name")?,
        credentials: parse_json(&credentials_raw, "accounts.credentials_json")?,
        sync_cursor: cursor_raw.map(SyncCursor::new),
        sync_status: status_raw.parse().map_err(StorageError::Data)?,
        last_sync_at: last_sync_raw
            .as_deref()
            .map(|raw| parse_datetime(raw, "accounts.last_sync_at"))
            .transpose()?,
        last_sync_error: row.try_get("last_sync_error")?,
        is_active: row.try_get("is_active")?,
        created_at: parse_datetime(&created_raw, "accounts.created_at")?,
        updated_at: parse_datetime(&updated_raw, "accounts.updated_at")?,
    })
}

fn row_to_folder(row: SqliteRow) -> Result<MailFolder, StorageError> {
    let account_raw: String = row.try_get("account_id")?;
    let type_raw: String = row.try_get("folder_type")?;
    let total_count: i64 = row.try_get("total_count")?;
    let unread_count: i64 = row.try_get("unread_count")?;

    Ok(MailFolder {
        account_id: parse_uuid(&account_raw, "mail_folders.account_id")?,
        remote_id: row.try_get("remote_id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        folder_type: type_raw.parse().map_err(StorageError::Data)?,
        parent_id: row.try_get("parent_id")?,
        total_count: total_count.max(0) as u32,
        unread_count: unread_count.max(0) as u32,
    })
}

/// Fixed-width UTC timestamps so lexical order in SQL matches chronological order.
pub(crate) fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid uuid for {field}: {err}")))
}

pub(crate) fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

pub(crate) fn parse_json<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid json for {field}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::{ImapCredentials, OAuthCredentials, ProviderKind, ServerEndpoint};

    fn gmail_account() -> Account {
        Account::new(
            ProviderKind::Gmail,
            "Ada@Example.org",
            "Ada",
            Credentials::OAuth(OAuthCredentials {
                access_token: "token".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: None,
            }),
        )
    }

    #[tokio::test]
    async fn account_round_trips_through_store() {
        let storage = Storage::in_memory().await.expect("storage");
        let account = gmail_account();
        storage.upsert_account(&account).await.expect("insert");

        let loaded = storage
            .get_account(account.id)
            .await
            .expect("query")
            .expect("account present");
        assert_eq!(loaded.provider, ProviderKind::Gmail);
        assert_eq!(loaded.sync_status, SyncStatus::NeverSynced);
        assert_eq!(loaded.credentials, account.credentials);
        assert!(loaded.sync_cursor.is_none());

        let by_email = storage
            .find_account_by_email("ada@example.org")
            .await
            .expect("query");
        assert_eq!(by_email.map(|a| a.id), Some(account.id));
    }

    #[tokio::test]
    async fn rejects_credentials_for_wrong_provider() {
        let storage = Storage::in_memory().await.expect("storage");
        let mut account = gmail_account();
        account.credentials = Credentials::Imap(ImapCredentials {
            imap: ServerEndpoint {
                host: "imap.example.org".to_string(),
                port: 993,
                username: "ada".to_string(),
                password: "pw".to_string(),
            },
            smtp: None,
        });

        assert!(matches!(
            storage.upsert_account(&account).await,
            Err(StorageError::Data(_))
        ));
    }

    #[tokio::test]
    async fn sync_failure_keeps_cursor_and_error_message() {
        let storage = Storage::in_memory().await.expect("storage");
        let mut account = gmail_account();
        account.sync_cursor = Some(SyncCursor::new("4242"));
        storage.upsert_account(&account).await.expect("insert");

        storage.mark_sync_started(account.id).await.expect("start");
        storage
            .record_sync_failure(account.id, "connection reset")
            .await
            .expect("failure");

        let loaded = storage.get_account(account.id).await.expect("query").expect("present");
        assert_eq!(loaded.sync_status, SyncStatus::Error);
        assert_eq!(loaded.last_sync_error.as_deref(), Some("connection reset"));
        assert_eq!(loaded.sync_cursor, Some(SyncCursor::new("4242")));
    }

    #[tokio::test]
    async fn inactive_accounts_are_filtered() {
        let storage = Storage::in_memory().await.expect("storage");
        let active = gmail_account();
        let dormant = gmail_account();
        storage.upsert_account(&active).await.expect("insert");
        storage.upsert_account(&dormant).await.expect("insert");
        storage.set_account_active(dormant.id, false).await.expect("deactivate");

        let ids: Vec<Uuid> = storage
            .list_accounts(true)
            .await
            .expect("list")
            .into_iter()
            .map(|account| account.id)
            .collect();
        assert_eq!(ids, vec![active.id]);
        assert_eq!(storage.list_accounts(false).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn folders_are_replaced_wholesale() {
        let storage = Storage::in_memory().await.expect("storage");
        let account = gmail_account();
        storage.upsert_account(&account).await.expect("insert");

        let folder = |remote_id: &str, folder_type| MailFolder {
            account_id: account.id,
            remote_id: remote_id.to_string(),
            name: remote_id.to_string(),
            display_name: remote_id.to_string(),
            folder_type,
            parent_id: None,
            total_count: 3,
            unread_count: 1,
        };

        storage
            .replace_folders(account.id, &[folder("INBOX", FolderType::Inbox), folder("Receipts", FolderType::Custom)])
            .await
            .expect("first");
        storage
            .replace_folders(account.id, &[folder("TRASH", FolderType::Trash)])
            .await
            .expect("second");

        let folders = storage.list_folders(account.id).await.expect("list");
        assert_eq!(folders.len(), 1);
        let trash = storage
            .find_folder_by_type(account.id, FolderType::Trash)
            .await
            .expect("query");
        assert_eq!(trash.map(|f| f.remote_id), Some("TRASH".to_string()));
    }
}
