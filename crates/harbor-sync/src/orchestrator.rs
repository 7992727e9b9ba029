use crate::SyncError;
use harbor_core::{Account, Credentials, SyncCursor, SyncResult, SyncStatus};
use harbor_email::{MailProvider, ProviderError, ProviderResolver};
use harbor_storage::{ReconcileStats, Storage};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

const DEFAULT_MAX_PARALLEL_ACCOUNTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Connecting,
    Syncing,
    Reconciling,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub account_id: Uuid,
    pub phase: SyncPhase,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub account_id: Uuid,
    pub status: SyncStatus,
    pub stats: Option<ReconcileStats>,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn from_result(account_id: Uuid, result: Result<ReconcileStats, SyncError>) -> Self {
        match result {
            Ok(stats) => Self {
                account_id,
                status: SyncStatus::Synced,
                stats: Some(stats),
                error: None,
            },
            Err(err) => Self {
                account_id,
                status: SyncStatus::Error,
                stats: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Drives one account at a time through connect, fetch and reconcile. Syncs of the
/// same account queue behind each other; different accounts run concurrently.
/// Per-account locks live only while someone holds or waits on them.
#[derive(Clone)]
pub struct SyncOrchestrator {
    storage: Storage,
    resolver: Arc<dyn ProviderResolver>,
    account_locks: Arc<Mutex<HashMap<Uuid, Weak<Mutex<()>>>>>,
    max_parallel_accounts: usize,
}

impl SyncOrchestrator {
    pub fn new(storage: Storage, resolver: Arc<dyn ProviderResolver>) -> Self {
        Self {
            storage,
            resolver,
            account_locks: Arc::new(Mutex::new(HashMap::new())),
            max_parallel_accounts: DEFAULT_MAX_PARALLEL_ACCOUNTS,
        }
    }

    pub fn with_max_parallel_accounts(mut self, max_parallel_accounts: usize) -> Self {
        self.max_parallel_accounts = max_parallel_accounts.max(1);
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn resolver(&self) -> &Arc<dyn ProviderResolver> {
        &self.resolver
    }

    async fn account_lock(&self, account_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().await;
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(&account_id).and_then(Weak::upgrade) {
            return lock;
        }

        let lock = Arc::new(Mutex::new(()));
        locks.insert(account_id, Arc::downgrade(&lock));
        lock
    }

    /// Exclusive access to one account's local state; sync passes take the same guard.
    pub(crate) async fn lock_account(&self, account_id: Uuid) -> OwnedMutexGuard<()> {
        self.account_lock(account_id).await.lock_owned().await
    }

    /// Runs one sync pass. On failure the account is left in `Error` with the
    /// message recorded and its cursor untouched, and the error is returned.
    pub async fn sync_account(
        &self,
        account_id: Uuid,
        progress: Option<UnboundedSender<SyncProgress>>,
    ) -> Result<ReconcileStats, SyncError> {
        let _guard = self.lock_account(account_id).await;

        // Read after taking the lock so a queued pass sees the cursor of the one before it.
        let account = self
            .storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("account {account_id}")))?;

        match self.run_pass(&account, progress.as_ref()).await {
            Ok(stats) => {
                tracing::info!(
                    %account_id,
                    provider = %account.provider,
                    threads = stats.threads_upserted,
                    messages = stats.messages_upserted,
                    deleted_threads = stats.threads_deleted,
                    deleted_messages = stats.messages_deleted,
                    "account sync finished"
                );
                emit(progress.as_ref(), account_id, SyncPhase::Idle, None);
                Ok(stats)
            }
            Err(err) => {
                tracing::warn!(%account_id, provider = %account.provider, error = %err, "account sync failed");
                emit(progress.as_ref(), account_id, SyncPhase::Failed, Some(err.to_string()));
                if let Err(store_err) = self.storage.record_sync_failure(account_id, &err.to_string()).await {
                    tracing::error!(%account_id, error = %store_err, "could not record sync failure");
                }
                emit(progress.as_ref(), account_id, SyncPhase::Idle, None);
                Err(err)
            }
        }
    }

    async fn run_pass(
        &self,
        account: &Account,
        progress: Option<&UnboundedSender<SyncProgress>>,
    ) -> Result<ReconcileStats, SyncError> {
        if !account.credentials_match_provider() {
            return Err(SyncError::InvalidAccount(format!(
                "credentials of account {} do not match provider {}",
                account.id, account.provider
            )));
        }

        let mut provider = self.resolver.resolve(account)?;
        self.storage.mark_sync_started(account.id).await?;

        let fetched = self.connect_and_fetch(provider.as_mut(), account, progress).await;
        provider.disconnect().await;
        let result = fetched?;

        emit(progress, account.id, SyncPhase::Reconciling, None);
        Ok(self.storage.apply_sync_result(account.id, &result).await?)
    }

    async fn connect_and_fetch(
        &self,
        provider: &mut dyn MailProvider,
        account: &Account,
        progress: Option<&UnboundedSender<SyncProgress>>,
    ) -> Result<SyncResult, SyncError> {
        emit(progress, account.id, SyncPhase::Connecting, None);
        if let Some(refreshed) = provider.connect().await? {
            self.storage
                .update_account_credentials(account.id, &Credentials::OAuth(refreshed))
                .await?;
            tracing::debug!(account_id = %account.id, "stored refreshed oauth credentials");
        }

        emit(progress, account.id, SyncPhase::Syncing, None);
        Ok(fetch_changes(provider, account.sync_cursor.as_ref()).await?)
    }

    /// Syncs every active account. A failing account never stops the others.
    pub async fn sync_all(&self) -> Result<Vec<SyncOutcome>, SyncError> {
        let accounts = self.storage.list_accounts(true).await?;
        let permits = Arc::new(Semaphore::new(self.max_parallel_accounts));
        let mut workers = JoinSet::new();

        for account in accounts {
            let orchestrator = self.clone();
            let permits = permits.clone();
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = orchestrator.sync_account(account.id, None).await;
                SyncOutcome::from_result(account.id, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!("sync worker join failed: {err}"),
            }
        }

        outcomes.sort_by_key(|outcome| outcome.account_id);
        Ok(outcomes)
    }
}

async fn fetch_changes(
    provider: &mut dyn MailProvider,
    cursor: Option<&SyncCursor>,
) -> Result<SyncResult, ProviderError> {
    // A rejected cursor falls back to an initial sync inside `perform_incremental_sync`.
    match cursor {
        Some(cursor) => provider.perform_incremental_sync(cursor).await,
        None => provider.perform_initial_sync().await,
    }
}

fn emit(
    progress: Option<&UnboundedSender<SyncProgress>>,
    account_id: Uuid,
    phase: SyncPhase,
    detail: Option<String>,
) {
    if let Some(sender) = progress {
        let _ = sender.send(SyncProgress {
            account_id,
            phase,
            detail,
        });
    }
}
