mod state;

use state::AppState;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Folder lists change rarely; refresh them every this many sync cycles.
const FOLDER_REFRESH_EVERY: u64 = 30;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let state = AppState::initialize().await?;

    tokio::select! {
        _ = background_sync_loop(&state) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::error!("could not listen for shutdown signal: {err}");
            }
            tracing::info!("shutting down");
        }
    }

    Ok(())
}

async fn background_sync_loop(state: &AppState) {
    let mut ticker = interval(state.config.sync.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = 0_u64;

    loop {
        ticker.tick().await;

        if tick % FOLDER_REFRESH_EVERY == 0 {
            refresh_all_folders(state).await;
        }

        match state.mail.sync_all().await {
            Ok(outcomes) => {
                let failed = outcomes.iter().filter(|outcome| outcome.error.is_some()).count();
                if !outcomes.is_empty() {
                    tracing::info!(
                        accounts = outcomes.len(),
                        failed,
                        "background sync cycle completed"
                    );
                }
                for outcome in outcomes.iter().filter(|outcome| outcome.error.is_some()) {
                    tracing::warn!(
                        account_id = %outcome.account_id,
                        error = outcome.error.as_deref().unwrap_or_default(),
                        "account left in error state"
                    );
                }
            }
            Err(err) => tracing::error!("background sync run failed: {err}"),
        }

        tick = tick.wrapping_add(1);
    }
}

async fn refresh_all_folders(state: &AppState) {
    let accounts = match state.storage.list_accounts(true).await {
        Ok(accounts) => accounts,
        Err(err) => {
            tracing::warn!("could not list accounts for folder refresh: {err}");
            return;
        }
    };

    for account in accounts {
        if let Err(err) = state.mail.refresh_folders(account.id).await {
            tracing::warn!(account_id = %account.id, provider = %account.provider, "folder refresh failed: {err}");
        }
    }
}
