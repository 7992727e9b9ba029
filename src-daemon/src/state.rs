use anyhow::Context;
use harbor_config::{AppConfig, ConfigManager};
use harbor_core::ProviderKind;
use harbor_email::{ProviderFactory, ProviderSettings};
use harbor_security::{OAuthWorkflow, SecretKey, SecretStore};
use harbor_storage::Storage;
use harbor_sync::{MailService, SyncOrchestrator};
use std::sync::Arc;

const KEYCHAIN_SERVICE: &str = "io.harbor.daemon";

pub struct AppState {
    pub(crate) config: AppConfig,
    pub(crate) storage: Storage,
    pub(crate) mail: MailService,
}

impl AppState {
    pub async fn initialize() -> anyhow::Result<Self> {
        let config_manager = ConfigManager::new().context("initialize config manager")?;
        let config = config_manager.load().context("load app config")?;

        let db_path = config_manager.database_path(&config);
        let storage = Storage::connect(&db_path)
            .await
            .context("initialize sqlite storage")?;

        let secrets = SecretStore::new(KEYCHAIN_SERVICE);
        let factory = provider_factory(&config, &secrets)?;

        let orchestrator = SyncOrchestrator::new(storage.clone(), Arc::new(factory))
            .with_max_parallel_accounts(config.sync.max_parallel_accounts);
        let mail = MailService::with_orchestrator(orchestrator);

        tracing::info!(database = %db_path.display(), "harbor state initialized");

        Ok(Self {
            config,
            storage,
            mail,
        })
    }
}

fn provider_factory(config: &AppConfig, secrets: &SecretStore) -> anyhow::Result<ProviderFactory> {
    let settings = ProviderSettings {
        initial_sync_limit: config.sync.initial_sync_limit.max(1),
        incremental_page_limit: config.sync.incremental_page_limit.max(1),
        request_timeout: config.sync.provider_timeout(),
    };
    let mut factory = ProviderFactory::new(settings).context("build provider http client")?;

    if config.oauth.google.is_configured() {
        let secret = client_secret(secrets, ProviderKind::Gmail)?;
        let profile = config
            .oauth
            .google_profile(secret)
            .context("build google oauth profile")?;
        let workflow = OAuthWorkflow::new(profile).context("initialize google oauth")?;
        factory = factory.with_google_oauth(workflow);
    } else {
        tracing::warn!("google oauth client is not configured; gmail accounts cannot refresh tokens");
    }

    if config.oauth.microsoft.is_configured() {
        let secret = client_secret(secrets, ProviderKind::GraphWork)?;
        let profile = config
            .oauth
            .microsoft_profile(secret)
            .context("build microsoft oauth profile")?;
        let workflow = OAuthWorkflow::new(profile).context("initialize microsoft oauth")?;
        factory = factory.with_microsoft_oauth(workflow);
    } else {
        tracing::warn!("microsoft oauth client is not configured; graph accounts cannot refresh tokens");
    }

    Ok(factory)
}

/// Public clients (PKCE only) have no secret stored; that is not an error.
fn client_secret(secrets: &SecretStore, provider: ProviderKind) -> anyhow::Result<Option<String>> {
    secrets
        .get(&SecretKey::oauth_client_secret(provider))
        .with_context(|| format!("load {provider} oauth client secret from keychain"))
}
