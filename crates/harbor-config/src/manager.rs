use crate::{AppConfig, ConfigError};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const ORG: &str = "io";
const AUTHOR: &str = "Harbor";
const APP: &str = "Harbor";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(ORG, AUTHOR, APP).ok_or(ConfigError::MissingDirectories)?;
        Self::from_dirs(
            dirs.config_dir().to_path_buf(),
            dirs.data_dir().to_path_buf(),
            dirs.cache_dir().to_path_buf(),
        )
    }

    /// Keeps config, data and cache under one root, e.g. for a portable install.
    pub fn with_root(root: &Path) -> Result<Self, ConfigError> {
        Self::from_dirs(root.join("config"), root.join("data"), root.join("cache"))
    }

    fn from_dirs(
        config_dir: PathBuf,
        data_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        fs::create_dir_all(&config_dir)?;
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&cache_dir)?;

        let config_path = config_dir.join("config.toml");
        if !config_path.exists() {
            let initial = AppConfig::default();
            let content = toml::to_string_pretty(&initial)?;
            fs::write(&config_path, content)?;
            tracing::info!(path = %config_path.display(), "wrote default config");
        }

        Ok(Self {
            config_path,
            data_dir,
            cache_dir,
        })
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let content = fs::read_to_string(&self.config_path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn database_path(&self, config: &AppConfig) -> PathBuf {
        self.data_dir.join(&config.database.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_default_config_on_first_use() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = ConfigManager::with_root(root.path()).expect("manager");

        assert!(manager.config_path().exists());
        let config = manager.load().expect("load default");
        assert_eq!(config.sync.initial_sync_limit, 100);
        assert_eq!(
            manager.database_path(&config),
            root.path().join("data").join("harbor.sqlite3")
        );
    }

    #[test]
    fn save_then_load_keeps_changes() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = ConfigManager::with_root(root.path()).expect("manager");

        let mut config = manager.load().expect("load");
        config.sync.provider_timeout_secs = 30;
        config.oauth.google.client_id = "google-client".to_string();
        manager.save(&config).expect("save");

        let reloaded = ConfigManager::with_root(root.path())
            .expect("manager")
            .load()
            .expect("reload");
        assert_eq!(reloaded.sync.provider_timeout_secs, 30);
        assert_eq!(reloaded.oauth.google.client_id, "google-client");
    }
}
