use crate::ConfigError;
use harbor_core::OAuthProfile;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

const MICROSOFT_SCOPES: &[&str] = &[
    "openid",
    "profile",
    "email",
    "offline_access",
    "Mail.ReadWrite",
    "Mail.Send",
    "User.Read",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: u32,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub poll_interval_secs: u64,
    /// Newest messages (IMAP) or conversations (Gmail, Graph) pulled by a first sync.
    pub initial_sync_limit: u32,
    /// Upper bound on delta pages followed during one incremental pass.
    pub incremental_page_limit: u32,
    pub provider_timeout_secs: u64,
    pub max_parallel_accounts: usize,
}

impl SyncConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(15))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 120,
            initial_sync_limit: 100,
            incremental_page_limit: 10,
            provider_timeout_secs: 45,
            max_parallel_accounts: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "OAuthClientConfig::google_default")]
    pub google: OAuthClientConfig,
    #[serde(default = "OAuthClientConfig::microsoft_default")]
    pub microsoft: OAuthClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub redirect_url: String,
    /// Azure AD tenant; ignored for Google.
    #[serde(default)]
    pub tenant: Option<String>,
}

impl OAuthClientConfig {
    fn google_default() -> Self {
        Self {
            client_id: String::new(),
            redirect_url: "http://localhost:3847/auth/google/callback".to_string(),
            tenant: None,
        }
    }

    fn microsoft_default() -> Self {
        Self {
            client_id: String::new(),
            redirect_url: "http://localhost:3847/auth/microsoft/callback".to_string(),
            tenant: Some("common".to_string()),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.client_id.trim().is_empty()
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            google: OAuthClientConfig::google_default(),
            microsoft: OAuthClientConfig::microsoft_default(),
        }
    }
}

impl OAuthConfig {
    pub fn google_profile(&self, client_secret: Option<String>) -> Result<OAuthProfile, ConfigError> {
        Ok(OAuthProfile {
            client_id: self.google.client_id.clone(),
            client_secret,
            auth_url: parse_url(GOOGLE_AUTH_URL)?,
            token_url: parse_url(GOOGLE_TOKEN_URL)?,
            redirect_url: parse_url(&self.google.redirect_url)?,
            scopes: GOOGLE_SCOPES.iter().map(|scope| scope.to_string()).collect(),
            extra_auth_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        })
    }

    pub fn microsoft_profile(
        &self,
        client_secret: Option<String>,
    ) -> Result<OAuthProfile, ConfigError> {
        let tenant = self
            .microsoft
            .tenant
            .as_deref()
            .filter(|tenant| !tenant.trim().is_empty())
            .unwrap_or("common");
        let authority = format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0");

        Ok(OAuthProfile {
            client_id: self.microsoft.client_id.clone(),
            client_secret,
            auth_url: parse_url(&format!("{authority}/authorize"))?,
            token_url: parse_url(&format!("{authority}/token"))?,
            redirect_url: parse_url(&self.microsoft.redirect_url)?,
            scopes: MICROSOFT_SCOPES.iter().map(|scope| scope.to_string()).collect(),
            extra_auth_params: vec![
                ("response_mode".to_string(), "query".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        })
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|err| ConfigError::OAuth(format!("invalid url '{raw}': {err}")))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            database: DatabaseConfig {
                file_name: "harbor.sqlite3".to_string(),
            },
            sync: SyncConfig::default(),
            oauth: OAuthConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microsoft_profile_uses_configured_tenant() {
        let mut config = AppConfig::default();
        config.oauth.microsoft.client_id = "client".to_string();
        config.oauth.microsoft.tenant = Some("organizations".to_string());

        let profile = config.oauth.microsoft_profile(None).expect("profile");
        assert_eq!(
            profile.token_url.as_str(),
            "https://login.microsoftonline.com/organizations/oauth2/v2.0/token"
        );
        assert!(profile.scopes.iter().any(|scope| scope == "offline_access"));
    }

    #[test]
    fn google_profile_requests_offline_access() {
        let config = AppConfig::default();
        let profile = config.oauth.google_profile(Some("secret".to_string())).expect("profile");
        assert_eq!(profile.redirect_url.host_str(), Some("localhost"));
        assert!(profile
            .extra_auth_params
            .iter()
            .any(|(key, value)| key == "access_type" && value == "offline"));
    }

    #[test]
    fn missing_oauth_section_falls_back_to_defaults() {
        let raw = r#"
            version = 1

            [database]
            file_name = "mail.sqlite3"

            [sync]
            poll_interval_secs = 60
            initial_sync_limit = 25
            incremental_page_limit = 5
            provider_timeout_secs = 30
            max_parallel_accounts = 2
        "#;
        let config: AppConfig = toml::from_str(raw).expect("config parses");
        assert_eq!(config.sync.initial_sync_limit, 25);
        assert!(!config.oauth.google.is_configured());
        assert_eq!(config.oauth.microsoft.tenant.as_deref(), Some("common"));
    }
}
