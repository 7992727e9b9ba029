use crate::SecurityError;
use harbor_core::ProviderKind;

/// OS keychain access for secrets that must not live in the TOML config.
#[derive(Debug, Clone)]
pub struct SecretStore {
    service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKey {
    pub namespace: String,
    pub id: String,
}

impl SecretKey {
    /// Client secret of the OAuth application registered for a provider family.
    pub fn oauth_client_secret(provider: ProviderKind) -> Self {
        let family = if provider.is_graph() {
            "microsoft"
        } else {
            provider.as_str()
        };
        Self {
            namespace: "oauth".to_string(),
            id: format!("{family}_client_secret"),
        }
    }

    pub fn as_username(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }
}

impl SecretStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn set(&self, key: &SecretKey, value: &str) -> Result<(), SecurityError> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    pub fn get(&self, key: &SecretKey) -> Result<Option<String>, SecurityError> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn delete(&self, key: &SecretKey) -> Result<(), SecurityError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn entry(&self, key: &SecretKey) -> Result<keyring::Entry, SecurityError> {
        Ok(keyring::Entry::new(&self.service_name, &key.as_username())?)
    }
}
