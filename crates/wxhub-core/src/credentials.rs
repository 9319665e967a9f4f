//! API key resolution for providers that require one.
//!
//! Lookup order: `WXHUB_<PROVIDER>_API_KEY` environment variable, the system
//! keyring (service `wxhub`, user = provider id), then `weather.api_keys` in
//! the config file. Keys are never logged.

use std::collections::BTreeMap;

use crate::config::WeatherConfig;
use crate::error::CredentialError;

const KEYRING_SERVICE: &str = "wxhub";

/// Resolves provider API keys from the environment, keyring and config.
#[derive(Debug, Clone)]
pub struct ApiKeyStore {
    config_keys: BTreeMap<String, String>,
    use_keyring: bool,
}

impl ApiKeyStore {
    pub fn new(config: &WeatherConfig) -> Self {
        Self {
            config_keys: config.api_keys.clone(),
            use_keyring: true,
        }
    }

    /// Skip the system keyring (headless environments, tests).
    pub fn without_keyring(mut self) -> Self {
        self.use_keyring = false;
        self
    }

    /// Environment variable consulted first for a provider.
    pub fn env_var_name(provider: &str) -> String {
        format!("WXHUB_{}_API_KEY", provider.to_ascii_uppercase())
    }

    /// Resolve the API key for a provider, if any source has one.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        if let Ok(key) = std::env::var(Self::env_var_name(provider)) {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }

        if self.use_keyring {
            match Self::keyring_entry(provider).and_then(|entry| {
                entry
                    .get_password()
                    .map_err(|e| CredentialError::StorageError(e.to_string()))
            }) {
                Ok(key) if !key.trim().is_empty() => return Some(key),
                Ok(_) => {}
                Err(e) => tracing::debug!("No keyring entry for {}: {}", provider, e),
            }
        }

        self.config_keys
            .get(provider)
            .filter(|key| !key.trim().is_empty())
            .cloned()
    }

    /// Like [`api_key`](Self::api_key), but a missing key is an error.
    pub fn require(&self, provider: &str) -> Result<String, CredentialError> {
        self.api_key(provider)
            .ok_or_else(|| CredentialError::NotFound(provider.to_string()))
    }

    /// Save a key in the system keyring.
    pub fn store_in_keyring(provider: &str, key: &str) -> Result<(), CredentialError> {
        Self::keyring_entry(provider)?
            .set_password(key)
            .map_err(|e| CredentialError::StorageError(e.to_string()))?;
        tracing::info!("Stored API key for provider: {}", provider);
        Ok(())
    }

    fn keyring_entry(provider: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(KEYRING_SERVICE, provider)
            .map_err(|e| CredentialError::StorageError(e.to_string()))
    }
}
