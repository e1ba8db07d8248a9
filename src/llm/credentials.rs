use std::collections::BTreeMap;

use tracing::debug;

use crate::config::CredentialsConfig;
use crate::llm::error::CredentialsError;
use crate::llm::generator::Credentials;
use crate::schema::ids::OwnerId;

/// Looks up the generation credentials of a world's owner.
pub trait CredentialsResolver: Send + Sync {
    fn resolve(&self, owner: &OwnerId) -> Result<Credentials, CredentialsError>;
}

/// Per-owner entries from configuration, then a shared fallback key.
#[derive(Clone, Default)]
pub struct ConfiguredCredentials {
    owners: BTreeMap<String, Credentials>,
    fallback: Option<String>,
}

impl std::fmt::Debug for ConfiguredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredCredentials")
            .field("owners", &self.owners.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ConfiguredCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration. The fallback key is read from the
    /// configured environment variable once, here.
    pub fn from_config(config: &CredentialsConfig) -> Self {
        let owners = config
            .owners
            .iter()
            .map(|(owner, entry)| {
                (
                    owner.clone(),
                    Credentials {
                        api_key: entry.api_key.clone(),
                        base_url: entry.base_url.clone(),
                        model: entry.model.clone(),
                    },
                )
            })
            .collect();
        let fallback = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Self { owners, fallback }
    }

    pub fn with_owner(mut self, owner: &OwnerId, credentials: Credentials) -> Self {
        self.owners.insert(owner.as_str().to_string(), credentials);
        self
    }

    pub fn with_fallback(mut self, api_key: impl Into<String>) -> Self {
        self.fallback = Some(api_key.into());
        self
    }
}

impl CredentialsResolver for ConfiguredCredentials {
    fn resolve(&self, owner: &OwnerId) -> Result<Credentials, CredentialsError> {
        if let Some(creds) = self.owners.get(owner.as_str()) {
            if !creds.api_key.trim().is_empty() {
                return Ok(creds.clone());
            }
        }
        match self.fallback.as_deref() {
            Some(key) if !key.trim().is_empty() => {
                debug!(owner_id = %owner, "using fallback generation key");
                Ok(Credentials::new(key))
            }
            _ => Err(CredentialsError::Missing(owner.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OwnerCredentials;

    #[test]
    fn owner_entry_wins_over_fallback() {
        let owner = OwnerId::new("u1");
        let mut creds = Credentials::new("owner-key");
        creds.model = Some("small".into());
        let resolver = ConfiguredCredentials::new()
            .with_owner(&owner, creds)
            .with_fallback("shared");

        let got = resolver.resolve(&owner).unwrap();
        assert_eq!(got.api_key, "owner-key");
        assert_eq!(got.model.as_deref(), Some("small"));

        let other = resolver.resolve(&OwnerId::new("u2")).unwrap();
        assert_eq!(other.api_key, "shared");
    }

    #[test]
    fn blank_keys_count_as_missing() {
        let owner = OwnerId::new("u1");
        let resolver = ConfiguredCredentials::new()
            .with_owner(&owner, Credentials::new("  "))
            .with_fallback("");
        assert!(matches!(
            resolver.resolve(&owner),
            Err(CredentialsError::Missing(o)) if o == owner
        ));
    }

    #[test]
    fn from_config_reads_owner_map() {
        let mut config = CredentialsConfig {
            api_key_env: Some("WORLDSMITH_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
            ..CredentialsConfig::default()
        };
        config.owners.insert(
            "u1".to_string(),
            OwnerCredentials {
                api_key: "k1".to_string(),
                base_url: Some("http://localhost:9999/v1".to_string()),
                model: None,
            },
        );
        let resolver = ConfiguredCredentials::from_config(&config);
        let got = resolver.resolve(&OwnerId::new("u1")).unwrap();
        assert_eq!(got.base_url.as_deref(), Some("http://localhost:9999/v1"));
        assert!(resolver.resolve(&OwnerId::new("u2")).is_err());
    }
}
