//! Provider selection, fallback chains, TTLs and retry policies, plus their
//! conversion from the user's settings.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use wxhub_core::config::AUTO_PROVIDER;
use wxhub_core::{CacheSettings, ConfigError, RetrySettings, WeatherConfig};

use crate::cache::DEFAULT_TTL;
use crate::retry::RetryPolicy;
use crate::types::{DataKind, ProviderId};

/// Which providers the orchestrator may ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderSelection {
    /// Walk the per-kind fallback chain
    #[default]
    Automatic,
    /// Only ever ask this provider
    Explicit(ProviderId),
}

impl FromStr for ProviderSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == AUTO_PROVIDER {
            Ok(Self::Automatic)
        } else {
            s.parse().map(Self::Explicit)
        }
    }
}

/// Fixed provider order per data kind. Never re-ranked at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackOrder {
    chains: HashMap<DataKind, Vec<ProviderId>>,
}

impl Default for FallbackOrder {
    fn default() -> Self {
        use ProviderId::{Nws, OpenMeteo, VisualCrossing};

        Self::empty()
            .with_chain(DataKind::Current, vec![Nws, OpenMeteo, VisualCrossing])
            .with_chain(DataKind::Forecast, vec![Nws, OpenMeteo, VisualCrossing])
            .with_chain(DataKind::Hourly, vec![Nws, OpenMeteo, VisualCrossing])
            .with_chain(DataKind::Alerts, vec![Nws, VisualCrossing])
            .with_chain(DataKind::Discussion, vec![Nws])
            .with_chain(DataKind::AirQuality, vec![OpenMeteo])
    }
}

impl FallbackOrder {
    /// No chains at all; every kind exhausts immediately until one is set.
    pub fn empty() -> Self {
        Self {
            chains: HashMap::new(),
        }
    }

    /// Replace the chain for `kind`. Duplicates keep their first position.
    pub fn with_chain(mut self, kind: DataKind, providers: Vec<ProviderId>) -> Self {
        let mut chain: Vec<ProviderId> = Vec::with_capacity(providers.len());
        for provider in providers {
            if !chain.contains(&provider) {
                chain.push(provider);
            }
        }
        self.chains.insert(kind, chain);
        self
    }

    pub fn chain(&self, kind: DataKind) -> &[ProviderId] {
        self.chains.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Build from `weather.fallback`. Kinds missing from the map keep the
    /// default chain.
    pub fn from_settings(
        fallback: &BTreeMap<String, Vec<String>>,
    ) -> Result<Self, ConfigError> {
        let mut order = Self::default();
        for (kind, providers) in fallback {
            let kind: DataKind = kind.parse()?;
            let providers = providers
                .iter()
                .map(|p| p.parse::<ProviderId>())
                .collect::<Result<Vec<_>, _>>()?;
            order = order.with_chain(kind, providers);
        }
        Ok(order)
    }
}

/// How long a fetched payload stays fresh, per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    pub default: Duration,
    pub per_kind: HashMap<DataKind, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default: DEFAULT_TTL,
            per_kind: HashMap::new(),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, kind: DataKind) -> Duration {
        self.per_kind.get(&kind).copied().unwrap_or(self.default)
    }

    pub fn from_settings(settings: &CacheSettings) -> Result<Self, ConfigError> {
        let per_kind = settings
            .kind_ttl_secs
            .iter()
            .map(|(kind, secs)| Ok((kind.parse::<DataKind>()?, Duration::from_secs(*secs))))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(Self {
            default: Duration::from_secs(settings.ttl_secs),
            per_kind,
        })
    }
}

/// Retry policy per provider, with a shared default.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetryPolicies {
    pub default: RetryPolicy,
    pub per_provider: HashMap<ProviderId, RetryPolicy>,
}

impl RetryPolicies {
    pub fn for_provider(&self, provider: ProviderId) -> &RetryPolicy {
        self.per_provider.get(&provider).unwrap_or(&self.default)
    }

    pub fn from_settings(settings: &RetrySettings) -> Result<Self, ConfigError> {
        let per_provider = settings
            .providers
            .iter()
            .map(|(name, policy)| Ok((name.parse::<ProviderId>()?, RetryPolicy::from(policy))))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(Self {
            default: RetryPolicy::from(&settings.default),
            per_provider,
        })
    }
}

/// Typed view of `WeatherConfig`, minus providers and credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorPolicies {
    pub selection: ProviderSelection,
    pub fallback: FallbackOrder,
    pub ttl: TtlPolicy,
    pub retry: RetryPolicies,
}

impl TryFrom<&WeatherConfig> for OrchestratorPolicies {
    type Error = ConfigError;

    fn try_from(config: &WeatherConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            selection: config.provider.parse()?,
            fallback: FallbackOrder::from_settings(&config.fallback)?,
            ttl: TtlPolicy::from_settings(&config.cache)?,
            retry: RetryPolicies::from_settings(&config.retry)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wxhub_core::RetryPolicySettings;

    #[test]
    fn test_selection_parsing() {
        assert_eq!("auto".parse::<ProviderSelection>().unwrap(), ProviderSelection::Automatic);
        assert_eq!(
            "openmeteo".parse::<ProviderSelection>().unwrap(),
            ProviderSelection::Explicit(ProviderId::OpenMeteo)
        );
        assert!("weatherbug".parse::<ProviderSelection>().is_err());
    }

    #[test]
    fn test_default_config_matches_default_chains() {
        let policies = OrchestratorPolicies::try_from(&WeatherConfig::default()).unwrap();
        assert_eq!(policies.fallback, FallbackOrder::default());
        assert_eq!(policies.selection, ProviderSelection::Automatic);
        assert_eq!(policies.ttl.ttl_for(DataKind::Current), Duration::from_secs(300));
        assert_eq!(policies.retry, RetryPolicies::default());
    }

    #[test]
    fn test_chain_dedupes_and_keeps_order() {
        let order = FallbackOrder::empty().with_chain(
            DataKind::Current,
            vec![ProviderId::OpenMeteo, ProviderId::Nws, ProviderId::OpenMeteo],
        );
        assert_eq!(
            order.chain(DataKind::Current),
            &[ProviderId::OpenMeteo, ProviderId::Nws]
        );
        assert!(order.chain(DataKind::Alerts).is_empty());
    }

    #[test]
    fn test_overrides_from_settings() {
        let mut config = WeatherConfig::default();
        config
            .fallback
            .insert("current".into(), vec!["openmeteo".into()]);
        config.cache.kind_ttl_secs.insert("alerts".into(), 60);
        config.retry.providers.insert(
            "nws".into(),
            RetryPolicySettings {
                max_attempts: 1,
                ..RetryPolicySettings::default()
            },
        );

        let policies = OrchestratorPolicies::try_from(&config).unwrap();
        assert_eq!(policies.fallback.chain(DataKind::Current), &[ProviderId::OpenMeteo]);
        assert_eq!(policies.ttl.ttl_for(DataKind::Alerts), Duration::from_secs(60));
        assert_eq!(policies.ttl.ttl_for(DataKind::Forecast), Duration::from_secs(300));
        assert_eq!(policies.retry.for_provider(ProviderId::Nws).max_attempts, 1);
        assert_eq!(policies.retry.for_provider(ProviderId::OpenMeteo).max_attempts, 3);
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let mut config = WeatherConfig::default();
        config.fallback.insert("pollen".into(), vec!["nws".into()]);
        let err = OrchestratorPolicies::try_from(&config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownName { field: "data kind", .. }));
    }
}
