//! Weather orchestrator: cache, request deduplication, retries and provider
//! fallback behind a single `fetch_weather` call.
//!
//! Per data kind the flow is:
//! 1. Fresh cache entry? Return it.
//! 2. Fetch already in flight for the same location and kind? Join it.
//! 3. Otherwise start one: walk the provider chain, each provider under its
//!    retry policy, and cache the first success.
//! 4. If every provider failed, fall back to a stale cache entry when the
//!    caller allows it, else report `AllProvidersExhausted`.
//!
//! Core kinds are awaited together. Enrichment kinds run in the background
//! and are handed back as [`PendingEnrichment`] handles.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use wxhub_core::{ApiKeyStore, ConfigError, WeatherConfig};

use crate::cache::{CacheEntry, RequestCache};
use crate::error::{ProviderAttempt, ProviderError, ProviderResult, WeatherError};
use crate::inflight::InFlightRequestTracker;
use crate::location::Location;
use crate::policy::{FallbackOrder, OrchestratorPolicies, ProviderSelection, RetryPolicies, TtlPolicy};
use crate::pool::{ConnectionPoolManager, PoolLimits};
use crate::provider::ProviderClient;
use crate::providers::{NwsClient, OpenMeteoClient, VisualCrossingClient};
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{CacheKey, DataKind, ProviderId, WeatherPayload};

/// Where a resolved payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Fetched from a provider for this request
    Live,
    /// Served from a fresh cache entry
    Cached,
    /// Every provider failed; last known data past its TTL
    Stale,
}

/// A payload for one kind, with diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedKind {
    pub kind: DataKind,
    pub payload: WeatherPayload,
    pub provider: ProviderId,
    pub freshness: Freshness,
    pub fetched_at: DateTime<Utc>,
    /// Providers that failed before this one succeeded, or before stale
    /// data was served
    pub attempts: Vec<ProviderAttempt>,
}

impl ResolvedKind {
    fn from_entry(
        kind: DataKind,
        entry: CacheEntry,
        freshness: Freshness,
        attempts: Vec<ProviderAttempt>,
    ) -> Self {
        Self {
            kind,
            payload: entry.payload,
            provider: entry.provider,
            freshness,
            fetched_at: entry.fetched_at,
            attempts,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

/// Invoked once per enrichment kind when it settles (success, failure or
/// cancellation).
pub type EnrichmentCallback =
    Arc<dyn Fn(DataKind, &Result<ResolvedKind, WeatherError>) + Send + Sync>;

/// What to fetch for one location.
#[derive(Clone)]
pub struct FetchRequest {
    /// Awaited before `fetch_weather` returns
    pub core: Vec<DataKind>,
    /// Started alongside the core kinds and returned as pending handles.
    /// When `fetch_weather` fails the handles are dropped, but the fetches
    /// still run to completion and report through the callback.
    pub enrichment: Vec<DataKind>,
    /// Skip fresh cache entries. An in-flight fetch is still joined.
    pub force_refresh: bool,
    /// Serve stale cache entries when every provider fails
    pub allow_stale: bool,
    on_enrichment_complete: Option<EnrichmentCallback>,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self::new(vec![DataKind::Current, DataKind::Forecast])
    }
}

impl FetchRequest {
    pub fn new(core: Vec<DataKind>) -> Self {
        Self {
            core,
            enrichment: Vec::new(),
            force_refresh: false,
            allow_stale: true,
            on_enrichment_complete: None,
        }
    }

    pub fn with_enrichment(mut self, kinds: Vec<DataKind>) -> Self {
        self.enrichment = kinds;
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn allow_stale(mut self, allow: bool) -> Self {
        self.allow_stale = allow;
        self
    }

    pub fn on_enrichment_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(DataKind, &Result<ResolvedKind, WeatherError>) + Send + Sync + 'static,
    {
        self.on_enrichment_complete = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("core", &self.core)
            .field("enrichment", &self.enrichment)
            .field("force_refresh", &self.force_refresh)
            .field("allow_stale", &self.allow_stale)
            .field("has_callback", &self.on_enrichment_complete.is_some())
            .finish()
    }
}

type SharedResult = Shared<BoxFuture<'static, Result<ResolvedKind, WeatherError>>>;

/// Handle to an enrichment kind still being fetched.
///
/// Cancelling stops this waiter only. A fetch other callers joined keeps
/// running and still fills the cache.
#[derive(Clone)]
pub struct PendingEnrichment {
    kind: DataKind,
    result: SharedResult,
    cancel: CancellationToken,
}

impl PendingEnrichment {
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// Wait for the outcome. Can be called from several clones.
    pub async fn wait(&self) -> Result<ResolvedKind, WeatherError> {
        self.result.clone().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Outcome if already settled.
    pub fn try_result(&self) -> Option<Result<ResolvedKind, WeatherError>> {
        self.result.peek().cloned()
    }
}

impl fmt::Debug for PendingEnrichment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEnrichment")
            .field("kind", &self.kind)
            .field("settled", &self.result.peek().is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// How complete the core data in an aggregate is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Every core kind is live or freshly cached
    Complete,
    /// Every core kind is present, some only as stale data
    ShowingLastKnown,
    /// At least one core kind is missing
    Partial,
}

/// Result of one `fetch_weather` call.
#[derive(Debug)]
pub struct WeatherDataAggregate {
    location: Location,
    resolved: BTreeMap<DataKind, ResolvedKind>,
    failures: BTreeMap<DataKind, WeatherError>,
    pending: HashMap<DataKind, PendingEnrichment>,
}

impl WeatherDataAggregate {
    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn get(&self, kind: DataKind) -> Option<&ResolvedKind> {
        self.resolved.get(&kind)
    }

    pub fn payload(&self, kind: DataKind) -> Option<&WeatherPayload> {
        self.resolved.get(&kind).map(|r| &r.payload)
    }

    pub fn provider_used(&self, kind: DataKind) -> Option<ProviderId> {
        self.resolved.get(&kind).map(|r| r.provider)
    }

    pub fn is_stale(&self, kind: DataKind) -> bool {
        self.resolved.get(&kind).is_some_and(ResolvedKind::is_stale)
    }

    pub fn resolved(&self) -> impl Iterator<Item = &ResolvedKind> {
        self.resolved.values()
    }

    /// Core kinds that could not be served at all.
    pub fn failures(&self) -> &BTreeMap<DataKind, WeatherError> {
        &self.failures
    }

    pub fn failure(&self, kind: DataKind) -> Option<&WeatherError> {
        self.failures.get(&kind)
    }

    pub fn pending(&self, kind: DataKind) -> Option<&PendingEnrichment> {
        self.pending.get(&kind)
    }

    pub fn take_pending(&mut self, kind: DataKind) -> Option<PendingEnrichment> {
        self.pending.remove(&kind)
    }

    pub fn pending_kinds(&self) -> Vec<DataKind> {
        let mut kinds: Vec<DataKind> = self.pending.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn availability(&self) -> Availability {
        if !self.failures.is_empty() {
            Availability::Partial
        } else if self.resolved.values().any(ResolvedKind::is_stale) {
            Availability::ShowingLastKnown
        } else {
            Availability::Complete
        }
    }
}

struct Inner {
    providers: HashMap<ProviderId, Arc<dyn ProviderClient>>,
    selection: ProviderSelection,
    fallback: FallbackOrder,
    retry: RetryPolicies,
    ttl: TtlPolicy,
    cache: Arc<RequestCache>,
    in_flight: InFlightRequestTracker<ResolvedKind>,
}

impl Inner {
    fn chain_for(&self, kind: DataKind) -> Vec<ProviderId> {
        match self.selection {
            ProviderSelection::Automatic => self.fallback.chain(kind).to_vec(),
            ProviderSelection::Explicit(provider) => vec![provider],
        }
    }

    /// Body of the shared fetch for one key.
    async fn fetch_for_key(
        &self,
        location: &Location,
        kind: DataKind,
        force_refresh: bool,
    ) -> Result<ResolvedKind, WeatherError> {
        let key = CacheKey::new(location.key(), kind);
        // Another fetch may have filled the cache since the caller looked
        if !force_refresh {
            if let Some(entry) = self.cache.get_if_fresh(&key) {
                return Ok(ResolvedKind::from_entry(kind, entry, Freshness::Cached, Vec::new()));
            }
        }
        self.run_provider_chain(location, kind).await
    }

    async fn run_provider_chain(
        &self,
        location: &Location,
        kind: DataKind,
    ) -> Result<ResolvedKind, WeatherError> {
        let key = CacheKey::new(location.key(), kind);
        let mut attempts: Vec<ProviderAttempt> = Vec::new();

        for provider_id in self.chain_for(kind) {
            let Some(provider) = self.providers.get(&provider_id) else {
                tracing::debug!("{} is not configured, skipping for {}", provider_id, key);
                continue;
            };
            if !provider.supports(kind, location) {
                tracing::debug!("{} does not serve {}, skipping", provider_id, key);
                attempts.push(ProviderAttempt {
                    provider: provider_id,
                    error: ProviderError::Unsupported {
                        provider: provider_id,
                        kind,
                    },
                });
                continue;
            }

            let label = format!("{} {}", provider_id, kind);
            let policy = self.retry.for_provider(provider_id);
            let outcome = with_retry(policy, &label, || provider.fetch(kind, location)).await;

            let error = match outcome {
                ProviderResult::Success(payload) if payload.kind() == kind => {
                    let entry = self
                        .cache
                        .put(key, payload, provider_id, self.ttl.ttl_for(kind));
                    if attempts.is_empty() {
                        tracing::debug!("{} served by {}", key, provider_id);
                    } else {
                        tracing::info!(
                            "{} served by fallback provider {} after {} failure(s)",
                            key,
                            provider_id,
                            attempts.len()
                        );
                    }
                    return Ok(ResolvedKind::from_entry(kind, entry, Freshness::Live, attempts));
                }
                ProviderResult::Success(payload) => ProviderError::UpstreamFormat(format!(
                    "asked for {} but got {}",
                    kind,
                    payload.kind()
                )),
                ProviderResult::TransientFailure(error) | ProviderResult::PermanentFailure(error) => {
                    error
                }
            };

            tracing::warn!("{} failed for {}: {}", provider_id, key, error);
            attempts.push(ProviderAttempt {
                provider: provider_id,
                error,
            });
        }

        tracing::error!(
            "All providers exhausted for {} ({} attempted)",
            key,
            attempts.len()
        );
        Err(WeatherError::AllProvidersExhausted {
            kind,
            location: key.location,
            attempts,
        })
    }
}

/// Entry point for weather data. Cheap to clone; clones share the cache,
/// the in-flight map and the providers.
#[derive(Clone)]
pub struct WeatherOrchestrator {
    inner: Arc<Inner>,
}

impl WeatherOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.inner.cache
    }

    pub fn selection(&self) -> ProviderSelection {
        self.inner.selection
    }

    /// Registered providers, in id order.
    pub fn providers(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.inner.providers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Fetch `request.core` and start `request.enrichment` for `location`.
    ///
    /// Returns `Err` only when no core kind could be served, not even from
    /// stale data. Otherwise failed core kinds are listed in
    /// [`WeatherDataAggregate::failures`]. Enrichment already started keeps
    /// running after an `Err`; its outcome reaches the callback and the cache.
    pub async fn fetch_weather(
        &self,
        location: &Location,
        request: FetchRequest,
    ) -> Result<WeatherDataAggregate, WeatherError> {
        let FetchRequest {
            core,
            enrichment,
            force_refresh,
            allow_stale,
            on_enrichment_complete,
        } = request;

        let core = dedup(core);
        let enrichment: Vec<DataKind> = dedup(enrichment)
            .into_iter()
            .filter(|kind| !core.contains(kind))
            .collect();

        tracing::debug!(
            "Fetching {:?} (+{:?}) for {}",
            core,
            enrichment,
            location
        );

        let pending: HashMap<DataKind, PendingEnrichment> = enrichment
            .into_iter()
            .map(|kind| {
                let handle = self.spawn_enrichment(
                    location.clone(),
                    kind,
                    force_refresh,
                    allow_stale,
                    on_enrichment_complete.clone(),
                );
                (kind, handle)
            })
            .collect();

        let results = join_all(core.iter().map(|&kind| async move {
            (
                kind,
                self.resolve_kind(location, kind, force_refresh, allow_stale)
                    .await,
            )
        }))
        .await;

        let mut resolved = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (kind, result) in results {
            match result {
                Ok(value) => {
                    resolved.insert(kind, value);
                }
                Err(error) => {
                    failures.insert(kind, error);
                }
            }
        }

        if resolved.is_empty() {
            if let Some(error) = core.iter().find_map(|kind| failures.remove(kind)) {
                return Err(error);
            }
        }

        Ok(WeatherDataAggregate {
            location: location.clone(),
            resolved,
            failures,
            pending,
        })
    }

    /// Resolve a single kind, using the cache and allowing stale fallback.
    pub async fn fetch_kind(
        &self,
        location: &Location,
        kind: DataKind,
    ) -> Result<ResolvedKind, WeatherError> {
        self.resolve_kind(location, kind, false, true).await
    }

    async fn resolve_kind(
        &self,
        location: &Location,
        kind: DataKind,
        force_refresh: bool,
        allow_stale: bool,
    ) -> Result<ResolvedKind, WeatherError> {
        let key = CacheKey::new(location.key(), kind);

        if !force_refresh {
            if let Some(entry) = self.inner.cache.get_if_fresh(&key) {
                tracing::debug!("Cache hit for {} (age {:?})", key, entry.age());
                return Ok(ResolvedKind::from_entry(kind, entry, Freshness::Cached, Vec::new()));
            }
        }

        let inner = Arc::clone(&self.inner);
        let owned_location = location.clone();
        let handle = self.inner.in_flight.get_or_start(key, move || async move {
            inner
                .fetch_for_key(&owned_location, kind, force_refresh)
                .await
        });
        if handle.joined {
            tracing::debug!("Joined in-flight fetch for {}", key);
        }

        match handle.future.await {
            Ok(resolved) => Ok(resolved),
            Err(error) => {
                if allow_stale {
                    if let Some(entry) = self.inner.cache.get(&key) {
                        tracing::warn!(
                            "Serving cached {} from {} (age {:?}): {}",
                            key,
                            entry.provider,
                            entry.age(),
                            error
                        );
                        // A forced refresh can fail while the entry is still fresh
                        let freshness = if entry.is_fresh() {
                            Freshness::Cached
                        } else {
                            Freshness::Stale
                        };
                        let attempts = error.attempts().to_vec();
                        return Ok(ResolvedKind::from_entry(kind, entry, freshness, attempts));
                    }
                }
                Err(error)
            }
        }
    }

    fn spawn_enrichment(
        &self,
        location: Location,
        kind: DataKind,
        force_refresh: bool,
        allow_stale: bool,
        callback: Option<EnrichmentCallback>,
    ) -> PendingEnrichment {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.clone();

        let task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(WeatherError::Cancelled),
                result = this.resolve_kind(&location, kind, force_refresh, allow_stale) => result,
            };
            match &result {
                Ok(resolved) => tracing::debug!(
                    "Enrichment {} ready from {}",
                    kind,
                    resolved.provider
                ),
                Err(error) => tracing::debug!("Enrichment {} settled: {}", kind, error),
            }
            if let Some(callback) = callback {
                callback(kind, &result);
            }
            result
        });

        let result = async move {
            task.await
                .unwrap_or_else(|e| Err(WeatherError::TaskAborted(e.to_string())))
        }
        .boxed()
        .shared();

        PendingEnrichment {
            kind,
            result,
            cancel,
        }
    }
}

fn dedup(kinds: Vec<DataKind>) -> Vec<DataKind> {
    let mut seen = Vec::with_capacity(kinds.len());
    for kind in kinds {
        if !seen.contains(&kind) {
            seen.push(kind);
        }
    }
    seen
}

/// Builder for [`WeatherOrchestrator`].
pub struct OrchestratorBuilder {
    providers: Vec<Arc<dyn ProviderClient>>,
    selection: ProviderSelection,
    fallback: FallbackOrder,
    retry: RetryPolicies,
    ttl: TtlPolicy,
    cache: Option<Arc<RequestCache>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            selection: ProviderSelection::Automatic,
            fallback: FallbackOrder::default(),
            retry: RetryPolicies::default(),
            ttl: TtlPolicy::default(),
            cache: None,
        }
    }

    /// Register a provider. A later registration with the same id wins.
    pub fn provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn selection(mut self, selection: ProviderSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn fallback_order(mut self, fallback: FallbackOrder) -> Self {
        self.fallback = fallback;
        self
    }

    /// Default retry policy for providers without an override.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry.default = policy;
        self
    }

    pub fn provider_retry_policy(mut self, provider: ProviderId, policy: RetryPolicy) -> Self {
        self.retry.per_provider.insert(provider, policy);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl.default = ttl;
        self
    }

    pub fn kind_ttl(mut self, kind: DataKind, ttl: Duration) -> Self {
        self.ttl.per_kind.insert(kind, ttl);
        self
    }

    /// Use an existing cache, e.g. one restored from disk.
    pub fn cache(mut self, cache: Arc<RequestCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn policies(mut self, policies: OrchestratorPolicies) -> Self {
        self.selection = policies.selection;
        self.fallback = policies.fallback;
        self.retry = policies.retry;
        self.ttl = policies.ttl;
        self
    }

    /// Builder with the real providers and policies from the user's
    /// settings. Visual Crossing is registered only when an API key is
    /// available.
    pub fn from_config(config: &WeatherConfig, keys: &ApiKeyStore) -> Result<Self, WeatherError> {
        let policies = OrchestratorPolicies::try_from(config)?;
        let pool = ConnectionPoolManager::new(PoolLimits::from(&config.pool))?;

        let mut builder = Self::new()
            .provider(Arc::new(NwsClient::new(pool.clone())))
            .provider(Arc::new(OpenMeteoClient::new(pool.clone())));

        match keys.api_key(ProviderId::VisualCrossing.as_str()) {
            Some(key) => {
                builder = builder.provider(Arc::new(VisualCrossingClient::new(pool, key)));
            }
            None if policies.selection == ProviderSelection::Explicit(ProviderId::VisualCrossing) => {
                return Err(ConfigError::Invalid(format!(
                    "provider is set to {} but no API key is configured (set {})",
                    ProviderId::VisualCrossing,
                    ApiKeyStore::env_var_name(ProviderId::VisualCrossing.as_str())
                ))
                .into());
            }
            None => {
                tracing::info!("No Visual Crossing API key; provider disabled");
            }
        }

        Ok(builder.policies(policies))
    }

    pub fn build(self) -> WeatherOrchestrator {
        let providers: HashMap<ProviderId, Arc<dyn ProviderClient>> = self
            .providers
            .into_iter()
            .map(|provider| (provider.id(), provider))
            .collect();

        tracing::info!(
            "Weather orchestrator ready: {} provider(s), selection {:?}",
            providers.len(),
            self.selection
        );

        WeatherOrchestrator {
            inner: Arc::new(Inner {
                providers,
                selection: self.selection,
                fallback: self.fallback,
                retry: self.retry,
                ttl: self.ttl,
                cache: self.cache.unwrap_or_default(),
                in_flight: InFlightRequestTracker::new(),
            }),
        }
    }
}
