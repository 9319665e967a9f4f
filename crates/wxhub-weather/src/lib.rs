//! Weather data aggregation for wxhub.
//!
//! Fetches current conditions, forecasts, alerts and enrichment data from
//! several providers (NWS, Open-Meteo, Visual Crossing) with caching,
//! request deduplication, bounded retries and automatic fallback.

pub mod cache;
pub mod error;
pub mod inflight;
pub mod location;
pub mod orchestrator;
pub mod policy;
pub mod pool;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod types;

pub use cache::{CacheEntry, RequestCache, CACHE_FILE_NAME, DEFAULT_TTL};
pub use error::{ProviderAttempt, ProviderError, ProviderResult, WeatherError};
pub use inflight::{InFlightHandle, InFlightRequestTracker, SharedFetch};
pub use location::{Location, LocationKey};
pub use orchestrator::{
    Availability, EnrichmentCallback, FetchRequest, Freshness, OrchestratorBuilder,
    PendingEnrichment, ResolvedKind, WeatherDataAggregate, WeatherOrchestrator,
};
pub use policy::{FallbackOrder, OrchestratorPolicies, ProviderSelection, RetryPolicies, TtlPolicy};
pub use pool::{ConnectionPoolManager, PoolLimits, PooledClient};
pub use provider::ProviderClient;
pub use providers::{NwsClient, OpenMeteoClient, VisualCrossingClient};
pub use retry::{with_retry, RetryPolicy};
pub use types::*;
