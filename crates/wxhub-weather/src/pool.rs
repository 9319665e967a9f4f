//! Shared HTTP client with bounded concurrency.
//!
//! One `reqwest::Client` is built per orchestrator and handed to every
//! provider. reqwest keeps idle connections per host but has no global cap,
//! so outstanding requests are bounded with a semaphore.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use wxhub_core::PoolSettings;

use crate::error::WeatherError;

const USER_AGENT: &str = "wxhub/0.1.0 (https://github.com/wxhub/wxhub)";

/// Limits applied to the shared client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub max_idle_per_host: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolLimits {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            max_connections: settings.max_connections.max(1),
            max_idle_per_host: settings.max_idle_per_host,
        }
    }
}

/// Owner of the shared client and the request permits.
#[derive(Debug, Clone)]
pub struct ConnectionPoolManager {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    limits: PoolLimits,
}

impl ConnectionPoolManager {
    pub fn new(limits: PoolLimits) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder()
            .timeout(limits.request_timeout)
            .connect_timeout(limits.connect_timeout)
            .pool_max_idle_per_host(limits.max_idle_per_host)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| WeatherError::Transport(e.to_string()))?;

        tracing::debug!(
            "HTTP pool ready: {} connections, {} idle per host, {:?} request timeout",
            limits.max_connections,
            limits.max_idle_per_host,
            limits.request_timeout
        );

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(limits.max_connections)),
            limits,
        })
    }

    /// The client without a permit. Prefer [`acquire`](Self::acquire).
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Wait for a request slot.
    pub async fn acquire(&self) -> Result<PooledClient, WeatherError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| WeatherError::Transport("connection pool closed".into()))?;

        Ok(PooledClient {
            client: self.client.clone(),
            _permit: permit,
        })
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Client handle that holds a request slot until dropped.
#[derive(Debug)]
pub struct PooledClient {
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = reqwest::Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = PoolLimits::default();
        assert_eq!(limits.request_timeout, Duration::from_secs(5));
        assert_eq!(limits.connect_timeout, Duration::from_secs(3));
        assert_eq!(limits.max_connections, 30);
        assert_eq!(limits.max_idle_per_host, 15);
    }

    #[tokio::test]
    async fn test_permits_are_bounded_and_released() {
        let pool = ConnectionPoolManager::new(PoolLimits {
            max_connections: 2,
            ..PoolLimits::default()
        })
        .unwrap();

        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();
        assert_eq!(pool.available_permits(), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(blocked.is_err(), "third request should wait for a slot");

        drop(first);
        assert_eq!(pool.available_permits(), 1);
        assert!(pool.acquire().await.is_ok());
    }
}
