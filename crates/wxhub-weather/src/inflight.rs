//! Deduplication of concurrent fetches for the same cache key.
//!
//! The first caller for a key starts the fetch on the runtime; later callers
//! clone its shared future. The fetch task deregisters itself before it
//! publishes its result, so a waiter that wakes up never sees its own
//! request still registered. Waiters can be dropped freely: the fetch keeps
//! running for anyone else joined to it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::WeatherError;
use crate::types::CacheKey;

/// Future every caller for one key awaits.
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, WeatherError>>>;

type RequestMap<T> = Arc<Mutex<HashMap<CacheKey, InFlightRequest<T>>>>;

/// Result of [`InFlightRequestTracker::get_or_start`].
pub struct InFlightHandle<T: Clone> {
    pub future: SharedFetch<T>,
    /// `true` when an existing fetch was joined
    pub joined: bool,
}

struct InFlightRequest<T: Clone> {
    id: u64,
    future: SharedFetch<T>,
    created_at: Instant,
}

pub struct InFlightRequestTracker<T: Clone> {
    requests: RequestMap<T>,
    next_id: AtomicU64,
}

impl<T: Clone> Default for InFlightRequestTracker<T> {
    fn default() -> Self {
        Self {
            requests: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> InFlightRequestTracker<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the fetch registered for `key`, or start one with `factory`.
    ///
    /// `factory` is only invoked when nothing is registered. Must be called
    /// from within a Tokio runtime.
    pub fn get_or_start<F, Fut>(&self, key: CacheKey, factory: F) -> InFlightHandle<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WeatherError>> + Send + 'static,
    {
        let mut requests = self.requests.lock();
        if let Some(existing) = requests.get(&key) {
            tracing::debug!(
                "Joining in-flight fetch #{} for {} (started {:?} ago)",
                existing.id,
                key,
                existing.created_at.elapsed()
            );
            return InFlightHandle {
                future: existing.future.clone(),
                joined: true,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let future: SharedFetch<T> = async move {
            receiver.await.unwrap_or_else(|_| {
                Err(WeatherError::TaskAborted(
                    "fetch task ended without a result".into(),
                ))
            })
        }
        .boxed()
        .shared();

        requests.insert(
            key,
            InFlightRequest {
                id,
                future: future.clone(),
                created_at: Instant::now(),
            },
        );
        // Registered before the task exists, so its removal always finds it
        drop(requests);

        let completion = Completion {
            requests: Arc::clone(&self.requests),
            key,
            id,
            sender: Some(sender),
        };
        let fetch = factory();
        tokio::spawn(async move {
            let result = fetch.await;
            completion.finish(result);
        });

        tracing::debug!("Started fetch #{} for {}", id, key);
        InFlightHandle {
            future,
            joined: false,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.requests.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

/// Owned by the fetch task. Deregisters the request before the result is
/// sent, and also when the task panics or is dropped unfinished.
struct Completion<T: Clone> {
    requests: RequestMap<T>,
    key: CacheKey,
    id: u64,
    sender: Option<oneshot::Sender<Result<T, WeatherError>>>,
}

impl<T: Clone> Completion<T> {
    fn finish(mut self, result: Result<T, WeatherError>) {
        self.deregister();
        if let Some(sender) = self.sender.take() {
            // No receivers left is fine
            let _ = sender.send(result);
        }
    }

    fn deregister(&self) {
        let mut requests = self.requests.lock();
        if requests.get(&self.key).is_some_and(|r| r.id == self.id) {
            requests.remove(&self.key);
        }
    }
}

impl<T: Clone> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.deregister();
        }
    }
}
