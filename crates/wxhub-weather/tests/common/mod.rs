//! Shared fixtures for orchestrator tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use wxhub_weather::{
    AirQuality, CurrentWeather, DataKind, ForecastDiscussion, Location, ProviderClient,
    ProviderError, ProviderId, ProviderResult, RetryPolicy, WeatherCondition, WeatherPayload,
};

/// Provider that replays scripted outcomes and counts calls.
pub struct ScriptedProvider {
    id: ProviderId,
    kinds: Vec<DataKind>,
    delay: Duration,
    script: Mutex<VecDeque<ProviderResult<WeatherPayload>>>,
    otherwise: Mutex<Option<ProviderResult<WeatherPayload>>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    /// Serves every kind, succeeding with [`sample_payload`] unless scripted.
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            kinds: DataKind::ALL.to_vec(),
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            otherwise: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    pub fn supporting(mut self, kinds: &[DataKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue the outcome of the next unscripted call.
    pub fn then(self, outcome: ProviderResult<WeatherPayload>) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// Outcome once the queue is empty.
    pub fn otherwise(self, outcome: ProviderResult<WeatherPayload>) -> Self {
        *self.otherwise.lock() = Some(outcome);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl ProviderClient for ScriptedProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn supports(&self, kind: DataKind, _location: &Location) -> bool {
        self.kinds.contains(&kind)
    }

    fn fetch<'a>(
        &'a self,
        kind: DataKind,
        _location: &'a Location,
    ) -> BoxFuture<'a, ProviderResult<WeatherPayload>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.script.lock().pop_front();
            let fallback = self.otherwise.lock().clone();

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            scripted
                .or(fallback)
                .unwrap_or_else(|| ProviderResult::Success(sample_payload(kind, self.id)))
        }
        .boxed()
    }
}

pub fn philadelphia() -> Location {
    Location::new("Philadelphia, PA", 40.0, -75.0)
}

/// Short backoff so paused-clock tests stay readable: 100ms, 200ms.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(100), 2.0, Duration::from_secs(1))
}

pub fn current(temperature: f64) -> WeatherPayload {
    WeatherPayload::Current(CurrentWeather {
        temperature,
        feels_like: None,
        humidity: Some(55),
        wind_speed: Some(12.0),
        condition: WeatherCondition::PartlyCloudy,
        summary: "Partly Cloudy".into(),
        observed_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    })
}

/// A well-formed payload of `kind`, tagged with the provider in its text.
pub fn sample_payload(kind: DataKind, provider: ProviderId) -> WeatherPayload {
    match kind {
        DataKind::Current => current(21.0),
        DataKind::Forecast => WeatherPayload::Forecast(Vec::new()),
        DataKind::Hourly => WeatherPayload::Hourly(Vec::new()),
        DataKind::Alerts => WeatherPayload::Alerts(Vec::new()),
        DataKind::Discussion => WeatherPayload::Discussion(ForecastDiscussion {
            office: provider.to_string(),
            issued_at: None,
            text: "Quiet weather continues.".into(),
        }),
        DataKind::AirQuality => WeatherPayload::AirQuality(AirQuality {
            us_aqi: Some(42),
            pm2_5: Some(8.1),
            pm10: Some(14.0),
            observed_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }),
    }
}

pub fn transient() -> ProviderResult<WeatherPayload> {
    ProviderResult::TransientFailure(ProviderError::Server { status: 503 })
}

pub fn permanent() -> ProviderResult<WeatherPayload> {
    ProviderResult::PermanentFailure(ProviderError::InvalidCredentials)
}
