//! US National Weather Service client (api.weather.gov).
//!
//! Every lookup starts from `/points/{lat},{lon}`, which names the forecast
//! office, grid URLs and nearby observation stations. That response is
//! memoized per location so steady-state fetches are a single request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::instrument;

use crate::error::{ProviderError, ProviderResult};
use crate::location::{Location, LocationKey};
use crate::pool::ConnectionPoolManager;
use crate::provider::{fetch_json, required, ProviderClient};
use crate::types::{
    fahrenheit_to_celsius, percent, CurrentWeather, DataKind, DayForecast, ForecastDiscussion,
    HourlyForecast, ProviderId, WeatherAlert, WeatherCondition, WeatherPayload,
};

const NWS_API_BASE: &str = "https://api.weather.gov";
const GEO_JSON: &str = "application/geo+json";
const LD_JSON: &str = "application/ld+json";
/// Grid lookups kept per client; the oldest is evicted beyond this.
const MAX_GRID_POINTS: usize = 64;

/// Grid metadata for one location.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridPoint {
    forecast: Option<String>,
    forecast_hourly: Option<String>,
    observation_stations: Option<String>,
    cwa: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Feature<P> {
    properties: P,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "P: Deserialize<'de>"))]
struct FeatureCollection<P> {
    #[serde(default)]
    features: Vec<Feature<P>>,
}

#[derive(Debug, Deserialize)]
struct PeriodList {
    #[serde(default)]
    periods: Vec<Period>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Period {
    start_time: DateTime<FixedOffset>,
    is_daytime: bool,
    temperature: Option<f64>,
    temperature_unit: Option<String>,
    probability_of_precipitation: Option<Measurement>,
    #[serde(default)]
    short_forecast: String,
}

impl Period {
    fn celsius(&self) -> Option<f64> {
        let value = self.temperature?;
        match self.temperature_unit.as_deref() {
            Some("F") | None => Some(fahrenheit_to_celsius(value)),
            _ => Some(value),
        }
    }

    fn precipitation_chance(&self) -> Option<u8> {
        self.probability_of_precipitation
            .as_ref()
            .and_then(|m| m.value)
            .map(percent)
    }
}

#[derive(Debug, Deserialize)]
struct Measurement {
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Station {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StationCollection {
    #[serde(default)]
    features: Vec<Station>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Observation {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    text_description: String,
    temperature: Option<Measurement>,
    heat_index: Option<Measurement>,
    wind_chill: Option<Measurement>,
    relative_humidity: Option<Measurement>,
    wind_speed: Option<Measurement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertProperties {
    id: String,
    event: String,
    headline: Option<String>,
    severity: Option<String>,
    #[serde(default)]
    description: String,
    expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ProductList {
    #[serde(rename = "@graph", default)]
    graph: Vec<ProductRef>,
}

#[derive(Debug, Deserialize)]
struct ProductRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Product {
    issuance_time: Option<DateTime<Utc>>,
    issuing_office: Option<String>,
    #[serde(default)]
    product_text: String,
}

/// Insertion-ordered memo of `/points` responses.
#[derive(Debug, Default)]
struct GridPointMemo {
    entries: HashMap<LocationKey, Arc<GridPoint>>,
    order: VecDeque<LocationKey>,
}

impl GridPointMemo {
    fn get(&self, key: &LocationKey) -> Option<Arc<GridPoint>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: LocationKey, point: Arc<GridPoint>) {
        if self.entries.insert(key, point).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > MAX_GRID_POINTS {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct NwsClient {
    pool: ConnectionPoolManager,
    base_url: String,
    points: Mutex<GridPointMemo>,
}

impl NwsClient {
    pub fn new(pool: ConnectionPoolManager) -> Self {
        Self::with_base_url(pool, NWS_API_BASE)
    }

    pub fn with_base_url(pool: ConnectionPoolManager, base_url: &str) -> Self {
        Self {
            pool,
            base_url: base_url.trim_end_matches('/').to_string(),
            points: Mutex::new(GridPointMemo::default()),
        }
    }

    async fn grid_point(&self, location: &Location) -> Result<Arc<GridPoint>, ProviderError> {
        let key = location.key();
        let cached = self.points.lock().get(&key);
        if let Some(point) = cached {
            return Ok(point);
        }

        let url = format!("{}/points/{}", self.base_url, location.coordinate_pair());
        let feature: Feature<GridPoint> = fetch_json(&self.pool, &url, &[], GEO_JSON).await?;
        let point = Arc::new(feature.properties);
        tracing::debug!(
            "NWS grid for {}: office {}",
            key,
            point.cwa.as_deref().unwrap_or("?")
        );

        self.points.lock().insert(key, Arc::clone(&point));
        Ok(point)
    }

    async fn current(&self, location: &Location) -> Result<CurrentWeather, ProviderError> {
        let point = self.grid_point(location).await?;
        let stations_url = required(point.observation_stations.as_deref(), "observationStations")?;
        let stations: StationCollection =
            fetch_json(&self.pool, stations_url, &[], GEO_JSON).await?;
        let station = required(stations.features.first(), "features[0]")?;

        let url = format!("{}/observations/latest", station.id);
        let observation: Feature<Observation> = fetch_json(&self.pool, &url, &[], GEO_JSON).await?;
        let obs = observation.properties;

        let value = |m: &Option<Measurement>| m.as_ref().and_then(|m| m.value);
        let temperature = required(value(&obs.temperature), "temperature.value")?;

        Ok(CurrentWeather {
            temperature,
            feels_like: value(&obs.heat_index).or(value(&obs.wind_chill)),
            humidity: value(&obs.relative_humidity).map(percent),
            wind_speed: value(&obs.wind_speed),
            condition: WeatherCondition::from_text(&obs.text_description),
            summary: obs.text_description,
            observed_at: obs.timestamp,
        })
    }

    async fn periods(&self, url: Option<&str>, field: &str) -> Result<Vec<Period>, ProviderError> {
        let url = required(url, field)?;
        let list: Feature<PeriodList> = fetch_json(&self.pool, url, &[], GEO_JSON).await?;
        Ok(list.properties.periods)
    }

    async fn forecast(&self, location: &Location) -> Result<Vec<DayForecast>, ProviderError> {
        let point = self.grid_point(location).await?;
        let periods = self.periods(point.forecast.as_deref(), "forecast").await?;
        Ok(group_periods_by_day(&periods))
    }

    async fn hourly(&self, location: &Location) -> Result<Vec<HourlyForecast>, ProviderError> {
        let point = self.grid_point(location).await?;
        let periods = self
            .periods(point.forecast_hourly.as_deref(), "forecastHourly")
            .await?;

        periods
            .iter()
            .map(|p| {
                Ok(HourlyForecast {
                    time: p.start_time.with_timezone(&Utc),
                    temperature: required(p.celsius(), "temperature")?,
                    condition: WeatherCondition::from_text(&p.short_forecast),
                    precipitation_chance: p.precipitation_chance(),
                })
            })
            .collect()
    }

    async fn alerts(&self, location: &Location) -> Result<Vec<WeatherAlert>, ProviderError> {
        let url = format!("{}/alerts/active", self.base_url);
        let query = [("point", location.coordinate_pair())];
        let alerts: FeatureCollection<AlertProperties> =
            fetch_json(&self.pool, &url, &query, GEO_JSON).await?;

        Ok(alerts
            .features
            .into_iter()
            .map(|f| {
                let a = f.properties;
                WeatherAlert {
                    id: a.id,
                    event: a.event,
                    headline: a.headline,
                    severity: a.severity,
                    description: a.description,
                    expires: a.expires,
                }
            })
            .collect())
    }

    async fn discussion(&self, location: &Location) -> Result<ForecastDiscussion, ProviderError> {
        let point = self.grid_point(location).await?;
        let office = required(point.cwa.clone(), "cwa")?;

        let list_url = format!("{}/products/types/AFD/locations/{}", self.base_url, office);
        let list: ProductList = fetch_json(&self.pool, &list_url, &[], LD_JSON).await?;
        let latest = required(list.graph.first(), "@graph[0]")?;

        let url = format!("{}/products/{}", self.base_url, latest.id);
        let product: Product = fetch_json(&self.pool, &url, &[], LD_JSON).await?;

        Ok(ForecastDiscussion {
            office: product.issuing_office.unwrap_or(office),
            issued_at: product.issuance_time,
            text: product.product_text,
        })
    }

    #[instrument(skip(self, location), fields(location = %location), level = "debug")]
    async fn fetch_kind(
        &self,
        kind: DataKind,
        location: &Location,
    ) -> Result<WeatherPayload, ProviderError> {
        if !self.supports(kind, location) {
            return Err(ProviderError::Unsupported {
                provider: ProviderId::Nws,
                kind,
            });
        }

        match kind {
            DataKind::Current => self.current(location).await.map(WeatherPayload::Current),
            DataKind::Forecast => self.forecast(location).await.map(WeatherPayload::Forecast),
            DataKind::Hourly => self.hourly(location).await.map(WeatherPayload::Hourly),
            DataKind::Alerts => self.alerts(location).await.map(WeatherPayload::Alerts),
            DataKind::Discussion => self
                .discussion(location)
                .await
                .map(WeatherPayload::Discussion),
            DataKind::AirQuality => Err(ProviderError::Unsupported {
                provider: ProviderId::Nws,
                kind,
            }),
        }
    }
}

impl ProviderClient for NwsClient {
    fn id(&self) -> ProviderId {
        ProviderId::Nws
    }

    fn supports(&self, kind: DataKind, location: &Location) -> bool {
        kind != DataKind::AirQuality && location.is_within_us()
    }

    fn fetch<'a>(
        &'a self,
        kind: DataKind,
        location: &'a Location,
    ) -> BoxFuture<'a, ProviderResult<WeatherPayload>> {
        self.fetch_kind(kind, location)
            .map(ProviderResult::from_result)
            .boxed()
    }
}

/// Fold day/night periods into one entry per local date.
fn group_periods_by_day(periods: &[Period]) -> Vec<DayForecast> {
    let mut days: Vec<DayForecast> = Vec::new();

    for period in periods {
        let date: NaiveDate = period.start_time.date_naive();
        let index = match days.iter().position(|d| d.date == date) {
            Some(index) => index,
            None => {
                days.push(DayForecast {
                    date,
                    high: None,
                    low: None,
                    condition: WeatherCondition::from_text(&period.short_forecast),
                    summary: period.short_forecast.clone(),
                    precipitation_chance: None,
                    sunrise: None,
                    sunset: None,
                });
                days.len() - 1
            }
        };
        let day = &mut days[index];

        if period.is_daytime {
            day.high = period.celsius();
            day.condition = WeatherCondition::from_text(&period.short_forecast);
            day.summary = period.short_forecast.clone();
        } else {
            day.low = period.celsius();
        }
        day.precipitation_chance = day.precipitation_chance.max(period.precipitation_chance());
    }

    days
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_point(office: &str) -> Arc<GridPoint> {
        Arc::new(GridPoint {
            forecast: None,
            forecast_hourly: None,
            observation_stations: None,
            cwa: Some(office.into()),
        })
    }

    #[test]
    fn test_grid_memo_evicts_oldest() {
        let mut memo = GridPointMemo::default();
        let keys: Vec<LocationKey> = (0..=MAX_GRID_POINTS)
            .map(|i| Location::new("grid", 30.0 + i as f64 * 0.1, -90.0).key())
            .collect();

        for key in &keys {
            memo.insert(*key, grid_point("PHI"));
        }

        assert_eq!(memo.len(), MAX_GRID_POINTS);
        assert!(memo.get(&keys[0]).is_none());
        assert!(memo.get(&keys[1]).is_some());
        assert!(memo.get(&keys[MAX_GRID_POINTS]).is_some());
    }

    #[test]
    fn test_grid_memo_reinsert_keeps_size() {
        let mut memo = GridPointMemo::default();
        let key = Location::new("Philadelphia", 40.0, -75.0).key();

        memo.insert(key, grid_point("PHI"));
        memo.insert(key, grid_point("LWX"));

        assert_eq!(memo.len(), 1);
        assert_eq!(memo.get(&key).unwrap().cwa.as_deref(), Some("LWX"));
    }

    fn period(start: &str, is_daytime: bool, temperature: f64, forecast: &str) -> Period {
        Period {
            start_time: DateTime::parse_from_rfc3339(start).unwrap(),
            is_daytime,
            temperature: Some(temperature),
            temperature_unit: Some("F".into()),
            probability_of_precipitation: Some(Measurement {
                value: Some(if is_daytime { 20.0 } else { 60.0 }),
            }),
            short_forecast: forecast.into(),
        }
    }

    #[test]
    fn test_group_periods_by_day() {
        let periods = vec![
            period("2024-06-01T18:00:00-04:00", false, 59.0, "Mostly Clear"),
            period("2024-06-02T06:00:00-04:00", true, 86.0, "Sunny"),
            period("2024-06-02T18:00:00-04:00", false, 68.0, "Chance Showers"),
        ];

        let days = group_periods_by_day(&periods);
        assert_eq!(days.len(), 2);

        assert_eq!(days[0].high, None);
        assert_eq!(days[0].low, Some(15.0));

        assert_eq!(days[1].high, Some(30.0));
        assert_eq!(days[1].low, Some(20.0));
        assert_eq!(days[1].summary, "Sunny");
        assert_eq!(days[1].condition, WeatherCondition::Clear);
        assert_eq!(days[1].precipitation_chance, Some(60));
    }

    #[tokio::test]
    async fn test_outside_us_is_unsupported_without_request() {
        let pool = ConnectionPoolManager::new(Default::default()).unwrap();
        // Unroutable base: any request would fail with a connection error
        let client = NwsClient::with_base_url(pool, "http://127.0.0.1:9");
        let london = Location::new("London", 51.5, -0.12);

        assert!(!client.supports(DataKind::Current, &london));
        let result = client.fetch(DataKind::Current, &london).await;
        assert!(matches!(
            result,
            ProviderResult::PermanentFailure(ProviderError::Unsupported { .. })
        ));
    }
}
