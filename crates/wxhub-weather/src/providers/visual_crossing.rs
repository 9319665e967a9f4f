//! Visual Crossing Timeline API client. Requires an API key.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use tracing::instrument;

use crate::error::{ProviderError, ProviderResult};
use crate::location::Location;
use crate::pool::ConnectionPoolManager;
use crate::provider::{fetch_json, required, ProviderClient};
use crate::types::{
    percent, CurrentWeather, DataKind, DayForecast, HourlyForecast, ProviderId, WeatherAlert,
    WeatherCondition, WeatherPayload,
};

const TIMELINE_API_BASE: &str =
    "https://weather.visualcrossing.com/VisualCrossingWebServices/rest/services/timeline";
const JSON: &str = "application/json";

const HOURS_KEPT: usize = 48;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Timeline {
    current_conditions: Option<Conditions>,
    #[serde(default)]
    days: Vec<Day>,
    #[serde(default)]
    alerts: Vec<Alert>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Conditions {
    datetime_epoch: i64,
    temp: Option<f64>,
    feelslike: Option<f64>,
    humidity: Option<f64>,
    windspeed: Option<f64>,
    #[serde(default)]
    conditions: String,
    precipprob: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Day {
    datetime: NaiveDate,
    tempmax: Option<f64>,
    tempmin: Option<f64>,
    precipprob: Option<f64>,
    #[serde(default)]
    conditions: String,
    sunrise: Option<NaiveTime>,
    sunset: Option<NaiveTime>,
    #[serde(default)]
    hours: Vec<Conditions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Alert {
    id: Option<String>,
    event: String,
    headline: Option<String>,
    #[serde(default)]
    description: String,
    ends_epoch: Option<i64>,
}

pub struct VisualCrossingClient {
    pool: ConnectionPoolManager,
    api_key: String,
    base_url: String,
}

impl VisualCrossingClient {
    pub fn new(pool: ConnectionPoolManager, api_key: impl Into<String>) -> Self {
        Self::with_base_url(pool, api_key, TIMELINE_API_BASE)
    }

    pub fn with_base_url(
        pool: ConnectionPoolManager,
        api_key: impl Into<String>,
        base_url: &str,
    ) -> Self {
        Self {
            pool,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn timeline(&self, location: &Location, include: &str) -> Result<Timeline, ProviderError> {
        let url = format!("{}/{}", self.base_url, location.coordinate_pair());
        let query = [
            ("key", self.api_key.clone()),
            ("unitGroup", "metric".to_string()),
            ("include", include.to_string()),
            ("contentType", "json".to_string()),
        ];
        fetch_json(&self.pool, &url, &query, JSON).await
    }

    async fn current(&self, location: &Location) -> Result<CurrentWeather, ProviderError> {
        let timeline = self.timeline(location, "current").await?;
        let c = required(timeline.current_conditions, "currentConditions")?;

        Ok(CurrentWeather {
            temperature: required(c.temp, "currentConditions.temp")?,
            feels_like: c.feelslike,
            humidity: c.humidity.map(percent),
            wind_speed: c.windspeed,
            condition: WeatherCondition::from_text(&c.conditions),
            observed_at: epoch(c.datetime_epoch)?,
            summary: c.conditions,
        })
    }

    async fn forecast(&self, location: &Location) -> Result<Vec<DayForecast>, ProviderError> {
        let timeline = self.timeline(location, "days").await?;
        Ok(timeline
            .days
            .into_iter()
            .map(|d| DayForecast {
                date: d.datetime,
                high: d.tempmax,
                low: d.tempmin,
                condition: WeatherCondition::from_text(&d.conditions),
                summary: d.conditions,
                precipitation_chance: d.precipprob.map(percent),
                sunrise: d.sunrise,
                sunset: d.sunset,
            })
            .collect())
    }

    async fn hourly(&self, location: &Location) -> Result<Vec<HourlyForecast>, ProviderError> {
        let timeline = self.timeline(location, "hours").await?;
        let now = Utc::now().timestamp();

        timeline
            .days
            .into_iter()
            .flat_map(|d| d.hours)
            .filter(|h| h.datetime_epoch + 3600 > now)
            .take(HOURS_KEPT)
            .map(|h| {
                Ok(HourlyForecast {
                    time: epoch(h.datetime_epoch)?,
                    temperature: required(h.temp, "hours.temp")?,
                    condition: WeatherCondition::from_text(&h.conditions),
                    precipitation_chance: h.precipprob.map(percent),
                })
            })
            .collect()
    }

    async fn alerts(&self, location: &Location) -> Result<Vec<WeatherAlert>, ProviderError> {
        let timeline = self.timeline(location, "alerts").await?;
        timeline
            .alerts
            .into_iter()
            .map(|a| {
                Ok(WeatherAlert {
                    id: a.id.unwrap_or_else(|| a.event.clone()),
                    expires: a.ends_epoch.map(epoch).transpose()?,
                    event: a.event,
                    headline: a.headline,
                    severity: None,
                    description: a.description,
                })
            })
            .collect()
    }

    #[instrument(skip(self, location), fields(location = %location), level = "debug")]
    async fn fetch_kind(
        &self,
        kind: DataKind,
        location: &Location,
    ) -> Result<WeatherPayload, ProviderError> {
        match kind {
            DataKind::Current => self.current(location).await.map(WeatherPayload::Current),
            DataKind::Forecast => self.forecast(location).await.map(WeatherPayload::Forecast),
            DataKind::Hourly => self.hourly(location).await.map(WeatherPayload::Hourly),
            DataKind::Alerts => self.alerts(location).await.map(WeatherPayload::Alerts),
            DataKind::Discussion | DataKind::AirQuality => Err(ProviderError::Unsupported {
                provider: ProviderId::VisualCrossing,
                kind,
            }),
        }
    }
}

impl ProviderClient for VisualCrossingClient {
    fn id(&self) -> ProviderId {
        ProviderId::VisualCrossing
    }

    fn supports(&self, kind: DataKind, _location: &Location) -> bool {
        !matches!(kind, DataKind::Discussion | DataKind::AirQuality)
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

fn epoch(seconds: i64) -> Result<DateTime<Utc>, ProviderError> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| ProviderError::UpstreamFormat(format!("bad epoch {}", seconds)))
}
