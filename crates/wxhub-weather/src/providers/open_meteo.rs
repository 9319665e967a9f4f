//! Open-Meteo client. Global coverage, no API key.
//! See: https://open-meteo.com/en/docs

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use tracing::instrument;

use crate::error::{ProviderError, ProviderResult};
use crate::location::Location;
use crate::pool::ConnectionPoolManager;
use crate::provider::{fetch_json, ProviderClient};
use crate::types::{
    percent, AirQuality, CurrentWeather, DataKind, DayForecast, HourlyForecast, ProviderId,
    WeatherCondition, WeatherPayload,
};

const FORECAST_API_BASE: &str = "https://api.open-meteo.com";
const AIR_QUALITY_API_BASE: &str = "https://air-quality-api.open-meteo.com";
const JSON: &str = "application/json";

const CURRENT_FIELDS: &str =
    "temperature_2m,apparent_temperature,relative_humidity_2m,wind_speed_10m,weather_code";
const DAILY_FIELDS: &str =
    "weather_code,temperature_2m_max,temperature_2m_min,precipitation_probability_max,sunrise,sunset";
const HOURLY_FIELDS: &str = "temperature_2m,weather_code,precipitation_probability";
const AIR_QUALITY_FIELDS: &str = "us_aqi,pm2_5,pm10";

const FORECAST_DAYS: u32 = 7;
const FORECAST_HOURS: u32 = 48;

/// Open-Meteo timestamps are ISO-8601 without seconds or offset.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    current: CurrentBlock,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    time: String,
    temperature_2m: f64,
    apparent_temperature: Option<f64>,
    relative_humidity_2m: Option<f64>,
    wind_speed_10m: Option<f64>,
    weather_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    daily: DailyBlock,
}

#[derive(Debug, Deserialize)]
struct DailyBlock {
    time: Vec<String>,
    weather_code: Vec<Option<i32>>,
    temperature_2m_max: Vec<Option<f64>>,
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_probability_max: Vec<Option<f64>>,
    #[serde(default)]
    sunrise: Vec<Option<String>>,
    #[serde(default)]
    sunset: Vec<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct HourlyResponse {
    hourly: HourlyBlock,
}

#[derive(Debug, Deserialize)]
struct HourlyBlock {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    weather_code: Vec<Option<i32>>,
    #[serde(default)]
    precipitation_probability: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AirQualityResponse {
    current: AirQualityBlock,
}

#[derive(Debug, Deserialize)]
struct AirQualityBlock {
    time: String,
    us_aqi: Option<f64>,
    pm2_5: Option<f64>,
    pm10: Option<f64>,
}

pub struct OpenMeteoClient {
    pool: ConnectionPoolManager,
    forecast_base: String,
    air_quality_base: String,
}

impl OpenMeteoClient {
    pub fn new(pool: ConnectionPoolManager) -> Self {
        Self::with_base_urls(pool, FORECAST_API_BASE, AIR_QUALITY_API_BASE)
    }

    pub fn with_base_urls(
        pool: ConnectionPoolManager,
        forecast_base: &str,
        air_quality_base: &str,
    ) -> Self {
        Self {
            pool,
            forecast_base: forecast_base.trim_end_matches('/').to_string(),
            air_quality_base: air_quality_base.trim_end_matches('/').to_string(),
        }
    }

    fn query(
        location: &Location,
        block: &'static str,
        fields: &str,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("latitude", format!("{:.4}", location.latitude)),
            ("longitude", format!("{:.4}", location.longitude)),
            (block, fields.to_string()),
            ("timezone", "UTC".to_string()),
        ]
    }

    async fn current(&self, location: &Location) -> Result<CurrentWeather, ProviderError> {
        let url = format!("{}/v1/forecast", self.forecast_base);
        let query = Self::query(location, "current", CURRENT_FIELDS);
        let response: CurrentResponse = fetch_json(&self.pool, &url, &query, JSON).await?;
        let c = response.current;

        let condition = WeatherCondition::from_wmo_code(c.weather_code.unwrap_or(0));
        Ok(CurrentWeather {
            temperature: c.temperature_2m,
            feels_like: c.apparent_temperature,
            humidity: c.relative_humidity_2m.map(percent),
            wind_speed: c.wind_speed_10m,
            condition,
            summary: condition.description().to_string(),
            observed_at: parse_time(&c.time)?,
        })
    }

    async fn forecast(&self, location: &Location) -> Result<Vec<DayForecast>, ProviderError> {
        let url = format!("{}/v1/forecast", self.forecast_base);
        let mut query = Self::query(location, "daily", DAILY_FIELDS);
        query.push(("forecast_days", FORECAST_DAYS.to_string()));
        let response: DailyResponse = fetch_json(&self.pool, &url, &query, JSON).await?;
        daily_from_block(response.daily)
    }

    async fn hourly(&self, location: &Location) -> Result<Vec<HourlyForecast>, ProviderError> {
        let url = format!("{}/v1/forecast", self.forecast_base);
        let mut query = Self::query(location, "hourly", HOURLY_FIELDS);
        query.push(("forecast_hours", FORECAST_HOURS.to_string()));
        let response: HourlyResponse = fetch_json(&self.pool, &url, &query, JSON).await?;
        hourly_from_block(response.hourly)
    }

    async fn air_quality(&self, location: &Location) -> Result<AirQuality, ProviderError> {
        let url = format!("{}/v1/air-quality", self.air_quality_base);
        let query = Self::query(location, "current", AIR_QUALITY_FIELDS);
        let response: AirQualityResponse = fetch_json(&self.pool, &url, &query, JSON).await?;
        let aq = response.current;

        Ok(AirQuality {
            us_aqi: aq.us_aqi.map(|v| v.round().clamp(0.0, f64::from(u16::MAX)) as u16),
            pm2_5: aq.pm2_5,
            pm10: aq.pm10,
            observed_at: parse_time(&aq.time)?,
        })
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
            DataKind::AirQuality => self
                .air_quality(location)
                .await
                .map(WeatherPayload::AirQuality),
            DataKind::Alerts | DataKind::Discussion => Err(ProviderError::Unsupported {
                provider: ProviderId::OpenMeteo,
                kind,
            }),
        }
    }
}

impl ProviderClient for OpenMeteoClient {
    fn id(&self) -> ProviderId {
        ProviderId::OpenMeteo
    }

    fn supports(&self, kind: DataKind, _location: &Location) -> bool {
        !matches!(kind, DataKind::Alerts | DataKind::Discussion)
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

fn parse_time(value: &str) -> Result<DateTime<Utc>, ProviderError> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|e| ProviderError::UpstreamFormat(format!("bad time `{}`: {}", value, e)))
}

fn parse_clock(value: Option<&String>) -> Option<NaiveTime> {
    value
        .and_then(|v| NaiveDateTime::parse_from_str(v, TIME_FORMAT).ok())
        .map(|t| t.time())
}

fn check_len(name: &str, len: usize, expected: usize) -> Result<(), ProviderError> {
    if len == expected {
        Ok(())
    } else {
        Err(ProviderError::UpstreamFormat(format!(
            "`{}` has {} values, expected {}",
            name, len, expected
        )))
    }
}

fn daily_from_block(daily: DailyBlock) -> Result<Vec<DayForecast>, ProviderError> {
    let n = daily.time.len();
    check_len("weather_code", daily.weather_code.len(), n)?;
    check_len("temperature_2m_max", daily.temperature_2m_max.len(), n)?;
    check_len("temperature_2m_min", daily.temperature_2m_min.len(), n)?;

    (0..n)
        .map(|i| {
            let date = NaiveDate::parse_from_str(&daily.time[i], "%Y-%m-%d").map_err(|e| {
                ProviderError::UpstreamFormat(format!("bad date `{}`: {}", daily.time[i], e))
            })?;
            let condition = WeatherCondition::from_wmo_code(daily.weather_code[i].unwrap_or(0));

            Ok(DayForecast {
                date,
                high: daily.temperature_2m_max[i],
                low: daily.temperature_2m_min[i],
                condition,
                summary: condition.description().to_string(),
                precipitation_chance: daily
                    .precipitation_probability_max
                    .get(i)
                    .copied()
                    .flatten()
                    .map(percent),
                sunrise: parse_clock(daily.sunrise.get(i).and_then(Option::as_ref)),
                sunset: parse_clock(daily.sunset.get(i).and_then(Option::as_ref)),
            })
        })
        .collect()
}

fn hourly_from_block(hourly: HourlyBlock) -> Result<Vec<HourlyForecast>, ProviderError> {
    let n = hourly.time.len();
    check_len("temperature_2m", hourly.temperature_2m.len(), n)?;
    check_len("weather_code", hourly.weather_code.len(), n)?;

    let mut entries = Vec::with_capacity(n);
    for i in 0..n {
        // Trailing hours past the model horizon come back as null
        let Some(temperature) = hourly.temperature_2m[i] else {
            continue;
        };
        entries.push(HourlyForecast {
            time: parse_time(&hourly.time[i])?,
            temperature,
            condition: WeatherCondition::from_wmo_code(hourly.weather_code[i].unwrap_or(0)),
            precipitation_chance: hourly
                .precipitation_probability
                .get(i)
                .copied()
                .flatten()
                .map(percent),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        let t = parse_time("2024-06-01T14:00").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-06-01T14:00:00+00:00");
        assert!(matches!(
            parse_time("yesterday"),
            Err(ProviderError::UpstreamFormat(_))
        ));
    }

    #[test]
    fn test_daily_block() {
        let block: DailyBlock = serde_json::from_value(serde_json::json!({
            "time": ["2024-06-01", "2024-06-02"],
            "weather_code": [3, 61],
            "temperature_2m_max": [24.1, 19.8],
            "temperature_2m_min": [12.0, null],
            "precipitation_probability_max": [10, 80],
            "sunrise": ["2024-06-01T09:31", "2024-06-02T09:30"],
            "sunset": ["2024-06-02T00:25", "2024-06-03T00:26"]
        }))
        .unwrap();

        let days = daily_from_block(block).unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].condition, WeatherCondition::Cloudy);
        assert_eq!(days[1].condition, WeatherCondition::Rain);
        assert_eq!(days[1].low, None);
        assert_eq!(days[1].precipitation_chance, Some(80));
        assert_eq!(days[0].sunrise, NaiveTime::from_hms_opt(9, 31, 0));
    }

    #[test]
    fn test_mismatched_arrays_are_rejected() {
        let block = HourlyBlock {
            time: vec!["2024-06-01T00:00".into(), "2024-06-01T01:00".into()],
            temperature_2m: vec![Some(10.0)],
            weather_code: vec![Some(0), Some(0)],
            precipitation_probability: Vec::new(),
        };
        assert!(matches!(
            hourly_from_block(block),
            Err(ProviderError::UpstreamFormat(_))
        ));
    }

    #[test]
    fn test_only_alerts_and_discussion_unsupported() {
        let pool = ConnectionPoolManager::new(Default::default()).unwrap();
        let client = OpenMeteoClient::new(pool);
        let sydney = Location::new("Sydney", -33.87, 151.21);

        assert!(client.supports(DataKind::Current, &sydney));
        assert!(client.supports(DataKind::AirQuality, &sydney));
        assert!(!client.supports(DataKind::Alerts, &sydney));
        assert!(!client.supports(DataKind::Discussion, &sydney));
    }
}
