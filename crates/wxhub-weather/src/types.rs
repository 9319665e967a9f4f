use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::location::LocationKey;
use wxhub_core::ConfigError;

/// Category of weather information a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Current,
    Forecast,
    Hourly,
    Alerts,
    /// Forecaster's discussion text (enrichment)
    Discussion,
    /// Air quality index (enrichment)
    AirQuality,
}

impl DataKind {
    pub const ALL: [DataKind; 6] = [
        DataKind::Current,
        DataKind::Forecast,
        DataKind::Hourly,
        DataKind::Alerts,
        DataKind::Discussion,
        DataKind::AirQuality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Forecast => "forecast",
            Self::Hourly => "hourly",
            Self::Alerts => "alerts",
            Self::Discussion => "discussion",
            Self::AirQuality => "air_quality",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownName {
                field: "data kind",
                value: s.to_string(),
            })
    }
}

/// Upstream weather-data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// US National Weather Service (api.weather.gov)
    Nws,
    OpenMeteo,
    VisualCrossing,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [
        ProviderId::Nws,
        ProviderId::OpenMeteo,
        ProviderId::VisualCrossing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nws => "nws",
            Self::OpenMeteo => "openmeteo",
            Self::VisualCrossing => "visualcrossing",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|provider| provider.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownName {
                field: "provider",
                value: s.to_string(),
            })
    }
}

/// Key shared by the request cache and the in-flight tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub location: LocationKey,
    pub kind: DataKind,
}

impl CacheKey {
    pub fn new(location: LocationKey, kind: DataKind) -> Self {
        Self { location, kind }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.location)
    }
}

/// Weather condition categories mapped from WMO codes or provider text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    #[default]
    Clear,
    PartlyCloudy,
    Cloudy,
    Fog,
    Drizzle,
    Rain,
    HeavyRain,
    Snow,
    Sleet,
    Thunderstorm,
}

impl WeatherCondition {
    /// Convert WMO weather code to WeatherCondition
    /// See: https://open-meteo.com/en/docs#weathervariables
    pub fn from_wmo_code(code: i32) -> Self {
        match code {
            0 => Self::Clear,
            1..=2 => Self::PartlyCloudy,
            3 => Self::Cloudy,
            45 | 48 => Self::Fog,
            51 | 53 | 55 => Self::Drizzle,
            56 | 57 => Self::Sleet, // Freezing drizzle
            61 | 63 | 80 => Self::Rain,
            65 | 81 | 82 => Self::HeavyRain,
            66 | 67 => Self::Sleet, // Freezing rain
            71 | 73 | 75 | 77 | 85 | 86 => Self::Snow,
            95 | 96 | 99 => Self::Thunderstorm,
            _ => Self::Clear, // Unknown codes default to clear
        }
    }

    /// Classify a free-text summary such as "Chance Showers And Thunderstorms"
    /// or "Partially cloudy". Most severe match wins.
    pub fn from_text(text: &str) -> Self {
        let text = text.to_lowercase();
        let has = |needle: &str| text.contains(needle);

        if has("thunder") || has("t-storm") {
            Self::Thunderstorm
        } else if has("sleet") || has("freezing") || has("ice") {
            Self::Sleet
        } else if has("snow") || has("flurr") || has("blizzard") {
            Self::Snow
        } else if has("heavy rain") {
            Self::HeavyRain
        } else if has("drizzle") {
            Self::Drizzle
        } else if has("rain") || has("shower") {
            Self::Rain
        } else if has("fog") || has("haze") || has("mist") {
            Self::Fog
        } else if has("partly") || has("partially") || has("mostly sunny") || has("mostly clear")
        {
            Self::PartlyCloudy
        } else if has("cloud") || has("overcast") {
            Self::Cloudy
        } else {
            Self::Clear
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::PartlyCloudy => "Partly Cloudy",
            Self::Cloudy => "Cloudy",
            Self::Fog => "Fog",
            Self::Drizzle => "Drizzle",
            Self::Rain => "Rain",
            Self::HeavyRain => "Heavy Rain",
            Self::Snow => "Snow",
            Self::Sleet => "Sleet",
            Self::Thunderstorm => "Thunderstorm",
        }
    }
}

/// Current weather conditions. Temperatures in °C, wind in km/h.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeather {
    pub temperature: f64,
    pub feels_like: Option<f64>,
    pub humidity: Option<u8>,
    pub wind_speed: Option<f64>,
    pub condition: WeatherCondition,
    pub summary: String,
    pub observed_at: DateTime<Utc>,
}

/// Hourly forecast entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    pub time: DateTime<Utc>,
    pub temperature: f64,
    pub condition: WeatherCondition,
    pub precipitation_chance: Option<u8>,
}

/// Daily forecast entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayForecast {
    pub date: NaiveDate,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub condition: WeatherCondition,
    pub summary: String,
    pub precipitation_chance: Option<u8>,
    pub sunrise: Option<NaiveTime>,
    pub sunset: Option<NaiveTime>,
}

/// Active weather alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherAlert {
    pub id: String,
    pub event: String,
    pub headline: Option<String>,
    pub severity: Option<String>,
    pub description: String,
    pub expires: Option<DateTime<Utc>>,
}

/// Forecaster's discussion product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDiscussion {
    pub office: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub text: String,
}

/// Air quality snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQuality {
    pub us_aqi: Option<u16>,
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// Normalized payload for one data kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum WeatherPayload {
    Current(CurrentWeather),
    Forecast(Vec<DayForecast>),
    Hourly(Vec<HourlyForecast>),
    Alerts(Vec<WeatherAlert>),
    Discussion(ForecastDiscussion),
    AirQuality(AirQuality),
}

impl WeatherPayload {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Current(_) => DataKind::Current,
            Self::Forecast(_) => DataKind::Forecast,
            Self::Hourly(_) => DataKind::Hourly,
            Self::Alerts(_) => DataKind::Alerts,
            Self::Discussion(_) => DataKind::Discussion,
            Self::AirQuality(_) => DataKind::AirQuality,
        }
    }
}

/// Fahrenheit to Celsius, rounded to one decimal.
pub(crate) fn fahrenheit_to_celsius(value: f64) -> f64 {
    ((value - 32.0) * 5.0 / 9.0 * 10.0).round() / 10.0
}

/// Clamp a 0–100 percentage reported as a float.
pub(crate) fn percent(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}
