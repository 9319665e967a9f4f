//! Locations and their cache identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal places kept when deriving a location's identity.
pub const COORDINATE_PRECISION: i32 = 4;

const COORDINATE_SCALE: f64 = 10_000.0;

/// Geographic location requested by a caller.
///
/// The name is for display only; cache and in-flight identity come from the
/// rounded coordinates (see [`Location::key`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
        }
    }

    /// Identity used for caching and request deduplication.
    pub fn key(&self) -> LocationKey {
        LocationKey::from_coordinates(self.latitude, self.longitude)
    }

    /// Rough coverage test for the US National Weather Service: the
    /// contiguous states, Alaska, Hawaii and Puerto Rico.
    pub fn is_within_us(&self) -> bool {
        const REGIONS: [(f64, f64, f64, f64); 4] = [
            // (min_lat, max_lat, min_lon, max_lon)
            (24.3, 49.5, -125.0, -66.8),
            (51.0, 71.6, -180.0, -129.9),
            (18.8, 22.4, -160.4, -154.7),
            (17.8, 18.6, -67.4, -65.1),
        ];
        REGIONS.iter().any(|(min_lat, max_lat, min_lon, max_lon)| {
            (*min_lat..=*max_lat).contains(&self.latitude)
                && (*min_lon..=*max_lon).contains(&self.longitude)
        })
    }

    /// `lat,lon` with the identity precision, as used in provider URLs.
    pub fn coordinate_pair(&self) -> String {
        format!("{:.4},{:.4}", self.latitude, self.longitude)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.key())
    }
}

/// Coordinates rounded to [`COORDINATE_PRECISION`] decimal places, stored as
/// scaled integers so they can be hashed and compared exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationKey {
    pub latitude_e4: i64,
    pub longitude_e4: i64,
}

impl LocationKey {
    pub fn from_coordinates(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude_e4: scale(latitude),
            longitude_e4: scale(longitude),
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude_e4 as f64 / COORDINATE_SCALE
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_e4 as f64 / COORDINATE_SCALE
    }
}

fn scale(value: f64) -> i64 {
    (value * COORDINATE_SCALE).round() as i64
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4},{:.4}", self.latitude(), self.longitude())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_does_not_affect_identity() {
        let a = Location::new("Philadelphia, PA", 39.9526, -75.1652);
        let b = Location::new("philly", 39.9526, -75.1652);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_rounding_merges_nearby_coordinates() {
        let a = Location::new("a", 40.000_01, -75.000_04);
        let b = Location::new("b", 40.0, -75.0);
        assert_eq!(a.key(), b.key());

        let c = Location::new("c", 40.0001, -75.0);
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_key_display() {
        let key = Location::new("x", 40.0, -75.0).key();
        assert_eq!(key.to_string(), "40.0000,-75.0000");
    }

    #[test]
    fn test_us_coverage() {
        assert!(Location::new("Philadelphia", 39.95, -75.16).is_within_us());
        assert!(Location::new("Anchorage", 61.22, -149.9).is_within_us());
        assert!(Location::new("Honolulu", 21.31, -157.86).is_within_us());
        assert!(!Location::new("London", 51.5, -0.12).is_within_us());
        assert!(!Location::new("Sydney", -33.87, 151.21).is_within_us());
    }
}
