//! Provider abstraction and the HTTP plumbing shared by implementations.

use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde::de::DeserializeOwned;

use crate::error::{ProviderError, ProviderResult};
use crate::location::Location;
use crate::pool::ConnectionPoolManager;
use crate::types::{DataKind, ProviderId, WeatherPayload};

/// Upper bound on error body text kept in `BadRequest` messages.
const ERROR_BODY_LIMIT: usize = 200;

/// A single upstream weather service.
///
/// Implementations perform one logical fetch per call: no retries and no
/// caching. Both are layered on by the orchestrator.
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Whether this provider can serve `kind` for `location` at all.
    /// Unsupported combinations are skipped without a network call.
    fn supports(&self, kind: DataKind, location: &Location) -> bool;

    fn fetch<'a>(
        &'a self,
        kind: DataKind,
        location: &'a Location,
    ) -> BoxFuture<'a, ProviderResult<WeatherPayload>>;
}

/// GET `url` through the shared pool and decode the JSON body.
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    pool: &ConnectionPoolManager,
    url: &str,
    query: &[(&str, String)],
    accept: &str,
) -> Result<T, ProviderError> {
    let client = pool
        .acquire()
        .await
        .map_err(|e| ProviderError::Connection(e.to_string()))?;

    let response = client
        .get(url)
        .query(query)
        .header(ACCEPT, accept)
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(&e))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        let mut text = response.text().await.unwrap_or_default();
        text.truncate(floor_char_boundary(&text, ERROR_BODY_LIMIT));
        return Err(ProviderError::from_status(status, retry_after, text));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| ProviderError::from_reqwest(&e))?;

    serde_json::from_slice(&body).map_err(|e| ProviderError::UpstreamFormat(e.to_string()))
}

fn floor_char_boundary(text: &str, limit: usize) -> usize {
    if text.len() <= limit {
        return text.len();
    }
    (0..=limit)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

/// Require a field the normalized payload cannot do without.
pub(crate) fn required<T>(value: Option<T>, field: &str) -> Result<T, ProviderError> {
    value.ok_or_else(|| ProviderError::UpstreamFormat(format!("missing field `{}`", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let text = "ab°cd";
        // '°' spans bytes 2..4
        assert_eq!(floor_char_boundary(text, 3), 2);
        assert_eq!(floor_char_boundary(text, 100), text.len());
    }

    #[test]
    fn test_required_reports_field() {
        let err = required::<u8>(None, "properties.forecast").unwrap_err();
        assert_eq!(
            err,
            ProviderError::UpstreamFormat("missing field `properties.forecast`".into())
        );
    }
}
