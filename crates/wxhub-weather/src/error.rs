//! Provider and orchestrator error types.

use reqwest::StatusCode;
use thiserror::Error;

use crate::location::LocationKey;
use crate::types::{DataKind, ProviderId};
use wxhub_core::ConfigError;

/// Failure of a single upstream call, as reported by a provider client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited by upstream")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("upstream server error: HTTP {status}")]
    Server { status: u16 },

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("request rejected: HTTP {status}: {message}")]
    BadRequest { status: u16, message: String },

    #[error("unexpected upstream payload: {0}")]
    UpstreamFormat(String),

    #[error("{provider} does not provide {kind} here")]
    Unsupported { provider: ProviderId, kind: DataKind },
}

impl ProviderError {
    /// Whether another attempt against the same provider may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }

    /// Map a transport error from reqwest.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::UpstreamFormat(error.to_string())
        } else if let Some(status) = error.status() {
            Self::from_status(status, None, error.to_string())
        } else {
            Self::Connection(error.to_string())
        }
    }

    /// Map a non-success HTTP status.
    pub fn from_status(status: StatusCode, retry_after_secs: Option<u64>, message: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited { retry_after_secs }
        } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            Self::Server {
                status: status.as_u16(),
            }
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Self::InvalidCredentials
        } else {
            Self::BadRequest {
                status: status.as_u16(),
                message,
            }
        }
    }
}

/// Outcome of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResult<T> {
    Success(T),
    /// Eligible for retry and fallback
    TransientFailure(ProviderError),
    /// Not retried; the orchestrator moves on to the next provider
    PermanentFailure(ProviderError),
}

impl<T> ProviderResult<T> {
    /// Wrap an error in the variant its classification calls for.
    pub fn failure(error: ProviderError) -> Self {
        if error.is_transient() {
            Self::TransientFailure(error)
        } else {
            Self::PermanentFailure(error)
        }
    }

    pub fn from_result(result: Result<T, ProviderError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::failure(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn error(&self) -> Option<&ProviderError> {
        match self {
            Self::Success(_) => None,
            Self::TransientFailure(e) | Self::PermanentFailure(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<T, ProviderError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::TransientFailure(e) | Self::PermanentFailure(e) => Err(e),
        }
    }
}

/// One failed provider in a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttempt {
    pub provider: ProviderId,
    pub error: ProviderError,
}

/// Errors surfaced by the orchestrator and its components.
#[derive(Debug, Clone, Error)]
pub enum WeatherError {
    #[error("all providers exhausted for {kind} at {location} ({} failed)", attempts.len())]
    AllProvidersExhausted {
        kind: DataKind,
        location: LocationKey,
        attempts: Vec<ProviderAttempt>,
    },

    /// A cached payload is present but unreadable; treated as a miss.
    #[error("cache entry unreadable: {0}")]
    CacheCorruption(String),

    #[error("cancelled by caller")]
    Cancelled,

    #[error("fetch task aborted: {0}")]
    TaskAborted(String),

    #[error("HTTP transport unavailable: {0}")]
    Transport(String),

    #[error("cache persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WeatherError {
    /// Returns a user-friendly message suitable for display in the UI.
    pub fn user_message(&self) -> &'static str {
        match self {
            WeatherError::AllProvidersExhausted { attempts, .. }
                if attempts
                    .iter()
                    .any(|a| a.error == ProviderError::InvalidCredentials) =>
            {
                "Weather data unavailable. A provider API key was rejected; check settings."
            }
            WeatherError::AllProvidersExhausted { .. } => {
                "Weather data is unavailable right now. Please try again later."
            }
            WeatherError::CacheCorruption(_) => "Saved weather data could not be read.",
            WeatherError::Cancelled => "The request was cancelled.",
            WeatherError::TaskAborted(_) => "Something went wrong while fetching weather.",
            WeatherError::Transport(_) => "Unable to connect. Check your internet connection.",
            WeatherError::Persistence(_) => "Weather data could not be saved for offline use.",
            WeatherError::Config(e) => e.user_message(),
        }
    }

    /// Provider attempts behind an exhaustion error.
    pub fn attempts(&self) -> &[ProviderAttempt] {
        match self {
            WeatherError::AllProvidersExhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}
