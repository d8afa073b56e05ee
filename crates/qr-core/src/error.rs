//! Failures raised by model and search backends.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The remote API answered with a non-success status.
    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("malformed payload: {0}")]
    Serialization(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("unknown model '{0}'")]
    ModelNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

macro_rules! constructors {
    ($($fn_name:ident => $variant:ident),* $(,)?) => {
        $(
            pub fn $fn_name(message: impl Into<String>) -> Self {
                Self::$variant(message.into())
            }
        )*
    };
}

impl Error {
    constructors! {
        auth => Auth,
        rate_limit => RateLimit,
        network => Network,
        serialization => Serialization,
        search => Search,
        timeout => Timeout,
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify an unsuccessful HTTP status with the backend's message.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::auth(message),
            429 => Self::rate_limit(message),
            _ => Self::api(status, message),
        }
    }

    /// Transient failures a caller could reasonably try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimit(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(Error::from_status(401, "nope").is_auth_error());
        assert!(Error::from_status(403, "nope").is_auth_error());
        assert!(matches!(Error::from_status(429, "slow"), Error::RateLimit(_)));
        assert!(matches!(
            Error::from_status(400, "bad"),
            Error::Api { status: 400, .. }
        ));
        assert_eq!(Error::from_status(503, "down").to_string(), "down (HTTP 503)");
    }

    #[test]
    fn test_retryable_failures() {
        assert!(Error::network("connection reset").is_retryable());
        assert!(Error::timeout("model call").is_retryable());
        assert!(Error::api(502, "bad gateway").is_retryable());
        assert!(!Error::api(400, "bad request").is_retryable());
        assert!(!Error::search("quota exhausted").is_retryable());
        assert!(!Error::ModelNotFound("gpt-9".into()).is_retryable());
    }
}
