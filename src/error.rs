//! error.rs - Error types for sources, snapshots and configuration

use std::time::Duration;
use thiserror::Error;

/// Classified failure returned by a price source
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Required credentials or settings are missing
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Provider rejected the credentials
    #[error("authentication rejected ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("access forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// 5xx responses and transport failures
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Timeouts and malformed payloads
    #[error("transient error: {0}")]
    Transient(String),
}

impl SourceError {
    pub fn auth(message: impl Into<String>) -> Self {
        SourceError::Auth {
            status: 401,
            message: message.into(),
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        SourceError::RateLimited {
            retry_after,
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        SourceError::Server {
            status,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SourceError::Transient(message.into())
    }

    /// Map a non-success HTTP status into the taxonomy
    pub fn from_status(status: u16, retry_after: Option<Duration>, context: &str) -> Self {
        let message = format!("{} returned status {}", context, status);
        match status {
            401 => SourceError::Auth { status, message },
            403 => SourceError::Forbidden(message),
            429 => SourceError::RateLimited {
                retry_after,
                message,
            },
            500..=599 => SourceError::Server { status, message },
            _ => SourceError::Transient(message),
        }
    }

    /// HTTP-like status code carried by the error
    pub fn status(&self) -> u16 {
        match self {
            SourceError::Configuration(_) => 0,
            SourceError::Auth { status, .. } => *status,
            SourceError::Forbidden(_) => 403,
            SourceError::RateLimited { .. } => 429,
            SourceError::Server { status, .. } => *status,
            SourceError::Transient(_) => 408,
        }
    }

    /// Label persisted as the source's last status
    pub fn label(&self) -> &'static str {
        match self {
            SourceError::Configuration(_) => "config",
            SourceError::Auth { .. } => "auth",
            SourceError::Forbidden(_) => "forbidden",
            SourceError::RateLimited { .. } => "rate_limited",
            SourceError::Server { .. } => "server_error",
            SourceError::Transient(_) => "transient",
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_decode() {
            SourceError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            SourceError::from_status(status.as_u16(), None, "provider")
        } else {
            SourceError::Server {
                status: 502,
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Transient(format!("malformed payload: {}", err))
    }
}

/// Failure reading or writing the snapshot file
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Malformed configuration value
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("invalid JSON in {name}: {source}")]
    InvalidJson {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            SourceError::from_status(401, None, "x"),
            SourceError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            SourceError::from_status(403, None, "x"),
            SourceError::Forbidden(_)
        ));
        assert!(matches!(
            SourceError::from_status(503, None, "x"),
            SourceError::Server { status: 503, .. }
        ));
        assert!(matches!(
            SourceError::from_status(404, None, "x"),
            SourceError::Transient(_)
        ));

        let limited = SourceError::from_status(429, Some(Duration::from_secs(120)), "x");
        assert_eq!(
            limited,
            SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
                message: "x returned status 429".to_string(),
            }
        );
        assert_eq!(limited.status(), 429);
        assert_eq!(limited.label(), "rate_limited");
    }
}
