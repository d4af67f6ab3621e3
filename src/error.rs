//! Unified error handling for run tracking and sync.
//!
//! Errors are split into two families:
//! - [`LocalError`]: failures of the on-device store (e.g. disk full)
//! - [`NetworkError`]: failures talking to the remote run service
//!
//! Background jobs never surface these to a caller; they are resolved into a
//! [`Disposition`] instead (see [`DataError::disposition`]).

use thiserror::Error;

/// Failures of the remote run service or the transport in front of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum NetworkError {
    #[error("request timed out")]
    RequestTimeout,
    #[error("unauthorized")]
    Unauthorized,
    #[error("conflict")]
    Conflict,
    #[error("too many requests")]
    TooManyRequests,
    #[error("no internet connection")]
    NoInternet,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("server error")]
    ServerError,
    #[error("serialization error")]
    Serialization,
    #[error("unknown network error")]
    Unknown,
}

impl NetworkError {
    /// Map a non-success HTTP status code onto a network error.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => NetworkError::Unauthorized,
            408 => NetworkError::RequestTimeout,
            409 => NetworkError::Conflict,
            413 => NetworkError::PayloadTooLarge,
            429 => NetworkError::TooManyRequests,
            500..=599 => NetworkError::ServerError,
            _ => NetworkError::Unknown,
        }
    }

    /// Whether the server may have applied the request despite the error.
    /// Connection failures and explicit rejections never land; a timeout,
    /// a 5xx or a conflict can mean the write already happened.
    pub fn may_have_landed(&self) -> bool {
        matches!(
            self,
            NetworkError::RequestTimeout
                | NetworkError::Conflict
                | NetworkError::ServerError
                | NetworkError::Unknown
        )
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::RequestTimeout
        } else if err.is_connect() {
            NetworkError::NoInternet
        } else if err.is_decode() {
            NetworkError::Serialization
        } else if let Some(status) = err.status() {
            NetworkError::from_status(status.as_u16())
        } else {
            NetworkError::Unknown
        }
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(_: serde_json::Error) -> Self {
        NetworkError::Serialization
    }
}

/// Failures of the local store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalError {
    #[error("disk full")]
    DiskFull,
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl LocalError {
    pub fn storage(message: impl Into<String>) -> Self {
        LocalError::Storage {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for LocalError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
                LocalError::DiskFull
            }
            _ => LocalError::storage(err.to_string()),
        }
    }
}

impl From<rusqlite_migration::Error> for LocalError {
    fn from(err: rusqlite_migration::Error) -> Self {
        LocalError::storage(format!("migration failed: {}", err))
    }
}

impl From<serde_json::Error> for LocalError {
    fn from(err: serde_json::Error) -> Self {
        LocalError::storage(format!("snapshot encoding failed: {}", err))
    }
}

/// Any failure surfaced by the data layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("local error: {0}")]
    Local(#[from] LocalError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

impl From<rusqlite::Error> for DataError {
    fn from(err: rusqlite::Error) -> Self {
        DataError::Local(err.into())
    }
}

/// What a background job does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Try again later, subject to the attempt ceiling.
    Retry,
    /// Give up; the pending record stays for later reconciliation.
    Fail,
}

impl DataError {
    /// Classify an error into retry or give-up.
    pub fn disposition(&self) -> Disposition {
        match self {
            DataError::Local(LocalError::DiskFull) => Disposition::Fail,
            DataError::Local(LocalError::Storage { .. }) => Disposition::Fail,
            DataError::Network(NetworkError::RequestTimeout) => Disposition::Retry,
            DataError::Network(NetworkError::Unauthorized) => Disposition::Retry,
            DataError::Network(NetworkError::Conflict) => Disposition::Retry,
            DataError::Network(NetworkError::TooManyRequests) => Disposition::Retry,
            DataError::Network(NetworkError::NoInternet) => Disposition::Retry,
            DataError::Network(NetworkError::PayloadTooLarge) => Disposition::Fail,
            DataError::Network(NetworkError::ServerError) => Disposition::Retry,
            DataError::Network(NetworkError::Serialization) => Disposition::Fail,
            DataError::Network(NetworkError::Unknown) => Disposition::Fail,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type alias for data-layer operations.
pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataError::Network(NetworkError::NoInternet);
        assert!(err.to_string().contains("no internet"));

        let err = DataError::Local(LocalError::storage("table missing"));
        assert!(err.to_string().contains("table missing"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(NetworkError::from_status(401), NetworkError::Unauthorized);
        assert_eq!(NetworkError::from_status(408), NetworkError::RequestTimeout);
        assert_eq!(NetworkError::from_status(409), NetworkError::Conflict);
        assert_eq!(NetworkError::from_status(413), NetworkError::PayloadTooLarge);
        assert_eq!(NetworkError::from_status(429), NetworkError::TooManyRequests);
        assert_eq!(NetworkError::from_status(503), NetworkError::ServerError);
        assert_eq!(NetworkError::from_status(404), NetworkError::Unknown);
    }

    #[test]
    fn test_may_have_landed() {
        assert!(NetworkError::RequestTimeout.may_have_landed());
        assert!(NetworkError::ServerError.may_have_landed());
        assert!(NetworkError::Conflict.may_have_landed());
        assert!(!NetworkError::NoInternet.may_have_landed());
        assert!(!NetworkError::PayloadTooLarge.may_have_landed());
        assert!(!NetworkError::Unauthorized.may_have_landed());
    }

    #[test]
    fn test_disposition_table() {
        let retry = [
            NetworkError::RequestTimeout,
            NetworkError::Unauthorized,
            NetworkError::Conflict,
            NetworkError::TooManyRequests,
            NetworkError::NoInternet,
            NetworkError::ServerError,
        ];
        for e in retry {
            assert_eq!(DataError::from(e).disposition(), Disposition::Retry, "{e:?}");
        }

        let fail = [
            NetworkError::PayloadTooLarge,
            NetworkError::Serialization,
            NetworkError::Unknown,
        ];
        for e in fail {
            assert_eq!(DataError::from(e).disposition(), Disposition::Fail, "{e:?}");
        }

        assert_eq!(
            DataError::Local(LocalError::DiskFull).disposition(),
            Disposition::Fail
        );
    }

    #[test]
    fn test_disk_full_from_sqlite() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        assert_eq!(LocalError::from(err), LocalError::DiskFull);
    }
}
