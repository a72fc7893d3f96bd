//! Error types for the Barman Cloud operator

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Object vanished from the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure (stale resourceVersion or name already taken)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Store or dependency unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The API server refused the request
    #[error("Request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// A store call did not finish within its deadline
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// A store call was aborted by cancellation
    #[error("Store call cancelled")]
    Cancelled,

    /// Deletion is blocked by live Backup or Cluster resources
    #[error("ObjectStore is still referenced by {0}")]
    ReferencedResourceExists(String),

    /// The ObjectStore spec cannot be turned into derivatives
    #[error("Invalid ObjectStore spec: {0}")]
    InvalidSpec(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Secret key not found
    #[error("Secret key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// A reconciliation invariant was violated
    #[error("Invariant violated: {0}")]
    Fatal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How the reconciliation loop reacts to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing left to do
    Gone,
    /// Retry immediately without growing the backoff
    Conflict,
    /// Retry with backoff
    Transient,
    /// Deletion waits on external references
    Blocked,
    /// Persistent until the user fixes the spec or its Secrets
    Configuration,
    /// Programming invariant violated
    Fatal,
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid spec error
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Error::InvalidSpec(msg.into())
    }

    /// Create a fatal invariant error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound(_) => ErrorClass::Gone,
            Error::Conflict(_) => ErrorClass::Conflict,
            Error::Unavailable(_)
            | Error::Rejected { .. }
            | Error::Timeout(_)
            | Error::Cancelled => ErrorClass::Transient,
            Error::ReferencedResourceExists(_) => ErrorClass::Blocked,
            Error::InvalidSpec(_)
            | Error::SecretNotFound(_)
            | Error::SecretKeyNotFound { .. }
            | Error::Config(_) => ErrorClass::Configuration,
            Error::Fatal(_) | Error::Serialization(_) => ErrorClass::Fatal,
        }
    }

    /// Reason recorded on the Ready condition when this error persists
    pub fn reason(&self) -> &'static str {
        match self {
            Error::ReferencedResourceExists(_) => "ReferencedResourceExists",
            Error::InvalidSpec(_) | Error::Config(_) => "InvalidConfiguration",
            Error::SecretNotFound(_) | Error::SecretKeyNotFound { .. } => "CredentialsNotFound",
            Error::Fatal(_) | Error::Serialization(_) => "InternalError",
            _ => "StoreUnavailable",
        }
    }

    /// Label used for the reconciliation error counter
    pub fn metric_label(&self) -> &'static str {
        match self.class() {
            ErrorClass::Gone => "gone",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Transient => "transient",
            ErrorClass::Blocked => "blocked",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Error::NotFound(resp.message),
                409 => Error::Conflict(resp.message),
                429 | 500..=599 => Error::Unavailable(resp.message),
                code => Error::Rejected {
                    code,
                    message: resp.message,
                },
            },
            other => Error::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn kube_status_codes_map_to_store_errors() {
        assert!(matches!(Error::from(api_error(404)), Error::NotFound(_)));
        assert!(matches!(Error::from(api_error(409)), Error::Conflict(_)));
        assert!(matches!(Error::from(api_error(503)), Error::Unavailable(_)));
        assert!(matches!(Error::from(api_error(429)), Error::Unavailable(_)));
        assert!(matches!(
            Error::from(api_error(422)),
            Error::Rejected { code: 422, .. }
        ));
    }

    #[test]
    fn cancellation_is_transient_not_fatal() {
        assert_eq!(Error::Cancelled.class(), ErrorClass::Transient);
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn persistent_errors_carry_status_reasons() {
        assert_eq!(
            Error::invalid_spec("bad").reason(),
            "InvalidConfiguration"
        );
        assert_eq!(
            Error::SecretKeyNotFound {
                secret: "aws".to_string(),
                key: "ID".to_string()
            }
            .reason(),
            "CredentialsNotFound"
        );
        assert_eq!(Error::fatal("boom").reason(), "InternalError");
    }
}
