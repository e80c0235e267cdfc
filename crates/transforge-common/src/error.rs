//! Common error types used throughout transforge.
//!
//! [`Error`] covers every failure the core can surface. Validation and quota
//! failures are caller-fixable and returned synchronously from admission;
//! transform and storage failures are captured by the executor and persisted
//! as a sanitized [`crate::ErrorCode`]; delivery exhaustion is only ever logged.

use std::fmt;

/// A request failed one of the admission checks.
///
/// Every variant carries only caller-supplied data or configured limits, so
/// the message is safe to return to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required field was missing or empty.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The canonical input path lies outside the permitted root.
    #[error("input path escapes the permitted root")]
    PathEscapesRoot,

    /// The input reference does not resolve to an existing file.
    #[error("input not found: {0}")]
    InputNotFound(String),

    /// The input reference resolves to something other than a regular file.
    #[error("input is not a regular file: {0}")]
    NotAFile(String),

    /// The input exceeds the configured size limit.
    #[error("input is {size} bytes, limit is {limit} bytes")]
    InputTooLarge {
        /// Size reported by the metadata probe.
        size: u64,
        /// Configured maximum.
        limit: u64,
    },

    /// A filename contains control characters, separators or is otherwise unsafe.
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    /// A metadata value contains characters that cannot be passed to the transcoder.
    #[error("invalid metadata value for {0}")]
    InvalidMetadata(&'static str),

    /// The webhook URL could not be parsed or uses a forbidden form.
    #[error("invalid webhook url: {0}")]
    InvalidWebhookUrl(String),

    /// The webhook URL resolves to a loopback, private or otherwise internal address.
    #[error("webhook target {0} resolves to a forbidden address")]
    ForbiddenWebhookTarget(String),

    /// A numeric encoding parameter is outside its allowed range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// Name of the parameter.
        field: &'static str,
        /// Supplied value.
        value: u64,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
    },

    /// A combination of parameters is not supported.
    #[error("unsupported parameters: {0}")]
    Unsupported(String),
}

impl ValidationError {
    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::PathEscapesRoot => "path_escapes_root",
            ValidationError::InputNotFound(_) => "input_not_found",
            ValidationError::NotAFile(_) => "not_a_file",
            ValidationError::InputTooLarge { .. } => "input_too_large",
            ValidationError::InvalidFilename(_) => "invalid_filename",
            ValidationError::InvalidMetadata(_) => "invalid_metadata",
            ValidationError::InvalidWebhookUrl(_) => "invalid_webhook_url",
            ValidationError::ForbiddenWebhookTarget(_) => "forbidden_webhook_target",
            ValidationError::OutOfRange { .. } => "out_of_range",
            ValidationError::Unsupported(_) => "unsupported",
        }
    }
}

/// Unified error type for transforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The owner already has the maximum number of active jobs.
    #[error("Quota exceeded: owner {owner} already has {limit} active jobs")]
    QuotaExceeded {
        /// Owner whose quota is exhausted.
        owner: String,
        /// Configured maximum of queued + running jobs.
        limit: u32,
    },

    /// The external transform tool failed.
    #[error("Transform error: {0}")]
    Transform(String),

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Every webhook attempt for a job failed.
    #[error("Webhook delivery for job {job_id} exhausted after {attempts} attempts")]
    DeliveryExhausted {
        /// Job whose notification was abandoned.
        job_id: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The requested entity was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The caller is not authenticated.
    #[error("Unauthorized")]
    Unauthorized,

    /// The caller may not act on the resource.
    #[error("Forbidden")]
    Forbidden,

    /// The request conflicts with the current state of the resource.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The task queue rejected or lost a message.
    #[error("Broker error: {0}")]
    Broker(String),

    /// A database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 422,
            Error::QuotaExceeded { .. } => 429,
            Error::NotFound { .. } => 404,
            Error::Unauthorized => 401,
            Error::Forbidden => 403,
            Error::Conflict(_) => 409,
            Error::Broker(_) => 503,
            Error::Transform(_)
            | Error::Storage(_)
            | Error::DeliveryExhausted { .. }
            | Error::Database(_)
            | Error::Io(_)
            | Error::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(v) => v.code(),
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::Transform(_) => "transform_failed",
            Error::Storage(_) => "storage_error",
            Error::DeliveryExhausted { .. } => "delivery_exhausted",
            Error::NotFound { .. } => "not_found",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden => "forbidden",
            Error::Conflict(_) => "conflict",
            Error::Broker(_) => "queue_unavailable",
            Error::Database(_) | Error::Io(_) | Error::Internal(_) => "internal",
        }
    }

    /// Whether the message may be shown to an API caller as-is.
    ///
    /// Server-side failures carry paths and driver messages, so callers only
    /// ever see their code.
    pub fn is_caller_visible(&self) -> bool {
        self.http_status() < 500 || matches!(self, Error::Broker(_))
    }

    /// Create a new NotFound error.
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create a new Database error.
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new Storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new Transform error.
    pub fn transform<S: Into<String>>(msg: S) -> Self {
        Self::Transform(msg.into())
    }

    /// Create a new Broker error.
    pub fn broker<S: Into<String>>(msg: S) -> Self {
        Self::Broker(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_and_status() {
        let err: Error = ValidationError::InputTooLarge {
            size: 20,
            limit: 10,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Validation error: input is 20 bytes, limit is 10 bytes"
        );
        assert_eq!(err.http_status(), 422);
        assert_eq!(err.code(), "input_too_large");
        assert!(err.is_caller_visible());
    }

    #[test]
    fn test_quota_exceeded() {
        let err = Error::QuotaExceeded {
            owner: "acme".into(),
            limit: 3,
        };
        assert_eq!(err.http_status(), 429);
        assert_eq!(err.code(), "quota_exceeded");
        assert!(err.to_string().contains("acme"));
    }

    #[test]
    fn test_server_errors_are_not_caller_visible() {
        for err in [
            Error::database("disk I/O error at /var/lib/transforge/db.sqlite"),
            Error::storage("permission denied"),
            Error::internal("bug"),
        ] {
            assert_eq!(err.http_status(), 500);
            assert!(!err.is_caller_visible());
        }
        assert!(Error::broker("queue offline").is_caller_visible());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("job", 42);
        assert_eq!(err.to_string(), "job not found: 42");
        assert_eq!(err.http_status(), 404);
    }
}
