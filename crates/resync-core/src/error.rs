use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents all possible errors that can occur while replicating
/// listing data. It uses the `thiserror` crate for ergonomic error handling and
/// automatic conversion from underlying library errors.
///
/// # Error Conversion
///
/// Most errors automatically convert from their source types using the `#[from]` attribute:
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
/// - `std::io::Error` → `AppError::IoError`
///
/// # Examples
///
/// ```no_run
/// use resync_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::Config("source 'abor' has no destinations".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// This error wraps all errors from SQLx database operations, including
    /// connection failures, query errors, and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// HTTP client request failed.
    ///
    /// This error occurs when an upstream request fails with a non-retryable
    /// status or the response body cannot be decoded.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Reading or writing a batch file failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// URL parsing failed.
    ///
    /// This error occurs when an endpoint template or a server-issued next link
    /// does not produce a valid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid or inconsistent configuration.
    ///
    /// Raised at startup for malformed index definitions, unknown adapter tags,
    /// missing credentials and bad cron expressions. A source with a
    /// configuration error never gets scheduled.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An upstream metadata type could not be mapped to a destination column.
    ///
    /// Fatal for the structure sync of that resource: proceeding would leave the
    /// destination schema out of step with the upstream metadata.
    #[error("Cannot map field {resource}.{field}: unknown type {type_name}")]
    SchemaMapping {
        resource: String,
        field: String,
        type_name: String,
    },

    /// Metadata document could not be parsed.
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// A destination adapter rejected an operation.
    #[error("Destination '{destination}' error: {message}")]
    Destination {
        destination: String,
        message: String,
    },

    /// The isolated reconcile diff task failed or panicked.
    #[error("Reconcile diff failed: {0}")]
    DiffTask(String),

    /// The cron scheduler could not be built or started.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// API response contained no data.
    #[error("Empty response from API")]
    EmptyResponse,

    /// Network or connection error.
    ///
    /// This error occurs when a network request fails due to connectivity issues,
    /// DNS resolution failures, or the remote server being unreachable.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Generic application error for cases not covered by specific variants.
    ///
    /// Use this sparingly - prefer creating specific error variants
    /// for better error handling and debugging.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Shorthand for a destination failure.
    pub fn destination(destination: &str, message: impl Into<String>) -> Self {
        AppError::Destination {
            destination: destination.to_string(),
            message: message.into(),
        }
    }

    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to the destination database. Is PostgreSQL running?\n   Check the connection string in the destination config.".to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::ClientError(msg) => {
                if msg.contains("401") || msg.contains("403") {
                    format!(
                        "The MLS rejected our credentials: {}\n   Check the access token environment variable for this source.",
                        msg
                    )
                } else {
                    format!("API error: {}", msg)
                }
            }
            AppError::Config(msg) => {
                format!("Configuration error: {}\n   Fix sources.toml and run `resync check`.", msg)
            }
            AppError::SchemaMapping { .. } => {
                format!(
                    "{}\n   Add a platform data adapter override or exclude the field.",
                    self
                )
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!("Request timed out after {} seconds.\n   The MLS may be overloaded. The next scheduled run will retry.", secs)
            }
            AppError::RateLimitExceeded => {
                "The MLS is rate limiting us. The next scheduled run will retry.".to_string()
            }
            AppError::EmptyResponse => {
                "The API returned no data. The MLS may be temporarily unavailable.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use resync_core::error::AppError;
    ///
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::Config("two primary keys".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ClientError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = AppError::Config("Expected exactly 1 key, got 0 ()".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Expected exactly 1 key, got 0 ()"
        );
    }

    #[test]
    fn test_schema_mapping_display() {
        let err = AppError::SchemaMapping {
            resource: "Property".to_string(),
            field: "Location".to_string(),
            type_name: "Edm.Stream".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot map field Property.Location: unknown type Edm.Stream"
        );
        assert!(err.user_message().contains("platform data adapter"));
    }

    #[test]
    fn test_destination_helper() {
        let err = AppError::destination("pg1", "table missing");
        assert_eq!(err.to_string(), "Destination 'pg1' error: table missing");
    }

    #[test]
    fn test_error_from_serde() {
        let result: Result<serde_json::Value, _> = serde_json::from_str("{ invalid json }");
        let app_err: AppError = result.unwrap_err().into();
        assert!(matches!(app_err, AppError::SerializationError(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let app_err: AppError = io.into();
        assert!(matches!(app_err, AppError::IoError(_)));
    }

    #[test]
    fn test_user_message_credentials() {
        let err = AppError::ClientError("HTTP 401 from https://mls.example".to_string());
        assert!(err.user_message().contains("credentials"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(AppError::NetworkError("timeout".to_string()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(!AppError::DiffTask("panicked".to_string()).is_retryable());
        assert!(!AppError::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_error() {
        let err = AppError::Timeout(30);
        assert_eq!(err.to_string(), "Request timed out after 30 seconds");
    }
}
