//! Error types and result definitions for relay operations.
//!
//! [`RelayError`] carries a classification, a static description, optional dynamic detail, the
//! originating error and the callsite where it was created. Several errors can be aggregated into
//! one, which is how the orchestrator reports failures of multiple workers at once.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use crate::types::LsnError;

/// Convenient result type for relay operations using [`RelayError`] as the error type.
pub type RelayResult<T> = Result<T, RelayError>;

/// Detailed payload stored for single [`RelayError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for relay operations.
#[derive(Debug, Clone)]
pub struct RelayError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors, mainly produced when several workers fail.
    Many {
        errors: Vec<RelayError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors that can occur while capturing and delivering changes.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Source Errors
    SourceConnectionFailed,
    SourceQueryFailed,
    SourceSchemaError,
    TrackingNotEnabled,

    // Store Errors
    StoreConnectionFailed,
    StoreQueryFailed,

    // Receiver Errors
    ReceiverConnectionFailed,
    ReceiverTimeout,
    DeliveryFailed,

    // Processing Errors
    FilterError,
    TransformError,

    // Data & Mapping Errors
    ConversionError,
    InvalidData,

    // Configuration Errors
    ConfigError,

    // IO & Serialization Errors
    IoError,
    DeserializationError,

    // State & Workflow Errors
    InvalidState,
    SourceWorkerPanic,
    ReceiverWorkerPanic,
    CleanupWorkerPanic,

    Unknown,
}

impl RelayError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// when the aggregate is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the static description of this error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "Multiple errors occurred",
        }
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the aggregated errors, if this error is an aggregate.
    pub fn errors(&self) -> Option<&[RelayError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors),
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Renders the error as a single line, suitable for persisting as a delivery error.
    ///
    /// Unlike [`fmt::Display`], the rendering contains neither the callsite nor the backtrace.
    pub fn message(&self) -> String {
        match self.repr {
            ErrorRepr::Single(ref payload) => match payload.detail {
                Some(ref detail) => format!("{}: {}", payload.description, detail),
                None => payload.description.to_string(),
            },
            ErrorRepr::Many { ref errors, .. } => errors
                .iter()
                .map(|err| err.message())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward their first error as the source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        RelayError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    #[track_caller]
    fn from_source<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        RelayError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl PartialEq for RelayError {
    fn eq(&self, other: &RelayError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl Hash for RelayError {
    /// Hashes only the kind and static description so that occurrences of the same failure group
    /// together regardless of dynamic detail or callsite.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_indented(f, "Detail", detail)?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    match lines.next() {
                        Some(first_line) => write!(f, "\n  {}. {}", index + 1, first_line)?,
                        None => write!(f, "\n  {}.", index + 1)?,
                    }

                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, title: &str, text: &str) -> fmt::Result {
    write!(f, "\n  {title}:")?;
    for line in text.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for RelayError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for RelayError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> RelayError {
        RelayError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for RelayError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> RelayError {
        RelayError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

impl<E> From<Vec<E>> for RelayError
where
    E: Into<RelayError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> RelayError {
        let location = Location::caller();

        let mut errors: Vec<RelayError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        RelayError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for RelayError {
    #[track_caller]
    fn from(err: std::io::Error) -> RelayError {
        RelayError::from_source(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for RelayError {
    #[track_caller]
    fn from(err: serde_json::Error) -> RelayError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        RelayError::from_source(kind, description, err)
    }
}

impl From<std::num::ParseIntError> for RelayError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> RelayError {
        RelayError::from_source(ErrorKind::ConversionError, "Integer parsing failed", err)
    }
}

impl From<chrono::ParseError> for RelayError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> RelayError {
        RelayError::from_source(ErrorKind::ConversionError, "Datetime parsing failed", err)
    }
}

impl From<uuid::Error> for RelayError {
    #[track_caller]
    fn from(err: uuid::Error) -> RelayError {
        RelayError::from_source(ErrorKind::InvalidData, "UUID parsing failed", err)
    }
}

impl From<LsnError> for RelayError {
    #[track_caller]
    fn from(err: LsnError) -> RelayError {
        RelayError::from_source(ErrorKind::InvalidData, "Invalid log sequence number", err)
    }
}

impl From<num_bigint::ParseBigIntError> for RelayError {
    #[track_caller]
    fn from(err: num_bigint::ParseBigIntError) -> RelayError {
        RelayError::from_source(ErrorKind::ConversionError, "Big integer parsing failed", err)
    }
}

impl From<sqlx::Error> for RelayError {
    #[track_caller]
    fn from(err: sqlx::Error) -> RelayError {
        let kind = match &err {
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => {
                ErrorKind::StoreConnectionFailed
            }
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
                ErrorKind::DeserializationError
            }
            _ => ErrorKind::StoreQueryFailed,
        };

        RelayError::from_source(kind, "Store operation failed", err)
    }
}

impl From<sqlx::migrate::MigrateError> for RelayError {
    #[track_caller]
    fn from(err: sqlx::migrate::MigrateError) -> RelayError {
        RelayError::from_source(ErrorKind::StoreQueryFailed, "Store migration failed", err)
    }
}

impl From<tiberius::error::Error> for RelayError {
    #[track_caller]
    fn from(err: tiberius::error::Error) -> RelayError {
        use tiberius::error::Error as TdsError;

        let (kind, description) = match &err {
            TdsError::Io { .. } | TdsError::Tls(_) | TdsError::Routing { .. } => (
                ErrorKind::SourceConnectionFailed,
                "SQL Server connection failed",
            ),
            TdsError::Server(token) => match token.code() {
                // Login failures and permission denials.
                18456 | 229 | 230 => (
                    ErrorKind::SourceConnectionFailed,
                    "SQL Server authentication failed",
                ),
                // Invalid object/column names and missing capture functions.
                208 | 207 | 313 | 22859 => {
                    (ErrorKind::SourceSchemaError, "SQL Server object not found")
                }
                _ => (ErrorKind::SourceQueryFailed, "SQL Server query failed"),
            },
            TdsError::Conversion(_) | TdsError::Utf8 | TdsError::Utf16 | TdsError::ParseInt(_) => {
                (ErrorKind::ConversionError, "SQL Server value conversion failed")
            }
            _ => (ErrorKind::SourceQueryFailed, "SQL Server query failed"),
        };

        RelayError::from_source(kind, description, err)
    }
}

impl From<reqwest::Error> for RelayError {
    #[track_caller]
    fn from(err: reqwest::Error) -> RelayError {
        let (kind, description) = if err.is_timeout() {
            (ErrorKind::ReceiverTimeout, "Receiver request timed out")
        } else if err.is_connect() {
            (
                ErrorKind::ReceiverConnectionFailed,
                "Receiver connection failed",
            )
        } else if err.is_builder() {
            (ErrorKind::ConfigError, "Receiver request is invalid")
        } else {
            (ErrorKind::DeliveryFailed, "Receiver request failed")
        };

        RelayError::from_source(kind, description, err)
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    #[track_caller]
    fn from(err: tokio::time::error::Elapsed) -> RelayError {
        RelayError::from_source(ErrorKind::ReceiverTimeout, "Operation timed out", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, relay_error};

    fn failing(flag: bool) -> RelayResult<u32> {
        if flag {
            bail!(ErrorKind::InvalidData, "Unknown change operation", "code 7");
        }

        Ok(1)
    }

    #[test]
    fn single_error_exposes_kind_and_detail() {
        let err = relay_error!(ErrorKind::ConfigError, "Unknown component", "receiver 'Foo'");

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert_eq!(err.kinds(), vec![ErrorKind::ConfigError]);
        assert_eq!(err.detail(), Some("receiver 'Foo'"));
        assert!(err.errors().is_none());
        assert_eq!(err.message(), "Unknown component: receiver 'Foo'");
    }

    #[test]
    fn bail_returns_error_early() {
        let err = failing(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(err.description(), "Unknown change operation");
        assert_eq!(failing(false).unwrap(), 1);
    }

    #[test]
    fn vec_of_one_error_is_not_aggregated() {
        let err: RelayError = vec![relay_error!(ErrorKind::IoError, "Disk failed")].into();

        assert!(err.errors().is_none());
        assert_eq!(err.kind(), ErrorKind::IoError);
    }

    #[test]
    fn many_errors_flatten_kinds() {
        let err: RelayError = vec![
            relay_error!(ErrorKind::SourceQueryFailed, "Query failed"),
            relay_error!(ErrorKind::ReceiverWorkerPanic, "Receiver worker panicked"),
        ]
        .into();

        assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::SourceQueryFailed, ErrorKind::ReceiverWorkerPanic]
        );
        assert_eq!(err.errors().map(|errors| errors.len()), Some(2));
        assert_eq!(err.message(), "Query failed; Receiver worker panicked");
    }

    #[test]
    fn source_is_preserved() {
        let io = std::io::Error::other("socket closed");
        let err = RelayError::from(io);

        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(error::Error::source(&err).is_some());
        assert_eq!(err.detail(), Some("socket closed"));
    }

    #[test]
    fn json_errors_are_classified_as_deserialization() {
        let err: RelayError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();

        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }
}
