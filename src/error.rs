//! Error types for the CoucheStor edge core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification used by callers that map failures onto
/// protocol responses (HTTP status codes, retry decisions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Entry too large, quota exhausted, or a bounded resource is full.
    CapacityExceeded,
    /// A bounded queue rejected new work.
    Backpressure,
    /// An operation did not finish before its deadline.
    Timeout,
    /// Replication gave up after the retry budget was spent.
    ReplicationAbandoned,
    /// The requested object or tenant does not exist.
    NotFound,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ReplicationAbandoned => "replication_abandoned",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the edge core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// Value exceeds the maximum size a single cache entry may hold
    #[error("Entry too large: {size} bytes exceeds limit of {limit} bytes")]
    EntryTooLarge { size: u64, limit: u64 },

    /// Tenant quota would be exceeded by the requested operation
    #[error("Quota exceeded for tenant {tenant}: {resource} requested {requested}, {used} used of {limit}")]
    QuotaExceeded {
        tenant: String,
        resource: QuotaResource,
        requested: u64,
        used: u64,
        limit: u64,
    },

    // =========================================================================
    // Flow Control
    // =========================================================================
    /// Bounded queue is full
    #[error("Backpressure: {0}")]
    Backpressure(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// Operation was cancelled by the caller
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Component is shutting down and refuses new work
    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    // =========================================================================
    // Replication Errors
    // =========================================================================
    /// Replication task exhausted its retry budget
    #[error("Replication abandoned for {key} after {attempts} attempts: {reason}")]
    ReplicationAbandoned {
        key: String,
        attempts: u32,
        reason: String,
    },

    /// Peer transport failure
    #[error("Peer transport error ({peer}): {reason}")]
    Transport { peer: String, reason: String },

    /// Peer is short-circuited by its breaker
    #[error("Circuit open for peer {0}")]
    CircuitOpen(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// A newer version of the object was already stored
    #[error("Version conflict for {key}: {current} is newer than {attempted}")]
    Conflict {
        key: String,
        attempted: u64,
        current: u64,
    },

    /// Tenant not registered and no default limits configured
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Backing store failure
    #[error("Backing store error: {0}")]
    Backend(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A cached value could not be encoded or decoded
    #[error("Compression error: {0}")]
    Compression(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Quota dimension that denied an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    Storage,
    Objects,
    Bandwidth,
    Requests,
}

impl std::fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaResource::Storage => write!(f, "storage"),
            QuotaResource::Objects => write!(f, "objects"),
            QuotaResource::Bandwidth => write!(f, "bandwidth"),
            QuotaResource::Requests => write!(f, "requests"),
        }
    }
}

impl Error {
    /// Classify this error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EntryTooLarge { .. } | Error::QuotaExceeded { .. } => {
                ErrorKind::CapacityExceeded
            }
            Error::Backpressure(_) => ErrorKind::Backpressure,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::ReplicationAbandoned { .. } => ErrorKind::ReplicationAbandoned,
            Error::NotFound(_) | Error::TenantNotFound(_) => ErrorKind::NotFound,
            Error::Cancelled(_)
            | Error::ShuttingDown(_)
            | Error::Transport { .. }
            | Error::CircuitOpen(_)
            | Error::Conflict { .. }
            | Error::Backend(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Compression(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Backpressure(_)
                | Error::Timeout { .. }
                | Error::Transport { .. }
                | Error::CircuitOpen(_)
        )
    }

    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            millis: after.as_millis() as u64,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_and_size_are_capacity() {
        let e = Error::EntryTooLarge { size: 10, limit: 5 };
        assert_eq!(e.kind(), ErrorKind::CapacityExceeded);

        let e = Error::QuotaExceeded {
            tenant: "t1".into(),
            resource: QuotaResource::Storage,
            requested: 600,
            used: 600,
            limit: 1000,
        };
        assert_eq!(e.kind(), ErrorKind::CapacityExceeded);
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("storage"));
    }

    #[test]
    fn test_backpressure_distinct_from_timeout() {
        let bp = Error::Backpressure("queue full".into());
        let to = Error::timeout("persist", std::time::Duration::from_millis(250));
        assert_eq!(bp.kind(), ErrorKind::Backpressure);
        assert_eq!(to.kind(), ErrorKind::Timeout);
        assert!(bp.is_retryable());
        assert!(to.is_retryable());
        assert!(to.to_string().contains("250ms"));
    }

    #[test]
    fn test_not_found_kinds() {
        assert_eq!(Error::NotFound("k".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::TenantNotFound("t".into()).kind(), ErrorKind::NotFound);
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }

    #[test]
    fn test_conflict_is_permanent() {
        let e = Error::Conflict {
            key: "t1/k".into(),
            attempted: 3,
            current: 9,
        };
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("9 is newer than 3"));
    }
}
