//! Error types for Parley operations

use thiserror::Error;

/// Storage layer errors (lease stores).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Stored record is corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Remote lookup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Request to {backend} failed with status {status}: {message}")]
    RequestFailed {
        backend: String,
        status: u16,
        message: String,
    },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("{backend} cannot serve this request: {reason}")]
    Unsupported { backend: String, reason: String },

    #[error("Lookup task for {backend} was cancelled")]
    Cancelled { backend: String },
}

/// Exclusive lease errors, surfaced only by the composition root.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Lease '{slot}' is held by another process; try again later")]
    HeldElsewhere { slot: String },

    #[error("Lease '{slot}' was lost to another holder")]
    Lost { slot: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or PARLEY_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Failed to initialize logging: {reason}")]
    Telemetry { reason: String },
}

/// Master error type for all Parley errors.
#[derive(Debug, Clone, Error)]
pub enum ParleyError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Parley operations.
pub type ParleyResult<T> = Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_display_request_failed() {
        let err = LookupError::RequestFailed {
            backend: "json-rpc".to_string(),
            status: 502,
            message: "bad gateway".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("json-rpc"));
        assert!(msg.contains("502"));
        assert!(msg.contains("bad gateway"));
    }

    #[test]
    fn test_lease_error_reads_as_try_later() {
        let err = LeaseError::HeldElsewhere {
            slot: "parley.lease".to_string(),
        };
        assert!(format!("{}", err).contains("try again later"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "lease.timeout_ms".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("lease.timeout_ms"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_parley_error_from_variants() {
        let storage = ParleyError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, ParleyError::Storage(_)));

        let lookup = ParleyError::from(LookupError::Cancelled {
            backend: "profile".to_string(),
        });
        assert!(matches!(lookup, ParleyError::Lookup(_)));

        let lease = ParleyError::from(LeaseError::Lost {
            slot: "s".to_string(),
        });
        assert!(matches!(lease, ParleyError::Lease(_)));

        let validation = ParleyError::from(ValidationError::RequiredFieldMissing {
            field: "address".to_string(),
        });
        assert!(matches!(validation, ParleyError::Validation(_)));

        let config = ParleyError::from(ConfigError::MissingConfigPath);
        assert!(matches!(config, ParleyError::Config(_)));
    }
}
