//! Error types for the migration controller
//!
//! Errors carry the migration they relate to where one is known, so that
//! log lines emitted by the error policy can be correlated with the object.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for migration controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Spec or configuration validation error
    #[error("validation error for {migration}: {message}")]
    Validation {
        /// Namespaced name of the migration (or VMI) with invalid input
        migration: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.domain.devices.gpus")
        field: Option<String>,
    },

    /// A test-and-set precondition no longer holds
    ///
    /// Raised locally when the observed value changed between read and
    /// write, and mapped from API 409/422 responses on conditional patches.
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Object the conditional write targeted
        resource: String,
        /// Description of the mismatch
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "gc", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            migration: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error scoped to a migration
    pub fn validation_for(migration: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            migration: migration.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with migration context and field path
    pub fn validation_for_field(
        migration: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            migration: migration.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error for a failed precondition on `resource`
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Conflicts are always retryable: the next pass re-reads the object and
    /// recomputes the patch. Kubernetes client errors (4xx) are not, except
    /// for 409 Conflict and 422 from a rejected JSON-patch `test` operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 422 => true,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the error means a conditional write lost a race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 || ae.code == 422,
            _ => false,
        }
    }

    /// Get the migration name if this error is associated with one
    pub fn migration(&self) -> Option<&str> {
        match self {
            Error::Validation { migration, .. } => Some(migration),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: a stale handoff patch is rejected and the pass is retried
    ///
    /// The API server answers a failed JSON-patch `test` op with 422. That
    /// must surface as a retryable conflict, not a permanent client error.
    #[test]
    fn story_rejected_test_operation_is_retryable_conflict() {
        let err = api_error(422);
        assert!(err.is_conflict());
        assert!(err.is_retryable());

        let err = api_error(409);
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[test]
    fn story_client_errors_are_not_retried() {
        let err = api_error(403);
        assert!(!err.is_retryable());
        assert!(!err.is_conflict());

        let err = api_error(404);
        assert!(!err.is_retryable());
    }

    #[test]
    fn story_server_errors_are_retried() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    /// Story: permitted host device violations name the VMI and the field
    #[test]
    fn story_validation_errors_carry_context() {
        let err = Error::validation_for_field(
            "default/vmi-gpu",
            "spec.domain.devices.gpus",
            "GPU nvidia.com/A100 is not permitted in permittedHostDevices configuration",
        );
        assert!(err.to_string().contains("default/vmi-gpu"));
        assert!(err.to_string().contains("not permitted"));
        assert_eq!(err.migration(), Some("default/vmi-gpu"));
        assert!(!err.is_retryable());

        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.domain.devices.gpus"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    #[test]
    fn local_conflict_is_retryable() {
        let err = Error::conflict("default/vmi", "migrationState changed");
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("migrationState changed"));
    }

    #[test]
    fn internal_error_exposes_context() {
        let err = Error::internal_with_context("gc", "store not ready");
        assert_eq!(err.context(), Some("gc"));
        assert_eq!(Error::internal("x").context(), Some(UNKNOWN_CONTEXT));
        assert!(err.is_retryable());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
        assert!(Error::serialization_for_kind("Pod", "bad").to_string().contains("bad"));
    }
}
