//! Error types for Varv.
//!
//! All errors in Varv are strongly typed using thiserror.
//! Resolution failures, validation failures and the cooperative
//! [`StopError`] are distinct variants so chain hosts can tell an
//! intentional early stop apart from a bug.

use thiserror::Error;

use crate::datastore::DatastoreError;

/// Failures to resolve a name (property, concept, action, variable) or to
/// find the target an operation needs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("No property [{name}] found")]
    PropertyNotFound {
        name: String,
    },

    #[error("No concept [{name}] found")]
    ConceptNotFound {
        name: String,
    },

    #[error("No action [{name}] found")]
    ActionNotFound {
        name: String,
    },

    #[error("Unknown variable [{name}]")]
    UnknownVariable {
        name: String,
    },

    #[error("Property [{property}] has type {actual}, expected {expected}")]
    WrongPropertyType {
        property: String,
        expected: String,
        actual: String,
    },

    #[error("Action [{action}] requires a target but the context has none")]
    MissingTarget {
        action: String,
    },

    #[error("No concept known for instance [{uuid}]")]
    UnknownInstance {
        uuid: String,
    },
}

/// Validation errors raised when a value does not fit a property.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Cannot cast {value} to {target_type}")]
    CastFailed {
        value: String,
        target_type: String,
    },

    #[error("Value {value} is not allowed for property [{property}]")]
    NotInEnum {
        property: String,
        value: String,
    },

    #[error("Property [{property}] is derived and cannot be written")]
    ReadOnly {
        property: String,
    },

    #[error("Property [{property}] has no backing datastore")]
    Unbacked {
        property: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },
}

/// Errors from building or evaluating a filter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    #[error("Operator '{operator}' is not allowed on values of type {value_type}")]
    OperatorNotAllowed {
        operator: String,
        value_type: String,
    },

    #[error("Invalid filter: {reason}")]
    Malformed {
        reason: String,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        pattern: String,
        reason: String,
    },
}

/// Errors in a declarative specification.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpecError {
    #[error("Invalid specification: {reason}")]
    Invalid {
        reason: String,
    },

    #[error("Invalid options for action '{action}': {reason}")]
    InvalidAction {
        action: String,
        reason: String,
    },

    #[error("Invalid trigger '{trigger}': {reason}")]
    InvalidTrigger {
        trigger: String,
        reason: String,
    },

    #[error("Unknown datastore type '{kind}' for datastore '{name}'")]
    UnknownDatastoreType {
        name: String,
        kind: String,
    },

    #[error("Extension '{extension}' failed: {reason}")]
    Extension {
        extension: String,
        reason: String,
    },

    #[error("Failed to read spec source '{source_name}': {reason}")]
    Source {
        source_name: String,
        reason: String,
    },
}

/// Errors from parsing or evaluating a calculation expression.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Parse error at {position}: {reason}")]
    Parse {
        position: usize,
        reason: String,
    },

    #[error("Cannot evaluate '{expression}': {reason}")]
    Eval {
        expression: String,
        reason: String,
    },
}

/// Cooperative, non-fatal chain termination.
///
/// Raised by steps such as `select` with `stopIfEmpty`. Chain hosts log it
/// and treat the invocation as finished.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Chain stopped: {reason}")]
pub struct StopError {
    pub reason: String,
}

impl StopError {
    /// Creates a stop signal with a reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Top-level error type for Varv.
#[derive(Debug, Error)]
pub enum VarvError {
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Spec error: {0}")]
    Spec(#[from] SpecError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl VarvError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a stop signal.
    #[must_use]
    pub fn stop(reason: impl Into<String>) -> Self {
        Self::Stop(StopError::new(reason))
    }

    /// Shorthand for an invalid-action-options error.
    #[must_use]
    pub fn invalid_action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spec(SpecError::InvalidAction {
            action: action.into(),
            reason: reason.into(),
        })
    }

    /// Returns true if this is a cooperative stop signal.
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        matches!(self, Self::Stop(_))
    }

    /// Returns true if this is a resolution error.
    #[must_use]
    pub const fn is_resolution(&self) -> bool {
        matches!(self, Self::Resolution(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a filter error.
    #[must_use]
    pub const fn is_filter(&self) -> bool {
        matches!(self, Self::Filter(_))
    }

    /// Returns true if this is a spec error.
    #[must_use]
    pub const fn is_spec(&self) -> bool {
        matches!(self, Self::Spec(_))
    }
}

/// Result type alias for Varv operations.
pub type VarvResult<T> = Result<T, VarvError>;

pub(crate) fn lock_err(context: &'static str) -> VarvError {
    VarvError::internal(format!("poisoned lock: {context}"))
}
