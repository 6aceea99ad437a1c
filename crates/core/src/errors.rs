use thiserror::Error;

use crate::conditions::ConditionError;
use crate::store::StoreError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Lost a race on a mutually exclusive transition; someone else already acted.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    /// Concurrency conflicts are a kind of invalid-state failure.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_) | Self::ConcurrencyConflict(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        self.domain().map(DomainError::is_invalid_state).unwrap_or(false)
    }
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::VersionConflict { .. } | StoreError::StepConflict { .. } => {
                Self::Domain(DomainError::ConcurrencyConflict(value.to_string()))
            }
            StoreError::Database(message) | StoreError::Decode(message) => {
                Self::Persistence(message)
            }
        }
    }
}

impl From<ConditionError> for ApplicationError {
    fn from(value: ConditionError) -> Self {
        match value {
            ConditionError::NotNumeric { .. } => {
                Self::Domain(DomainError::Validation(value.to_string()))
            }
            ConditionError::Evaluation(message) => Self::Integration(message),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not allowed to perform this action.",
            Self::NotFound { .. } => "The requested item does not exist.",
            Self::Conflict { .. } => {
                "This item was changed by someone else. Refresh and decide whether to retry."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::Validation(message)) => {
                Self::BadRequest { message, correlation_id: unassigned() }
            }
            ApplicationError::Domain(DomainError::NotAuthorized(message)) => {
                Self::Forbidden { message, correlation_id: unassigned() }
            }
            ApplicationError::Domain(error @ DomainError::NotFound { .. }) => {
                Self::NotFound { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Domain(DomainError::InvalidState(message))
            | ApplicationError::Domain(DomainError::ConcurrencyConflict(message)) => {
                Self::Conflict { message, correlation_id: unassigned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{ApplicationError, DomainError, InterfaceError};
    use crate::store::StoreError;

    #[test]
    fn validation_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::Validation(
            "rejection requires comments".to_owned(),
        ))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn store_conflicts_surface_as_invalid_state() {
        let error = ApplicationError::from(StoreError::StepConflict {
            step_id: "STP-1".to_owned(),
        });

        assert!(error.is_invalid_state());
        assert!(matches!(error, ApplicationError::Domain(DomainError::ConcurrencyConflict(_))));
        assert!(matches!(error.into_interface("req-2"), InterfaceError::Conflict { .. }));
    }

    #[test]
    fn authorization_and_lookup_failures_keep_their_class() {
        let forbidden =
            ApplicationError::from(DomainError::NotAuthorized("not the approver".to_owned()))
                .into_interface("req-3");
        assert!(matches!(forbidden, InterfaceError::Forbidden { .. }));

        let missing = ApplicationError::from(DomainError::not_found("step", "STP-9"))
            .into_interface("req-4");
        assert!(matches!(
            missing,
            InterfaceError::NotFound { ref message, .. } if message.contains("STP-9")
        ));
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-5");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }
}
