use thiserror::Error;

use crate::domain::action::{ActionId, ActionStatus, RiskTier};
use crate::domain::event::EventId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed sync input. Rejected, never retried.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// Idempotency-triple race. Absorbed by the sync engine unless retries run out.
    #[error("sync conflict persisted after {attempts} attempts")]
    ConflictRetry { attempts: u32 },
    #[error("event {0} was already processed")]
    EventRedelivery(EventId),
    #[error("action {action_id} failed after {attempts} attempts: {error}")]
    ActionExecutionFailure { action_id: ActionId, attempts: u32, error: String },
    #[error("action `{action_type}` is tier {} and requires approval", level.as_str())]
    ApprovalRequired { action_type: String, level: RiskTier },
    #[error("invalid action transition from {} to {}", from.as_str(), to.as_str())]
    InvalidTransition { from: ActionStatus, to: ActionStatus },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::InvalidRecord(_) => "invalid_record",
            Self::ConflictRetry { .. } => "conflict_retry",
            Self::EventRedelivery(_) => "event_redelivery",
            Self::ActionExecutionFailure { .. } => "action_execution_failure",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, error_class: &'static str, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, error_class: &'static str, correlation_id: String },
    #[error("unprocessable: {message}")]
    Unprocessable { message: String, error_class: &'static str, correlation_id: String },
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
            Self::NotFound { .. } => "The requested resource does not exist for this company.",
            Self::Conflict { .. } => "The request conflicts with the current state of the resource.",
            Self::Unprocessable { .. } => "The submitted record is invalid and was not stored.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::Unprocessable { .. } => 422,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::BadRequest { error_class, .. }
            | Self::Conflict { error_class, .. }
            | Self::Unprocessable { error_class, .. } => error_class,
            Self::NotFound { .. } => "not_found",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. }
            | Self::Unprocessable { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::Unprocessable { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::Unprocessable { correlation_id: id, .. }
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
            ApplicationError::Domain(error) => {
                let error_class = error.error_class();
                let message = error.to_string();
                match error {
                    DomainError::InvalidRecord(_) => {
                        Self::Unprocessable { message, error_class, correlation_id: unassigned() }
                    }
                    DomainError::ApprovalRequired { .. }
                    | DomainError::InvalidTransition { .. }
                    | DomainError::EventRedelivery(_) => {
                        Self::Conflict { message, error_class, correlation_id: unassigned() }
                    }
                    DomainError::ConflictRetry { .. }
                    | DomainError::ActionExecutionFailure { .. } => {
                        Self::ServiceUnavailable { message, correlation_id: unassigned() }
                    }
                    DomainError::InvariantViolation(_) => {
                        Self::BadRequest { message, error_class, correlation_id: unassigned() }
                    }
                }
            }
            ApplicationError::NotFound(message) => {
                Self::NotFound { message, correlation_id: unassigned() }
            }
            ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}
