//! Folds service errors into `ApplicationError` so interfaces map them once.

use kuria_core::errors::{ApplicationError, DomainError};
use kuria_db::repositories::RepositoryError;

use crate::agent_runs::AgentRunError;
use crate::analytics::AnalyticsError;
use crate::governance::GovernanceError;
use crate::router::RouterError;
use crate::sync::SyncError;

fn from_repository(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

impl From<SyncError> for ApplicationError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::Domain(error) => Self::Domain(error),
            SyncError::ConflictExhausted { attempts, .. } => {
                Self::Domain(DomainError::ConflictRetry { attempts })
            }
            SyncError::Repository(error) => from_repository(error),
        }
    }
}

impl From<RouterError> for ApplicationError {
    fn from(value: RouterError) -> Self {
        match value {
            RouterError::Repository(error) => from_repository(error),
        }
    }
}

impl From<GovernanceError> for ApplicationError {
    fn from(value: GovernanceError) -> Self {
        match value {
            GovernanceError::Domain(error) => Self::Domain(error),
            GovernanceError::UnknownCompany(company_id) => {
                Self::NotFound(format!("company `{company_id}`"))
            }
            GovernanceError::NotFound(action_id) => Self::NotFound(format!("action `{action_id}`")),
            GovernanceError::Repository(error) => from_repository(error),
        }
    }
}

impl From<AnalyticsError> for ApplicationError {
    fn from(value: AnalyticsError) -> Self {
        match value {
            AnalyticsError::UnknownCompany(company_id) => {
                Self::NotFound(format!("company `{company_id}`"))
            }
            AnalyticsError::Repository(error) => from_repository(error),
        }
    }
}

impl From<AgentRunError> for ApplicationError {
    fn from(value: AgentRunError) -> Self {
        match value {
            AgentRunError::UnknownCompany(company_id) => {
                Self::NotFound(format!("company `{company_id}`"))
            }
            AgentRunError::NotFound(run_id) => Self::NotFound(format!("agent run `{run_id}`")),
            AgentRunError::AlreadyFinished(run_id) => {
                Self::Domain(DomainError::InvariantViolation(format!(
                    "agent run `{run_id}` is already finished"
                )))
            }
            AgentRunError::Repository(error) => from_repository(error),
        }
    }
}
