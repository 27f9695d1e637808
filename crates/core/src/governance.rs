//! Risk-tiered action governance.
//!
//! Pure state machine for agent-proposed side effects. The runtime persists
//! every transition this engine allows; the engine itself never touches
//! storage or the network.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::GovernanceConfig;
use crate::domain::action::{
    ActionId, ActionLog, ActionLogId, ActionLogStatus, ActionPayload, ActionProposal,
    ActionReceipt, ActionResult, ActionStatus, PendingAction, RiskTier,
};
use crate::domain::company::CompanyId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GovernanceEngineConfig {
    /// Total dispatch attempts, the first one included.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
}

impl Default for GovernanceEngineConfig {
    fn default() -> Self {
        Self { max_attempts: 3, retry_base_delay_ms: 1_000, retry_backoff_multiplier: 3 }
    }
}

impl From<&GovernanceConfig> for GovernanceEngineConfig {
    fn from(value: &GovernanceConfig) -> Self {
        Self {
            max_attempts: value.max_attempts,
            retry_base_delay_ms: value.retry_base_delay_ms,
            retry_backoff_multiplier: value.retry_backoff_multiplier,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    AutoApproved,
    AwaitApproval,
}

impl Admission {
    pub fn status(&self) -> ActionStatus {
        match self {
            Self::AutoApproved => ActionStatus::AutoApproved,
            Self::AwaitApproval => ActionStatus::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureDecision {
    Retry { delay: Duration },
    Finalize,
}

#[derive(Clone, Debug, Default)]
pub struct GovernanceEngine {
    config: GovernanceEngineConfig,
}

impl GovernanceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GovernanceEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GovernanceEngineConfig {
        &self.config
    }

    /// Tier A runs straight away; B and C wait for a human.
    pub fn admit(&self, level: RiskTier) -> Admission {
        if level.requires_approval() {
            Admission::AwaitApproval
        } else {
            Admission::AutoApproved
        }
    }

    /// Gate for agents that try to execute without going through approval.
    pub fn check_direct_execution(&self, proposal: &ActionProposal) -> Result<(), DomainError> {
        match self.admit(proposal.level) {
            Admission::AutoApproved => Ok(()),
            Admission::AwaitApproval => Err(DomainError::ApprovalRequired {
                action_type: proposal.action_type().to_string(),
                level: proposal.level,
            }),
        }
    }

    pub fn validate_transition(
        &self,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<(), DomainError> {
        use ActionStatus::*;

        let valid = matches!(
            (from, to),
            (Proposed, Pending)
                | (Proposed, AutoApproved)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Approved, Executing)
                | (AutoApproved, Executing)
                | (Executing, Succeeded)
                | (Executing, Failed)
        );
        if valid {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition { from, to })
        }
    }

    /// Decides what follows failed attempt number `attempt` (1-based).
    pub fn after_failure(&self, attempt: u32) -> FailureDecision {
        if attempt >= self.config.max_attempts {
            return FailureDecision::Finalize;
        }
        let factor = u64::from(self.config.retry_backoff_multiplier)
            .saturating_pow(attempt.saturating_sub(1));
        FailureDecision::Retry {
            delay: Duration::from_millis(self.config.retry_base_delay_ms.saturating_mul(factor)),
        }
    }

    /// Builds the row that tracks a proposal through its lifecycle.
    pub fn open(
        &self,
        company_id: &CompanyId,
        proposal: ActionProposal,
        now: DateTime<Utc>,
    ) -> Result<PendingAction, DomainError> {
        let payload_hash = payload_hash(&proposal.payload)?;
        let status = self.admit(proposal.level).status();
        self.validate_transition(ActionStatus::Proposed, status)?;

        Ok(PendingAction {
            id: ActionId(Uuid::new_v4().to_string()),
            company_id: company_id.clone(),
            level: proposal.level,
            agent: proposal.agent,
            payload: proposal.payload,
            payload_hash,
            description: proposal.description,
            preview: proposal.preview,
            idempotency_key: proposal.idempotency_key,
            status,
            result: None,
            decided_by: None,
            decided_at: None,
            created_at: now,
            executed_at: None,
        })
    }

    /// Audit row written before attempt `attempt` is dispatched.
    pub fn attempt_log(&self, action: &PendingAction, attempt: u32, now: DateTime<Utc>) -> ActionLog {
        log_entry(action, ActionLogStatus::Executing, attempt, None, None, now)
    }

    pub fn failure_log(
        &self,
        action: &PendingAction,
        attempt: u32,
        decision: FailureDecision,
        error: &str,
        now: DateTime<Utc>,
    ) -> ActionLog {
        let status = match decision {
            FailureDecision::Retry { .. } => ActionLogStatus::Retrying,
            FailureDecision::Finalize => ActionLogStatus::Failed,
        };
        log_entry(action, status, attempt, None, Some(failure_message(error)), now)
    }

    pub fn success_log(
        &self,
        action: &PendingAction,
        attempt: u32,
        result: ActionResult,
        now: DateTime<Utc>,
    ) -> ActionLog {
        log_entry(action, ActionLogStatus::Succeeded, attempt, Some(result), None, now)
    }
}

fn log_entry(
    action: &PendingAction,
    status: ActionLogStatus,
    attempts: u32,
    result: Option<ActionResult>,
    error: Option<String>,
    now: DateTime<Utc>,
) -> ActionLog {
    ActionLog {
        id: ActionLogId(Uuid::new_v4().to_string()),
        action_id: action.id.clone(),
        company_id: action.company_id.clone(),
        level: action.level,
        agent: action.agent.clone(),
        payload: action.payload.clone(),
        payload_hash: action.payload_hash.clone(),
        idempotency_key: action.idempotency_key.clone(),
        status,
        result,
        error,
        attempts,
        executed_at: now,
    }
}

pub const EMPTY_FAILURE_MESSAGE: &str = "dispatch failed with an empty error";

/// Failed audit rows always carry an error; a blank one is replaced.
pub fn failure_message(error: &str) -> String {
    if error.trim().is_empty() {
        EMPTY_FAILURE_MESSAGE.to_string()
    } else {
        error.to_string()
    }
}

/// Receipt for an action, using the latest audit row for attempt details.
pub fn receipt(action: &PendingAction, latest_log: Option<&ActionLog>) -> ActionReceipt {
    ActionReceipt {
        action_id: action.id.clone(),
        action_type: action.action_type().to_string(),
        level: action.level,
        status: action.status,
        attempts: latest_log.map(|log| log.attempts).unwrap_or(0),
        result: action.result.clone(),
        error: latest_log.and_then(|log| log.error.clone()),
    }
}

/// Stable fingerprint of an action's type and body.
pub fn payload_hash(payload: &ActionPayload) -> Result<String, DomainError> {
    use sha2::{Digest, Sha256};

    let (action_type, body) = payload
        .to_parts()
        .map_err(|error| DomainError::InvariantViolation(format!("unencodable payload: {error}")))?;
    let mut hasher = Sha256::new();
    hasher.update(action_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.to_string().as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
