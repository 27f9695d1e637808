//! Persistence and dispatch around the pure governance engine.
//!
//! Every action row moves through conditional updates, so two callers racing
//! on the same action cannot both execute it. Each dispatch attempt is logged
//! before the dispatcher is called.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use kuria_core::config::GovernanceConfig;
use kuria_core::domain::action::{
    ActionId, ActionLog, ActionProposal, ActionReceipt, ActionResult, ActionStatus, PendingAction,
};
use kuria_core::domain::company::CompanyId;
use kuria_core::errors::DomainError;
use kuria_core::governance::{self, FailureDecision, GovernanceEngine, GovernanceEngineConfig};
use kuria_db::repositories::{RepositoryError, Store};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher not configured")]
    NotConfigured,
    #[error("{0}")]
    Failed(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Performs the side effect of an approved action.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        company_id: &CompanyId,
        action: &PendingAction,
    ) -> Result<ActionResult, DispatchError>;
}

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("unknown company `{0}`")]
    UnknownCompany(CompanyId),
    #[error("action `{0}` not found")]
    NotFound(ActionId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct ActionGovernor {
    store: Store,
    engine: GovernanceEngine,
    dispatcher: Arc<dyn ActionDispatcher>,
}

impl ActionGovernor {
    pub fn new(
        store: Store,
        config: &GovernanceConfig,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> Self {
        Self {
            store,
            engine: GovernanceEngine::with_config(GovernanceEngineConfig::from(config)),
            dispatcher,
        }
    }

    /// Records a proposal. Tier A runs straight away, B and C wait for a
    /// decision. A repeated idempotency key returns the existing receipt.
    pub async fn submit(
        &self,
        company_id: &CompanyId,
        proposal: ActionProposal,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, GovernanceError> {
        if let Some(key) = proposal.idempotency_key.as_deref() {
            if let Some(existing) = self.store.actions.find_by_idempotency_key(company_id, key).await? {
                return self.receipt_for(existing).await;
            }
        }
        if self.store.companies.find(company_id).await?.is_none() {
            return Err(GovernanceError::UnknownCompany(company_id.clone()));
        }

        let action = self.engine.open(company_id, proposal, now)?;
        match self.store.actions.insert_pending(&action).await {
            Ok(()) => {}
            Err(error) if error.is_conflict() => {
                let key = action.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .store
                    .actions
                    .find_by_idempotency_key(company_id, key)
                    .await?
                    .ok_or(GovernanceError::Repository(error))?;
                return self.receipt_for(existing).await;
            }
            Err(error) => return Err(error.into()),
        }

        info!(
            event_name = "governance.action.submitted",
            company_id = %company_id,
            action_id = %action.id,
            action_type = action.action_type(),
            level = action.level.as_str(),
            status = action.status.as_str(),
            "action submitted"
        );

        if action.status == ActionStatus::AutoApproved {
            return self.run(action).await;
        }
        Ok(governance::receipt(&action, None))
    }

    /// Entry point for agents that want the side effect now. Anything above
    /// tier A is refused and nothing is stored.
    pub async fn execute_direct(
        &self,
        company_id: &CompanyId,
        proposal: ActionProposal,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, GovernanceError> {
        if let Err(refused) = self.engine.check_direct_execution(&proposal) {
            warn!(
                event_name = "governance.action.direct_refused",
                company_id = %company_id,
                action_type = proposal.action_type(),
                level = proposal.level.as_str(),
                "direct execution requires approval"
            );
            return Err(refused.into());
        }
        self.submit(company_id, proposal, now).await
    }

    pub async fn approve(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        approver: &str,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, GovernanceError> {
        self.decide(company_id, action_id, ActionStatus::Approved, Some(approver), now).await?;
        self.resume_approved(company_id, action_id).await
    }

    /// Executes an action left `approved`, e.g. by a crash between the
    /// decision and the dispatch.
    pub async fn resume_approved(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
    ) -> Result<ActionReceipt, GovernanceError> {
        let action = self.load(company_id, action_id).await?;
        if action.status != ActionStatus::Approved {
            return Err(DomainError::InvalidTransition {
                from: action.status,
                to: ActionStatus::Executing,
            }
            .into());
        }
        self.run(action).await
    }

    pub async fn reject(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        decided_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, GovernanceError> {
        let action =
            self.decide(company_id, action_id, ActionStatus::Rejected, Some(decided_by), now).await?;
        self.receipt_for(action).await
    }

    /// Hook for an external expiry policy; nothing expires on its own.
    pub async fn expire(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, GovernanceError> {
        let action = self.decide(company_id, action_id, ActionStatus::Expired, None, now).await?;
        self.receipt_for(action).await
    }

    pub async fn list_pending(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<PendingAction>, GovernanceError> {
        Ok(self.store.actions.list_by_status(company_id, ActionStatus::Pending).await?)
    }

    pub async fn list_logs(
        &self,
        company_id: &CompanyId,
        action_id: Option<&ActionId>,
    ) -> Result<Vec<ActionLog>, GovernanceError> {
        Ok(self.store.actions.list_logs(company_id, action_id).await?)
    }

    pub async fn receipt(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
    ) -> Result<ActionReceipt, GovernanceError> {
        let action = self.load(company_id, action_id).await?;
        self.receipt_for(action).await
    }

    async fn decide(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        to: ActionStatus,
        decided_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PendingAction, GovernanceError> {
        let action = self.load(company_id, action_id).await?;
        self.engine.validate_transition(action.status, to)?;
        if !self.store.actions.decide(company_id, action_id, to, decided_by, now).await? {
            let current = self.load(company_id, action_id).await?;
            return Err(DomainError::InvalidTransition { from: current.status, to }.into());
        }

        info!(
            event_name = "governance.action.decided",
            company_id = %company_id,
            action_id = %action_id,
            status = to.as_str(),
            decided_by = decided_by.unwrap_or("system"),
            "action decided"
        );
        self.load(company_id, action_id).await
    }

    /// Takes the action to `executing` and dispatches it, retrying with
    /// backoff until it succeeds or the attempts run out.
    async fn run(&self, action: PendingAction) -> Result<ActionReceipt, GovernanceError> {
        let company_id = action.company_id.clone();
        let from = action.status;
        self.engine.validate_transition(from, ActionStatus::Executing)?;
        if !self
            .store
            .actions
            .transition(&company_id, &action.id, from, ActionStatus::Executing)
            .await?
        {
            let current = self.load(&company_id, &action.id).await?;
            return Err(DomainError::InvalidTransition {
                from: current.status,
                to: ActionStatus::Executing,
            }
            .into());
        }

        let mut attempt = 1;
        let (status, result) = loop {
            self.store.actions.append_log(&self.engine.attempt_log(&action, attempt, Utc::now())).await?;

            match self.dispatcher.dispatch(&company_id, &action).await {
                Ok(result) => {
                    let log = self.engine.success_log(&action, attempt, result.clone(), Utc::now());
                    self.store.actions.append_log(&log).await?;
                    break (ActionStatus::Succeeded, Some(result));
                }
                Err(failure) => {
                    let decision = if failure.is_retryable() {
                        self.engine.after_failure(attempt)
                    } else {
                        FailureDecision::Finalize
                    };
                    let message = governance::failure_message(&failure.to_string());
                    let log = self.engine.failure_log(&action, attempt, decision, &message, Utc::now());
                    self.store.actions.append_log(&log).await?;

                    match decision {
                        FailureDecision::Retry { delay } => {
                            warn!(
                                event_name = "governance.action.retrying",
                                company_id = %company_id,
                                action_id = %action.id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %message,
                                "dispatch failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        FailureDecision::Finalize => {
                            error!(
                                event_name = "governance.action.failed",
                                company_id = %company_id,
                                action_id = %action.id,
                                attempts = attempt,
                                error = %DomainError::ActionExecutionFailure {
                                    action_id: action.id.clone(),
                                    attempts: attempt,
                                    error: message.clone(),
                                },
                                "action failed"
                            );
                            break (ActionStatus::Failed, None);
                        }
                    }
                }
            }
        };

        self.engine.validate_transition(ActionStatus::Executing, status)?;
        if !self
            .store
            .actions
            .finish(&company_id, &action.id, status, result.as_ref(), Utc::now())
            .await?
        {
            return Err(DomainError::InvariantViolation(format!(
                "action {} left executing state while it was being dispatched",
                action.id
            ))
            .into());
        }
        if status == ActionStatus::Succeeded {
            info!(
                event_name = "governance.action.succeeded",
                company_id = %company_id,
                action_id = %action.id,
                attempts = attempt,
                "action succeeded"
            );
        }

        let finished = self.load(&company_id, &action.id).await?;
        self.receipt_for(finished).await
    }

    async fn load(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
    ) -> Result<PendingAction, GovernanceError> {
        self.store
            .actions
            .find(company_id, action_id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(action_id.clone()))
    }

    async fn receipt_for(&self, action: PendingAction) -> Result<ActionReceipt, GovernanceError> {
        let latest = self.store.actions.latest_log(&action.company_id, &action.id).await?;
        Ok(governance::receipt(&action, latest.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use kuria_core::config::GovernanceConfig;
    use kuria_core::domain::action::{
        ActionLogStatus, ActionPayload, ActionPreview, ActionProposal, ActionResult, ActionStatus,
        PendingAction, RiskTier,
    };
    use kuria_core::domain::company::{Company, CompanyId};
    use kuria_core::errors::DomainError;
    use kuria_db::repositories::Store;
    use kuria_db::{connect_with_settings, migrations};

    use super::{ActionDispatcher, ActionGovernor, DispatchError, GovernanceError};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 5, hour, 0, 0).unwrap()
    }

    async fn store_with_company(id: &str) -> (Store, CompanyId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrations");
        let store = Store::sqlite(pool);
        let company_id = CompanyId(id.to_string());
        store.companies.create(&Company::new(company_id.clone(), "Acme", at(0))).await.expect("company");
        (store, company_id)
    }

    /// Fails the first `failures` calls, then succeeds.
    struct ScriptedDispatcher {
        failures: u32,
        calls: AtomicU32,
    }

    impl ScriptedDispatcher {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self { failures, calls: AtomicU32::new(0) })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActionDispatcher for ScriptedDispatcher {
        async fn dispatch(
            &self,
            _company_id: &CompanyId,
            _action: &PendingAction,
        ) -> Result<ActionResult, DispatchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(DispatchError::Failed(format!("smtp 503 on call {call}")))
            } else {
                Ok(ActionResult::from_value(json!({ "message_id": "m-1" })))
            }
        }
    }

    fn fast_retries() -> GovernanceConfig {
        GovernanceConfig { max_attempts: 3, retry_base_delay_ms: 1, retry_backoff_multiplier: 1 }
    }

    fn reminder(level: RiskTier, key: Option<&str>) -> ActionProposal {
        ActionProposal {
            level,
            agent: "cash_predictability".to_string(),
            payload: ActionPayload::SendInvoiceReminder {
                invoice_id: "inv-7".to_string(),
                client_email: "ap@client.test".to_string(),
                days_overdue: 10,
                reminder_number: 1,
            },
            description: "first reminder".to_string(),
            preview: ActionPreview::None,
            idempotency_key: key.map(str::to_string),
        }
    }

    fn refund() -> ActionProposal {
        ActionProposal {
            level: RiskTier::C,
            agent: "cash_predictability".to_string(),
            payload: ActionPayload::IssueRefund {
                client_id: "cl-9".to_string(),
                amount: Decimal::new(5_000, 0),
                currency: "EUR".to_string(),
            },
            description: "refund".to_string(),
            preview: ActionPreview::None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn tier_a_executes_and_logs_the_attempt_before_the_result() {
        let (store, acme) = store_with_company("acme").await;
        let dispatcher = ScriptedDispatcher::new(0);
        let governor = ActionGovernor::new(store.clone(), &fast_retries(), dispatcher.clone());

        let receipt = governor.submit(&acme, reminder(RiskTier::A, None), at(9)).await.expect("submit");

        assert_eq!(receipt.status, ActionStatus::Succeeded);
        assert_eq!(receipt.attempts, 1);
        assert_eq!(
            receipt.result.as_ref().and_then(|result| result.0.get("message_id")),
            Some(&json!("m-1"))
        );
        let statuses: Vec<ActionLogStatus> = governor
            .list_logs(&acme, Some(&receipt.action_id))
            .await
            .expect("logs")
            .into_iter()
            .map(|log| log.status)
            .collect();
        assert_eq!(statuses, vec![ActionLogStatus::Executing, ActionLogStatus::Succeeded]);
    }

    #[tokio::test]
    async fn tier_b_waits_for_approval_then_executes_once() {
        let (store, acme) = store_with_company("acme").await;
        let dispatcher = ScriptedDispatcher::new(0);
        let governor = ActionGovernor::new(store.clone(), &fast_retries(), dispatcher.clone());

        let receipt = governor.submit(&acme, reminder(RiskTier::B, None), at(9)).await.expect("submit");
        assert_eq!(receipt.status, ActionStatus::Pending);
        assert_eq!(dispatcher.calls(), 0);
        assert!(governor.list_logs(&acme, Some(&receipt.action_id)).await.expect("logs").is_empty());

        let approved =
            governor.approve(&acme, &receipt.action_id, "ines", at(10)).await.expect("approve");
        assert_eq!(approved.status, ActionStatus::Succeeded);

        let again = governor.approve(&acme, &receipt.action_id, "ines", at(11)).await;
        assert!(matches!(
            again,
            Err(GovernanceError::Domain(DomainError::InvalidTransition {
                from: ActionStatus::Succeeded,
                to: ActionStatus::Approved
            }))
        ));
        assert_eq!(dispatcher.calls(), 1);

        let stored = store.actions.find(&acme, &receipt.action_id).await.expect("find").expect("row");
        assert_eq!(stored.decided_by.as_deref(), Some("ines"));
        assert_eq!(stored.decided_at, Some(at(10)));
    }

    #[tokio::test]
    async fn direct_execution_of_a_refund_is_refused_without_a_trace() {
        let (store, acme) = store_with_company("acme").await;
        let dispatcher = ScriptedDispatcher::new(0);
        let governor = ActionGovernor::new(store.clone(), &fast_retries(), dispatcher.clone());

        let refused = governor.execute_direct(&acme, refund(), at(9)).await;

        assert!(matches!(
            refused,
            Err(GovernanceError::Domain(DomainError::ApprovalRequired { level: RiskTier::C, .. }))
        ));
        assert_eq!(dispatcher.calls(), 0);
        assert!(governor.list_pending(&acme).await.expect("pending").is_empty());
        assert!(governor.list_logs(&acme, None).await.expect("logs").is_empty());
    }

    #[tokio::test]
    async fn retries_until_success_and_counts_attempts() {
        let (store, acme) = store_with_company("acme").await;
        let dispatcher = ScriptedDispatcher::new(2);
        let governor = ActionGovernor::new(store.clone(), &fast_retries(), dispatcher.clone());

        let receipt = governor.submit(&acme, reminder(RiskTier::A, None), at(9)).await.expect("submit");

        assert_eq!(receipt.status, ActionStatus::Succeeded);
        assert_eq!(receipt.attempts, 3);
        let logs = governor.list_logs(&acme, Some(&receipt.action_id)).await.expect("logs");
        let retrying: Vec<_> =
            logs.iter().filter(|log| log.status == ActionLogStatus::Retrying).collect();
        assert_eq!(retrying.len(), 2);
        assert_eq!(retrying[0].error.as_deref(), Some("smtp 503 on call 1"));
    }

    #[tokio::test]
    async fn exhausted_retries_finalize_with_the_verbatim_error() {
        let (store, acme) = store_with_company("acme").await;
        let dispatcher = ScriptedDispatcher::new(u32::MAX);
        let governor = ActionGovernor::new(store.clone(), &fast_retries(), dispatcher.clone());

        let receipt = governor.submit(&acme, reminder(RiskTier::A, None), at(9)).await.expect("submit");

        assert_eq!(receipt.status, ActionStatus::Failed);
        assert_eq!(receipt.attempts, 3);
        assert_eq!(receipt.error.as_deref(), Some("smtp 503 on call 3"));
        assert_eq!(dispatcher.calls(), 3);
    }

    #[tokio::test]
    async fn repeated_idempotency_key_returns_the_first_receipt() {
        let (store, acme) = store_with_company("acme").await;
        let dispatcher = ScriptedDispatcher::new(0);
        let governor = ActionGovernor::new(store.clone(), &fast_retries(), dispatcher.clone());

        let first = governor
            .submit(&acme, reminder(RiskTier::A, Some("inv-7#1")), at(9))
            .await
            .expect("first");
        let second = governor
            .submit(&acme, reminder(RiskTier::A, Some("inv-7#1")), at(10))
            .await
            .expect("second");

        assert_eq!(second, first);
        assert_eq!(dispatcher.calls(), 1);
    }

    #[tokio::test]
    async fn rejected_and_expired_actions_never_dispatch() {
        let (store, acme) = store_with_company("acme").await;
        let dispatcher = ScriptedDispatcher::new(0);
        let governor = ActionGovernor::new(store.clone(), &fast_retries(), dispatcher.clone());

        let rejected = governor.submit(&acme, refund(), at(9)).await.expect("refund");
        let expired = governor.submit(&acme, reminder(RiskTier::B, None), at(9)).await.expect("b");

        let rejected = governor.reject(&acme, &rejected.action_id, "ines", at(10)).await.expect("reject");
        let expired = governor.expire(&acme, &expired.action_id, at(10)).await.expect("expire");

        assert_eq!(rejected.status, ActionStatus::Rejected);
        assert_eq!(expired.status, ActionStatus::Expired);
        assert!(governor.list_pending(&acme).await.expect("pending").is_empty());
        assert!(governor.list_logs(&acme, None).await.expect("logs").is_empty());
        assert!(governor.resume_approved(&acme, &rejected.action_id).await.is_err());
        assert_eq!(dispatcher.calls(), 0);
    }

    #[tokio::test]
    async fn unconfigured_dispatcher_fails_without_retrying() {
        struct Unconfigured;

        #[async_trait]
        impl ActionDispatcher for Unconfigured {
            async fn dispatch(
                &self,
                _company_id: &CompanyId,
                _action: &PendingAction,
            ) -> Result<ActionResult, DispatchError> {
                Err(DispatchError::NotConfigured)
            }
        }

        let (store, acme) = store_with_company("acme").await;
        let governor = ActionGovernor::new(store.clone(), &fast_retries(), Arc::new(Unconfigured));

        let receipt = governor.submit(&acme, reminder(RiskTier::A, None), at(9)).await.expect("submit");

        assert_eq!(receipt.status, ActionStatus::Failed);
        assert_eq!(receipt.attempts, 1);
        assert_eq!(receipt.error.as_deref(), Some("dispatcher not configured"));
    }

    #[tokio::test]
    async fn unknown_company_is_rejected() {
        let (store, _) = store_with_company("acme").await;
        let governor =
            ActionGovernor::new(store.clone(), &fast_retries(), ScriptedDispatcher::new(0));

        let nobody = CompanyId("nobody".to_string());
        let result = governor.submit(&nobody, reminder(RiskTier::A, None), at(9)).await;

        assert!(matches!(result, Err(GovernanceError::UnknownCompany(_))));
    }
}
