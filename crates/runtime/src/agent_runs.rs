use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use kuria_core::domain::agent_run::{AgentRun, AgentRunId, AgentRunOutcome};
use kuria_core::domain::company::CompanyId;
use kuria_db::repositories::{RepositoryError, Store};

#[derive(Debug, Error)]
pub enum AgentRunError {
    #[error("unknown company `{0}`")]
    UnknownCompany(CompanyId),
    #[error("agent run `{0}` not found")]
    NotFound(AgentRunId),
    #[error("agent run `{0}` is already finished")]
    AlreadyFinished(AgentRunId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Bookkeeping for runs of external agents.
pub struct AgentRunRecorder {
    store: Store,
}

impl AgentRunRecorder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn start(
        &self,
        company_id: &CompanyId,
        agent: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentRun, AgentRunError> {
        if self.store.companies.find(company_id).await?.is_none() {
            return Err(AgentRunError::UnknownCompany(company_id.clone()));
        }
        let run = AgentRun::start(AgentRunId(Uuid::new_v4().to_string()), company_id.clone(), agent, now);
        self.store.agent_runs.insert(&run).await?;
        Ok(run)
    }

    pub async fn finish(
        &self,
        company_id: &CompanyId,
        run_id: &AgentRunId,
        outcome: AgentRunOutcome,
        now: DateTime<Utc>,
    ) -> Result<AgentRun, AgentRunError> {
        let run = self
            .store
            .agent_runs
            .find(company_id, run_id)
            .await?
            .ok_or_else(|| AgentRunError::NotFound(run_id.clone()))?;
        let finished =
            run.finish(outcome, now).ok_or_else(|| AgentRunError::AlreadyFinished(run_id.clone()))?;
        if !self.store.agent_runs.finish(&finished).await? {
            return Err(AgentRunError::AlreadyFinished(run_id.clone()));
        }

        info!(
            event_name = "agent_run.finished",
            company_id = %company_id,
            run_id = %run_id,
            agent = %finished.agent,
            success = finished.success.unwrap_or(false),
            actions_count = finished.actions_count,
            "agent run finished"
        );
        Ok(finished)
    }

    pub async fn list(
        &self,
        company_id: &CompanyId,
        limit: u32,
    ) -> Result<Vec<AgentRun>, AgentRunError> {
        Ok(self.store.agent_runs.list(company_id, limit).await?)
    }
}
