use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use kuria_core::analytics::CompanyRecords;
use kuria_core::domain::action::{ActionId, ActionLog, ActionResult, ActionStatus, PendingAction};
use kuria_core::domain::agent_run::{AgentRun, AgentRunId};
use kuria_core::domain::company::{
    AgentConfigs, Company, CompanyId, CompanyProfile, ToolCategory, ToolConnection,
};
use kuria_core::domain::event::{Event, EventId, MarkOutcome};
use kuria_core::domain::history::{InvoiceReminder, TaskReminder, WinLossAnalysis};
use kuria_core::domain::metrics::{CacMetrics, CashForecast, Forecast, ProcessMetrics, SnapshotSet};
use kuria_core::domain::record::{RecordId, RecordKind, SyncKey, SyncedRecord};
use kuria_core::domain::team::{Credential, TeamMember};

use crate::DbPool;

mod codec;

pub mod action;
pub mod agent_run;
pub mod company;
pub mod event;
pub mod history;
pub mod record;
pub mod snapshot;
pub mod team;

pub use action::SqlActionRepository;
pub use agent_run::SqlAgentRunRepository;
pub use company::SqlCompanyRepository;
pub use event::SqlEventRepository;
pub use history::SqlHistoryRepository;
pub use record::SqlRecordRepository;
pub use snapshot::SqlSnapshotRepository;
pub use team::SqlTeamRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Maps a unique-constraint violation to `Conflict`, anything else to `Database`.
    pub(crate) fn from_write(error: sqlx::Error, what: impl FnOnce() -> String) -> Self {
        match &error {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict(what()),
            _ => Self::Database(error),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[async_trait]
pub trait CompanyRepository: Send + Sync {
    async fn create(&self, company: &Company) -> Result<(), RepositoryError>;
    async fn find(&self, company_id: &CompanyId) -> Result<Option<Company>, RepositoryError>;
    /// Every tenant id; the only operation that is not scoped to one company.
    async fn list_ids(&self) -> Result<Vec<CompanyId>, RepositoryError>;
    async fn update_profile(
        &self,
        company_id: &CompanyId,
        profile: &CompanyProfile,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    async fn connect_tool(
        &self,
        company_id: &CompanyId,
        category: ToolCategory,
        connection: ToolConnection,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// Replaces the agent configs only while the stored value still equals
    /// `expected`; false means the company is gone or was written in between.
    async fn update_agent_configs(
        &self,
        company_id: &CompanyId,
        expected: &AgentConfigs,
        configs: &AgentConfigs,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    async fn update_clarity_score(
        &self,
        company_id: &CompanyId,
        score: u8,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn find_by_key(
        &self,
        key: &SyncKey,
        kind: RecordKind,
    ) -> Result<Option<SyncedRecord>, RepositoryError>;
    async fn find(
        &self,
        company_id: &CompanyId,
        kind: RecordKind,
        id: &RecordId,
    ) -> Result<Option<SyncedRecord>, RepositoryError>;
    /// Inserts a new record and its events in one transaction. A second row
    /// for the same idempotency triple fails with `Conflict`.
    async fn insert(&self, record: &SyncedRecord, events: &[Event]) -> Result<(), RepositoryError>;
    /// Writes a merged record and its events if the stored `row_version`
    /// still equals `record.meta.row_version`. Returns `false` when another
    /// writer got there first.
    async fn update(&self, record: &SyncedRecord, events: &[Event]) -> Result<bool, RepositoryError>;
    async fn list(
        &self,
        company_id: &CompanyId,
        kind: RecordKind,
    ) -> Result<Vec<SyncedRecord>, RepositoryError>;
    async fn load_company_records(
        &self,
        company_id: &CompanyId,
    ) -> Result<CompanyRecords, RepositoryError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<(), RepositoryError>;
    async fn find(
        &self,
        company_id: &CompanyId,
        event_id: &EventId,
    ) -> Result<Option<Event>, RepositoryError>;
    async fn fetch_unprocessed(
        &self,
        company_id: &CompanyId,
        limit: u32,
    ) -> Result<Vec<Event>, RepositoryError>;
    /// Leases up to `limit` unprocessed events to `worker_id`. Each event is
    /// claimed with its own conditional update.
    async fn claim(
        &self,
        company_id: &CompanyId,
        worker_id: &str,
        lease: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>, RepositoryError>;
    async fn mark_processed(
        &self,
        company_id: &CompanyId,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, RepositoryError>;
    async fn release(
        &self,
        company_id: &CompanyId,
        event_id: &EventId,
        worker_id: &str,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ActionRepository: Send + Sync {
    /// A duplicate idempotency key fails with `Conflict`.
    async fn insert_pending(&self, action: &PendingAction) -> Result<(), RepositoryError>;
    async fn find(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
    ) -> Result<Option<PendingAction>, RepositoryError>;
    async fn find_by_idempotency_key(
        &self,
        company_id: &CompanyId,
        idempotency_key: &str,
    ) -> Result<Option<PendingAction>, RepositoryError>;
    async fn list_by_status(
        &self,
        company_id: &CompanyId,
        status: ActionStatus,
    ) -> Result<Vec<PendingAction>, RepositoryError>;
    /// Moves a `pending` action to `to`, recording who decided.
    async fn decide(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        to: ActionStatus,
        decided_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// Conditional status change; `false` when the row is not in `from`.
    async fn transition(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, RepositoryError>;
    /// Moves an `executing` action to its terminal status.
    async fn finish(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        to: ActionStatus,
        result: Option<&ActionResult>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    async fn append_log(&self, log: &ActionLog) -> Result<(), RepositoryError>;
    async fn list_logs(
        &self,
        company_id: &CompanyId,
        action_id: Option<&ActionId>,
    ) -> Result<Vec<ActionLog>, RepositoryError>;
    async fn latest_log(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
    ) -> Result<Option<ActionLog>, RepositoryError>;
}

#[async_trait]
pub trait AgentRunRepository: Send + Sync {
    async fn insert(&self, run: &AgentRun) -> Result<(), RepositoryError>;
    async fn find(
        &self,
        company_id: &CompanyId,
        run_id: &AgentRunId,
    ) -> Result<Option<AgentRun>, RepositoryError>;
    /// Persists a finished run if the stored row is still open.
    async fn finish(&self, run: &AgentRun) -> Result<bool, RepositoryError>;
    async fn list(&self, company_id: &CompanyId, limit: u32)
        -> Result<Vec<AgentRun>, RepositoryError>;
}

/// Snapshot rows, one per company. Each save overwrites the row and, when
/// given, publishes `event` in the same transaction.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn find_forecast(&self, company_id: &CompanyId)
        -> Result<Option<Forecast>, RepositoryError>;
    async fn save_forecast(
        &self,
        company_id: &CompanyId,
        forecast: &Forecast,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError>;
    async fn find_cash_forecast(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<CashForecast>, RepositoryError>;
    async fn save_cash_forecast(
        &self,
        company_id: &CompanyId,
        forecast: &CashForecast,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError>;
    async fn find_process_metrics(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ProcessMetrics>, RepositoryError>;
    async fn save_process_metrics(
        &self,
        company_id: &CompanyId,
        metrics: &ProcessMetrics,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError>;
    async fn find_cac_metrics(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<CacMetrics>, RepositoryError>;
    async fn save_cac_metrics(
        &self,
        company_id: &CompanyId,
        metrics: &CacMetrics,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError>;
    async fn load_all(&self, company_id: &CompanyId) -> Result<SnapshotSet, RepositoryError>;
}

/// Append-only history. Inserts return `false` when the uniqueness
/// constraint already holds a row for the same cycle.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn insert_invoice_reminder(
        &self,
        reminder: &InvoiceReminder,
        event: &Event,
    ) -> Result<bool, RepositoryError>;
    async fn list_invoice_reminders(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<InvoiceReminder>, RepositoryError>;
    async fn insert_task_reminder(
        &self,
        reminder: &TaskReminder,
        event: &Event,
    ) -> Result<bool, RepositoryError>;
    async fn list_task_reminders(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<TaskReminder>, RepositoryError>;
    async fn insert_win_loss(&self, analysis: &WinLossAnalysis) -> Result<bool, RepositoryError>;
    async fn list_win_loss(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<WinLossAnalysis>, RepositoryError>;
    async fn analyzed_deal_ids(
        &self,
        company_id: &CompanyId,
    ) -> Result<BTreeSet<RecordId>, RepositoryError>;
}

#[async_trait]
pub trait TeamRepository: Send + Sync {
    async fn add_member(&self, member: &TeamMember) -> Result<(), RepositoryError>;
    async fn list_members(&self, company_id: &CompanyId)
        -> Result<Vec<TeamMember>, RepositoryError>;
    async fn upsert_credential(&self, credential: &Credential) -> Result<(), RepositoryError>;
    async fn find_credential(
        &self,
        company_id: &CompanyId,
        tool: &str,
    ) -> Result<Option<Credential>, RepositoryError>;
}

/// Every repository over one pool.
#[derive(Clone)]
pub struct Store {
    pub companies: Arc<dyn CompanyRepository>,
    pub records: Arc<dyn RecordRepository>,
    pub events: Arc<dyn EventRepository>,
    pub actions: Arc<dyn ActionRepository>,
    pub agent_runs: Arc<dyn AgentRunRepository>,
    pub snapshots: Arc<dyn SnapshotRepository>,
    pub history: Arc<dyn HistoryRepository>,
    pub team: Arc<dyn TeamRepository>,
}

impl Store {
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            companies: Arc::new(SqlCompanyRepository::new(pool.clone())),
            records: Arc::new(SqlRecordRepository::new(pool.clone())),
            events: Arc::new(SqlEventRepository::new(pool.clone())),
            actions: Arc::new(SqlActionRepository::new(pool.clone())),
            agent_runs: Arc::new(SqlAgentRunRepository::new(pool.clone())),
            snapshots: Arc::new(SqlSnapshotRepository::new(pool.clone())),
            history: Arc::new(SqlHistoryRepository::new(pool.clone())),
            team: Arc::new(SqlTeamRepository::new(pool)),
        }
    }
}
