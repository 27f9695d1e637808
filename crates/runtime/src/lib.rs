//! Async services over the canonical store.
//!
//! Each service owns one side of the store: the sync engine writes records,
//! the router owns the `processed` transition, the governor owns action rows
//! and the analytics service owns snapshots and history.

use std::sync::Arc;

use kuria_core::config::AppConfig;
use kuria_db::repositories::Store;

pub mod agent_runs;
pub mod analytics;
pub mod errors;
pub mod governance;
pub mod router;
pub mod scheduler;
pub mod sync;

pub use agent_runs::{AgentRunError, AgentRunRecorder};
pub use analytics::{
    AnalyticsError, AnalyticsService, RecomputeReport, ReminderReport, SnapshotStatus,
};
pub use governance::{ActionDispatcher, ActionGovernor, DispatchError, GovernanceError};
pub use router::{AgentConfigHandler, DispatchReport, EventHandler, EventRouter, RouterError};
pub use scheduler::{RoundReport, TenantJob, TenantScheduler};
pub use sync::{SyncEngine, SyncError, SyncOutcome};

/// Every service wired over one store.
#[derive(Clone)]
pub struct Runtime {
    pub store: Store,
    pub sync: Arc<SyncEngine>,
    pub router: Arc<EventRouter>,
    pub governor: Arc<ActionGovernor>,
    pub analytics: Arc<AnalyticsService>,
    pub agent_runs: Arc<AgentRunRecorder>,
}

impl Runtime {
    pub fn new(store: Store, config: &AppConfig, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self {
            sync: Arc::new(SyncEngine::new(store.clone(), config.sync.max_conflict_retries)),
            router: Arc::new(EventRouter::new(store.clone(), &config.router)),
            governor: Arc::new(ActionGovernor::new(store.clone(), &config.governance, dispatcher)),
            analytics: Arc::new(AnalyticsService::new(store.clone())),
            agent_runs: Arc::new(AgentRunRecorder::new(store.clone())),
            store,
        }
    }

    pub fn scheduler(&self, config: &AppConfig) -> TenantScheduler {
        TenantScheduler::new(
            self.store.clone(),
            self.router.clone(),
            self.analytics.clone(),
            config.scheduler.clone(),
        )
    }
}
