//! Periodic per-tenant jobs.
//!
//! Each round fans out over every company on a `JoinSet`, with at most
//! `max_concurrent_tenants` running at once. Tenants never wait on each
//! other's results; a failing tenant is logged and the round moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use kuria_core::config::SchedulerConfig;
use kuria_core::domain::company::CompanyId;
use kuria_db::repositories::{RepositoryError, Store};

use crate::analytics::AnalyticsService;
use crate::router::EventRouter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantJob {
    /// Dispatch unprocessed events.
    Route,
    /// Recompute snapshots, then reminders and win/loss rows.
    Analytics,
}

impl TenantJob {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::Analytics => "analytics",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub tenants: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct TenantScheduler {
    store: Store,
    router: Arc<EventRouter>,
    analytics: Arc<AnalyticsService>,
    config: SchedulerConfig,
}

impl TenantScheduler {
    pub fn new(
        store: Store,
        router: Arc<EventRouter>,
        analytics: Arc<AnalyticsService>,
        config: SchedulerConfig,
    ) -> Self {
        Self { store, router, analytics, config }
    }

    /// Runs `job` once for every tenant.
    pub async fn run_round(
        &self,
        job: TenantJob,
        now: DateTime<Utc>,
    ) -> Result<RoundReport, RepositoryError> {
        let tenants = self.store.companies.list_ids().await?;
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tenants.max(1) as usize));
        let mut tasks = JoinSet::new();

        for company_id in tenants.iter().cloned() {
            let permits = Arc::clone(&permits);
            let router = Arc::clone(&self.router);
            let analytics = Arc::clone(&self.analytics);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(|error| error.to_string())?;
                run_job(job, &company_id, &router, &analytics, now).await.map_err(|error| {
                    warn!(
                        event_name = "scheduler.tenant.failed",
                        company_id = %company_id,
                        job = job.as_str(),
                        error = %error,
                        "tenant job failed"
                    );
                    error
                })
            });
        }

        let mut report = RoundReport { tenants: tenants.len(), ..RoundReport::default() };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(_)) => report.failed += 1,
                Err(join_error) => {
                    error!(
                        event_name = "scheduler.tenant.panicked",
                        job = job.as_str(),
                        error = %join_error,
                        "tenant task did not complete"
                    );
                    report.failed += 1;
                }
            }
        }

        debug!(
            event_name = "scheduler.round.completed",
            job = job.as_str(),
            tenants = report.tenants,
            succeeded = report.succeeded,
            failed = report.failed,
            "round completed"
        );
        Ok(report)
    }

    /// Ticks both jobs until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!(event_name = "scheduler.disabled", "scheduler disabled by configuration");
            return;
        }

        let mut route_tick =
            tokio::time::interval(Duration::from_secs(self.config.route_interval_secs.max(1)));
        let mut analytics_tick =
            tokio::time::interval(Duration::from_secs(self.config.analytics_interval_secs.max(1)));
        route_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        analytics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            event_name = "scheduler.started",
            route_interval_secs = self.config.route_interval_secs,
            analytics_interval_secs = self.config.analytics_interval_secs,
            max_concurrent_tenants = self.config.max_concurrent_tenants,
            "scheduler started"
        );

        loop {
            let job = tokio::select! {
                _ = route_tick.tick() => TenantJob::Route,
                _ = analytics_tick.tick() => TenantJob::Analytics,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            if let Err(error) = self.run_round(job, Utc::now()).await {
                error!(
                    event_name = "scheduler.round.failed",
                    job = job.as_str(),
                    error = %error,
                    "could not list tenants"
                );
            }
        }

        info!(event_name = "scheduler.stopped", "scheduler stopped");
    }
}

async fn run_job(
    job: TenantJob,
    company_id: &CompanyId,
    router: &EventRouter,
    analytics: &AnalyticsService,
    now: DateTime<Utc>,
) -> Result<(), String> {
    match job {
        TenantJob::Route => {
            router.dispatch_pending(company_id, now).await.map_err(|error| error.to_string())?;
        }
        TenantJob::Analytics => {
            analytics.recompute(company_id, now).await.map_err(|error| error.to_string())?;
            analytics.run_reminders(company_id, now).await.map_err(|error| error.to_string())?;
            analytics.analyze_win_loss(company_id, now).await.map_err(|error| error.to_string())?;
        }
    }
    Ok(())
}
