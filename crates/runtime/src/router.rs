use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kuria_core::config::RouterConfig;
use kuria_core::domain::company::CompanyId;
use kuria_core::domain::event::{Event, EventId, EventPayload, MarkOutcome};
use kuria_core::routing::{self, RoutingDecision};
use kuria_db::repositories::{RepositoryError, Store};

const MAX_LEASE_SECS: u64 = 24 * 60 * 60;
const MAX_CONFIG_WRITE_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<RepositoryError> for HandlerError {
    fn from(value: RepositoryError) -> Self {
        Self(value.to_string())
    }
}

/// A consumer of published events. Handlers must be idempotent: an event can
/// be delivered again after a crash or an expired lease.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn handles(&self, event_type: &str) -> bool;
    async fn handle(&self, event: &Event, now: DateTime<Utc>) -> Result<(), HandlerError>;
}

/// Writes cross-agent signals into the company's agent configuration.
pub struct AgentConfigHandler {
    store: Store,
}

impl AgentConfigHandler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for AgentConfigHandler {
    fn name(&self) -> &'static str {
        "agent_configs"
    }

    fn handles(&self, event_type: &str) -> bool {
        routing::is_routed(event_type)
    }

    async fn handle(&self, event: &Event, now: DateTime<Utc>) -> Result<(), HandlerError> {
        for attempt in 1..=MAX_CONFIG_WRITE_ATTEMPTS {
            let company = self
                .store
                .companies
                .find(&event.company_id)
                .await?
                .ok_or_else(|| HandlerError(format!("unknown company `{}`", event.company_id)))?;

            let next = match routing::route(event, &company.agent_configs) {
                RoutingDecision::UpdateAgentConfigs(next) => next,
                RoutingDecision::Unchanged | RoutingDecision::Unrouted => return Ok(()),
            };
            if self
                .store
                .companies
                .update_agent_configs(&company.id, &company.agent_configs, &next, now)
                .await?
            {
                return Ok(());
            }

            debug!(
                event_name = "router.agent_configs.write_conflict",
                company_id = %company.id,
                event_id = %event.id,
                attempt,
                "agent configs changed underneath, re-reading"
            );
        }

        Err(HandlerError(format!(
            "agent configs of `{}` kept changing after {MAX_CONFIG_WRITE_ATTEMPTS} attempts",
            event.company_id
        )))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: u32,
    pub processed: u32,
    pub unrouted: u32,
    pub redelivered: u32,
    pub failed: u32,
}

/// Claim-and-lease delivery of a company's unprocessed events.
pub struct EventRouter {
    store: Store,
    handlers: Vec<Arc<dyn EventHandler>>,
    worker_id: String,
    lease: Duration,
    batch_size: u32,
}

impl EventRouter {
    /// Router with the built-in agent configuration handler registered.
    pub fn new(store: Store, config: &RouterConfig) -> Self {
        let lease = Duration::seconds(config.lease_secs.clamp(1, MAX_LEASE_SECS) as i64);
        Self {
            handlers: vec![Arc::new(AgentConfigHandler::new(store.clone()))],
            store,
            worker_id: config.worker_id.clone(),
            lease,
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn publish(
        &self,
        company_id: &CompanyId,
        payload: EventPayload,
        now: DateTime<Utc>,
    ) -> Result<Event, RouterError> {
        let event = Event::new(EventId(Uuid::new_v4().to_string()), company_id.clone(), payload, now);
        self.store.events.publish(&event).await?;
        debug!(
            event_name = "router.event.published",
            company_id = %company_id,
            event_id = %event.id,
            event_type = event.event_type(),
            "event published"
        );
        Ok(event)
    }

    pub async fn fetch_unprocessed(
        &self,
        company_id: &CompanyId,
        limit: u32,
    ) -> Result<Vec<Event>, RouterError> {
        Ok(self.store.events.fetch_unprocessed(company_id, limit).await?)
    }

    pub async fn claim(
        &self,
        company_id: &CompanyId,
        worker_id: &str,
        lease: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>, RouterError> {
        Ok(self.store.events.claim(company_id, worker_id, lease, limit, now).await?)
    }

    pub async fn mark_processed(
        &self,
        company_id: &CompanyId,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, RouterError> {
        let outcome = self.store.events.mark_processed(company_id, event_id, now).await?;
        if outcome == MarkOutcome::AlreadyProcessed {
            debug!(
                event_name = "router.event.redelivered",
                company_id = %company_id,
                event_id = %event_id,
                "event was already processed"
            );
        }
        Ok(outcome)
    }

    pub async fn release(
        &self,
        company_id: &CompanyId,
        event_id: &EventId,
        worker_id: &str,
    ) -> Result<bool, RouterError> {
        Ok(self.store.events.release(company_id, event_id, worker_id).await?)
    }

    /// Claims one batch and runs the matching handlers in registration order.
    ///
    /// An event whose handler fails is released and stays unprocessed.
    pub async fn dispatch_pending(
        &self,
        company_id: &CompanyId,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, RouterError> {
        let events = self
            .store
            .events
            .claim(company_id, &self.worker_id, self.lease, self.batch_size, now)
            .await?;
        let mut report =
            DispatchReport { claimed: events.len() as u32, ..DispatchReport::default() };

        for event in &events {
            let handlers: Vec<&Arc<dyn EventHandler>> =
                self.handlers.iter().filter(|handler| handler.handles(event.event_type())).collect();
            if handlers.is_empty() {
                report.unrouted += 1;
            }

            let mut failure = None;
            for handler in handlers {
                if let Err(error) = handler.handle(event, now).await {
                    failure = Some((handler.name(), error));
                    break;
                }
            }

            if let Some((handler, error)) = failure {
                warn!(
                    event_name = "router.handler.failed",
                    company_id = %company_id,
                    event_id = %event.id,
                    event_type = event.event_type(),
                    handler,
                    error = %error,
                    "event handler failed, releasing for redelivery"
                );
                self.store.events.release(company_id, &event.id, &self.worker_id).await?;
                report.failed += 1;
                continue;
            }

            match self.mark_processed(company_id, &event.id, now).await? {
                MarkOutcome::Marked => report.processed += 1,
                MarkOutcome::AlreadyProcessed => report.redelivered += 1,
                MarkOutcome::NotFound => {}
            }
        }

        if report.claimed > 0 {
            info!(
                event_name = "router.dispatch.completed",
                company_id = %company_id,
                claimed = report.claimed,
                processed = report.processed,
                unrouted = report.unrouted,
                failed = report.failed,
                "event batch dispatched"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use kuria_core::config::RouterConfig;
    use kuria_core::domain::company::{
        AgentConfigs, Company, CompanyId, CompanyProfile, ToolCategory, ToolConnection,
    };
    use kuria_core::domain::event::{Event, EventPayload, MarkOutcome};
    use kuria_core::domain::record::RecordId;
    use kuria_db::repositories::{CompanyRepository, RepositoryError, Store};
    use kuria_db::{connect_with_settings, migrations};

    use super::{AgentConfigHandler, EventHandler, EventRouter, HandlerError};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, hour, 0, 0).unwrap()
    }

    fn config() -> RouterConfig {
        RouterConfig { batch_size: 10, lease_secs: 60, worker_id: "router-test".to_string() }
    }

    async fn store_with_company(id: &str) -> (Store, CompanyId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrations");
        let store = Store::sqlite(pool);
        let company_id = CompanyId(id.to_string());
        store.companies.create(&Company::new(company_id.clone(), "Acme", at(0))).await.expect("company");
        (store, company_id)
    }

    fn cac_updated() -> EventPayload {
        EventPayload::CacUpdated {
            blended_cac: Decimal::new(300, 0),
            cac_by_source: BTreeMap::from([("referral".to_string(), Decimal::new(120, 0))]),
            top_source: Some("referral".to_string()),
        }
    }

    fn task_reminder(reminder_type: &str) -> EventPayload {
        EventPayload::TaskReminderDue {
            record_id: RecordId("t-1".to_string()),
            reminder_type: reminder_type.to_string(),
        }
    }

    struct Failing {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn handles(&self, event_type: &str) -> bool {
            event_type == "task_reminder_due"
        }

        async fn handle(&self, _event: &Event, _now: DateTime<Utc>) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError("agent endpoint unavailable".to_string()))
        }
    }

    /// Bumps the stagnation threshold just before each of the first `races`
    /// conditional configs writes.
    struct InterleavedWriter {
        inner: Arc<dyn CompanyRepository>,
        races: AtomicU32,
    }

    impl InterleavedWriter {
        fn new(inner: Arc<dyn CompanyRepository>, races: u32) -> Self {
            Self { inner, races: AtomicU32::new(races) }
        }
    }

    #[async_trait]
    impl CompanyRepository for InterleavedWriter {
        async fn create(&self, company: &Company) -> Result<(), RepositoryError> {
            self.inner.create(company).await
        }

        async fn find(&self, company_id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
            self.inner.find(company_id).await
        }

        async fn list_ids(&self) -> Result<Vec<CompanyId>, RepositoryError> {
            self.inner.list_ids().await
        }

        async fn update_profile(
            &self,
            company_id: &CompanyId,
            profile: &CompanyProfile,
            now: DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.inner.update_profile(company_id, profile, now).await
        }

        async fn connect_tool(
            &self,
            company_id: &CompanyId,
            category: ToolCategory,
            connection: ToolConnection,
            now: DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.inner.connect_tool(company_id, category, connection, now).await
        }

        async fn update_agent_configs(
            &self,
            company_id: &CompanyId,
            expected: &AgentConfigs,
            configs: &AgentConfigs,
            now: DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            let racing = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if racing {
                let mut rival = expected.clone();
                rival.revenue_velocity.stagnation_threshold_days += 1;
                assert!(self.inner.update_agent_configs(company_id, expected, &rival, now).await?);
            }
            self.inner.update_agent_configs(company_id, expected, configs, now).await
        }

        async fn update_clarity_score(
            &self,
            company_id: &CompanyId,
            score: u8,
            now: DateTime<Utc>,
        ) -> Result<bool, RepositoryError> {
            self.inner.update_clarity_score(company_id, score, now).await
        }
    }

    #[tokio::test]
    async fn routed_event_updates_agent_configs_and_is_marked() {
        let (store, acme) = store_with_company("acme").await;
        let router = EventRouter::new(store.clone(), &config());
        router.publish(&acme, cac_updated(), at(1)).await.expect("publish");

        let report = router.dispatch_pending(&acme, at(2)).await.expect("dispatch");
        assert_eq!(report.claimed, 1);
        assert_eq!(report.processed, 1);

        let company = store.companies.find(&acme).await.expect("find").expect("exists");
        let signals = &company.agent_configs.revenue_velocity;
        assert_eq!(signals.top_acquisition_source.as_deref(), Some("referral"));
        assert!(router.fetch_unprocessed(&acme, 10).await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn unrouted_events_are_still_marked_processed() {
        let (store, acme) = store_with_company("acme").await;
        let router = EventRouter::new(store.clone(), &config());
        let event =
            router.publish(&acme, task_reminder("overdue_alert"), at(1)).await.expect("publish");

        let report = router.dispatch_pending(&acme, at(2)).await.expect("dispatch");
        assert_eq!(report.unrouted, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(
            router.mark_processed(&acme, &event.id, at(3)).await.expect("mark"),
            MarkOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn failing_handler_leaves_the_event_for_redelivery() {
        let (store, acme) = store_with_company("acme").await;
        let failing = Arc::new(Failing { calls: AtomicU32::new(0) });
        let router = EventRouter::new(store.clone(), &config()).with_handler(failing.clone());
        router.publish(&acme, task_reminder("escalation"), at(1)).await.expect("publish");

        let first = router.dispatch_pending(&acme, at(2)).await.expect("first");
        assert_eq!(first.failed, 1);
        let second = router.dispatch_pending(&acme, at(2) + Duration::seconds(1)).await.expect("second");
        assert_eq!(second.claimed, 1);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
        assert_eq!(router.fetch_unprocessed(&acme, 10).await.expect("fetch").len(), 1);
    }

    #[tokio::test]
    async fn replaying_a_routed_event_does_not_change_the_outcome() {
        let (store, acme) = store_with_company("acme").await;
        let router = EventRouter::new(store.clone(), &config());
        let event = router.publish(&acme, cac_updated(), at(1)).await.expect("publish");

        let handler = AgentConfigHandler::new(store.clone());
        handler.handle(&event, at(2)).await.expect("first delivery");
        let once = store.companies.find(&acme).await.expect("find").expect("exists").agent_configs;
        handler.handle(&event, at(3)).await.expect("second delivery");
        let twice = store.companies.find(&acme).await.expect("find").expect("exists").agent_configs;
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn concurrent_config_write_is_kept_and_the_signal_reapplied() {
        let (store, acme) = store_with_company("acme").await;
        let racing = Store {
            companies: Arc::new(InterleavedWriter::new(store.companies.clone(), 1)),
            ..store.clone()
        };
        let router = EventRouter::new(racing.clone(), &config());
        let event = router.publish(&acme, cac_updated(), at(1)).await.expect("publish");

        AgentConfigHandler::new(racing).handle(&event, at(2)).await.expect("handled");

        let company = store.companies.find(&acme).await.expect("find").expect("exists");
        let signals = &company.agent_configs.revenue_velocity;
        let threshold = AgentConfigs::default().revenue_velocity.stagnation_threshold_days;
        assert_eq!(signals.stagnation_threshold_days, threshold + 1);
        assert_eq!(signals.top_acquisition_source.as_deref(), Some("referral"));
        assert_eq!(company.updated_at, at(2));
    }

    #[tokio::test]
    async fn configs_that_never_settle_fail_the_delivery() {
        let (store, acme) = store_with_company("acme").await;
        let racing = Store {
            companies: Arc::new(InterleavedWriter::new(
                store.companies.clone(),
                super::MAX_CONFIG_WRITE_ATTEMPTS,
            )),
            ..store.clone()
        };
        let router = EventRouter::new(racing.clone(), &config());
        router.publish(&acme, cac_updated(), at(1)).await.expect("publish");

        let report = router.dispatch_pending(&acme, at(2)).await.expect("dispatch");
        assert_eq!(report.failed, 1);
        assert_eq!(router.fetch_unprocessed(&acme, 10).await.expect("fetch").len(), 1);
        let company = store.companies.find(&acme).await.expect("find").expect("exists");
        assert_eq!(company.agent_configs.revenue_velocity.top_acquisition_source, None);
    }
}
