use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use kuria_core::config::AppConfig;
use kuria_core::domain::action::{
    ActionLogStatus, ActionPayload, ActionPreview, ActionProposal, ActionResult, ActionStatus,
    PendingAction, RiskTier,
};
use kuria_core::domain::company::{Company, CompanyId};
use kuria_core::governance::EMPTY_FAILURE_MESSAGE;
use kuria_core::domain::event::{EventPayload, MarkOutcome};
use kuria_core::domain::record::{
    DealFields, DealStatus, ExpenseFields, InvoiceFields, InvoiceStatus, RawRecord, RecordFields,
    RecordKind, SyncedRecord,
};
use kuria_db::repositories::Store;
use kuria_db::{connect_with_settings, migrations};
use kuria_runtime::{ActionDispatcher, DispatchError, Runtime, SnapshotStatus};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, day, hour, 0, 0).unwrap()
}

/// Succeeds unless switched to failing.
#[derive(Default)]
struct FakeDispatcher {
    failing: AtomicBool,
}

#[async_trait]
impl ActionDispatcher for FakeDispatcher {
    async fn dispatch(
        &self,
        _company_id: &CompanyId,
        action: &PendingAction,
    ) -> Result<ActionResult, DispatchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Failed("gateway returned 502".to_string()));
        }
        Ok(ActionResult::from_value(json!({ "dispatched": action.action_type() })))
    }
}

async fn runtime(tenants: &[&str]) -> (Runtime, Arc<FakeDispatcher>) {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("pool");
    migrations::run_pending(&pool).await.expect("migrations");
    let store = Store::sqlite(pool);
    for id in tenants {
        store
            .companies
            .create(&Company::new(CompanyId(id.to_string()), *id, at(1, 0)))
            .await
            .expect("company");
    }

    let mut config = AppConfig::default();
    config.governance.retry_base_delay_ms = 1;
    config.governance.retry_backoff_multiplier = 1;
    let dispatcher = Arc::new(FakeDispatcher::default());
    (Runtime::new(store, &config, dispatcher.clone()), dispatcher)
}

fn company(id: &str) -> CompanyId {
    CompanyId(id.to_string())
}

fn hubspot_deal(raw_id: &str, amount: i64, updated_at: DateTime<Utc>) -> RawRecord {
    RawRecord {
        connector_source: "hubspot".to_string(),
        raw_id: raw_id.to_string(),
        source_updated_at: updated_at,
        fields: RecordFields::Deal(DealFields {
            amount: Some(Decimal::new(amount, 0)),
            stage: Some("proposal".to_string()),
            status: Some(DealStatus::Active),
            ..Default::default()
        }),
    }
}

fn proposal(level: RiskTier, payload: ActionPayload) -> ActionProposal {
    ActionProposal {
        level,
        agent: "revenue_velocity".to_string(),
        payload,
        description: String::new(),
        preview: ActionPreview::None,
        idempotency_key: None,
    }
}

fn note(deal_id: &str) -> ActionPayload {
    ActionPayload::AddDealNote { deal_id: deal_id.to_string(), note: "follow up".to_string() }
}

#[tokio::test]
async fn resyncing_a_deal_updates_the_single_row() {
    let (runtime, _) = runtime(&["acme"]).await;
    let acme = company("acme");

    let first = runtime.sync.sync(&acme, hubspot_deal("D1", 1_000, at(2, 8)), at(2, 9)).await.expect("first");
    let second =
        runtime.sync.sync(&acme, hubspot_deal("D1", 1_500, at(3, 8)), at(3, 9)).await.expect("second");

    assert_eq!(second.record_id, first.record_id);
    let deals = runtime.store.records.list(&acme, RecordKind::Deal).await.expect("list");
    assert_eq!(deals.len(), 1);
    let SyncedRecord::Deal(deal) = &deals[0] else { panic!("expected a deal") };
    assert_eq!(deal.amount, Some(Decimal::new(1_500, 0)));
    assert_eq!(deal.meta.synced_at, at(3, 9));
}

#[tokio::test]
async fn identical_resync_only_advances_synced_at() {
    let (runtime, _) = runtime(&["acme"]).await;
    let acme = company("acme");

    let first = runtime.sync.sync(&acme, hubspot_deal("D1", 1_000, at(2, 8)), at(2, 9)).await.expect("first");
    let second = runtime.sync.sync(&acme, hubspot_deal("D1", 1_000, at(2, 8)), at(4, 9)).await.expect("second");

    assert_eq!(second.record_id, first.record_id);
    assert!(second.changed_fields.is_empty());
    assert!(second.events.is_empty());
    let stored = runtime
        .store
        .records
        .find(&acme, RecordKind::Deal, &first.record_id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(stored.meta().synced_at, at(4, 9));
}

#[tokio::test]
async fn tenants_never_see_each_others_rows() {
    let (runtime, _) = runtime(&["acme", "globex"]).await;
    let (acme, globex) = (company("acme"), company("globex"));

    let deal = runtime.sync.sync(&acme, hubspot_deal("D1", 1_000, at(2, 8)), at(2, 9)).await.expect("sync");
    let pending = runtime
        .governor
        .submit(&acme, proposal(RiskTier::B, note("D1")), at(2, 10))
        .await
        .expect("submit");

    assert!(runtime.store.records.list(&globex, RecordKind::Deal).await.expect("list").is_empty());
    assert!(runtime
        .store
        .records
        .find(&globex, RecordKind::Deal, &deal.record_id)
        .await
        .expect("find")
        .is_none());
    assert!(runtime.router.fetch_unprocessed(&globex, 100).await.expect("events").is_empty());
    assert!(runtime.governor.list_pending(&globex).await.expect("pending").is_empty());
    assert!(runtime.governor.approve(&globex, &pending.action_id, "mallory", at(2, 11)).await.is_err());
    assert_eq!(
        runtime.governor.receipt(&acme, &pending.action_id).await.expect("receipt").status,
        ActionStatus::Pending
    );

    let same_raw_id =
        runtime.sync.sync(&globex, hubspot_deal("D1", 9_999, at(2, 8)), at(2, 9)).await.expect("globex");
    assert_ne!(same_raw_id.record_id, deal.record_id);
}

#[tokio::test]
async fn redelivered_event_leaves_the_same_end_state() {
    let (runtime, _) = runtime(&["acme"]).await;
    let acme = company("acme");
    let event = runtime
        .router
        .publish(
            &acme,
            EventPayload::CacUpdated {
                blended_cac: Decimal::new(250, 0),
                cac_by_source: BTreeMap::from([("referral".to_string(), Decimal::new(90, 0))]),
                top_source: Some("referral".to_string()),
            },
            at(5, 8),
        )
        .await
        .expect("publish");

    let report = runtime.router.dispatch_pending(&acme, at(5, 9)).await.expect("dispatch");
    assert_eq!(report.processed, 1);
    let once = runtime.store.companies.find(&acme).await.expect("find").expect("company");

    assert_eq!(
        runtime.router.mark_processed(&acme, &event.id, at(5, 10)).await.expect("mark"),
        MarkOutcome::AlreadyProcessed
    );
    let again = runtime.router.dispatch_pending(&acme, at(5, 11)).await.expect("dispatch");
    assert_eq!(again.claimed, 0);
    let twice = runtime.store.companies.find(&acme).await.expect("find").expect("company");
    assert_eq!(twice.agent_configs, once.agent_configs);
    assert_eq!(
        once.agent_configs.revenue_velocity.top_acquisition_source.as_deref(),
        Some("referral")
    );
}

#[tokio::test]
async fn tier_b_passes_through_approved_and_tier_a_never_waits() {
    let (runtime, _) = runtime(&["acme"]).await;
    let acme = company("acme");

    let auto = runtime.governor.submit(&acme, proposal(RiskTier::A, note("D1")), at(6, 8)).await.expect("a");
    assert_eq!(auto.status, ActionStatus::Succeeded);

    let supervised =
        runtime.governor.submit(&acme, proposal(RiskTier::B, note("D2")), at(6, 8)).await.expect("b");
    assert_eq!(supervised.status, ActionStatus::Pending);
    assert!(runtime.governor.resume_approved(&acme, &supervised.action_id).await.is_err());
    assert!(runtime
        .governor
        .list_logs(&acme, Some(&supervised.action_id))
        .await
        .expect("logs")
        .is_empty());

    let executed = runtime
        .governor
        .approve(&acme, &supervised.action_id, "ines", at(6, 9))
        .await
        .expect("approve");
    assert_eq!(executed.status, ActionStatus::Succeeded);
    let row = runtime.store.actions.find(&acme, &supervised.action_id).await.expect("find").expect("row");
    assert_eq!(row.decided_by.as_deref(), Some("ines"));
}

#[tokio::test]
async fn every_audit_row_counts_attempts_and_failures_keep_the_error() {
    let (runtime, dispatcher) = runtime(&["acme"]).await;
    let acme = company("acme");
    runtime.governor.submit(&acme, proposal(RiskTier::A, note("D1")), at(7, 8)).await.expect("ok");
    dispatcher.failing.store(true, Ordering::SeqCst);

    let failed = runtime.governor.submit(&acme, proposal(RiskTier::A, note("D2")), at(7, 9)).await.expect("failed");

    assert_eq!(failed.status, ActionStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("gateway returned 502"));
    let logs = runtime.governor.list_logs(&acme, None).await.expect("logs");
    assert!(logs.iter().all(|log| log.attempts >= 1));
    let terminal: Vec<_> = logs
        .iter()
        .filter(|log| log.action_id == failed.action_id && log.status == ActionLogStatus::Failed)
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].attempts, 3);
    assert!(terminal[0].error.as_deref().is_some_and(|error| !error.is_empty()));
}

/// Fails every dispatch without saying why.
struct SilentFailure;

#[async_trait]
impl ActionDispatcher for SilentFailure {
    async fn dispatch(
        &self,
        _company_id: &CompanyId,
        _action: &PendingAction,
    ) -> Result<ActionResult, DispatchError> {
        Err(DispatchError::Failed(String::new()))
    }
}

#[tokio::test]
async fn blank_dispatch_error_still_ends_in_failed() {
    let (seeded, _) = runtime(&["acme"]).await;
    let mut config = AppConfig::default();
    config.governance.retry_base_delay_ms = 1;
    config.governance.retry_backoff_multiplier = 1;
    let runtime = Runtime::new(seeded.store.clone(), &config, Arc::new(SilentFailure));
    let acme = company("acme");

    let failed = runtime
        .governor
        .submit(&acme, proposal(RiskTier::A, note("D3")), at(7, 10))
        .await
        .expect("a blank error is still a recorded failure");

    assert_eq!(failed.status, ActionStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some(EMPTY_FAILURE_MESSAGE));
    let stuck = runtime
        .store
        .actions
        .list_by_status(&acme, ActionStatus::Executing)
        .await
        .expect("executing");
    assert!(stuck.is_empty());
    let logs = runtime.governor.list_logs(&acme, Some(&failed.action_id)).await.expect("logs");
    assert!(logs
        .iter()
        .filter(|log| log.status != ActionLogStatus::Executing)
        .all(|log| log.error.as_deref().is_some_and(|error| !error.is_empty())));
}

#[tokio::test]
async fn rejected_refund_leaves_no_audit_rows() {
    let (runtime, _) = runtime(&["acme"]).await;
    let acme = company("acme");
    let refund = ActionPayload::IssueRefund {
        client_id: "cl-9".to_string(),
        amount: Decimal::new(5_000, 0),
        currency: "EUR".to_string(),
    };

    let pending = runtime.governor.submit(&acme, proposal(RiskTier::C, refund), at(8, 8)).await.expect("submit");
    assert_eq!(pending.status, ActionStatus::Pending);

    let rejected = runtime
        .governor
        .reject(&acme, &pending.action_id, "ines", at(8, 9))
        .await
        .expect("reject");

    assert_eq!(rejected.status, ActionStatus::Rejected);
    assert!(runtime
        .governor
        .list_logs(&acme, Some(&pending.action_id))
        .await
        .expect("logs")
        .is_empty());
}

#[tokio::test]
async fn cac_is_stable_across_recomputes() {
    let (runtime, _) = runtime(&["acme"]).await;
    let acme = company("acme");
    for (raw_id, source) in [("D1", "referral"), ("D2", "ads"), ("D3", "referral")] {
        let raw = RawRecord {
            connector_source: "hubspot".to_string(),
            raw_id: raw_id.to_string(),
            source_updated_at: at(9, 8),
            fields: RecordFields::Deal(DealFields {
                amount: Some(Decimal::new(8_000, 0)),
                status: Some(DealStatus::Won),
                source: Some(source.to_string()),
                created_at: Some(at(1, 8)),
                closed_at: Some(at(9, 8)),
                ..Default::default()
            }),
        };
        runtime.sync.sync(&acme, raw, at(9, 9)).await.expect("deal");
    }
    let spend = RawRecord {
        connector_source: "quickbooks".to_string(),
        raw_id: "E1".to_string(),
        source_updated_at: at(9, 8),
        fields: RecordFields::Expense(ExpenseFields {
            amount: Some(Decimal::new(900, 0)),
            category: Some("Marketing".to_string()),
            date: Some(at(9, 8).date_naive()),
            ..Default::default()
        }),
    };
    runtime.sync.sync(&acme, spend, at(9, 9)).await.expect("expense");

    runtime.analytics.recompute(&acme, at(10, 8)).await.expect("first");
    let first = runtime.store.snapshots.find_cac_metrics(&acme).await.expect("find").expect("row");
    let report = runtime.analytics.recompute(&acme, at(10, 9)).await.expect("second");
    let second = runtime.store.snapshots.find_cac_metrics(&acme).await.expect("find").expect("row");

    assert_eq!(report.cac_metrics, SnapshotStatus::Unchanged);
    assert_eq!(first.blended_cac, Decimal::new(300, 0));
    assert_eq!(second.blended_cac, first.blended_cac);
    assert_eq!(second.total_clients, first.total_clients);
    assert_eq!(second.cac_by_source, first.cac_by_source);
    assert_eq!(second.computed_at, at(10, 9));
}

#[tokio::test]
async fn ten_day_overdue_invoice_gets_one_first_reminder() {
    let (runtime, _) = runtime(&["acme"]).await;
    let acme = company("acme");
    let now = at(20, 9);
    let invoice = RawRecord {
        connector_source: "xero".to_string(),
        raw_id: "INV-42".to_string(),
        source_updated_at: at(10, 9),
        fields: RecordFields::Invoice(InvoiceFields {
            amount: Some(Decimal::new(2_400, 0)),
            status: Some(InvoiceStatus::Overdue),
            issued_at: Some(at(1, 9)),
            due_at: Some(now - Duration::days(10)),
            ..Default::default()
        }),
    };
    runtime.sync.sync(&acme, invoice, at(10, 10)).await.expect("invoice");

    let first = runtime.analytics.run_reminders(&acme, now).await.expect("first");
    let again = runtime.analytics.run_reminders(&acme, now + Duration::hours(3)).await.expect("again");

    assert_eq!(first.invoice_reminders, 1);
    assert_eq!(again.invoice_reminders, 0);
    let reminders = runtime.store.history.list_invoice_reminders(&acme).await.expect("list");
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].reminder_number, 1);
    assert_eq!(reminders[0].days_overdue, 10);
}
