use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kuria_core::analytics::{
    analyze_closed_deals, compute_cac, compute_cash_forecast, compute_clarity_score,
    compute_forecast, compute_process_metrics, plan_invoice_reminders, plan_task_reminders,
    AnalyticsInputError,
};
use kuria_core::domain::company::{Company, CompanyId};
use kuria_core::domain::event::{Event, EventId, EventPayload};
use kuria_core::domain::history::{InvoiceReminder, TaskReminder};
use kuria_core::domain::metrics::{Snapshot, SnapshotKind};
use kuria_db::repositories::{RepositoryError, Store};

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("unknown company `{0}`")]
    UnknownCompany(CompanyId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// Values changed and an `*_updated` event went out with the row.
    Updated,
    /// Row rewritten with the same values; no event.
    Unchanged,
    /// Inputs were invalid; the prior row is untouched.
    Skipped { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecomputeReport {
    pub company_id: CompanyId,
    pub forecast: SnapshotStatus,
    pub cash_forecast: SnapshotStatus,
    pub process_metrics: SnapshotStatus,
    pub cac_metrics: SnapshotStatus,
    pub clarity_score: u8,
}

impl RecomputeReport {
    pub fn updated(&self) -> usize {
        [&self.forecast, &self.cash_forecast, &self.process_metrics, &self.cac_metrics]
            .into_iter()
            .filter(|status| **status == SnapshotStatus::Updated)
            .count()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub invoice_reminders: u32,
    pub task_reminders: u32,
}

/// Derives snapshots, reminders and win/loss rows from canonical records.
pub struct AnalyticsService {
    store: Store,
}

impl AnalyticsService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Recomputes every snapshot for one tenant. A snapshot whose inputs are
    /// invalid is skipped and the others still update.
    pub async fn recompute(
        &self,
        company_id: &CompanyId,
        now: DateTime<Utc>,
    ) -> Result<RecomputeReport, AnalyticsError> {
        let company = self.company(company_id).await?;
        let records = self.store.records.load_company_records(company_id).await?;
        let prior = self.store.snapshots.load_all(company_id).await?;
        let configs = &company.agent_configs;

        let forecast = compute_forecast(&records.deals, now);
        let forecast_status = match &forecast {
            Ok(next) => {
                let event = changed_event(company_id, prior.forecast.as_ref(), next, now, |value| {
                    EventPayload::ForecastUpdated {
                        forecast_30d: value.forecast_30d,
                        confidence: value.confidence,
                    }
                });
                self.store.snapshots.save_forecast(company_id, next, event.as_ref()).await?;
                status_of(event.as_ref())
            }
            Err(error) => skipped(company_id, SnapshotKind::Forecast, error),
        };

        let pipeline = forecast.as_ref().ok().or(prior.forecast.as_ref());
        let cash_status = match compute_cash_forecast(
            &records.invoices,
            &records.expenses,
            pipeline,
            &configs.cash_predictability,
            now,
        ) {
            Ok(next) => {
                let event =
                    changed_event(company_id, prior.cash_forecast.as_ref(), &next, now, |value| {
                        EventPayload::CashForecastUpdated {
                            days_until_critical: value.days_until_critical,
                            runway_months: value.runway_months,
                        }
                    });
                self.store.snapshots.save_cash_forecast(company_id, &next, event.as_ref()).await?;
                status_of(event.as_ref())
            }
            Err(error) => skipped(company_id, SnapshotKind::CashForecast, &error),
        };

        let process = compute_process_metrics(&records.tasks, now);
        let process_event =
            changed_event(company_id, prior.process_metrics.as_ref(), &process, now, |value| {
                EventPayload::ProcessMetricsUpdated {
                    overdue_tasks: value.overdue_tasks,
                    avg_cycle_time_days: value.avg_cycle_time_days,
                }
            });
        self.store.snapshots.save_process_metrics(company_id, &process, process_event.as_ref()).await?;
        let process_status = status_of(process_event.as_ref());

        let cac_status = match compute_cac(
            &records.deals,
            &records.expenses,
            &configs.acquisition_efficiency,
            now,
        ) {
            Ok(next) => {
                let event = changed_event(company_id, prior.cac_metrics.as_ref(), &next, now, |value| {
                    EventPayload::CacUpdated {
                        blended_cac: value.blended_cac,
                        cac_by_source: value.cac_by_source.clone(),
                        top_source: value.top_source.clone(),
                    }
                });
                self.store.snapshots.save_cac_metrics(company_id, &next, event.as_ref()).await?;
                status_of(event.as_ref())
            }
            Err(error) => skipped(company_id, SnapshotKind::CacMetrics, &error),
        };

        let clarity_score = compute_clarity_score(&records, &company.tools_connected);
        if prior.clarity_score != Some(clarity_score) {
            self.store.companies.update_clarity_score(company_id, clarity_score, now).await?;
        }

        let report = RecomputeReport {
            company_id: company_id.clone(),
            forecast: forecast_status,
            cash_forecast: cash_status,
            process_metrics: process_status,
            cac_metrics: cac_status,
            clarity_score,
        };
        info!(
            event_name = "analytics.recompute.completed",
            company_id = %company_id,
            updated = report.updated(),
            clarity_score,
            "snapshots recomputed"
        );
        Ok(report)
    }

    /// Stores every reminder due today and publishes one event per reminder.
    /// Reminders already stored for the same cycle are skipped.
    pub async fn run_reminders(
        &self,
        company_id: &CompanyId,
        now: DateTime<Utc>,
    ) -> Result<ReminderReport, AnalyticsError> {
        let company = self.company(company_id).await?;
        let records = self.store.records.load_company_records(company_id).await?;
        let configs = &company.agent_configs;
        let cycle_date = now.date_naive();
        let mut report = ReminderReport::default();

        let invoice_history = self.store.history.list_invoice_reminders(company_id).await?;
        for planned in plan_invoice_reminders(
            &records.invoices,
            &invoice_history,
            &configs.cash_predictability,
            now,
        ) {
            let reminder = InvoiceReminder {
                id: Uuid::new_v4().to_string(),
                company_id: company_id.clone(),
                invoice_id: planned.invoice_id.clone(),
                reminder_number: planned.reminder_number,
                days_overdue: planned.days_overdue,
                cycle_date,
                sent_at: now,
            };
            let event = new_event(
                company_id,
                EventPayload::InvoiceReminderDue {
                    record_id: planned.invoice_id,
                    reminder_number: planned.reminder_number,
                    days_overdue: planned.days_overdue,
                },
                now,
            );
            if self.store.history.insert_invoice_reminder(&reminder, &event).await? {
                report.invoice_reminders += 1;
            }
        }

        let task_history = self.store.history.list_task_reminders(company_id).await?;
        for planned in
            plan_task_reminders(&records.tasks, &task_history, &configs.process_clarity, now)
        {
            let reminder = TaskReminder {
                id: Uuid::new_v4().to_string(),
                company_id: company_id.clone(),
                task_id: planned.task_id.clone(),
                reminder_type: planned.reminder_type,
                cycle_date,
                sent_at: now,
            };
            let event = new_event(
                company_id,
                EventPayload::TaskReminderDue {
                    record_id: planned.task_id,
                    reminder_type: planned.reminder_type.as_str().to_string(),
                },
                now,
            );
            if self.store.history.insert_task_reminder(&reminder, &event).await? {
                report.task_reminders += 1;
            }
        }

        if report != ReminderReport::default() {
            info!(
                event_name = "analytics.reminders.stored",
                company_id = %company_id,
                invoice_reminders = report.invoice_reminders,
                task_reminders = report.task_reminders,
                "reminders due"
            );
        }
        Ok(report)
    }

    /// Appends an analysis row for every closed deal that has none yet.
    pub async fn analyze_win_loss(
        &self,
        company_id: &CompanyId,
        now: DateTime<Utc>,
    ) -> Result<u32, AnalyticsError> {
        self.company(company_id).await?;
        let records = self.store.records.load_company_records(company_id).await?;
        let analyzed = self.store.history.analyzed_deal_ids(company_id).await?;

        let mut inserted = 0;
        for analysis in analyze_closed_deals(company_id, &records.deals, &analyzed, now) {
            if self.store.history.insert_win_loss(&analysis).await? {
                inserted += 1;
            }
        }
        debug!(
            event_name = "analytics.win_loss.analyzed",
            company_id = %company_id,
            inserted,
            "win/loss analyses appended"
        );
        Ok(inserted)
    }

    async fn company(&self, company_id: &CompanyId) -> Result<Company, AnalyticsError> {
        self.store
            .companies
            .find(company_id)
            .await?
            .ok_or_else(|| AnalyticsError::UnknownCompany(company_id.clone()))
    }
}

fn new_event(company_id: &CompanyId, payload: EventPayload, now: DateTime<Utc>) -> Event {
    Event::new(EventId(Uuid::new_v4().to_string()), company_id.clone(), payload, now)
}

/// The `*_updated` event for `next`, unless it matches the stored row.
fn changed_event<S: Snapshot>(
    company_id: &CompanyId,
    prior: Option<&S>,
    next: &S,
    now: DateTime<Utc>,
    payload: impl FnOnce(&S) -> EventPayload,
) -> Option<Event> {
    if prior.is_some_and(|prior| prior.same_values(next)) {
        return None;
    }
    Some(new_event(company_id, payload(next), now))
}

fn status_of(event: Option<&Event>) -> SnapshotStatus {
    match event {
        Some(_) => SnapshotStatus::Updated,
        None => SnapshotStatus::Unchanged,
    }
}

fn skipped(company_id: &CompanyId, kind: SnapshotKind, error: &AnalyticsInputError) -> SnapshotStatus {
    warn!(
        event_name = "analytics.snapshot.skipped",
        company_id = %company_id,
        snapshot = kind.as_str(),
        error = %error,
        "snapshot inputs invalid, keeping the prior row"
    );
    SnapshotStatus::Skipped { reason: error.to_string() }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;

    use kuria_core::domain::company::{Company, CompanyId};
    use kuria_core::domain::record::{
        DealFields, DealStatus, ExpenseFields, InvoiceFields, InvoiceStatus, RawRecord,
        RecordFields, TaskFields, TaskStatus,
    };
    use kuria_db::repositories::Store;
    use kuria_db::{connect_with_settings, migrations};

    use super::{AnalyticsService, SnapshotStatus};
    use crate::sync::SyncEngine;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap()
    }

    async fn store_with_company(id: &str) -> (Store, CompanyId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrations");
        let store = Store::sqlite(pool);
        let company_id = CompanyId(id.to_string());
        store
            .companies
            .create(&Company::new(company_id.clone(), "Acme", now() - Duration::days(90)))
            .await
            .expect("company");
        (store, company_id)
    }

    async fn sync(store: &Store, company_id: &CompanyId, source: &str, raw_id: &str, fields: RecordFields) {
        SyncEngine::new(store.clone(), 3)
            .sync(
                company_id,
                RawRecord {
                    connector_source: source.to_string(),
                    raw_id: raw_id.to_string(),
                    source_updated_at: now() - Duration::hours(1),
                    fields,
                },
                now() - Duration::minutes(30),
            )
            .await
            .expect("sync");
    }

    fn won_deal(source: &str, amount: i64, days_ago: i64) -> RecordFields {
        RecordFields::Deal(DealFields {
            amount: Some(Decimal::new(amount, 0)),
            stage: Some("closed".to_string()),
            status: Some(DealStatus::Won),
            source: Some(source.to_string()),
            created_at: Some(now() - Duration::days(days_ago + 20)),
            closed_at: Some(now() - Duration::days(days_ago)),
            ..Default::default()
        })
    }

    fn ads(amount: i64, days_ago: i64) -> RecordFields {
        RecordFields::Expense(ExpenseFields {
            amount: Some(Decimal::new(amount, 0)),
            category: Some("marketing".to_string()),
            vendor: Some("Google Ads".to_string()),
            date: Some((now() - Duration::days(days_ago)).date_naive()),
            ..Default::default()
        })
    }

    fn overdue_invoice(days_overdue: i64) -> RecordFields {
        RecordFields::Invoice(InvoiceFields {
            amount: Some(Decimal::new(4_000, 0)),
            client_id: Some("cl-1".to_string()),
            status: Some(InvoiceStatus::Sent),
            issued_at: Some(now() - Duration::days(days_overdue + 30)),
            due_at: Some(now() - Duration::days(days_overdue)),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn first_recompute_publishes_events_and_an_identical_rerun_does_not() {
        let (store, acme) = store_with_company("acme").await;
        sync(&store, &acme, "hubspot", "D1", won_deal("referral", 10_000, 10)).await;
        sync(&store, &acme, "xero", "E1", ads(600, 5)).await;
        let service = AnalyticsService::new(store.clone());

        let first = service.recompute(&acme, now()).await.expect("first");
        assert_eq!(first.cac_metrics, SnapshotStatus::Updated);
        assert_eq!(first.process_metrics, SnapshotStatus::Updated);
        let published = store.events.fetch_unprocessed(&acme, 100).await.expect("events").len();

        let second = service.recompute(&acme, now() + Duration::minutes(5)).await.expect("second");
        assert_eq!(second.cac_metrics, SnapshotStatus::Unchanged);
        assert_eq!(second.updated(), 0);
        assert_eq!(store.events.fetch_unprocessed(&acme, 100).await.expect("events").len(), published);
    }

    #[tokio::test]
    async fn cac_without_won_deals_keeps_the_prior_row() {
        let (store, acme) = store_with_company("acme").await;
        sync(&store, &acme, "hubspot", "D1", won_deal("referral", 10_000, 10)).await;
        sync(&store, &acme, "xero", "E1", ads(600, 5)).await;
        let service = AnalyticsService::new(store.clone());
        service.recompute(&acme, now()).await.expect("first");
        let stored = store.snapshots.find_cac_metrics(&acme).await.expect("find").expect("row");

        let later = now() + Duration::days(200);
        let report = service.recompute(&acme, later).await.expect("later");

        assert!(matches!(report.cac_metrics, SnapshotStatus::Skipped { .. }));
        assert_eq!(report.process_metrics, SnapshotStatus::Unchanged);
        assert_eq!(store.snapshots.find_cac_metrics(&acme).await.expect("find"), Some(stored));
    }

    #[tokio::test]
    async fn invoice_reminder_is_stored_once_per_cycle() {
        let (store, acme) = store_with_company("acme").await;
        sync(&store, &acme, "xero", "INV-1", overdue_invoice(10)).await;
        let service = AnalyticsService::new(store.clone());

        let first = service.run_reminders(&acme, now()).await.expect("first");
        let rerun = service.run_reminders(&acme, now() + Duration::hours(2)).await.expect("rerun");

        assert_eq!(first.invoice_reminders, 1);
        assert_eq!(rerun.invoice_reminders, 0);
        let stored = store.history.list_invoice_reminders(&acme).await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].reminder_number, 1);
        assert_eq!(stored[0].cycle_date, NaiveDate::from_ymd_opt(2026, 3, 20).unwrap());
        let due: Vec<_> = store
            .events
            .fetch_unprocessed(&acme, 100)
            .await
            .expect("events")
            .into_iter()
            .filter(|event| event.event_type() == "invoice_reminder_due")
            .collect();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn overdue_task_gets_an_alert() {
        let (store, acme) = store_with_company("acme").await;
        sync(
            &store,
            &acme,
            "asana",
            "T1",
            RecordFields::Task(TaskFields {
                title: Some("Send contract".to_string()),
                status: Some(TaskStatus::Todo),
                due_at: Some(now() - Duration::days(2)),
                ..Default::default()
            }),
        )
        .await;
        let service = AnalyticsService::new(store.clone());

        let report = service.run_reminders(&acme, now()).await.expect("reminders");

        assert_eq!(report.task_reminders, 1);
        let stored = store.history.list_task_reminders(&acme).await.expect("list");
        assert_eq!(stored[0].reminder_type.as_str(), "overdue_alert");
    }

    #[tokio::test]
    async fn closed_deals_are_analyzed_once() {
        let (store, acme) = store_with_company("acme").await;
        sync(&store, &acme, "hubspot", "D1", won_deal("referral", 10_000, 10)).await;
        let service = AnalyticsService::new(store.clone());

        assert_eq!(service.analyze_win_loss(&acme, now()).await.expect("first"), 1);
        assert_eq!(service.analyze_win_loss(&acme, now()).await.expect("second"), 0);
    }
}
