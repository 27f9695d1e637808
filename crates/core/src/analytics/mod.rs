//! Snapshot formulas. Every function here is a pure function of the records
//! it is given and an explicit `now`.

pub mod cac;
pub mod cash;
pub mod clarity;
pub mod forecast;
pub mod process;
pub mod reminders;
pub mod win_loss;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::record::{Contact, Deal, Expense, Invoice, RecordId, RecordKind, Task};

pub use cac::compute_cac;
pub use cash::compute_cash_forecast;
pub use clarity::compute_clarity_score;
pub use forecast::compute_forecast;
pub use process::compute_process_metrics;
pub use reminders::{plan_invoice_reminders, plan_task_reminders};
pub use win_loss::analyze_closed_deals;

/// Inputs that make a snapshot impossible to compute. The prior snapshot is
/// kept when one of these is reported.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AnalyticsInputError {
    #[error("{} {record_id} is missing required field `{field}`", kind.as_str())]
    MissingField { kind: RecordKind, record_id: RecordId, field: &'static str },
    #[error("no won deals in the trailing window")]
    NoWonDeals,
}

/// Every canonical record of one company, as read for a recomputation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecords {
    pub deals: Vec<Deal>,
    pub contacts: Vec<Contact>,
    pub invoices: Vec<Invoice>,
    pub tasks: Vec<Task>,
    pub expenses: Vec<Expense>,
}

pub(crate) fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven).normalize()
}

pub(crate) fn round_f64(value: f64, places: i32) -> f64 {
    let factor = 10_f64.powi(places);
    (value * factor).round() / factor
}

pub(crate) fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).map(|value| value.round_dp(6)).unwrap_or(Decimal::ZERO)
}

/// Whole days from `from` to `to`, rounded towards negative infinity.
pub(crate) fn floor_days(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().div_euclid(86_400)
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;

    use crate::domain::company::CompanyId;
    use crate::domain::record::{
        ConnectorSource, Deal, DealStatus, Expense, Invoice, InvoiceStatus, RecordId, RecordMeta,
        Task, TaskStatus,
    };

    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap()
    }

    pub fn days_ago(days: i64) -> DateTime<Utc> {
        now() - Duration::days(days)
    }

    pub fn date_in(days: i64) -> NaiveDate {
        (now() + Duration::days(days)).date_naive()
    }

    fn meta(id: &str, source: ConnectorSource) -> RecordMeta {
        RecordMeta {
            id: RecordId(id.to_string()),
            company_id: CompanyId("co-1".to_string()),
            connector_source: source,
            raw_id: id.to_uppercase(),
            synced_at: now(),
            source_updated_at: now(),
            field_versions: BTreeMap::new(),
            row_version: 1,
        }
    }

    pub fn deal(id: &str, stage: &str, status: DealStatus, amount: i64) -> Deal {
        Deal {
            meta: meta(id, ConnectorSource::Hubspot),
            title: Some(format!("Deal {id}")),
            amount: Some(Decimal::new(amount, 0)),
            currency: Some("EUR".to_string()),
            stage: Some(stage.to_string()),
            stage_order: None,
            probability: None,
            status: Some(status),
            created_at: None,
            last_activity_at: None,
            closed_at: None,
            expected_close_date: None,
            owner_id: None,
            owner_name: None,
            source: None,
        }
    }

    pub fn invoice(id: &str, status: InvoiceStatus, amount: i64) -> Invoice {
        Invoice {
            meta: meta(id, ConnectorSource::Quickbooks),
            amount: Some(Decimal::new(amount, 0)),
            amount_paid: None,
            currency: Some("EUR".to_string()),
            client_id: None,
            client_name: None,
            status: Some(status),
            issued_at: None,
            due_at: None,
            paid_at: None,
            payment_delay_days: None,
        }
    }

    pub fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            meta: meta(id, ConnectorSource::Asana),
            title: Some(format!("Task {id}")),
            description: None,
            assignee_id: None,
            assignee_name: None,
            status: Some(status),
            created_at: None,
            due_at: None,
            completed_at: None,
            cycle_time_days: None,
        }
    }

    pub fn expense(id: &str, amount: i64, category: &str, days_back: i64) -> Expense {
        Expense {
            meta: meta(id, ConnectorSource::Xero),
            amount: Some(Decimal::new(amount, 0)),
            currency: Some("EUR".to_string()),
            vendor: None,
            category: Some(category.to_string()),
            is_recurring: None,
            date: Some(date_in(-days_back)),
        }
    }
}
