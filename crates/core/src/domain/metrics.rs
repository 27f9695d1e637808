//! Per-company snapshot rows. Each is overwritten whole on recomputation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Forecast,
    CashForecast,
    ProcessMetrics,
    CacMetrics,
}

impl SnapshotKind {
    pub const ALL: [SnapshotKind; 4] =
        [Self::Forecast, Self::CashForecast, Self::ProcessMetrics, Self::CacMetrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forecast => "forecast",
            Self::CashForecast => "cash_forecast",
            Self::ProcessMetrics => "process_metrics",
            Self::CacMetrics => "cac_metrics",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Forecast => "forecasts",
            Self::CashForecast => "cash_forecasts",
            Self::ProcessMetrics => "process_metrics",
            Self::CacMetrics => "cac_metrics",
        }
    }
}

/// Revenue forecast over the active pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub forecast_30d: Decimal,
    pub forecast_60d: Decimal,
    pub forecast_90d: Decimal,
    pub revenue_velocity: Decimal,
    pub confidence: f64,
    pub deals_analyzed: u32,
    pub win_rate_by_stage: BTreeMap<String, f64>,
    pub avg_cycle_days_by_stage: BTreeMap<String, f64>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTrend {
    Degrading,
    Improving,
    Stable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientPaymentPattern {
    pub avg_delay_days: f64,
    pub trend: PaymentTrend,
    pub sample_size: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CashScenarios {
    pub base_30d: Decimal,
    pub base_60d: Decimal,
    pub base_90d: Decimal,
    pub stress_30d: Decimal,
    pub upside_30d: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CashForecast {
    pub current_balance: Decimal,
    pub monthly_burn: Decimal,
    pub runway_months: Option<Decimal>,
    pub critical_threshold: Decimal,
    pub days_until_critical: Option<i64>,
    pub scenarios: CashScenarios,
    pub client_patterns: BTreeMap<String, ClientPaymentPattern>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub avg_cycle_time_days: Option<f64>,
    pub active_tasks: u32,
    pub overdue_tasks: u32,
    pub unassigned_tasks: u32,
    pub completed_last_30d: u32,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacMetrics {
    pub period_days: u32,
    pub blended_cac: Decimal,
    pub total_marketing_spend: Decimal,
    pub total_clients: u32,
    pub cac_by_source: BTreeMap<String, Decimal>,
    pub clients_by_source: BTreeMap<String, u32>,
    pub revenue_by_source: BTreeMap<String, Decimal>,
    pub top_source: Option<String>,
    pub computed_at: DateTime<Utc>,
}

/// Implemented by every snapshot so callers can compare values while
/// ignoring the recomputation timestamp.
pub trait Snapshot: Clone + PartialEq {
    const KIND: SnapshotKind;

    fn computed_at(&self) -> DateTime<Utc>;

    fn with_computed_at(&self, computed_at: DateTime<Utc>) -> Self;

    fn same_values(&self, other: &Self) -> bool {
        self.with_computed_at(other.computed_at()) == *other
    }
}

macro_rules! impl_snapshot {
    ($ty:ty, $kind:expr) => {
        impl Snapshot for $ty {
            const KIND: SnapshotKind = $kind;

            fn computed_at(&self) -> DateTime<Utc> {
                self.computed_at
            }

            fn with_computed_at(&self, computed_at: DateTime<Utc>) -> Self {
                Self { computed_at, ..self.clone() }
            }
        }
    };
}

impl_snapshot!(Forecast, SnapshotKind::Forecast);
impl_snapshot!(CashForecast, SnapshotKind::CashForecast);
impl_snapshot!(ProcessMetrics, SnapshotKind::ProcessMetrics);
impl_snapshot!(CacMetrics, SnapshotKind::CacMetrics);

/// Everything the dashboard reads for one company.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSet {
    pub forecast: Option<Forecast>,
    pub cash_forecast: Option<CashForecast>,
    pub process_metrics: Option<ProcessMetrics>,
    pub cac_metrics: Option<CacMetrics>,
    pub clarity_score: Option<u8>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    #[test]
    fn same_values_ignores_computed_at() {
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let metrics = ProcessMetrics {
            avg_cycle_time_days: Some(4.5),
            active_tasks: 3,
            overdue_tasks: 1,
            unassigned_tasks: 0,
            completed_last_30d: 6,
            computed_at: at,
        };
        let later = ProcessMetrics { computed_at: at + Duration::hours(1), ..metrics.clone() };
        let changed = ProcessMetrics { overdue_tasks: 2, ..later.clone() };

        assert!(metrics.same_values(&later));
        assert!(!metrics.same_values(&changed));
    }
}
