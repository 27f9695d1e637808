use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::analytics::{mean, round_f64, round_money, AnalyticsInputError};
use crate::domain::company::CashPredictabilityConfig;
use crate::domain::metrics::{
    CashForecast, CashScenarios, ClientPaymentPattern, Forecast, PaymentTrend,
};
use crate::domain::record::{Expense, Invoice, InvoiceStatus, RecordKind};

pub const MIN_PAID_INVOICES_FOR_PATTERN: usize = 2;
pub const BURN_WINDOW_DAYS: i64 = 90;
const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq)]
struct Scenario {
    horizon_days: i64,
    pipeline_factor: Decimal,
    delay_days: f64,
}

impl Scenario {
    const fn base(horizon_days: i64) -> Self {
        Self { horizon_days, pipeline_factor: Decimal::ONE, delay_days: 0.0 }
    }

    fn stress() -> Self {
        Self { horizon_days: 30, pipeline_factor: Decimal::new(5, 1), delay_days: 15.0 }
    }

    fn upside() -> Self {
        Self { horizon_days: 30, pipeline_factor: Decimal::new(12, 1), delay_days: -5.0 }
    }
}

/// Cash position projection.
///
/// `pipeline` is the revenue forecast computed in the same pass (or the last
/// stored one); without it the pipeline contributes nothing.
pub fn compute_cash_forecast(
    invoices: &[Invoice],
    expenses: &[Expense],
    pipeline: Option<&Forecast>,
    config: &CashPredictabilityConfig,
    now: DateTime<Utc>,
) -> Result<CashForecast, AnalyticsInputError> {
    let client_patterns = payment_patterns(invoices);
    let monthly_burn = monthly_burn(expenses, now);

    let mut pending = Vec::new();
    for invoice in invoices.iter().filter(|invoice| {
        matches!(invoice.status, Some(InvoiceStatus::Sent) | Some(InvoiceStatus::Overdue))
    }) {
        let missing = |field| AnalyticsInputError::MissingField {
            kind: RecordKind::Invoice,
            record_id: invoice.meta.id.clone(),
            field,
        };
        let amount = invoice.amount.ok_or_else(|| missing("amount"))?;
        let due_at = invoice.due_at.ok_or_else(|| missing("due_at"))?;
        let client_delay = invoice
            .client_id
            .as_deref()
            .and_then(|client| client_patterns.get(client))
            .map(|pattern| pattern.avg_delay_days)
            .unwrap_or(0.0);
        pending.push(PendingReceipt { amount, due_at, client_delay });
    }

    let pipeline_for = |horizon_days: i64| match (pipeline, horizon_days) {
        (Some(forecast), 60) => forecast.forecast_60d,
        (Some(forecast), 90) => forecast.forecast_90d,
        (Some(forecast), _) => forecast.forecast_30d,
        (None, _) => Decimal::ZERO,
    };
    let project = |scenario: Scenario| {
        round_money(project_scenario(
            &pending,
            pipeline_for(scenario.horizon_days),
            monthly_burn,
            scenario,
            now,
        ))
    };
    let scenarios = CashScenarios {
        base_30d: project(Scenario::base(30)),
        base_60d: project(Scenario::base(60)),
        base_90d: project(Scenario::base(90)),
        stress_30d: project(Scenario::stress()),
        upside_30d: project(Scenario::upside()),
    };

    let current_balance = round_money(config.current_balance.unwrap_or_else(|| {
        let received: Decimal = invoices
            .iter()
            .filter(|invoice| invoice.status == Some(InvoiceStatus::Paid))
            .filter_map(|invoice| invoice.amount_paid)
            .sum();
        let spent: Decimal = expenses.iter().filter_map(|expense| expense.amount).sum();
        received - spent
    }));
    let critical_threshold =
        round_money(config.critical_threshold.unwrap_or(monthly_burn * Decimal::new(15, 1)));
    let runway_months = if monthly_burn.is_zero() {
        None
    } else {
        Some((current_balance / monthly_burn).round_dp(1).normalize())
    };
    let days_until_critical =
        days_until_critical(current_balance, critical_threshold, scenarios.base_30d);

    Ok(CashForecast {
        current_balance,
        monthly_burn,
        runway_months,
        critical_threshold,
        days_until_critical,
        scenarios,
        client_patterns,
        computed_at: now,
    })
}

struct PendingReceipt {
    amount: Decimal,
    due_at: DateTime<Utc>,
    client_delay: f64,
}

fn project_scenario(
    pending: &[PendingReceipt],
    pipeline: Decimal,
    monthly_burn: Decimal,
    scenario: Scenario,
    now: DateTime<Utc>,
) -> Decimal {
    let horizon = now + Duration::days(scenario.horizon_days);
    let receipts: Decimal = pending
        .iter()
        .filter(|receipt| {
            let delay = (receipt.client_delay + scenario.delay_days).trunc() as i64;
            receipt.due_at + Duration::days(delay) <= horizon
        })
        .map(|receipt| receipt.amount)
        .sum();
    let expected_expenses = monthly_burn * Decimal::from(scenario.horizon_days) / Decimal::from(30);
    receipts + pipeline * scenario.pipeline_factor - expected_expenses
}

/// Average monthly spend over the trailing 90 days.
pub fn monthly_burn(expenses: &[Expense], now: DateTime<Utc>) -> Decimal {
    let since = (now - Duration::days(BURN_WINDOW_DAYS)).date_naive();
    let total: Decimal = expenses
        .iter()
        .filter(|expense| expense.date.is_some_and(|date| date >= since))
        .filter_map(|expense| expense.amount)
        .sum();
    round_money(total / Decimal::from(3))
}

/// Payment delay habits of clients with at least two paid invoices.
pub fn payment_patterns(invoices: &[Invoice]) -> BTreeMap<String, ClientPaymentPattern> {
    let mut paid: Vec<&Invoice> =
        invoices.iter().filter(|invoice| invoice.status == Some(InvoiceStatus::Paid)).collect();
    // Oldest payment first so the trend sees the latest delays last.
    paid.sort_by(|a, b| (a.paid_at, &a.meta.id).cmp(&(b.paid_at, &b.meta.id)));

    let mut delays: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for invoice in paid {
        let Some(delay) = invoice.payment_delay_days else {
            continue;
        };
        let client = invoice.client_id.clone().unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
        delays.entry(client).or_default().push(delay as f64);
    }

    delays
        .into_iter()
        .filter(|(_, values)| values.len() >= MIN_PAID_INVOICES_FOR_PATTERN)
        .filter_map(|(client, values)| {
            let avg = mean(&values)?;
            Some((
                client,
                ClientPaymentPattern {
                    avg_delay_days: round_f64(avg, 1),
                    trend: payment_trend(&values),
                    sample_size: values.len() as u32,
                },
            ))
        })
        .collect()
}

/// Compares the three most recent delays with the ones before them.
pub fn payment_trend(values: &[f64]) -> PaymentTrend {
    if values.len() < 3 {
        return PaymentTrend::Stable;
    }
    let (older, recent) = values.split_at(values.len() - 3);
    let recent = mean(recent).unwrap_or(0.0);
    let older = mean(older).unwrap_or(values[0]);

    if recent > older * 1.2 {
        PaymentTrend::Degrading
    } else if recent < older * 0.8 {
        PaymentTrend::Improving
    } else {
        PaymentTrend::Stable
    }
}

/// Linear projection of when the balance crosses the threshold, using the
/// base 30 day net flow.
pub fn days_until_critical(balance: Decimal, threshold: Decimal, base_30d: Decimal) -> Option<i64> {
    if balance <= threshold {
        return Some(0);
    }
    if base_30d >= Decimal::ZERO {
        return None;
    }
    // (balance - threshold) / (-base_30d / 30), kept exact.
    let days = ((balance - threshold) * Decimal::from(30) / -base_30d).ceil();
    Some(days.to_i64().unwrap_or(i64::MAX))
}
