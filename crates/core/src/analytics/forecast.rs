use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::analytics::{floor_days, mean, round_f64, round_money, to_decimal, AnalyticsInputError};
use crate::domain::metrics::Forecast;
use crate::domain::record::{Deal, DealStatus, RecordKind};

pub const DEFAULT_WIN_RATE: f64 = 0.2;
pub const MIN_CLOSED_DEALS_FOR_WIN_RATE: u32 = 5;
pub const DEFAULT_CYCLE_DAYS: f64 = 30.0;
pub const MIN_STAGNATION_FACTOR: f64 = 0.1;
/// Stand-in for "never active".
pub const NO_ACTIVITY_DAYS: i64 = 999;
const UNKNOWN_STAGE: &str = "unknown";

/// Weighted revenue forecast of the active pipeline.
///
/// Each active deal contributes `amount * win_rate * stagnation`, where the
/// win rate comes from closed deals at the same stage and the stagnation
/// factor decays with inactivity relative to the stage's usual cycle.
pub fn compute_forecast(deals: &[Deal], now: DateTime<Utc>) -> Result<Forecast, AnalyticsInputError> {
    let win_rate_by_stage = win_rate_by_stage(deals);
    let avg_cycle_days_by_stage = avg_cycle_days_by_stage(deals);
    let today = now.date_naive();

    let mut buckets = [Decimal::ZERO; 3];
    let mut probabilities = Vec::new();

    for deal in deals.iter().filter(|deal| deal.status == Some(DealStatus::Active)) {
        let amount = deal.amount.ok_or_else(|| AnalyticsInputError::MissingField {
            kind: RecordKind::Deal,
            record_id: deal.meta.id.clone(),
            field: "amount",
        })?;
        if amount.is_zero() {
            continue;
        }

        let stage = stage_key(deal);
        let win_rate = win_rate_by_stage.get(stage).copied().unwrap_or(DEFAULT_WIN_RATE);
        let avg_cycle = avg_cycle_days_by_stage.get(stage).copied().unwrap_or(DEFAULT_CYCLE_DAYS);
        let days_stagnant = deal
            .last_activity_at
            .map(|last| floor_days(last, now))
            .unwrap_or(NO_ACTIVITY_DAYS);
        let horizon = (avg_cycle * 2.0).max(1.0);
        let stagnation = (1.0 - days_stagnant as f64 / horizon).max(MIN_STAGNATION_FACTOR);
        let probability = win_rate * stagnation;
        let weighted = amount * to_decimal(probability);

        match deal.expected_close_date {
            Some(close) => match (close - today).num_days() {
                0..=30 => buckets[0] += weighted,
                31..=60 => buckets[1] += weighted,
                61..=90 => buckets[2] += weighted,
                _ => {}
            },
            None => {
                buckets[0] += weighted * Decimal::new(3, 1);
                buckets[1] += weighted * Decimal::new(4, 1);
                buckets[2] += weighted * Decimal::new(3, 1);
            }
        }
        probabilities.push(probability);
    }

    let [forecast_30d, forecast_60d, forecast_90d] = buckets;
    Ok(Forecast {
        forecast_30d: round_money(forecast_30d),
        forecast_60d: round_money(forecast_60d),
        forecast_90d: round_money(forecast_90d),
        revenue_velocity: round_money(forecast_30d / Decimal::from(30)),
        confidence: mean(&probabilities).map(|value| round_f64(value, 3)).unwrap_or(0.0),
        deals_analyzed: probabilities.len() as u32,
        win_rate_by_stage,
        avg_cycle_days_by_stage,
        computed_at: now,
    })
}

fn stage_key(deal: &Deal) -> &str {
    deal.stage.as_deref().filter(|stage| !stage.trim().is_empty()).unwrap_or(UNKNOWN_STAGE)
}

/// Won / (won + lost) per stage, once a stage has enough closed deals.
pub fn win_rate_by_stage(deals: &[Deal]) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    for deal in deals {
        let entry = match deal.status {
            Some(DealStatus::Won) | Some(DealStatus::Lost) => {
                counts.entry(stage_key(deal).to_string()).or_default()
            }
            _ => continue,
        };
        if deal.status == Some(DealStatus::Won) {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    counts
        .into_iter()
        .map(|(stage, (won, lost))| {
            let closed = won + lost;
            let rate = if closed >= MIN_CLOSED_DEALS_FOR_WIN_RATE {
                f64::from(won) / f64::from(closed)
            } else {
                DEFAULT_WIN_RATE
            };
            (stage, rate)
        })
        .collect()
}

/// Mean created-to-closed days of won deals per stage.
pub fn avg_cycle_days_by_stage(deals: &[Deal]) -> BTreeMap<String, f64> {
    let mut durations: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for deal in deals.iter().filter(|deal| deal.status == Some(DealStatus::Won)) {
        if let (Some(created), Some(closed)) = (deal.created_at, deal.closed_at) {
            durations
                .entry(stage_key(deal).to_string())
                .or_default()
                .push(floor_days(created, closed) as f64);
        }
    }
    durations
        .into_iter()
        .filter_map(|(stage, values)| mean(&values).map(|avg| (stage, avg)))
        .collect()
}
