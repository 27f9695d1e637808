use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::analytics::{round_money, AnalyticsInputError};
use crate::domain::company::AcquisitionEfficiencyConfig;
use crate::domain::metrics::CacMetrics;
use crate::domain::record::{Deal, DealStatus, Expense};

const UNKNOWN_SOURCE: &str = "unknown";

/// Customer acquisition cost over the trailing `period_days`.
///
/// Marketing spend is spread over sources in proportion to the clients each
/// source brought in.
pub fn compute_cac(
    deals: &[Deal],
    expenses: &[Expense],
    config: &AcquisitionEfficiencyConfig,
    now: DateTime<Utc>,
) -> Result<CacMetrics, AnalyticsInputError> {
    let since = now - Duration::days(i64::from(config.period_days));
    let won: Vec<&Deal> = deals
        .iter()
        .filter(|deal| deal.status == Some(DealStatus::Won))
        .filter(|deal| deal.closed_at.is_some_and(|closed| closed >= since))
        .collect();
    if won.is_empty() {
        return Err(AnalyticsInputError::NoWonDeals);
    }

    let since_date = since.date_naive();
    let spend: Decimal = expenses
        .iter()
        .filter(|expense| is_marketing(expense, &config.marketing_keywords))
        .filter(|expense| expense.date.is_some_and(|date| date >= since_date))
        .filter_map(|expense| expense.amount)
        .sum();

    let mut clients_by_source: BTreeMap<String, u32> = BTreeMap::new();
    let mut revenue_by_source: BTreeMap<String, Decimal> = BTreeMap::new();
    for deal in &won {
        let source = deal
            .source
            .as_deref()
            .filter(|source| !source.trim().is_empty())
            .unwrap_or(UNKNOWN_SOURCE)
            .to_string();
        *clients_by_source.entry(source.clone()).or_default() += 1;
        *revenue_by_source.entry(source).or_default() += deal.amount.unwrap_or_default();
    }

    let total_clients = won.len() as u32;
    let total = Decimal::from(total_clients);
    let cac_by_source: BTreeMap<String, Decimal> = clients_by_source
        .iter()
        .map(|(source, count)| {
            let count = Decimal::from(*count);
            let source_spend = spend * (count / total);
            (source.clone(), round_money(source_spend / count))
        })
        .collect();

    // BTreeMap iteration is by name, so the first minimum wins ties.
    let top_source = cac_by_source
        .iter()
        .fold(None::<(&String, &Decimal)>, |best, (source, cac)| match best {
            Some((_, best_cac)) if best_cac <= cac => best,
            _ => Some((source, cac)),
        })
        .map(|(source, _)| source.clone());

    Ok(CacMetrics {
        period_days: config.period_days,
        blended_cac: round_money(spend / total),
        total_marketing_spend: round_money(spend),
        total_clients,
        cac_by_source,
        clients_by_source,
        revenue_by_source: revenue_by_source
            .into_iter()
            .map(|(source, revenue)| (source, round_money(revenue)))
            .collect(),
        top_source,
        computed_at: now,
    })
}

fn is_marketing(expense: &Expense, keywords: &[String]) -> bool {
    let category = expense.category.as_deref().unwrap_or_default().to_lowercase();
    let vendor = expense.vendor.as_deref().unwrap_or_default().to_lowercase();
    keywords.iter().any(|keyword| {
        let keyword = keyword.to_lowercase();
        category.contains(&keyword) || vendor.contains(&keyword)
    })
}
