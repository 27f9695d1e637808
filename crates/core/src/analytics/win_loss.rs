use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::analytics::{floor_days, mean};
use crate::domain::company::CompanyId;
use crate::domain::history::{DealOutcome, WinLossAnalysis};
use crate::domain::record::{Deal, DealStatus, RecordId};

pub const DEFAULT_AVG_WON_DAYS: f64 = 30.0;

/// One analysis row for every closed deal that does not have one yet.
pub fn analyze_closed_deals(
    company_id: &CompanyId,
    deals: &[Deal],
    already_analyzed: &BTreeSet<RecordId>,
    now: DateTime<Utc>,
) -> Vec<WinLossAnalysis> {
    let won_durations: Vec<f64> = deals
        .iter()
        .filter(|deal| deal.status == Some(DealStatus::Won))
        .filter_map(total_days)
        .map(|days| days as f64)
        .collect();
    let avg_won_days = mean(&won_durations).unwrap_or(DEFAULT_AVG_WON_DAYS);

    deals
        .iter()
        .filter(|deal| !already_analyzed.contains(&deal.meta.id))
        .filter_map(|deal| {
            let outcome = match deal.status {
                Some(DealStatus::Won) => DealOutcome::Won,
                Some(DealStatus::Lost) => DealOutcome::Lost,
                _ => return None,
            };
            Some(WinLossAnalysis {
                id: Uuid::new_v4().to_string(),
                company_id: company_id.clone(),
                deal_id: deal.meta.id.clone(),
                deal_title: deal.title.clone(),
                outcome,
                total_days: total_days(deal).unwrap_or(0),
                avg_won_days,
                analysis: None,
                analyzed_at: now,
            })
        })
        .collect()
}

fn total_days(deal: &Deal) -> Option<i64> {
    Some(floor_days(deal.created_at?, deal.closed_at?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::fixtures::{days_ago, deal, now};

    #[test]
    fn only_unanalyzed_closed_deals_get_rows() {
        let mut won = deal("d1", "closing", DealStatus::Won, 1_000);
        won.created_at = Some(days_ago(50));
        won.closed_at = Some(days_ago(10));
        let mut lost = deal("d2", "demo", DealStatus::Lost, 1_000);
        lost.created_at = Some(days_ago(20));
        lost.closed_at = Some(days_ago(5));
        let open = deal("d3", "demo", DealStatus::Active, 1_000);
        let analyzed_won = deal("d4", "closing", DealStatus::Won, 1_000);

        let done: BTreeSet<RecordId> = [RecordId("d4".to_string())].into_iter().collect();
        let rows = analyze_closed_deals(
            &CompanyId("co-1".to_string()),
            &[won, lost, open, analyzed_won],
            &done,
            now(),
        );

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].outcome, DealOutcome::Won);
        assert_eq!(rows[0].total_days, 40);
        assert_eq!(rows[1].outcome, DealOutcome::Lost);
        assert_eq!(rows[1].total_days, 15);
        assert_eq!(rows[1].avg_won_days, 40.0);
        assert!(rows.iter().all(|row| row.analysis.is_none()));
    }

    #[test]
    fn average_defaults_without_dated_wins() {
        let lost = deal("d1", "demo", DealStatus::Lost, 100);
        let rows =
            analyze_closed_deals(&CompanyId("co-1".to_string()), &[lost], &BTreeSet::new(), now());
        assert_eq!(rows[0].avg_won_days, DEFAULT_AVG_WON_DAYS);
        assert_eq!(rows[0].total_days, 0);
    }
}
