use crate::analytics::CompanyRecords;
use crate::domain::company::{ToolCategory, ToolsConnected};

const COMPLETENESS_POINTS: f64 = 10.0;

/// How legible a company's data is, 0 to 100.
///
/// Half of the score rewards complete records, the other half rewards
/// connected tool categories.
pub fn compute_clarity_score(records: &CompanyRecords, tools: &ToolsConnected) -> u8 {
    let deals = &records.deals;
    let invoices = &records.invoices;
    let tasks = &records.tasks;

    let completeness = [
        ratio(deals.len(), deals.iter().filter(|deal| deal.amount.is_some()).count()),
        ratio(deals.len(), deals.iter().filter(|deal| deal.last_activity_at.is_some()).count()),
        ratio(
            deals.len(),
            deals
                .iter()
                .filter(|deal| deal.source.as_deref().is_some_and(|s| !s.trim().is_empty()))
                .count(),
        ),
        ratio(
            invoices.len(),
            invoices
                .iter()
                .filter(|invoice| invoice.due_at.is_some() && invoice.issued_at.is_some())
                .count(),
        ),
        ratio(
            tasks.len(),
            tasks
                .iter()
                .filter(|task| task.assignee_id.is_some() && task.due_at.is_some())
                .count(),
        ),
    ];
    let data_points: f64 = completeness.iter().map(|ratio| ratio * COMPLETENESS_POINTS).sum();

    let tool_points: u32 = [
        (ToolCategory::Crm, 15),
        (ToolCategory::Finance, 15),
        (ToolCategory::Email, 10),
        (ToolCategory::Project, 10),
    ]
    .into_iter()
    .filter(|(category, _)| tools.is_connected(*category))
    .map(|(_, points)| points)
    .sum();

    (data_points + f64::from(tool_points)).round().clamp(0.0, 100.0) as u8
}

fn ratio(total: usize, matching: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        matching as f64 / total as f64
    }
}
