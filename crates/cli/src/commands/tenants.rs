//! Per-tenant jobs an operator can trigger outside the scheduler.

use chrono::Utc;
use serde_json::{json, Value};

use crate::commands::{with_runtime, CommandFailure, CommandResult, Target};

/// Recomputes snapshots, reminders and win/loss rows for each target tenant.
pub fn recompute(target: Target) -> CommandResult {
    with_runtime("recompute", |runtime| async move {
        let companies = target.resolve(&runtime).await?;
        let now = Utc::now();
        let mut reports = Vec::with_capacity(companies.len());

        for company_id in &companies {
            let snapshots = runtime
                .analytics
                .recompute(company_id, now)
                .await
                .map_err(CommandFailure::from_service)?;
            let reminders = runtime
                .analytics
                .run_reminders(company_id, now)
                .await
                .map_err(CommandFailure::from_service)?;
            let analyzed = runtime
                .analytics
                .analyze_win_loss(company_id, now)
                .await
                .map_err(CommandFailure::from_service)?;
            reports.push(json!({
                "company_id": company_id,
                "snapshots": snapshots,
                "reminders": reminders,
                "win_loss_analyzed": analyzed,
            }));
        }

        Ok((format!("recomputed {} tenant(s)", companies.len()), Value::Array(reports)))
    })
}

/// Runs one claim-and-dispatch batch per target tenant.
pub fn route(target: Target) -> CommandResult {
    with_runtime("route", |runtime| async move {
        let companies = target.resolve(&runtime).await?;
        let mut reports = Vec::with_capacity(companies.len());
        let mut processed = 0;

        for company_id in &companies {
            let report = runtime
                .router
                .dispatch_pending(company_id, Utc::now())
                .await
                .map_err(CommandFailure::from_service)?;
            processed += report.processed;
            reports.push(json!({ "company_id": company_id, "report": report }));
        }

        Ok((
            format!("routed {} tenant(s), {processed} event(s) processed", companies.len()),
            Value::Array(reports),
        ))
    })
}
