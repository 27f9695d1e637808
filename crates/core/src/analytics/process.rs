use chrono::{DateTime, Duration, Utc};

use crate::analytics::{mean, round_f64};
use crate::domain::metrics::ProcessMetrics;
use crate::domain::record::{Task, TaskStatus};

pub const CYCLE_WINDOW_DAYS: i64 = 30;

pub fn compute_process_metrics(tasks: &[Task], now: DateTime<Utc>) -> ProcessMetrics {
    let since = now - Duration::days(CYCLE_WINDOW_DAYS);
    let active: Vec<&Task> =
        tasks.iter().filter(|task| task.status != Some(TaskStatus::Done)).collect();
    let overdue = tasks.iter().filter(|task| task.status == Some(TaskStatus::Overdue)).count();
    let unassigned = active
        .iter()
        .filter(|task| task.assignee_id.as_deref().map_or(true, |id| id.trim().is_empty()))
        .count();

    let recent_cycles: Vec<f64> = tasks
        .iter()
        .filter(|task| task.status == Some(TaskStatus::Done))
        .filter(|task| task.completed_at.is_some_and(|completed| completed >= since))
        .filter_map(|task| task.cycle_time_days)
        .collect();
    let completed_last_30d = tasks
        .iter()
        .filter(|task| task.status == Some(TaskStatus::Done))
        .filter(|task| task.completed_at.is_some_and(|completed| completed >= since))
        .count();

    ProcessMetrics {
        avg_cycle_time_days: mean(&recent_cycles).map(|avg| round_f64(avg, 2)),
        active_tasks: active.len() as u32,
        overdue_tasks: overdue as u32,
        unassigned_tasks: unassigned as u32,
        completed_last_30d: completed_last_30d as u32,
        computed_at: now,
    }
}
