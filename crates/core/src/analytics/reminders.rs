//! Reminder policy for overdue invoices and tasks near or past their due date.
//!
//! The planners only decide which reminders are due; the store's uniqueness
//! constraints make a second run in the same cycle a no-op.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::floor_days;
use crate::domain::company::{CashPredictabilityConfig, ProcessClarityConfig};
use crate::domain::history::{InvoiceReminder, TaskReminder, TaskReminderType};
use crate::domain::record::{Invoice, RecordId, Task, TaskStatus};

pub const MAX_INVOICE_REMINDERS: u8 = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedInvoiceReminder {
    pub invoice_id: RecordId,
    pub reminder_number: u8,
    pub days_overdue: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTaskReminder {
    pub task_id: RecordId,
    pub reminder_type: TaskReminderType,
    pub days_overdue: i64,
}

/// The next reminder number for each overdue invoice, if its day has come.
///
/// Reminder `n` is sent once the invoice is `reminder_day_n` days overdue and
/// at least `reminder_cooldown_days` after the previous one.
pub fn plan_invoice_reminders(
    invoices: &[Invoice],
    history: &[InvoiceReminder],
    config: &CashPredictabilityConfig,
    now: DateTime<Utc>,
) -> Vec<PlannedInvoiceReminder> {
    let days = config.reminder_days();
    let cooldown = Duration::days(i64::from(config.reminder_cooldown_days));

    invoices
        .iter()
        .filter_map(|invoice| {
            let days_overdue = invoice.days_overdue(now)?;
            let sent: Vec<&InvoiceReminder> =
                history.iter().filter(|reminder| reminder.invoice_id == invoice.meta.id).collect();
            let last_number = sent.iter().map(|reminder| reminder.reminder_number).max().unwrap_or(0);
            if last_number >= MAX_INVOICE_REMINDERS {
                return None;
            }
            if let Some(last_sent) = sent.iter().map(|reminder| reminder.sent_at).max() {
                if now - last_sent < cooldown {
                    return None;
                }
            }

            let reminder_number = last_number + 1;
            let threshold = i64::from(days[usize::from(reminder_number - 1)]);
            (days_overdue >= threshold.max(1)).then(|| PlannedInvoiceReminder {
                invoice_id: invoice.meta.id.clone(),
                reminder_number,
                days_overdue,
            })
        })
        .collect()
}

/// Deadline warnings, overdue alerts and escalations for open tasks.
pub fn plan_task_reminders(
    tasks: &[Task],
    history: &[TaskReminder],
    config: &ProcessClarityConfig,
    now: DateTime<Utc>,
) -> Vec<PlannedTaskReminder> {
    let today = now.date_naive();
    let escalation_cooldown = Duration::days(i64::from(config.escalation_cooldown_days));
    let warning_days = i64::from(config.deadline_warning_days);
    let escalation_after = i64::from(config.overdue_escalation_days);

    tasks
        .iter()
        .filter(|task| task.status != Some(TaskStatus::Done))
        .filter_map(|task| {
            let due_at = task.due_at?;
            let days_until_due = floor_days(now, due_at);
            let days_overdue = if due_at < now { floor_days(due_at, now) } else { -1 };

            let reminder_type = if (0..=warning_days).contains(&days_until_due) {
                TaskReminderType::DeadlineWarning
            } else if (1..=escalation_after).contains(&days_overdue) {
                TaskReminderType::OverdueAlert
            } else if days_overdue > escalation_after {
                TaskReminderType::Escalation
            } else {
                return None;
            };

            let mut previous = history.iter().filter(|reminder| {
                reminder.task_id == task.meta.id && reminder.reminder_type == reminder_type
            });
            let blocked = match reminder_type {
                TaskReminderType::Escalation => {
                    previous.any(|reminder| now - reminder.sent_at < escalation_cooldown)
                }
                _ => previous.any(|reminder| reminder.cycle_date == today),
            };
            (!blocked).then(|| PlannedTaskReminder {
                task_id: task.meta.id.clone(),
                reminder_type,
                days_overdue: days_overdue.max(0),
            })
        })
        .collect()
}
