//! Append-only historical facts written by analytics jobs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::company::CompanyId;
use crate::domain::record::RecordId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealOutcome {
    Won,
    Lost,
}

impl DealOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WinLossAnalysis {
    pub id: String,
    pub company_id: CompanyId,
    pub deal_id: RecordId,
    pub deal_title: Option<String>,
    pub outcome: DealOutcome,
    pub total_days: i64,
    pub avg_won_days: f64,
    /// Narrative filled in later by an agent; this core never writes it.
    pub analysis: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceReminder {
    pub id: String,
    pub company_id: CompanyId,
    pub invoice_id: RecordId,
    pub reminder_number: u8,
    pub days_overdue: i64,
    pub cycle_date: NaiveDate,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskReminderType {
    DeadlineWarning,
    OverdueAlert,
    Escalation,
}

impl TaskReminderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeadlineWarning => "deadline_warning",
            Self::OverdueAlert => "overdue_alert",
            Self::Escalation => "escalation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deadline_warning" => Some(Self::DeadlineWarning),
            "overdue_alert" => Some(Self::OverdueAlert),
            "escalation" => Some(Self::Escalation),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReminder {
    pub id: String,
    pub company_id: CompanyId,
    pub task_id: RecordId,
    pub reminder_type: TaskReminderType,
    pub cycle_date: NaiveDate,
    pub sent_at: DateTime<Utc>,
}
