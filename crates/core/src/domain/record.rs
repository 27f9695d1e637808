use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::company::{CompanyId, ToolCategory};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorSource {
    Hubspot,
    Salesforce,
    Pipedrive,
    Zoho,
    Quickbooks,
    Xero,
    Freshbooks,
    Sage,
    Excel,
    Stripe,
    Gocardless,
    Gmail,
    Outlook,
    Asana,
    Notion,
    Trello,
}

impl ConnectorSource {
    pub const ALL: [Self; 16] = [
        Self::Hubspot,
        Self::Salesforce,
        Self::Pipedrive,
        Self::Zoho,
        Self::Quickbooks,
        Self::Xero,
        Self::Freshbooks,
        Self::Sage,
        Self::Excel,
        Self::Stripe,
        Self::Gocardless,
        Self::Gmail,
        Self::Outlook,
        Self::Asana,
        Self::Notion,
        Self::Trello,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hubspot => "hubspot",
            Self::Salesforce => "salesforce",
            Self::Pipedrive => "pipedrive",
            Self::Zoho => "zoho",
            Self::Quickbooks => "quickbooks",
            Self::Xero => "xero",
            Self::Freshbooks => "freshbooks",
            Self::Sage => "sage",
            Self::Excel => "excel",
            Self::Stripe => "stripe",
            Self::Gocardless => "gocardless",
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Asana => "asana",
            Self::Notion => "notion",
            Self::Trello => "trello",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|source| source.as_str() == normalized)
    }

    pub fn category(&self) -> ToolCategory {
        match self {
            Self::Hubspot | Self::Salesforce | Self::Pipedrive | Self::Zoho => ToolCategory::Crm,
            Self::Quickbooks | Self::Xero | Self::Freshbooks | Self::Sage | Self::Excel => {
                ToolCategory::Finance
            }
            Self::Stripe | Self::Gocardless => ToolCategory::Payments,
            Self::Gmail | Self::Outlook => ToolCategory::Email,
            Self::Asana | Self::Notion | Self::Trello => ToolCategory::Project,
        }
    }
}

impl std::fmt::Display for ConnectorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Deal,
    Contact,
    Invoice,
    Task,
    Expense,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deal => "deal",
            Self::Contact => "contact",
            Self::Invoice => "invoice",
            Self::Task => "task",
            Self::Expense => "expense",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Deal => "deals",
            Self::Contact => "contacts",
            Self::Invoice => "invoices",
            Self::Task => "tasks",
            Self::Expense => "expenses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deal" | "deals" => Some(Self::Deal),
            "contact" | "contacts" => Some(Self::Contact),
            "invoice" | "invoices" => Some(Self::Invoice),
            "task" | "tasks" => Some(Self::Task),
            "expense" | "expenses" => Some(Self::Expense),
            _ => None,
        }
    }
}

/// Idempotency key of a synced record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub company_id: CompanyId,
    pub connector_source: ConnectorSource,
    pub raw_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub id: RecordId,
    pub company_id: CompanyId,
    pub connector_source: ConnectorSource,
    pub raw_id: String,
    pub synced_at: DateTime<Utc>,
    pub source_updated_at: DateTime<Utc>,
    pub field_versions: BTreeMap<String, DateTime<Utc>>,
    pub row_version: u32,
}

impl RecordMeta {
    pub fn key(&self) -> SyncKey {
        SyncKey {
            company_id: self.company_id.clone(),
            connector_source: self.connector_source,
            raw_id: self.raw_id.clone(),
        }
    }
}

macro_rules! open_status {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::Other(value) => value.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Self::$variant,)+
                    _ => Self::Other(value),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }
    };
}

open_status!(DealStatus { Active => "active", Won => "won", Lost => "lost", Stagnant => "stagnant" });
open_status!(InvoiceStatus { Draft => "draft", Sent => "sent", Paid => "paid", Overdue => "overdue" });
open_status!(TaskStatus { Todo => "todo", InProgress => "in_progress", Done => "done", Overdue => "overdue" });
open_status!(ScoreLabel { Hot => "hot", Warm => "warm", Cold => "cold" });

impl DealStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub meta: RecordMeta,
    pub title: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub stage: Option<String>,
    pub stage_order: Option<i64>,
    pub probability: Option<f64>,
    pub status: Option<DealStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub expected_close_date: Option<NaiveDate>,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub source: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub meta: RecordMeta,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    pub company_size: Option<String>,
    pub sector: Option<String>,
    pub source: Option<String>,
    pub source_detail: Option<String>,
    pub score: Option<u8>,
    pub score_label: Option<ScoreLabel>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub meta: RecordMeta,
    pub amount: Option<Decimal>,
    pub amount_paid: Option<Decimal>,
    pub currency: Option<String>,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub issued_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_delay_days: Option<i64>,
}

impl Invoice {
    /// Whole days past `due_at`, or `None` when the invoice is not outstanding.
    pub fn days_overdue(&self, now: DateTime<Utc>) -> Option<i64> {
        let outstanding = matches!(
            self.status,
            Some(InvoiceStatus::Overdue) | Some(InvoiceStatus::Sent)
        );
        if !outstanding {
            return None;
        }
        let due_at = self.due_at?;
        let days = (now - due_at).num_days();
        match self.status {
            Some(InvoiceStatus::Overdue) => Some(days.max(0)),
            _ if days > 0 => Some(days),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub meta: RecordMeta,
    pub title: Option<String>,
    pub description: Option<String>,
    pub assignee_id: Option<String>,
    pub assignee_name: Option<String>,
    pub status: Option<TaskStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cycle_time_days: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub meta: RecordMeta,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub is_recurring: Option<bool>,
    pub date: Option<NaiveDate>,
}

/// A canonical record of any kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncedRecord {
    Deal(Deal),
    Contact(Contact),
    Invoice(Invoice),
    Task(Task),
    Expense(Expense),
}

impl SyncedRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Deal(_) => RecordKind::Deal,
            Self::Contact(_) => RecordKind::Contact,
            Self::Invoice(_) => RecordKind::Invoice,
            Self::Task(_) => RecordKind::Task,
            Self::Expense(_) => RecordKind::Expense,
        }
    }

    pub fn meta(&self) -> &RecordMeta {
        match self {
            Self::Deal(record) => &record.meta,
            Self::Contact(record) => &record.meta,
            Self::Invoice(record) => &record.meta,
            Self::Task(record) => &record.meta,
            Self::Expense(record) => &record.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut RecordMeta {
        match self {
            Self::Deal(record) => &mut record.meta,
            Self::Contact(record) => &mut record.meta,
            Self::Invoice(record) => &mut record.meta,
            Self::Task(record) => &mut record.meta,
            Self::Expense(record) => &mut record.meta,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DealFields {
    pub title: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub stage: Option<String>,
    pub stage_order: Option<i64>,
    pub probability: Option<f64>,
    pub status: Option<DealStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub expected_close_date: Option<NaiveDate>,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub source: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactFields {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    pub company_size: Option<String>,
    pub sector: Option<String>,
    pub source: Option<String>,
    pub source_detail: Option<String>,
    pub score: Option<u8>,
    pub score_label: Option<ScoreLabel>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceFields {
    pub amount: Option<Decimal>,
    pub amount_paid: Option<Decimal>,
    pub currency: Option<String>,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub issued_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_delay_days: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub assignee_id: Option<String>,
    pub assignee_name: Option<String>,
    pub status: Option<TaskStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cycle_time_days: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpenseFields {
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub is_recurring: Option<bool>,
    pub date: Option<NaiveDate>,
}

/// Field payload supplied by a connector, one variant per record kind.
/// Absent fields leave the stored value untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordFields {
    Deal(DealFields),
    Contact(ContactFields),
    Invoice(InvoiceFields),
    Task(TaskFields),
    Expense(ExpenseFields),
}

impl RecordFields {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Deal(_) => RecordKind::Deal,
            Self::Contact(_) => RecordKind::Contact,
            Self::Invoice(_) => RecordKind::Invoice,
            Self::Task(_) => RecordKind::Task,
            Self::Expense(_) => RecordKind::Expense,
        }
    }
}

/// A record as delivered by a connector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub connector_source: String,
    pub raw_id: String,
    pub source_updated_at: DateTime<Utc>,
    pub fields: RecordFields,
}
