use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::company::CompanyId;
use crate::domain::record::{ConnectorSource, RecordId, RecordKind};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed event body. Stored as `event_type` + `payload` columns; types this
/// build does not recognise decode to [`EventPayload::Opaque`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    DealCreated(RecordCreated),
    ContactCreated(RecordCreated),
    InvoiceCreated(RecordCreated),
    TaskCreated(RecordCreated),
    ExpenseCreated(RecordCreated),
    DealStageChanged {
        record_id: RecordId,
        from_stage: Option<String>,
        to_stage: Option<String>,
    },
    DealClosed {
        record_id: RecordId,
        status: String,
        amount: Option<Decimal>,
    },
    InvoicePaid {
        record_id: RecordId,
        amount_paid: Option<Decimal>,
    },
    InvoiceOverdue {
        record_id: RecordId,
        amount: Option<Decimal>,
        due_at: Option<DateTime<Utc>>,
    },
    TaskCompleted {
        record_id: RecordId,
        cycle_time_days: Option<f64>,
    },
    ContactScoreChanged {
        record_id: RecordId,
        from: Option<String>,
        to: Option<String>,
    },
    ForecastUpdated {
        forecast_30d: Decimal,
        confidence: f64,
    },
    CashForecastUpdated {
        days_until_critical: Option<i64>,
        runway_months: Option<Decimal>,
    },
    ProcessMetricsUpdated {
        overdue_tasks: u32,
        avg_cycle_time_days: Option<f64>,
    },
    CacUpdated {
        blended_cac: Decimal,
        cac_by_source: BTreeMap<String, Decimal>,
        top_source: Option<String>,
    },
    InvoiceReminderDue {
        record_id: RecordId,
        reminder_number: u8,
        days_overdue: i64,
    },
    TaskReminderDue {
        record_id: RecordId,
        reminder_type: String,
    },
    #[serde(skip)]
    Opaque {
        event_type: String,
        body: Value,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCreated {
    pub record_id: RecordId,
    pub connector_source: ConnectorSource,
    pub raw_id: String,
}

impl EventPayload {
    pub fn created(kind: RecordKind, created: RecordCreated) -> Self {
        match kind {
            RecordKind::Deal => Self::DealCreated(created),
            RecordKind::Contact => Self::ContactCreated(created),
            RecordKind::Invoice => Self::InvoiceCreated(created),
            RecordKind::Task => Self::TaskCreated(created),
            RecordKind::Expense => Self::ExpenseCreated(created),
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::DealCreated(_) => "deal_created",
            Self::ContactCreated(_) => "contact_created",
            Self::InvoiceCreated(_) => "invoice_created",
            Self::TaskCreated(_) => "task_created",
            Self::ExpenseCreated(_) => "expense_created",
            Self::DealStageChanged { .. } => "deal_stage_changed",
            Self::DealClosed { .. } => "deal_closed",
            Self::InvoicePaid { .. } => "invoice_paid",
            Self::InvoiceOverdue { .. } => "invoice_overdue",
            Self::TaskCompleted { .. } => "task_completed",
            Self::ContactScoreChanged { .. } => "contact_score_changed",
            Self::ForecastUpdated { .. } => "forecast_updated",
            Self::CashForecastUpdated { .. } => "cash_forecast_updated",
            Self::ProcessMetricsUpdated { .. } => "process_metrics_updated",
            Self::CacUpdated { .. } => "cac_updated",
            Self::InvoiceReminderDue { .. } => "invoice_reminder_due",
            Self::TaskReminderDue { .. } => "task_reminder_due",
            Self::Opaque { event_type, .. } => event_type,
        }
    }

    /// Splits the payload into its stored `(event_type, body)` columns.
    pub fn to_parts(&self) -> Result<(String, Value), serde_json::Error> {
        if let Self::Opaque { event_type, body } = self {
            return Ok((event_type.clone(), body.clone()));
        }
        let mut encoded = serde_json::to_value(self)?;
        let body = encoded.get_mut("payload").map(Value::take).unwrap_or(Value::Null);
        Ok((self.event_type().to_string(), body))
    }

    pub fn from_parts(event_type: &str, body: Value) -> Self {
        serde_json::from_value(json!({ "event_type": event_type, "payload": body.clone() }))
            .unwrap_or_else(|_| Self::Opaque { event_type: event_type.to_string(), body })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub company_id: CompanyId,
    pub payload: EventPayload,
    pub processed: bool,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(id: EventId, company_id: CompanyId, payload: EventPayload, now: DateTime<Utc>) -> Self {
        Self {
            id,
            company_id,
            payload,
            processed: false,
            claimed_by: None,
            claim_expires_at: None,
            processed_at: None,
            created_at: now,
        }
    }

    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }
}

/// Result of marking an event processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkOutcome {
    Marked,
    /// The event was already consumed; a redelivery is a no-op.
    AlreadyProcessed,
    NotFound,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn known_payload_splits_into_type_and_body() {
        let payload = EventPayload::DealStageChanged {
            record_id: RecordId("deal-1".to_string()),
            from_stage: Some("qualification".to_string()),
            to_stage: Some("proposal".to_string()),
        };

        let (event_type, body) = payload.to_parts().expect("encode");
        assert_eq!(event_type, "deal_stage_changed");
        assert_eq!(body["to_stage"], json!("proposal"));

        assert_eq!(EventPayload::from_parts(&event_type, body), payload);
    }

    #[test]
    fn unknown_event_type_falls_back_to_opaque() {
        let decoded = EventPayload::from_parts("weekly_report_sent", json!({ "week": 12 }));

        assert_eq!(decoded.event_type(), "weekly_report_sent");
        assert!(matches!(decoded, EventPayload::Opaque { ref body, .. } if body["week"] == 12));

        let (event_type, body) = decoded.to_parts().expect("opaque encodes");
        assert_eq!(event_type, "weekly_report_sent");
        assert_eq!(body, json!({ "week": 12 }));
    }

    #[test]
    fn malformed_known_payload_is_kept_as_opaque() {
        let decoded = EventPayload::from_parts("cac_updated", json!({ "blended_cac": "oops" }));
        assert!(matches!(decoded, EventPayload::Opaque { .. }));
        assert_eq!(decoded.event_type(), "cac_updated");
    }
}
