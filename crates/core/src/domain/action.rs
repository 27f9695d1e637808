use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::company::CompanyId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionLogId(pub String);

/// Oversight level supplied by the proposing agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskTier {
    /// Low risk and reversible: executes without approval.
    A,
    /// Supervised: a human approves before execution.
    B,
    /// Assisted: a human approves before execution.
    C,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            _ => None,
        }
    }

    pub fn requires_approval(&self) -> bool {
        !matches!(self, Self::A)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Proposed,
    Pending,
    AutoApproved,
    Approved,
    Rejected,
    Expired,
    Executing,
    Succeeded,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Pending => "pending",
            Self::AutoApproved => "auto_approved",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proposed" => Some(Self::Proposed),
            "pending" => Some(Self::Pending),
            "auto_approved" => Some(Self::AutoApproved),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "executing" => Some(Self::Executing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Expired | Self::Succeeded | Self::Failed)
    }
}

/// Status of a single append-only audit row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionLogStatus {
    /// Written before the dispatch of an attempt.
    Executing,
    /// Attempt failed and another one is scheduled.
    Retrying,
    Succeeded,
    Failed,
}

impl ActionLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "executing" => Some(Self::Executing),
            "retrying" => Some(Self::Retrying),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Side effect requested by an agent, one variant per known action type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "payload", rename_all = "snake_case")]
pub enum ActionPayload {
    SendInvoiceReminder {
        invoice_id: String,
        client_email: String,
        days_overdue: i64,
        reminder_number: u8,
    },
    TagDealZombie {
        deal_id: String,
        days_stagnant: i64,
        #[serde(default)]
        note: Option<String>,
    },
    AddDealNote {
        deal_id: String,
        note: String,
    },
    UpdateDealStage {
        deal_id: String,
        stage: String,
    },
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },
    IssueRefund {
        client_id: String,
        amount: Decimal,
        currency: String,
    },
    #[serde(skip)]
    Opaque {
        action_type: String,
        body: Value,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> &str {
        match self {
            Self::SendInvoiceReminder { .. } => "send_invoice_reminder",
            Self::TagDealZombie { .. } => "tag_deal_zombie",
            Self::AddDealNote { .. } => "add_deal_note",
            Self::UpdateDealStage { .. } => "update_deal_stage",
            Self::SendEmail { .. } => "send_email",
            Self::IssueRefund { .. } => "issue_refund",
            Self::Opaque { action_type, .. } => action_type,
        }
    }

    pub fn to_parts(&self) -> Result<(String, Value), serde_json::Error> {
        if let Self::Opaque { action_type, body } = self {
            return Ok((action_type.clone(), body.clone()));
        }
        let mut encoded = serde_json::to_value(self)?;
        let body = encoded.get_mut("payload").map(Value::take).unwrap_or(Value::Null);
        Ok((self.action_type().to_string(), body))
    }

    pub fn from_parts(action_type: &str, body: Value) -> Self {
        serde_json::from_value(json!({ "action_type": action_type, "payload": body.clone() }))
            .unwrap_or_else(|_| Self::Opaque { action_type: action_type.to_string(), body })
    }
}

/// Human-facing rendering of an action's effect.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPreview {
    #[default]
    None,
    Email {
        to: String,
        subject: String,
        body: String,
    },
    FieldChange {
        target: String,
        field: String,
        from: Option<String>,
        to: String,
    },
    Payment {
        amount: Decimal,
        currency: String,
        recipient: String,
    },
    #[serde(untagged)]
    Opaque(Value),
}

/// Outcome data returned by a dispatcher.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionResult(pub serde_json::Map<String, Value>);

impl ActionResult {
    /// Object values are kept as-is; anything else is wrapped as `{"value": ...}`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                Self(map)
            }
        }
    }
}

/// An action as submitted by an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub level: RiskTier,
    pub agent: String,
    pub payload: ActionPayload,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub preview: ActionPreview,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ActionProposal {
    pub fn action_type(&self) -> &str {
        self.payload.action_type()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub company_id: CompanyId,
    pub level: RiskTier,
    pub agent: String,
    pub payload: ActionPayload,
    pub payload_hash: String,
    pub description: String,
    pub preview: ActionPreview,
    pub idempotency_key: Option<String>,
    pub status: ActionStatus,
    pub result: Option<ActionResult>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl PendingAction {
    pub fn action_type(&self) -> &str {
        self.payload.action_type()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: ActionLogId,
    pub action_id: ActionId,
    pub company_id: CompanyId,
    pub level: RiskTier,
    pub agent: String,
    pub payload: ActionPayload,
    pub payload_hash: String,
    pub idempotency_key: Option<String>,
    pub status: ActionLogStatus,
    pub result: Option<ActionResult>,
    pub error: Option<String>,
    pub attempts: u32,
    pub executed_at: DateTime<Utc>,
}

impl ActionLog {
    pub fn action_type(&self) -> &str {
        self.payload.action_type()
    }
}

/// What an agent gets back after submitting or deciding an action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub action_id: ActionId,
    pub action_type: String,
    pub level: RiskTier,
    pub status: ActionStatus,
    pub attempts: u32,
    pub result: Option<ActionResult>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn proposal_decodes_known_payload_variant() {
        let proposal: ActionProposal = serde_json::from_value(json!({
            "level": "C",
            "agent": "cash_predictability",
            "payload": {
                "action_type": "issue_refund",
                "payload": { "client_id": "cl-9", "amount": "5000", "currency": "EUR" }
            },
            "description": "send €5,000 refund",
            "preview": { "kind": "payment", "amount": "5000", "currency": "EUR", "recipient": "cl-9" }
        }))
        .expect("proposal should decode");

        assert_eq!(proposal.action_type(), "issue_refund");
        assert!(proposal.level.requires_approval());
        assert!(matches!(proposal.preview, ActionPreview::Payment { .. }));
    }

    #[test]
    fn unknown_action_type_round_trips_as_opaque() {
        let payload = ActionPayload::from_parts("post_linkedin", json!({ "text": "hi" }));
        assert!(matches!(payload, ActionPayload::Opaque { .. }));

        let (action_type, body) = payload.to_parts().expect("encode");
        assert_eq!(action_type, "post_linkedin");
        assert_eq!(body, json!({ "text": "hi" }));
    }

    #[test]
    fn scalar_results_are_wrapped() {
        let result = ActionResult::from_value(json!(42));
        assert_eq!(serde_json::to_value(&result).expect("encode"), json!({ "value": 42 }));

        let object = ActionResult::from_value(json!({ "message_id": "m-1" }));
        assert_eq!(object.0.get("message_id"), Some(&json!("m-1")));
    }

    #[test]
    fn unknown_preview_shape_is_opaque() {
        let preview: ActionPreview =
            serde_json::from_value(json!({ "chart": [1, 2, 3] })).expect("decode");
        assert!(matches!(preview, ActionPreview::Opaque(_)));
    }
}
