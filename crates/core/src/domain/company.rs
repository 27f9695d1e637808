use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::record::ConnectorSource;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompanyId(pub String);

impl std::fmt::Display for CompanyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Crm,
    Finance,
    Payments,
    Email,
    Project,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crm => "crm",
            Self::Finance => "finance",
            Self::Payments => "payments",
            Self::Email => "email",
            Self::Project => "project",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "crm" => Some(Self::Crm),
            "finance" => Some(Self::Finance),
            "payments" => Some(Self::Payments),
            "email" => Some(Self::Email),
            "project" => Some(Self::Project),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConnection {
    pub connector: ConnectorSource,
    pub connected_at: DateTime<Utc>,
}

/// Connected tools by category. Categories this build does not know about are
/// carried through untouched in `other`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsConnected {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crm: Option<ToolConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finance: Option<ToolConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payments: Option<ToolConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<ToolConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ToolConnection>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl ToolsConnected {
    pub fn get(&self, category: ToolCategory) -> Option<&ToolConnection> {
        match category {
            ToolCategory::Crm => self.crm.as_ref(),
            ToolCategory::Finance => self.finance.as_ref(),
            ToolCategory::Payments => self.payments.as_ref(),
            ToolCategory::Email => self.email.as_ref(),
            ToolCategory::Project => self.project.as_ref(),
        }
    }

    pub fn set(&mut self, category: ToolCategory, connection: ToolConnection) {
        let slot = match category {
            ToolCategory::Crm => &mut self.crm,
            ToolCategory::Finance => &mut self.finance,
            ToolCategory::Payments => &mut self.payments,
            ToolCategory::Email => &mut self.email,
            ToolCategory::Project => &mut self.project,
        };
        *slot = Some(connection);
    }

    pub fn is_connected(&self, category: ToolCategory) -> bool {
        self.get(category).is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevenueVelocityConfig {
    pub stagnation_threshold_days: u32,
    pub hot_score_threshold: u8,
    pub warm_score_threshold: u8,
    pub cash_pressure_mode: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub cac_by_source: BTreeMap<String, Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_acquisition_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_low_confidence_alert: Option<DateTime<Utc>>,
}

impl Default for RevenueVelocityConfig {
    fn default() -> Self {
        Self {
            stagnation_threshold_days: 21,
            hot_score_threshold: 70,
            warm_score_threshold: 40,
            cash_pressure_mode: false,
            cac_by_source: BTreeMap::new(),
            top_acquisition_source: None,
            last_low_confidence_alert: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CashPredictabilityConfig {
    /// When unset the threshold is derived from monthly burn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical_threshold: Option<Decimal>,
    /// When unset the balance is derived from payments received minus expenses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_balance: Option<Decimal>,
    pub reminder_day_1: u32,
    pub reminder_day_2: u32,
    pub reminder_day_3: u32,
    pub reminder_cooldown_days: u32,
    pub escalation_days: u32,
}

impl CashPredictabilityConfig {
    pub fn reminder_days(&self) -> [u32; 3] {
        [self.reminder_day_1, self.reminder_day_2, self.reminder_day_3]
    }
}

impl Default for CashPredictabilityConfig {
    fn default() -> Self {
        Self {
            critical_threshold: None,
            current_balance: None,
            reminder_day_1: 1,
            reminder_day_2: 7,
            reminder_day_3: 15,
            reminder_cooldown_days: 7,
            escalation_days: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessClarityConfig {
    pub deadline_warning_days: u32,
    pub overdue_escalation_days: u32,
    pub escalation_cooldown_days: u32,
}

impl Default for ProcessClarityConfig {
    fn default() -> Self {
        Self { deadline_warning_days: 2, overdue_escalation_days: 3, escalation_cooldown_days: 3 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionEfficiencyConfig {
    pub period_days: u32,
    pub cac_anomaly_threshold: f64,
    pub marketing_keywords: Vec<String>,
}

impl Default for AcquisitionEfficiencyConfig {
    fn default() -> Self {
        Self {
            period_days: 90,
            cac_anomaly_threshold: 0.30,
            marketing_keywords: [
                "marketing",
                "advertising",
                "publicite",
                "ads",
                "pub",
                "communication",
                "acquisition",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

/// Per-agent settings. Stored JSON is read over the defaults, so a partial
/// object only overrides the keys it carries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfigs {
    pub revenue_velocity: RevenueVelocityConfig,
    pub cash_predictability: CashPredictabilityConfig,
    pub process_clarity: ProcessClarityConfig,
    pub acquisition_efficiency: AcquisitionEfficiencyConfig,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub sector: Option<String>,
    pub size_employees: Option<u32>,
    pub size_revenue: Option<Decimal>,
    pub tools_connected: ToolsConnected,
    pub clarity_score: u8,
    pub agent_configs: AgentConfigs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Company {
    pub fn new(id: CompanyId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            sector: None,
            size_employees: None,
            size_revenue: None,
            tools_connected: ToolsConnected::default(),
            clarity_score: 0,
            agent_configs: AgentConfigs::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub name: Option<String>,
    pub sector: Option<String>,
    pub size_employees: Option<u32>,
    pub size_revenue: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AgentConfigs, ToolCategory, ToolsConnected};

    #[test]
    fn partial_agent_config_keeps_defaults_for_missing_keys() {
        let configs: AgentConfigs = serde_json::from_value(json!({
            "process_clarity": { "deadline_warning_days": 5 },
            "weekly_report": { "send_on": "monday" }
        }))
        .expect("agent configs should decode");

        assert_eq!(configs.process_clarity.deadline_warning_days, 5);
        assert_eq!(configs.process_clarity.overdue_escalation_days, 3);
        assert_eq!(configs.revenue_velocity.stagnation_threshold_days, 21);
        assert_eq!(configs.acquisition_efficiency.period_days, 90);
        assert_eq!(configs.other.get("weekly_report"), Some(&json!({ "send_on": "monday" })));
    }

    #[test]
    fn unknown_tool_categories_survive_a_round_trip() {
        let tools: ToolsConnected = serde_json::from_value(json!({
            "crm": { "connector": "hubspot", "connected_at": "2026-01-10T09:00:00Z" },
            "calendar": { "connector": "gcal" }
        }))
        .expect("tools should decode");

        assert!(tools.is_connected(ToolCategory::Crm));
        assert!(!tools.is_connected(ToolCategory::Finance));

        let encoded = serde_json::to_value(&tools).expect("tools should encode");
        assert_eq!(encoded["calendar"], json!({ "connector": "gcal" }));
    }
}
