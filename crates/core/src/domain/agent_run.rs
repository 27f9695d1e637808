use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::company::CompanyId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRunId(pub String);

impl std::fmt::Display for AgentRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One execution of an external agent. Frozen once `finished_at` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: AgentRunId,
    pub company_id: CompanyId,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub kpi_name: Option<String>,
    pub kpi_value: Option<f64>,
    pub actions_count: u32,
    pub errors: Vec<String>,
    pub success: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl AgentRun {
    pub fn start(
        id: AgentRunId,
        company_id: CompanyId,
        agent: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            company_id,
            agent: agent.into(),
            started_at: now,
            finished_at: None,
            duration_seconds: None,
            kpi_name: None,
            kpi_value: None,
            actions_count: 0,
            errors: Vec::new(),
            success: None,
            created_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Applies an outcome to a still-open run. Returns `None` when the run was
    /// already finished.
    pub fn finish(&self, outcome: AgentRunOutcome, now: DateTime<Utc>) -> Option<Self> {
        if self.is_finished() {
            return None;
        }
        let elapsed = now.signed_duration_since(self.started_at);
        let duration_seconds = (elapsed.num_milliseconds().max(0) as f64) / 1000.0;
        let success = outcome.errors.is_empty();
        Some(Self {
            finished_at: Some(now),
            duration_seconds: Some(duration_seconds),
            kpi_name: outcome.kpi_name,
            kpi_value: outcome.kpi_value,
            actions_count: outcome.actions_count,
            errors: outcome.errors,
            success: Some(success),
            ..self.clone()
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRunOutcome {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub kpi_name: Option<String>,
    #[serde(default)]
    pub kpi_value: Option<f64>,
    #[serde(default)]
    pub actions_count: u32,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    #[test]
    fn finish_records_duration_and_success_from_errors() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let run = AgentRun::start(
            AgentRunId("run-1".to_string()),
            CompanyId("co-1".to_string()),
            "revenue_velocity",
            started,
        );

        let finished = run
            .finish(
                AgentRunOutcome {
                    errors: vec!["crm timeout".to_string()],
                    kpi_name: Some("revenue_velocity".to_string()),
                    kpi_value: Some(412.5),
                    actions_count: 2,
                },
                started + Duration::seconds(90),
            )
            .expect("open run finishes");

        assert_eq!(finished.duration_seconds, Some(90.0));
        assert_eq!(finished.success, Some(false));
        assert_eq!(finished.errors, vec!["crm timeout".to_string()]);
        assert!(finished.finish(AgentRunOutcome::default(), started).is_none());
    }
}
