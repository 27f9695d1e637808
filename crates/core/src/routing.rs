//! Cross-agent signals derived from published events.
//!
//! Each rule maps an event onto the company's agent configuration. Rules only
//! ever set values taken from the event itself, so replaying an event leaves
//! the configuration unchanged.

use crate::domain::company::AgentConfigs;
use crate::domain::event::{Event, EventPayload};

pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.3;
pub const CASH_PRESSURE_DAYS: i64 = 45;

#[derive(Clone, Debug, PartialEq)]
pub enum RoutingDecision {
    /// Nothing listens to this event type.
    Unrouted,
    /// A rule matched but the configuration already reflects the event.
    Unchanged,
    UpdateAgentConfigs(AgentConfigs),
}

pub fn is_routed(event_type: &str) -> bool {
    matches!(event_type, "forecast_updated" | "cash_forecast_updated" | "cac_updated")
}

pub fn route(event: &Event, current: &AgentConfigs) -> RoutingDecision {
    let mut next = current.clone();
    match &event.payload {
        EventPayload::ForecastUpdated { confidence, .. } => {
            if *confidence < LOW_CONFIDENCE_THRESHOLD {
                next.revenue_velocity.last_low_confidence_alert = Some(event.created_at);
            }
        }
        EventPayload::CashForecastUpdated { days_until_critical, .. } => {
            next.revenue_velocity.cash_pressure_mode =
                days_until_critical.is_some_and(|days| days < CASH_PRESSURE_DAYS);
        }
        EventPayload::CacUpdated { cac_by_source, top_source, .. } => {
            next.revenue_velocity.cac_by_source = cac_by_source.clone();
            next.revenue_velocity.top_acquisition_source = top_source.clone();
        }
        _ => return RoutingDecision::Unrouted,
    }

    if next == *current {
        RoutingDecision::Unchanged
    } else {
        RoutingDecision::UpdateAgentConfigs(next)
    }
}
