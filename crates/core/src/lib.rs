pub mod analytics;
pub mod config;
pub mod domain;
pub mod errors;
pub mod governance;
pub mod routing;
pub mod sync;

pub use analytics::{AnalyticsInputError, CompanyRecords};
pub use domain::action::{
    ActionId, ActionLog, ActionPayload, ActionPreview, ActionProposal, ActionReceipt,
    ActionResult, ActionStatus, PendingAction, RiskTier,
};
pub use domain::company::{AgentConfigs, Company, CompanyId, ToolCategory, ToolsConnected};
pub use domain::event::{Event, EventId, EventPayload, MarkOutcome};
pub use domain::record::{RawRecord, RecordFields, RecordId, RecordKind, SyncedRecord};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use governance::{GovernanceEngine, GovernanceEngineConfig};
pub use sync::SyncPlan;
