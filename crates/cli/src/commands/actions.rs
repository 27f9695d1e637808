use chrono::Utc;
use kuria_core::domain::action::ActionId;
use kuria_core::domain::company::CompanyId;
use serde_json::{json, Value};

use crate::commands::{with_runtime, CommandFailure, CommandResult};

pub fn pending(company_id: CompanyId) -> CommandResult {
    with_runtime("pending", |runtime| async move {
        let actions =
            runtime.governor.list_pending(&company_id).await.map_err(CommandFailure::from_service)?;
        let rows: Vec<Value> = actions
            .iter()
            .map(|action| {
                json!({
                    "action_id": action.id,
                    "level": action.level,
                    "agent": action.agent,
                    "action_type": action.action_type(),
                    "description": action.description,
                    "created_at": action.created_at,
                })
            })
            .collect();
        Ok((format!("{} action(s) awaiting approval", rows.len()), Value::Array(rows)))
    })
}

pub fn reject(company_id: CompanyId, action_id: ActionId, decided_by: String) -> CommandResult {
    with_runtime("reject", |runtime| async move {
        let receipt = runtime
            .governor
            .reject(&company_id, &action_id, &decided_by, Utc::now())
            .await
            .map_err(CommandFailure::from_service)?;
        Ok((format!("action `{action_id}` rejected"), json!(receipt)))
    })
}

pub fn expire(company_id: CompanyId, action_id: ActionId) -> CommandResult {
    with_runtime("expire", |runtime| async move {
        let receipt = runtime
            .governor
            .expire(&company_id, &action_id, Utc::now())
            .await
            .map_err(CommandFailure::from_service)?;
        Ok((format!("action `{action_id}` expired"), json!(receipt)))
    })
}
