use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use kuria_core::domain::action::{
    ActionId, ActionLog, ActionLogId, ActionLogStatus, ActionPayload, ActionResult, ActionStatus,
    PendingAction, RiskTier,
};
use kuria_core::domain::company::CompanyId;

use super::codec::{
    get_enum, get_json, get_optional_json, get_optional_timestamp, get_timestamp, parse_json,
    parse_u32, timestamp, to_json,
};
use super::{ActionRepository, RepositoryError};
use crate::DbPool;

const PENDING_COLUMNS: &str = "id, company_id, action_type, level, agent, payload, payload_hash, \
                               description, preview, idempotency_key, status, result, decided_by, \
                               decided_at, created_at, executed_at";

const LOG_COLUMNS: &str = "id, action_id, company_id, action_type, level, agent, payload, \
                           payload_hash, idempotency_key, status, result, error, attempts, \
                           executed_at";

pub struct SqlActionRepository {
    pool: DbPool,
}

impl SqlActionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn payload_parts(payload: &ActionPayload) -> Result<(String, String), RepositoryError> {
    let (action_type, body) = payload
        .to_parts()
        .map_err(|error| RepositoryError::Decode(format!("cannot encode action payload: {error}")))?;
    Ok((action_type, to_json("payload", &body)?))
}

#[async_trait::async_trait]
impl ActionRepository for SqlActionRepository {
    async fn insert_pending(&self, action: &PendingAction) -> Result<(), RepositoryError> {
        let (action_type, payload) = payload_parts(&action.payload)?;

        sqlx::query(&format!(
            "INSERT INTO pending_actions ({PENDING_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&action.id.0)
        .bind(&action.company_id.0)
        .bind(action_type)
        .bind(action.level.as_str())
        .bind(&action.agent)
        .bind(payload)
        .bind(&action.payload_hash)
        .bind(&action.description)
        .bind(to_json("preview", &action.preview)?)
        .bind(action.idempotency_key.as_deref())
        .bind(action.status.as_str())
        .bind(action.result.as_ref().map(|result| to_json("result", result)).transpose()?)
        .bind(action.decided_by.as_deref())
        .bind(action.decided_at.map(timestamp))
        .bind(timestamp(action.created_at))
        .bind(action.executed_at.map(timestamp))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            RepositoryError::from_write(error, || {
                format!(
                    "action with idempotency key {:?} already exists for company {}",
                    action.idempotency_key, action.company_id
                )
            })
        })?;

        Ok(())
    }

    async fn find(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_actions WHERE company_id = ? AND id = ?"
        ))
        .bind(&company_id.0)
        .bind(&action_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(pending_from_row).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        company_id: &CompanyId,
        idempotency_key: &str,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS}
             FROM pending_actions
             WHERE company_id = ? AND idempotency_key = ?"
        ))
        .bind(&company_id.0)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(pending_from_row).transpose()
    }

    async fn list_by_status(
        &self,
        company_id: &CompanyId,
        status: ActionStatus,
    ) -> Result<Vec<PendingAction>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS}
             FROM pending_actions
             WHERE company_id = ? AND status = ?
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(&company_id.0)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    async fn decide(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        to: ActionStatus,
        decided_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE pending_actions
             SET status = ?, decided_by = ?, decided_at = ?
             WHERE company_id = ? AND id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(decided_by)
        .bind(timestamp(now))
        .bind(&company_id.0)
        .bind(&action_id.0)
        .bind(ActionStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn transition(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE pending_actions SET status = ? WHERE company_id = ? AND id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(&company_id.0)
        .bind(&action_id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn finish(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
        to: ActionStatus,
        result: Option<&ActionResult>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE pending_actions
             SET status = ?, result = ?, executed_at = ?
             WHERE company_id = ? AND id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(result.map(|result| to_json("result", result)).transpose()?)
        .bind(timestamp(now))
        .bind(&company_id.0)
        .bind(&action_id.0)
        .bind(ActionStatus::Executing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn append_log(&self, log: &ActionLog) -> Result<(), RepositoryError> {
        let (action_type, payload) = payload_parts(&log.payload)?;

        sqlx::query(&format!(
            "INSERT INTO action_logs ({LOG_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&log.id.0)
        .bind(&log.action_id.0)
        .bind(&log.company_id.0)
        .bind(action_type)
        .bind(log.level.as_str())
        .bind(&log.agent)
        .bind(payload)
        .bind(&log.payload_hash)
        .bind(log.idempotency_key.as_deref())
        .bind(log.status.as_str())
        .bind(log.result.as_ref().map(|result| to_json("result", result)).transpose()?)
        .bind(log.error.as_deref())
        .bind(i64::from(log.attempts))
        .bind(timestamp(log.executed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_logs(
        &self,
        company_id: &CompanyId,
        action_id: Option<&ActionId>,
    ) -> Result<Vec<ActionLog>, RepositoryError> {
        let rows = match action_id {
            Some(action_id) => {
                sqlx::query(&format!(
                    "SELECT {LOG_COLUMNS}
                     FROM action_logs
                     WHERE company_id = ? AND action_id = ?
                     ORDER BY executed_at ASC, rowid ASC"
                ))
                .bind(&company_id.0)
                .bind(&action_id.0)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {LOG_COLUMNS}
                     FROM action_logs
                     WHERE company_id = ?
                     ORDER BY executed_at ASC, rowid ASC"
                ))
                .bind(&company_id.0)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(log_from_row).collect()
    }

    async fn latest_log(
        &self,
        company_id: &CompanyId,
        action_id: &ActionId,
    ) -> Result<Option<ActionLog>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS}
             FROM action_logs
             WHERE company_id = ? AND action_id = ?
             ORDER BY executed_at DESC, rowid DESC
             LIMIT 1"
        ))
        .bind(&company_id.0)
        .bind(&action_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(log_from_row).transpose()
    }
}

fn payload_from_row(row: &SqliteRow) -> Result<ActionPayload, RepositoryError> {
    let action_type: String = row.try_get("action_type")?;
    let raw: String = row.try_get("payload")?;
    Ok(ActionPayload::from_parts(&action_type, parse_json("payload", &raw)?))
}

fn pending_from_row(row: &SqliteRow) -> Result<PendingAction, RepositoryError> {
    Ok(PendingAction {
        id: ActionId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        level: get_enum(row, "level", RiskTier::parse)?,
        agent: row.try_get("agent")?,
        payload: payload_from_row(row)?,
        payload_hash: row.try_get("payload_hash")?,
        description: row.try_get("description")?,
        preview: get_json(row, "preview")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: get_enum(row, "status", ActionStatus::parse)?,
        result: get_optional_json(row, "result")?,
        decided_by: row.try_get("decided_by")?,
        decided_at: get_optional_timestamp(row, "decided_at")?,
        created_at: get_timestamp(row, "created_at")?,
        executed_at: get_optional_timestamp(row, "executed_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<ActionLog, RepositoryError> {
    Ok(ActionLog {
        id: ActionLogId(row.try_get("id")?),
        action_id: ActionId(row.try_get("action_id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        level: get_enum(row, "level", RiskTier::parse)?,
        agent: row.try_get("agent")?,
        payload: payload_from_row(row)?,
        payload_hash: row.try_get("payload_hash")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status: get_enum(row, "status", ActionLogStatus::parse)?,
        result: get_optional_json(row, "result")?,
        error: row.try_get("error")?,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        executed_at: get_timestamp(row, "executed_at")?,
    })
}
