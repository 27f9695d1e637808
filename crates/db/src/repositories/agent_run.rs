use sqlx::{sqlite::SqliteRow, Row};

use kuria_core::domain::agent_run::{AgentRun, AgentRunId};
use kuria_core::domain::company::CompanyId;

use super::codec::{get_json, get_optional_timestamp, get_timestamp, parse_u32, timestamp, to_json};
use super::{AgentRunRepository, RepositoryError};
use crate::DbPool;

const RUN_COLUMNS: &str = "id, company_id, agent, started_at, finished_at, duration_seconds, \
                           kpi_name, kpi_value, actions_count, errors, success, created_at";

pub struct SqlAgentRunRepository {
    pool: DbPool,
}

impl SqlAgentRunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AgentRunRepository for SqlAgentRunRepository {
    async fn insert(&self, run: &AgentRun) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO agent_runs ({RUN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&run.id.0)
        .bind(&run.company_id.0)
        .bind(&run.agent)
        .bind(timestamp(run.started_at))
        .bind(run.finished_at.map(timestamp))
        .bind(run.duration_seconds)
        .bind(run.kpi_name.as_deref())
        .bind(run.kpi_value)
        .bind(i64::from(run.actions_count))
        .bind(to_json("errors", &run.errors)?)
        .bind(run.success)
        .bind(timestamp(run.created_at))
        .execute(&self.pool)
        .await
        .map_err(|error| RepositoryError::from_write(error, || format!("agent run {} exists", run.id)))?;

        Ok(())
    }

    async fn find(
        &self,
        company_id: &CompanyId,
        run_id: &AgentRunId,
    ) -> Result<Option<AgentRun>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM agent_runs WHERE company_id = ? AND id = ?"
        ))
        .bind(&company_id.0)
        .bind(&run_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn finish(&self, run: &AgentRun) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE agent_runs
             SET finished_at = ?,
                 duration_seconds = ?,
                 kpi_name = ?,
                 kpi_value = ?,
                 actions_count = ?,
                 errors = ?,
                 success = ?
             WHERE company_id = ? AND id = ? AND finished_at IS NULL",
        )
        .bind(run.finished_at.map(timestamp))
        .bind(run.duration_seconds)
        .bind(run.kpi_name.as_deref())
        .bind(run.kpi_value)
        .bind(i64::from(run.actions_count))
        .bind(to_json("errors", &run.errors)?)
        .bind(run.success)
        .bind(&run.company_id.0)
        .bind(&run.id.0)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn list(
        &self,
        company_id: &CompanyId,
        limit: u32,
    ) -> Result<Vec<AgentRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS}
             FROM agent_runs
             WHERE company_id = ?
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?"
        ))
        .bind(&company_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }
}

fn run_from_row(row: &SqliteRow) -> Result<AgentRun, RepositoryError> {
    Ok(AgentRun {
        id: AgentRunId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        agent: row.try_get("agent")?,
        started_at: get_timestamp(row, "started_at")?,
        finished_at: get_optional_timestamp(row, "finished_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        kpi_name: row.try_get("kpi_name")?,
        kpi_value: row.try_get("kpi_value")?,
        actions_count: parse_u32("actions_count", row.try_get("actions_count")?)?,
        errors: get_json(row, "errors")?,
        success: row.try_get("success")?,
        created_at: get_timestamp(row, "created_at")?,
    })
}
