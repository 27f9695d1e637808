use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use kuria_core::domain::company::{
    AgentConfigs, Company, CompanyId, CompanyProfile, ToolCategory, ToolConnection, ToolsConnected,
};

use super::codec::{
    get_json, get_optional_decimal, get_timestamp, parse_json, parse_u32, timestamp, to_json,
};
use super::{CompanyRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCompanyRepository {
    pool: DbPool,
}

impl SqlCompanyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CompanyRepository for SqlCompanyRepository {
    async fn create(&self, company: &Company) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO companies (
                id,
                name,
                sector,
                size_employees,
                size_revenue,
                tools_connected,
                clarity_score,
                agent_configs,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&company.id.0)
        .bind(&company.name)
        .bind(company.sector.as_deref())
        .bind(company.size_employees.map(i64::from))
        .bind(company.size_revenue.map(|value| value.to_string()))
        .bind(to_json("tools_connected", &company.tools_connected)?)
        .bind(i64::from(company.clarity_score))
        .bind(to_json("agent_configs", &company.agent_configs)?)
        .bind(timestamp(company.created_at))
        .bind(timestamp(company.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            RepositoryError::from_write(error, || format!("company {} already exists", company.id))
        })?;

        Ok(())
    }

    async fn find(&self, company_id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                name,
                sector,
                size_employees,
                size_revenue,
                tools_connected,
                clarity_score,
                agent_configs,
                created_at,
                updated_at
             FROM companies
             WHERE id = ?",
        )
        .bind(&company_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(company_from_row).transpose()
    }

    async fn list_ids(&self) -> Result<Vec<CompanyId>, RepositoryError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM companies ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(CompanyId).collect())
    }

    async fn update_profile(
        &self,
        company_id: &CompanyId,
        profile: &CompanyProfile,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE companies
             SET name = COALESCE(?, name),
                 sector = COALESCE(?, sector),
                 size_employees = COALESCE(?, size_employees),
                 size_revenue = COALESCE(?, size_revenue),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(profile.name.as_deref())
        .bind(profile.sector.as_deref())
        .bind(profile.size_employees.map(i64::from))
        .bind(profile.size_revenue.map(|value| value.to_string()))
        .bind(timestamp(now))
        .bind(&company_id.0)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn connect_tool(
        &self,
        company_id: &CompanyId,
        category: ToolCategory,
        connection: ToolConnection,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT tools_connected FROM companies WHERE id = ?")
                .bind(&company_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(false);
        };
        let mut tools: ToolsConnected = parse_json("tools_connected", &current)?;
        tools.set(category, connection);

        sqlx::query("UPDATE companies SET tools_connected = ?, updated_at = ? WHERE id = ?")
            .bind(to_json("tools_connected", &tools)?)
            .bind(timestamp(now))
            .bind(&company_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn update_agent_configs(
        &self,
        company_id: &CompanyId,
        expected: &AgentConfigs,
        configs: &AgentConfigs,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT agent_configs FROM companies WHERE id = ?")
                .bind(&company_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(false);
        };
        let current: AgentConfigs = parse_json("agent_configs", &current)?;
        if &current != expected {
            return Ok(false);
        }

        sqlx::query("UPDATE companies SET agent_configs = ?, updated_at = ? WHERE id = ?")
            .bind(to_json("agent_configs", configs)?)
            .bind(timestamp(now))
            .bind(&company_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn update_clarity_score(
        &self,
        company_id: &CompanyId,
        score: u8,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let updated =
            sqlx::query("UPDATE companies SET clarity_score = ?, updated_at = ? WHERE id = ?")
                .bind(i64::from(score.min(100)))
                .bind(timestamp(now))
                .bind(&company_id.0)
                .execute(&self.pool)
                .await?;

        Ok(updated.rows_affected() == 1)
    }
}

fn company_from_row(row: &SqliteRow) -> Result<Company, RepositoryError> {
    let clarity_score = row.try_get::<i64, _>("clarity_score")?;
    let clarity_score = u8::try_from(clarity_score).map_err(|_| {
        RepositoryError::Decode(format!("clarity_score out of range: {clarity_score}"))
    })?;

    Ok(Company {
        id: CompanyId(row.try_get("id")?),
        name: row.try_get("name")?,
        sector: row.try_get("sector")?,
        size_employees: row
            .try_get::<Option<i64>, _>("size_employees")?
            .map(|value| parse_u32("size_employees", value))
            .transpose()?,
        size_revenue: get_optional_decimal(row, "size_revenue")?,
        tools_connected: get_json(row, "tools_connected")?,
        clarity_score,
        agent_configs: get_json(row, "agent_configs")?,
        created_at: get_timestamp(row, "created_at")?,
        updated_at: get_timestamp(row, "updated_at")?,
    })
}
