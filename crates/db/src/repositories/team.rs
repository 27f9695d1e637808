use secrecy::{ExposeSecret, SecretString};
use sqlx::{sqlite::SqliteRow, Row};

use kuria_core::domain::company::CompanyId;
use kuria_core::domain::team::{Credential, TeamMember, TeamMemberId};

use super::codec::{get_optional_timestamp, get_timestamp, timestamp};
use super::{RepositoryError, TeamRepository};
use crate::DbPool;

pub struct SqlTeamRepository {
    pool: DbPool,
}

impl SqlTeamRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TeamRepository for SqlTeamRepository {
    async fn add_member(&self, member: &TeamMember) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO team_members (id, company_id, name, email, role, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&member.id.0)
        .bind(&member.company_id.0)
        .bind(&member.name)
        .bind(member.email.as_deref())
        .bind(member.role.as_deref())
        .bind(timestamp(member.created_at))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            RepositoryError::from_write(error, || format!("team member {} exists", member.id.0))
        })?;

        Ok(())
    }

    async fn list_members(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<TeamMember>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, company_id, name, email, role, created_at
             FROM team_members
             WHERE company_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(member_from_row).collect()
    }

    async fn upsert_credential(&self, credential: &Credential) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO credentials (company_id, tool, secret, expires_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(company_id, tool) DO UPDATE SET
                secret = excluded.secret,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(&credential.company_id.0)
        .bind(&credential.tool)
        .bind(credential.secret.expose_secret())
        .bind(credential.expires_at.map(timestamp))
        .bind(timestamp(credential.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_credential(
        &self,
        company_id: &CompanyId,
        tool: &str,
    ) -> Result<Option<Credential>, RepositoryError> {
        let row = sqlx::query(
            "SELECT company_id, tool, secret, expires_at, updated_at
             FROM credentials
             WHERE company_id = ? AND tool = ?",
        )
        .bind(&company_id.0)
        .bind(tool)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(credential_from_row).transpose()
    }
}

fn member_from_row(row: &SqliteRow) -> Result<TeamMember, RepositoryError> {
    Ok(TeamMember {
        id: TeamMemberId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        role: row.try_get("role")?,
        created_at: get_timestamp(row, "created_at")?,
    })
}

fn credential_from_row(row: &SqliteRow) -> Result<Credential, RepositoryError> {
    Ok(Credential {
        company_id: CompanyId(row.try_get("company_id")?),
        tool: row.try_get("tool")?,
        secret: SecretString::from(row.try_get::<String, _>("secret")?),
        expires_at: get_optional_timestamp(row, "expires_at")?,
        updated_at: get_timestamp(row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use kuria_core::domain::team::{Credential, TeamMember, TeamMemberId};

    use super::SqlTeamRepository;
    use crate::repositories::test_support::{at, insert_company, setup_pool};
    use crate::repositories::TeamRepository;

    #[tokio::test]
    async fn credential_upsert_replaces_the_secret() {
        let pool = setup_pool().await;
        let acme = insert_company(&pool, "acme").await;
        let repo = SqlTeamRepository::new(pool.clone());

        let credential = |secret: &str, day: u32| Credential {
            company_id: acme.clone(),
            tool: "hubspot".to_string(),
            secret: SecretString::from(secret.to_string()),
            expires_at: Some(at(20, 0)),
            updated_at: at(day, 8),
        };
        repo.upsert_credential(&credential("pat-old", 2)).await.expect("first");
        repo.upsert_credential(&credential("pat-new", 3)).await.expect("rotate");

        let stored = repo.find_credential(&acme, "hubspot").await.expect("find").expect("exists");
        assert_eq!(stored.secret.expose_secret(), "pat-new");
        assert_eq!(stored.updated_at, at(3, 8));
        assert!(!stored.is_expired(at(19, 0)));
        assert!(repo.find_credential(&acme, "xero").await.expect("missing").is_none());
    }

    #[tokio::test]
    async fn members_are_listed_per_company() {
        let pool = setup_pool().await;
        let acme = insert_company(&pool, "acme").await;
        let globex = insert_company(&pool, "globex").await;
        let repo = SqlTeamRepository::new(pool.clone());

        let member = TeamMember {
            id: TeamMemberId("tm-1".to_string()),
            company_id: acme.clone(),
            name: "Ines".to_string(),
            email: Some("ines@acme.test".to_string()),
            role: Some("ops".to_string()),
            created_at: at(2, 9),
        };
        repo.add_member(&member).await.expect("add");
        assert!(repo.add_member(&member).await.expect_err("duplicate").is_conflict());

        assert_eq!(repo.list_members(&acme).await.expect("list"), vec![member]);
        assert!(repo.list_members(&globex).await.expect("foreign").is_empty());
    }
}
