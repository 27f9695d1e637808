use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use kuria_core::domain::company::CompanyId;
use kuria_core::domain::event::{Event, EventId, EventPayload, MarkOutcome};

use super::codec::{
    get_optional_timestamp, get_timestamp, optional_timestamp, parse_json, timestamp, to_json,
};
use super::{EventRepository, RepositoryError};
use crate::DbPool;

const EVENT_COLUMNS: &str = "id, company_id, event_type, payload, processed, claimed_by, \
                             claim_expires_at, processed_at, created_at";

pub struct SqlEventRepository {
    pool: DbPool,
}

impl SqlEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Inserts an event on an existing connection so that writers can publish
/// inside their own transaction.
pub(crate) async fn insert_event(
    conn: &mut SqliteConnection,
    event: &Event,
) -> Result<(), RepositoryError> {
    let (event_type, body) = event
        .payload
        .to_parts()
        .map_err(|error| RepositoryError::Decode(format!("cannot encode event payload: {error}")))?;

    sqlx::query(
        "INSERT INTO events (
            id,
            company_id,
            event_type,
            payload,
            processed,
            claimed_by,
            claim_expires_at,
            processed_at,
            created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.id.0)
    .bind(&event.company_id.0)
    .bind(event_type)
    .bind(to_json("payload", &body)?)
    .bind(event.processed)
    .bind(event.claimed_by.as_deref())
    .bind(optional_timestamp(event.claim_expires_at))
    .bind(optional_timestamp(event.processed_at))
    .bind(timestamp(event.created_at))
    .execute(&mut *conn)
    .await
    .map_err(|error| RepositoryError::from_write(error, || format!("event {} exists", event.id)))?;

    Ok(())
}

pub(crate) async fn insert_events(
    conn: &mut SqliteConnection,
    events: &[Event],
) -> Result<(), RepositoryError> {
    for event in events {
        insert_event(conn, event).await?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl EventRepository for SqlEventRepository {
    async fn publish(&self, event: &Event) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        insert_event(&mut conn, event).await
    }

    async fn find(
        &self,
        company_id: &CompanyId,
        event_id: &EventId,
    ) -> Result<Option<Event>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE company_id = ? AND id = ?"
        ))
        .bind(&company_id.0)
        .bind(&event_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn fetch_unprocessed(
        &self,
        company_id: &CompanyId,
        limit: u32,
    ) -> Result<Vec<Event>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM events
             WHERE company_id = ? AND processed = 0
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?"
        ))
        .bind(&company_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn claim(
        &self,
        company_id: &CompanyId,
        worker_id: &str,
        lease: Duration,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>, RepositoryError> {
        let now_text = timestamp(now);
        let candidates: Vec<String> = sqlx::query_scalar(
            "SELECT id
             FROM events
             WHERE company_id = ?
               AND processed = 0
               AND (claimed_by IS NULL OR claimed_by = ? OR claim_expires_at <= ?)
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?",
        )
        .bind(&company_id.0)
        .bind(worker_id)
        .bind(&now_text)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let expires_at = timestamp(now + lease);
        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Re-checks the lease so that a concurrent claimer wins at most once.
            let row = sqlx::query(&format!(
                "UPDATE events
                 SET claimed_by = ?, claim_expires_at = ?
                 WHERE company_id = ?
                   AND id = ?
                   AND processed = 0
                   AND (claimed_by IS NULL OR claimed_by = ? OR claim_expires_at <= ?)
                 RETURNING {EVENT_COLUMNS}"
            ))
            .bind(worker_id)
            .bind(&expires_at)
            .bind(&company_id.0)
            .bind(&id)
            .bind(worker_id)
            .bind(&now_text)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                claimed.push(event_from_row(&row)?);
            }
        }

        Ok(claimed)
    }

    async fn mark_processed(
        &self,
        company_id: &CompanyId,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE events
             SET processed = 1, processed_at = ?, claimed_by = NULL, claim_expires_at = NULL
             WHERE company_id = ? AND id = ? AND processed = 0",
        )
        .bind(timestamp(now))
        .bind(&company_id.0)
        .bind(&event_id.0)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(MarkOutcome::Marked);
        }

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT processed FROM events WHERE company_id = ? AND id = ?")
                .bind(&company_id.0)
                .bind(&event_id.0)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match exists {
            Some(_) => MarkOutcome::AlreadyProcessed,
            None => MarkOutcome::NotFound,
        })
    }

    async fn release(
        &self,
        company_id: &CompanyId,
        event_id: &EventId,
        worker_id: &str,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE events
             SET claimed_by = NULL, claim_expires_at = NULL
             WHERE company_id = ? AND id = ? AND processed = 0 AND claimed_by = ?",
        )
        .bind(&company_id.0)
        .bind(&event_id.0)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }
}

fn event_from_row(row: &SqliteRow) -> Result<Event, RepositoryError> {
    let event_type: String = row.try_get("event_type")?;
    let raw_payload: String = row.try_get("payload")?;
    let body: serde_json::Value = parse_json("payload", &raw_payload)?;

    Ok(Event {
        id: EventId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        payload: EventPayload::from_parts(&event_type, body),
        processed: row.try_get("processed")?,
        claimed_by: row.try_get("claimed_by")?,
        claim_expires_at: get_optional_timestamp(row, "claim_expires_at")?,
        processed_at: get_optional_timestamp(row, "processed_at")?,
        created_at: get_timestamp(row, "created_at")?,
    })
}
