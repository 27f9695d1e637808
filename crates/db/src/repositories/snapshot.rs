use serde::{de::DeserializeOwned, Serialize};

use kuria_core::domain::company::CompanyId;
use kuria_core::domain::event::Event;
use kuria_core::domain::metrics::{
    CacMetrics, CashForecast, Forecast, ProcessMetrics, Snapshot, SnapshotSet,
};

use super::codec::{parse_json, timestamp, to_json};
use super::event::insert_event;
use super::{RepositoryError, SnapshotRepository};
use crate::DbPool;

pub struct SqlSnapshotRepository {
    pool: DbPool,
}

impl SqlSnapshotRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_snapshot<S>(&self, company_id: &CompanyId) -> Result<Option<S>, RepositoryError>
    where
        S: Snapshot + DeserializeOwned + Send,
    {
        let table = S::KIND.table();
        let raw: Option<String> =
            sqlx::query_scalar(&format!("SELECT snapshot FROM {table} WHERE company_id = ?"))
                .bind(&company_id.0)
                .fetch_optional(&self.pool)
                .await?;

        raw.map(|raw| parse_json(table, &raw)).transpose()
    }

    /// Overwrites the generic snapshot tables (`company_id`, `snapshot`, `computed_at`).
    async fn save_snapshot<S>(
        &self,
        company_id: &CompanyId,
        snapshot: &S,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError>
    where
        S: Snapshot + Serialize + Send + Sync,
    {
        let table = S::KIND.table();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO {table} (company_id, snapshot, computed_at)
             VALUES (?, ?, ?)
             ON CONFLICT(company_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                computed_at = excluded.computed_at"
        ))
        .bind(&company_id.0)
        .bind(to_json(table, snapshot)?)
        .bind(timestamp(snapshot.computed_at()))
        .execute(&mut *tx)
        .await?;

        if let Some(event) = event {
            insert_event(&mut *tx, event).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SnapshotRepository for SqlSnapshotRepository {
    async fn find_forecast(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<Forecast>, RepositoryError> {
        self.find_snapshot(company_id).await
    }

    async fn save_forecast(
        &self,
        company_id: &CompanyId,
        forecast: &Forecast,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError> {
        self.save_snapshot(company_id, forecast, event).await
    }

    async fn find_cash_forecast(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<CashForecast>, RepositoryError> {
        self.find_snapshot(company_id).await
    }

    async fn save_cash_forecast(
        &self,
        company_id: &CompanyId,
        forecast: &CashForecast,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError> {
        self.save_snapshot(company_id, forecast, event).await
    }

    async fn find_process_metrics(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<ProcessMetrics>, RepositoryError> {
        self.find_snapshot(company_id).await
    }

    async fn save_process_metrics(
        &self,
        company_id: &CompanyId,
        metrics: &ProcessMetrics,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError> {
        self.save_snapshot(company_id, metrics, event).await
    }

    async fn find_cac_metrics(
        &self,
        company_id: &CompanyId,
    ) -> Result<Option<CacMetrics>, RepositoryError> {
        self.find_snapshot(company_id).await
    }

    // The CAC headline figures are also kept as columns for ad-hoc queries.
    async fn save_cac_metrics(
        &self,
        company_id: &CompanyId,
        metrics: &CacMetrics,
        event: Option<&Event>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO cac_metrics (
                company_id,
                blended_cac,
                total_clients,
                total_marketing_spend,
                cac_by_source,
                snapshot,
                computed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(company_id) DO UPDATE SET
                blended_cac = excluded.blended_cac,
                total_clients = excluded.total_clients,
                total_marketing_spend = excluded.total_marketing_spend,
                cac_by_source = excluded.cac_by_source,
                snapshot = excluded.snapshot,
                computed_at = excluded.computed_at",
        )
        .bind(&company_id.0)
        .bind(metrics.blended_cac.to_string())
        .bind(i64::from(metrics.total_clients))
        .bind(metrics.total_marketing_spend.to_string())
        .bind(to_json("cac_by_source", &metrics.cac_by_source)?)
        .bind(to_json("cac_metrics", metrics)?)
        .bind(timestamp(metrics.computed_at))
        .execute(&mut *tx)
        .await?;

        if let Some(event) = event {
            insert_event(&mut *tx, event).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_all(&self, company_id: &CompanyId) -> Result<SnapshotSet, RepositoryError> {
        let clarity_score: Option<i64> =
            sqlx::query_scalar("SELECT clarity_score FROM companies WHERE id = ?")
                .bind(&company_id.0)
                .fetch_optional(&self.pool)
                .await?;
        let clarity_score = clarity_score
            .map(|score| {
                u8::try_from(score).map_err(|_| {
                    RepositoryError::Decode(format!("clarity_score out of range: {score}"))
                })
            })
            .transpose()?;

        Ok(SnapshotSet {
            forecast: self.find_forecast(company_id).await?,
            cash_forecast: self.find_cash_forecast(company_id).await?,
            process_metrics: self.find_process_metrics(company_id).await?,
            cac_metrics: self.find_cac_metrics(company_id).await?,
            clarity_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rust_decimal::Decimal;

    use kuria_core::domain::event::{Event, EventId, EventPayload};
    use kuria_core::domain::metrics::{CacMetrics, ProcessMetrics};

    use super::SqlSnapshotRepository;
    use crate::repositories::test_support::{at, insert_company, setup_pool};
    use crate::repositories::{EventRepository, SnapshotRepository, SqlEventRepository};

    fn process_metrics(overdue_tasks: u32, hour: u32) -> ProcessMetrics {
        ProcessMetrics {
            avg_cycle_time_days: Some(4.5),
            active_tasks: 12,
            overdue_tasks,
            unassigned_tasks: 2,
            completed_last_30d: 9,
            computed_at: at(7, hour),
        }
    }

    #[tokio::test]
    async fn save_overwrites_the_single_row_per_company() {
        let pool = setup_pool().await;
        let acme = insert_company(&pool, "acme").await;
        let repo = SqlSnapshotRepository::new(pool.clone());

        repo.save_process_metrics(&acme, &process_metrics(3, 8), None).await.expect("first");
        repo.save_process_metrics(&acme, &process_metrics(5, 9), None).await.expect("second");

        let stored = repo.find_process_metrics(&acme).await.expect("find").expect("exists");
        assert_eq!(stored, process_metrics(5, 9));
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM process_metrics")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn cac_save_publishes_its_event_in_the_same_write() {
        let pool = setup_pool().await;
        let acme = insert_company(&pool, "acme").await;
        let repo = SqlSnapshotRepository::new(pool.clone());

        let metrics = CacMetrics {
            period_days: 90,
            blended_cac: Decimal::new(250, 0),
            total_marketing_spend: Decimal::new(1_000, 0),
            total_clients: 4,
            cac_by_source: BTreeMap::from([("linkedin".to_string(), Decimal::new(250, 0))]),
            clients_by_source: BTreeMap::from([("linkedin".to_string(), 4)]),
            revenue_by_source: BTreeMap::new(),
            top_source: Some("linkedin".to_string()),
            computed_at: at(7, 8),
        };
        let event = Event::new(
            EventId("evt-cac".to_string()),
            acme.clone(),
            EventPayload::CacUpdated {
                blended_cac: metrics.blended_cac,
                cac_by_source: metrics.cac_by_source.clone(),
                top_source: metrics.top_source.clone(),
            },
            at(7, 8),
        );
        repo.save_cac_metrics(&acme, &metrics, Some(&event)).await.expect("save");

        assert_eq!(repo.find_cac_metrics(&acme).await.expect("find"), Some(metrics));
        let blended: String = sqlx::query_scalar("SELECT blended_cac FROM cac_metrics")
            .fetch_one(&pool)
            .await
            .expect("column");
        assert_eq!(blended, "250");
        let events = SqlEventRepository::new(pool.clone());
        assert_eq!(events.fetch_unprocessed(&acme, 10).await.expect("events"), vec![event]);
    }

    #[tokio::test]
    async fn load_all_reports_missing_snapshots_as_none() {
        let pool = setup_pool().await;
        let acme = insert_company(&pool, "acme").await;
        let repo = SqlSnapshotRepository::new(pool.clone());
        repo.save_process_metrics(&acme, &process_metrics(1, 8), None).await.expect("save");

        let set = repo.load_all(&acme).await.expect("load");
        assert!(set.forecast.is_none());
        assert!(set.cash_forecast.is_none());
        assert_eq!(set.process_metrics, Some(process_metrics(1, 8)));
        assert_eq!(set.clarity_score, Some(0));
    }
}
