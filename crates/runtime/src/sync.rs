use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kuria_core::domain::company::CompanyId;
use kuria_core::domain::event::{Event, EventId};
use kuria_core::domain::record::{RawRecord, RecordId, RecordKind};
use kuria_core::errors::DomainError;
use kuria_core::sync::{plan_create, plan_update, validate_raw};
use kuria_db::repositories::{RepositoryError, Store};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Retries ran out while other writers kept winning the same row.
    #[error("sync of `{raw_id}` still conflicting after {attempts} attempts")]
    ConflictExhausted { raw_id: String, attempts: u32 },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub record_id: RecordId,
    pub kind: RecordKind,
    pub created: bool,
    pub changed_fields: Vec<String>,
    pub events: Vec<Event>,
}

/// Upserts connector records by their idempotency triple.
pub struct SyncEngine {
    store: Store,
    max_conflict_retries: u32,
}

impl SyncEngine {
    pub fn new(store: Store, max_conflict_retries: u32) -> Self {
        Self { store, max_conflict_retries: max_conflict_retries.max(1) }
    }

    pub async fn sync(
        &self,
        company_id: &CompanyId,
        raw: RawRecord,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        let key = validate_raw(company_id, &raw)?;
        if self.store.companies.find(company_id).await?.is_none() {
            return Err(DomainError::InvalidRecord(format!("unknown company `{company_id}`")).into());
        }
        let kind = raw.fields.kind();

        for attempt in 1..=self.max_conflict_retries {
            let existing = self.store.records.find_by_key(&key, kind).await?;
            let plan = match existing {
                Some(existing) => plan_update(existing, &raw, now)?,
                None => plan_create(&key, RecordId(Uuid::new_v4().to_string()), &raw, now),
            };
            if !plan.stale_fields.is_empty() {
                debug!(
                    event_name = "sync.record.stale_fields",
                    company_id = %company_id,
                    raw_id = %key.raw_id,
                    stale_fields = ?plan.stale_fields,
                    "ignored fields older than the stored values"
                );
            }

            let events: Vec<Event> = plan
                .events
                .iter()
                .map(|payload| {
                    Event::new(
                        EventId(Uuid::new_v4().to_string()),
                        company_id.clone(),
                        payload.clone(),
                        now,
                    )
                })
                .collect();

            let written = if plan.created {
                match self.store.records.insert(&plan.record, &events).await {
                    Ok(()) => true,
                    Err(error) if error.is_conflict() => false,
                    Err(error) => return Err(error.into()),
                }
            } else {
                self.store.records.update(&plan.record, &events).await?
            };

            if written {
                let record_id = plan.record.meta().id.clone();
                let event_name =
                    if plan.created { "sync.record.created" } else { "sync.record.updated" };
                info!(
                    event_name,
                    company_id = %company_id,
                    record_kind = kind.as_str(),
                    record_id = %record_id,
                    changed_fields = plan.changed_fields.len(),
                    events = events.len(),
                    "record synced"
                );
                return Ok(SyncOutcome {
                    record_id,
                    kind,
                    created: plan.created,
                    changed_fields: plan.changed_fields,
                    events,
                });
            }

            debug!(
                event_name = "sync.record.conflict_retry",
                company_id = %company_id,
                raw_id = %key.raw_id,
                attempt,
                "concurrent writer won the row, merging again"
            );
        }

        let error = DomainError::ConflictRetry { attempts: self.max_conflict_retries };
        warn!(
            event_name = "sync.record.conflict_exhausted",
            company_id = %company_id,
            raw_id = %key.raw_id,
            error = %error,
            "giving up on conflicting sync"
        );
        Err(SyncError::ConflictExhausted { raw_id: key.raw_id, attempts: self.max_conflict_retries })
    }

    /// Syncs every record in order. A bad record does not stop the batch.
    pub async fn sync_batch(
        &self,
        company_id: &CompanyId,
        records: Vec<RawRecord>,
        now: DateTime<Utc>,
    ) -> Vec<Result<SyncOutcome, SyncError>> {
        let mut results = Vec::with_capacity(records.len());
        for raw in records {
            let result = self.sync(company_id, raw, now).await;
            if let Err(error) = &result {
                warn!(
                    event_name = "sync.batch.record_failed",
                    company_id = %company_id,
                    error = %error,
                    "record in batch was not synced"
                );
            }
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use kuria_core::analytics::CompanyRecords;
    use kuria_core::domain::company::{Company, CompanyId};
    use kuria_core::domain::event::{Event, EventPayload};
    use kuria_core::domain::record::{
        DealFields, DealStatus, RawRecord, RecordFields, RecordId, RecordKind, SyncKey,
        SyncedRecord,
    };
    use kuria_core::errors::DomainError;
    use kuria_core::sync::{plan_create, validate_raw};
    use kuria_db::repositories::{RecordRepository, RepositoryError, Store};
    use kuria_db::{connect_with_settings, migrations};

    use super::{SyncEngine, SyncError};

    /// Lets a rival writer insert the same triple just before the first insert.
    struct RacingRecords {
        inner: Arc<dyn RecordRepository>,
        rival: Mutex<Option<SyncedRecord>>,
    }

    /// Loses every write to some other writer.
    struct AlwaysLosing {
        inner: Arc<dyn RecordRepository>,
    }

    #[async_trait]
    impl RecordRepository for RacingRecords {
        async fn find_by_key(
            &self,
            key: &SyncKey,
            kind: RecordKind,
        ) -> Result<Option<SyncedRecord>, RepositoryError> {
            self.inner.find_by_key(key, kind).await
        }

        async fn find(
            &self,
            company_id: &CompanyId,
            kind: RecordKind,
            id: &RecordId,
        ) -> Result<Option<SyncedRecord>, RepositoryError> {
            self.inner.find(company_id, kind, id).await
        }

        async fn insert(&self, record: &SyncedRecord, events: &[Event]) -> Result<(), RepositoryError> {
            let rival = self.rival.lock().unwrap().take();
            if let Some(rival) = rival {
                self.inner.insert(&rival, &[]).await?;
            }
            self.inner.insert(record, events).await
        }

        async fn update(&self, record: &SyncedRecord, events: &[Event]) -> Result<bool, RepositoryError> {
            self.inner.update(record, events).await
        }

        async fn list(
            &self,
            company_id: &CompanyId,
            kind: RecordKind,
        ) -> Result<Vec<SyncedRecord>, RepositoryError> {
            self.inner.list(company_id, kind).await
        }

        async fn load_company_records(
            &self,
            company_id: &CompanyId,
        ) -> Result<CompanyRecords, RepositoryError> {
            self.inner.load_company_records(company_id).await
        }
    }

    #[async_trait]
    impl RecordRepository for AlwaysLosing {
        async fn find_by_key(
            &self,
            key: &SyncKey,
            kind: RecordKind,
        ) -> Result<Option<SyncedRecord>, RepositoryError> {
            self.inner.find_by_key(key, kind).await
        }

        async fn find(
            &self,
            company_id: &CompanyId,
            kind: RecordKind,
            id: &RecordId,
        ) -> Result<Option<SyncedRecord>, RepositoryError> {
            self.inner.find(company_id, kind, id).await
        }

        async fn insert(&self, record: &SyncedRecord, _events: &[Event]) -> Result<(), RepositoryError> {
            Err(RepositoryError::Conflict(format!("record `{}` already exists", record.meta().raw_id)))
        }

        async fn update(&self, _record: &SyncedRecord, _events: &[Event]) -> Result<bool, RepositoryError> {
            Ok(false)
        }

        async fn list(
            &self,
            company_id: &CompanyId,
            kind: RecordKind,
        ) -> Result<Vec<SyncedRecord>, RepositoryError> {
            self.inner.list(company_id, kind).await
        }

        async fn load_company_records(
            &self,
            company_id: &CompanyId,
        ) -> Result<CompanyRecords, RepositoryError> {
            self.inner.load_company_records(company_id).await
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    async fn store_with_company(id: &str) -> (Store, CompanyId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrations");
        let store = Store::sqlite(pool);
        let company_id = CompanyId(id.to_string());
        store
            .companies
            .create(&Company::new(company_id.clone(), "Acme", at(0)))
            .await
            .expect("company");
        (store, company_id)
    }

    fn deal(raw_id: &str, source_updated_at: DateTime<Utc>, fields: DealFields) -> RawRecord {
        RawRecord {
            connector_source: "hubspot".to_string(),
            raw_id: raw_id.to_string(),
            source_updated_at,
            fields: RecordFields::Deal(fields),
        }
    }

    #[tokio::test]
    async fn create_emits_created_event_and_update_keeps_the_id() {
        let (store, acme) = store_with_company("acme").await;
        let engine = SyncEngine::new(store.clone(), 5);

        let created = engine
            .sync(&acme, deal("D1", at(1), DealFields { stage: Some("lead".into()), ..Default::default() }), at(2))
            .await
            .expect("create");
        assert!(created.created);
        assert!(matches!(created.events[0].payload, EventPayload::DealCreated(_)));

        let moved = engine
            .sync(&acme, deal("D1", at(3), DealFields { stage: Some("proposal".into()), ..Default::default() }), at(4))
            .await
            .expect("update");
        assert!(!moved.created);
        assert_eq!(moved.record_id, created.record_id);
        assert!(matches!(
            &moved.events[0].payload,
            EventPayload::DealStageChanged { to_stage: Some(stage), .. } if stage == "proposal"
        ));
    }

    #[tokio::test]
    async fn out_of_order_delivery_does_not_roll_fields_back() {
        let (store, acme) = store_with_company("acme").await;
        let engine = SyncEngine::new(store.clone(), 5);

        let newer = DealFields { status: Some(DealStatus::Won), ..Default::default() };
        let first = engine.sync(&acme, deal("D1", at(5), newer), at(6)).await.expect("newer");
        let older = DealFields { status: Some(DealStatus::Active), ..Default::default() };
        let second = engine.sync(&acme, deal("D1", at(1), older), at(7)).await.expect("older");

        assert!(second.changed_fields.is_empty());
        let stored = store
            .records
            .find(&acme, RecordKind::Deal, &first.record_id)
            .await
            .expect("find")
            .expect("exists");
        let SyncedRecord::Deal(stored) = stored else { panic!("expected a deal") };
        assert_eq!(stored.status, Some(DealStatus::Won));
        assert_eq!(stored.meta.synced_at, at(7));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_write() {
        let (store, acme) = store_with_company("acme").await;
        let engine = SyncEngine::new(store.clone(), 5);

        let blank = engine.sync(&acme, deal("  ", at(1), DealFields::default()), at(2)).await;
        assert!(matches!(blank, Err(SyncError::Domain(DomainError::InvalidRecord(_)))));

        let mut unknown_source = deal("D1", at(1), DealFields::default());
        unknown_source.connector_source = "myspace".to_string();
        let unknown = engine.sync(&acme, unknown_source, at(2)).await;
        assert!(matches!(unknown, Err(SyncError::Domain(DomainError::InvalidRecord(_)))));

        let nobody = CompanyId("nobody".to_string());
        let orphan = engine.sync(&nobody, deal("D1", at(1), DealFields::default()), at(2)).await;
        assert!(matches!(orphan, Err(SyncError::Domain(DomainError::InvalidRecord(_)))));

        assert!(store.records.list(&acme, RecordKind::Deal).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn batch_continues_past_bad_records() {
        let (store, acme) = store_with_company("acme").await;
        let engine = SyncEngine::new(store.clone(), 5);

        let results = engine
            .sync_batch(
                &acme,
                vec![
                    deal("D1", at(1), DealFields::default()),
                    deal("", at(1), DealFields::default()),
                    deal("D2", at(1) + Duration::minutes(5), DealFields::default()),
                ],
                at(2),
            )
            .await;

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert_eq!(store.records.list(&acme, RecordKind::Deal).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn losing_the_insert_race_merges_into_the_winning_row() {
        let (store, acme) = store_with_company("acme").await;
        let rival_raw = deal(
            "D7",
            at(1),
            DealFields {
                amount: Some(Decimal::new(1_000, 0)),
                stage: Some("lead".into()),
                ..Default::default()
            },
        );
        let key = validate_raw(&acme, &rival_raw).expect("key");
        let rival = plan_create(&key, RecordId("rival-id".to_string()), &rival_raw, at(1)).record;
        let racing = Store {
            records: Arc::new(RacingRecords {
                inner: store.records.clone(),
                rival: Mutex::new(Some(rival)),
            }),
            ..store.clone()
        };
        let engine = SyncEngine::new(racing, 5);

        let outcome = engine
            .sync(&acme, deal("D7", at(2), DealFields { stage: Some("proposal".into()), ..Default::default() }), at(3))
            .await
            .expect("merged after the conflict");

        assert!(!outcome.created);
        assert_eq!(outcome.record_id, RecordId("rival-id".to_string()));
        let rows = store.records.list(&acme, RecordKind::Deal).await.expect("list");
        assert_eq!(rows.len(), 1);
        let SyncedRecord::Deal(stored) = &rows[0] else { panic!("expected a deal") };
        assert_eq!(stored.meta.id, RecordId("rival-id".to_string()));
        assert_eq!(stored.amount, Some(Decimal::new(1_000, 0)));
        assert_eq!(stored.stage.as_deref(), Some("proposal"));
    }

    #[tokio::test]
    async fn endless_conflicts_give_up_after_the_retry_budget() {
        let (store, acme) = store_with_company("acme").await;
        let losing = Store {
            records: Arc::new(AlwaysLosing { inner: store.records.clone() }),
            ..store.clone()
        };
        let engine = SyncEngine::new(losing, 3);

        let result = engine.sync(&acme, deal("D8", at(1), DealFields::default()), at(2)).await;

        assert!(matches!(
            result,
            Err(SyncError::ConflictExhausted { ref raw_id, attempts: 3 }) if raw_id == "D8"
        ));
        assert!(store.records.list(&acme, RecordKind::Deal).await.expect("list").is_empty());
    }
}
