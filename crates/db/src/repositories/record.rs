//! Canonical record tables. One table per kind, all sharing the sync
//! metadata columns and the `(company_id, raw_id, connector_source)` key.

use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};

use kuria_core::analytics::CompanyRecords;
use kuria_core::domain::company::CompanyId;
use kuria_core::domain::event::Event;
use kuria_core::domain::record::{
    ConnectorSource, Contact, Deal, Expense, Invoice, RecordId, RecordKind, RecordMeta, SyncKey,
    SyncedRecord, Task,
};

use super::codec::{
    date, get_json, get_optional_date, get_optional_decimal, get_optional_timestamp,
    get_timestamp, optional_timestamp, parse_u32, timestamp, to_json,
};
use super::event::insert_events;
use super::{RecordRepository, RepositoryError};
use crate::DbPool;

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// A bindable column value.
enum Param {
    Text(Option<String>),
    Int(Option<i64>),
    Real(Option<f64>),
}

impl Param {
    fn bind(self, query: Query<'_>) -> Query<'_> {
        match self {
            Self::Text(value) => query.bind(value),
            Self::Int(value) => query.bind(value),
            Self::Real(value) => query.bind(value),
        }
    }
}

fn text(value: &Option<String>) -> Param {
    Param::Text(value.clone())
}

fn status<T: AsRef<str>>(value: Option<T>) -> Param {
    Param::Text(value.map(|value| value.as_ref().to_string()))
}

fn decimal(value: Option<rust_decimal::Decimal>) -> Param {
    Param::Text(value.map(|value| value.to_string()))
}

fn ts(value: Option<chrono::DateTime<chrono::Utc>>) -> Param {
    Param::Text(optional_timestamp(value))
}

fn day(value: Option<chrono::NaiveDate>) -> Param {
    Param::Text(value.map(date))
}

fn domain_columns(record: &SyncedRecord) -> Vec<(&'static str, Param)> {
    match record {
        SyncedRecord::Deal(deal) => vec![
            ("title", text(&deal.title)),
            ("amount", decimal(deal.amount)),
            ("currency", text(&deal.currency)),
            ("stage", text(&deal.stage)),
            ("stage_order", Param::Int(deal.stage_order)),
            ("probability", Param::Real(deal.probability)),
            ("status", status(deal.status.as_ref().map(|value| value.as_str()))),
            ("created_at", ts(deal.created_at)),
            ("last_activity_at", ts(deal.last_activity_at)),
            ("closed_at", ts(deal.closed_at)),
            ("expected_close_date", day(deal.expected_close_date)),
            ("owner_id", text(&deal.owner_id)),
            ("owner_name", text(&deal.owner_name)),
            ("source", text(&deal.source)),
        ],
        SyncedRecord::Contact(contact) => vec![
            ("email", text(&contact.email)),
            ("first_name", text(&contact.first_name)),
            ("last_name", text(&contact.last_name)),
            ("company_name", text(&contact.company_name)),
            ("company_size", text(&contact.company_size)),
            ("sector", text(&contact.sector)),
            ("source", text(&contact.source)),
            ("source_detail", text(&contact.source_detail)),
            ("score", Param::Int(contact.score.map(i64::from))),
            ("score_label", status(contact.score_label.as_ref().map(|value| value.as_str()))),
            ("created_at", ts(contact.created_at)),
            ("last_activity_at", ts(contact.last_activity_at)),
        ],
        SyncedRecord::Invoice(invoice) => vec![
            ("amount", decimal(invoice.amount)),
            ("amount_paid", decimal(invoice.amount_paid)),
            ("currency", text(&invoice.currency)),
            ("client_id", text(&invoice.client_id)),
            ("client_name", text(&invoice.client_name)),
            ("status", status(invoice.status.as_ref().map(|value| value.as_str()))),
            ("issued_at", ts(invoice.issued_at)),
            ("due_at", ts(invoice.due_at)),
            ("paid_at", ts(invoice.paid_at)),
            ("payment_delay_days", Param::Int(invoice.payment_delay_days)),
        ],
        SyncedRecord::Task(task) => vec![
            ("title", text(&task.title)),
            ("description", text(&task.description)),
            ("assignee_id", text(&task.assignee_id)),
            ("assignee_name", text(&task.assignee_name)),
            ("status", status(task.status.as_ref().map(|value| value.as_str()))),
            ("created_at", ts(task.created_at)),
            ("due_at", ts(task.due_at)),
            ("completed_at", ts(task.completed_at)),
            ("cycle_time_days", Param::Real(task.cycle_time_days)),
        ],
        SyncedRecord::Expense(expense) => vec![
            ("amount", decimal(expense.amount)),
            ("currency", text(&expense.currency)),
            ("vendor", text(&expense.vendor)),
            ("category", text(&expense.category)),
            ("is_recurring", Param::Int(expense.is_recurring.map(i64::from))),
            ("date", day(expense.date)),
        ],
    }
}

fn sync_columns(meta: &RecordMeta) -> Result<Vec<(&'static str, Param)>, RepositoryError> {
    Ok(vec![
        ("field_versions", Param::Text(Some(to_json("field_versions", &meta.field_versions)?))),
        ("source_updated_at", Param::Text(Some(timestamp(meta.source_updated_at)))),
        ("synced_at", Param::Text(Some(timestamp(meta.synced_at)))),
    ])
}

pub struct SqlRecordRepository {
    pool: DbPool,
}

impl SqlRecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RecordRepository for SqlRecordRepository {
    async fn find_by_key(
        &self,
        key: &SyncKey,
        kind: RecordKind,
    ) -> Result<Option<SyncedRecord>, RepositoryError> {
        let sql = format!(
            "SELECT * FROM {} WHERE company_id = ? AND connector_source = ? AND raw_id = ?",
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(&key.company_id.0)
            .bind(key.connector_source.as_str())
            .bind(&key.raw_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| record_from_row(kind, &row)).transpose()
    }

    async fn find(
        &self,
        company_id: &CompanyId,
        kind: RecordKind,
        id: &RecordId,
    ) -> Result<Option<SyncedRecord>, RepositoryError> {
        let sql = format!("SELECT * FROM {} WHERE company_id = ? AND id = ?", kind.table());
        let row = sqlx::query(&sql)
            .bind(&company_id.0)
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| record_from_row(kind, &row)).transpose()
    }

    async fn insert(&self, record: &SyncedRecord, events: &[Event]) -> Result<(), RepositoryError> {
        let meta = record.meta();
        let mut columns = vec![
            ("id", Param::Text(Some(meta.id.0.clone()))),
            ("company_id", Param::Text(Some(meta.company_id.0.clone()))),
            ("connector_source", Param::Text(Some(meta.connector_source.as_str().to_string()))),
            ("raw_id", Param::Text(Some(meta.raw_id.clone()))),
            ("row_version", Param::Int(Some(i64::from(meta.row_version)))),
        ];
        columns.extend(sync_columns(meta)?);
        columns.extend(domain_columns(record));

        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            record.kind().table(),
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );
        let query = columns.into_iter().fold(sqlx::query(&sql), |query, (_, value)| value.bind(query));

        let mut tx = self.pool.begin().await?;
        query.execute(&mut *tx).await.map_err(|error| {
            RepositoryError::from_write(error, || {
                format!(
                    "{} {}/{} already synced for company {}",
                    record.kind().as_str(),
                    meta.connector_source,
                    meta.raw_id,
                    meta.company_id
                )
            })
        })?;
        insert_events(&mut *tx, events).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn update(&self, record: &SyncedRecord, events: &[Event]) -> Result<bool, RepositoryError> {
        let meta = record.meta();
        let mut columns = sync_columns(meta)?;
        columns.extend(domain_columns(record));

        let assignments: Vec<String> =
            columns.iter().map(|(name, _)| format!("{name} = ?")).collect();
        let sql = format!(
            "UPDATE {} SET {}, row_version = row_version + 1
             WHERE company_id = ? AND id = ? AND row_version = ?",
            record.kind().table(),
            assignments.join(", ")
        );
        let query = columns
            .into_iter()
            .fold(sqlx::query(&sql), |query, (_, value)| value.bind(query))
            .bind(&meta.company_id.0)
            .bind(&meta.id.0)
            .bind(i64::from(meta.row_version));

        let mut tx = self.pool.begin().await?;
        let updated = query.execute(&mut *tx).await?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }
        insert_events(&mut *tx, events).await?;
        tx.commit().await?;

        Ok(true)
    }

    async fn list(
        &self,
        company_id: &CompanyId,
        kind: RecordKind,
    ) -> Result<Vec<SyncedRecord>, RepositoryError> {
        let sql = format!("SELECT * FROM {} WHERE company_id = ? ORDER BY rowid", kind.table());
        let rows = sqlx::query(&sql).bind(&company_id.0).fetch_all(&self.pool).await?;

        rows.iter().map(|row| record_from_row(kind, row)).collect()
    }

    async fn load_company_records(
        &self,
        company_id: &CompanyId,
    ) -> Result<CompanyRecords, RepositoryError> {
        let mut records = CompanyRecords::default();
        for kind in [
            RecordKind::Deal,
            RecordKind::Contact,
            RecordKind::Invoice,
            RecordKind::Task,
            RecordKind::Expense,
        ] {
            for record in self.list(company_id, kind).await? {
                match record {
                    SyncedRecord::Deal(deal) => records.deals.push(deal),
                    SyncedRecord::Contact(contact) => records.contacts.push(contact),
                    SyncedRecord::Invoice(invoice) => records.invoices.push(invoice),
                    SyncedRecord::Task(task) => records.tasks.push(task),
                    SyncedRecord::Expense(expense) => records.expenses.push(expense),
                }
            }
        }
        Ok(records)
    }
}

fn meta_from_row(row: &SqliteRow) -> Result<RecordMeta, RepositoryError> {
    let source: String = row.try_get("connector_source")?;
    let connector_source = ConnectorSource::parse(&source)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown connector_source `{source}`")))?;

    Ok(RecordMeta {
        id: RecordId(row.try_get("id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        connector_source,
        raw_id: row.try_get("raw_id")?,
        synced_at: get_timestamp(row, "synced_at")?,
        source_updated_at: get_timestamp(row, "source_updated_at")?,
        field_versions: get_json(row, "field_versions")?,
        row_version: parse_u32("row_version", row.try_get("row_version")?)?,
    })
}

fn optional_status<T: From<String>>(row: &SqliteRow, column: &str) -> Result<Option<T>, RepositoryError> {
    Ok(row.try_get::<Option<String>, _>(column)?.map(T::from))
}

fn record_from_row(kind: RecordKind, row: &SqliteRow) -> Result<SyncedRecord, RepositoryError> {
    let meta = meta_from_row(row)?;
    Ok(match kind {
        RecordKind::Deal => SyncedRecord::Deal(Deal {
            meta,
            title: row.try_get("title")?,
            amount: get_optional_decimal(row, "amount")?,
            currency: row.try_get("currency")?,
            stage: row.try_get("stage")?,
            stage_order: row.try_get("stage_order")?,
            probability: row.try_get("probability")?,
            status: optional_status(row, "status")?,
            created_at: get_optional_timestamp(row, "created_at")?,
            last_activity_at: get_optional_timestamp(row, "last_activity_at")?,
            closed_at: get_optional_timestamp(row, "closed_at")?,
            expected_close_date: get_optional_date(row, "expected_close_date")?,
            owner_id: row.try_get("owner_id")?,
            owner_name: row.try_get("owner_name")?,
            source: row.try_get("source")?,
        }),
        RecordKind::Contact => SyncedRecord::Contact(Contact {
            meta,
            email: row.try_get("email")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            company_name: row.try_get("company_name")?,
            company_size: row.try_get("company_size")?,
            sector: row.try_get("sector")?,
            source: row.try_get("source")?,
            source_detail: row.try_get("source_detail")?,
            score: row
                .try_get::<Option<i64>, _>("score")?
                .map(|score| {
                    u8::try_from(score)
                        .map_err(|_| RepositoryError::Decode(format!("score out of range: {score}")))
                })
                .transpose()?,
            score_label: optional_status(row, "score_label")?,
            created_at: get_optional_timestamp(row, "created_at")?,
            last_activity_at: get_optional_timestamp(row, "last_activity_at")?,
        }),
        RecordKind::Invoice => SyncedRecord::Invoice(Invoice {
            meta,
            amount: get_optional_decimal(row, "amount")?,
            amount_paid: get_optional_decimal(row, "amount_paid")?,
            currency: row.try_get("currency")?,
            client_id: row.try_get("client_id")?,
            client_name: row.try_get("client_name")?,
            status: optional_status(row, "status")?,
            issued_at: get_optional_timestamp(row, "issued_at")?,
            due_at: get_optional_timestamp(row, "due_at")?,
            paid_at: get_optional_timestamp(row, "paid_at")?,
            payment_delay_days: row.try_get("payment_delay_days")?,
        }),
        RecordKind::Task => SyncedRecord::Task(Task {
            meta,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            assignee_id: row.try_get("assignee_id")?,
            assignee_name: row.try_get("assignee_name")?,
            status: optional_status(row, "status")?,
            created_at: get_optional_timestamp(row, "created_at")?,
            due_at: get_optional_timestamp(row, "due_at")?,
            completed_at: get_optional_timestamp(row, "completed_at")?,
            cycle_time_days: row.try_get("cycle_time_days")?,
        }),
        RecordKind::Expense => SyncedRecord::Expense(Expense {
            meta,
            amount: get_optional_decimal(row, "amount")?,
            currency: row.try_get("currency")?,
            vendor: row.try_get("vendor")?,
            category: row.try_get("category")?,
            is_recurring: row.try_get::<Option<i64>, _>("is_recurring")?.map(|flag| flag != 0),
            date: get_optional_date(row, "date")?,
        }),
    })
}
