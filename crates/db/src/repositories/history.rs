use std::collections::BTreeSet;

use chrono::NaiveDate;
use sqlx::{sqlite::SqliteRow, Row};

use kuria_core::domain::company::CompanyId;
use kuria_core::domain::event::Event;
use kuria_core::domain::history::{
    DealOutcome, InvoiceReminder, TaskReminder, TaskReminderType, WinLossAnalysis,
};
use kuria_core::domain::record::RecordId;

use super::codec::{date, get_enum, get_optional_date, get_timestamp, timestamp};
use super::event::insert_event;
use super::{HistoryRepository, RepositoryError};
use crate::DbPool;

pub struct SqlHistoryRepository {
    pool: DbPool,
}

impl SqlHistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl HistoryRepository for SqlHistoryRepository {
    async fn insert_invoice_reminder(
        &self,
        reminder: &InvoiceReminder,
        event: &Event,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO invoice_reminders (
                id,
                company_id,
                invoice_id,
                reminder_number,
                days_overdue,
                cycle_date,
                sent_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(company_id, invoice_id, reminder_number) DO NOTHING",
        )
        .bind(&reminder.id)
        .bind(&reminder.company_id.0)
        .bind(&reminder.invoice_id.0)
        .bind(i64::from(reminder.reminder_number))
        .bind(reminder.days_overdue)
        .bind(date(reminder.cycle_date))
        .bind(timestamp(reminder.sent_at))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }
        insert_event(&mut *tx, event).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_invoice_reminders(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<InvoiceReminder>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, company_id, invoice_id, reminder_number, days_overdue, cycle_date, sent_at
             FROM invoice_reminders
             WHERE company_id = ?
             ORDER BY sent_at ASC, rowid ASC",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(invoice_reminder_from_row).collect()
    }

    async fn insert_task_reminder(
        &self,
        reminder: &TaskReminder,
        event: &Event,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO task_reminders (id, company_id, task_id, reminder_type, cycle_date, sent_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(company_id, task_id, reminder_type, cycle_date) DO NOTHING",
        )
        .bind(&reminder.id)
        .bind(&reminder.company_id.0)
        .bind(&reminder.task_id.0)
        .bind(reminder.reminder_type.as_str())
        .bind(date(reminder.cycle_date))
        .bind(timestamp(reminder.sent_at))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }
        insert_event(&mut *tx, event).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_task_reminders(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<TaskReminder>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, company_id, task_id, reminder_type, cycle_date, sent_at
             FROM task_reminders
             WHERE company_id = ?
             ORDER BY sent_at ASC, rowid ASC",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_reminder_from_row).collect()
    }

    async fn insert_win_loss(&self, analysis: &WinLossAnalysis) -> Result<bool, RepositoryError> {
        let inserted = sqlx::query(
            "INSERT INTO win_loss_analyses (
                id,
                company_id,
                deal_id,
                deal_title,
                outcome,
                total_days,
                avg_won_days,
                analysis,
                analyzed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(company_id, deal_id) DO NOTHING",
        )
        .bind(&analysis.id)
        .bind(&analysis.company_id.0)
        .bind(&analysis.deal_id.0)
        .bind(analysis.deal_title.as_deref())
        .bind(analysis.outcome.as_str())
        .bind(analysis.total_days)
        .bind(analysis.avg_won_days)
        .bind(analysis.analysis.as_deref())
        .bind(timestamp(analysis.analyzed_at))
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn list_win_loss(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<WinLossAnalysis>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                company_id,
                deal_id,
                deal_title,
                outcome,
                total_days,
                avg_won_days,
                analysis,
                analyzed_at
             FROM win_loss_analyses
             WHERE company_id = ?
             ORDER BY analyzed_at ASC, rowid ASC",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(win_loss_from_row).collect()
    }

    async fn analyzed_deal_ids(
        &self,
        company_id: &CompanyId,
    ) -> Result<BTreeSet<RecordId>, RepositoryError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT deal_id FROM win_loss_analyses WHERE company_id = ?")
                .bind(&company_id.0)
                .fetch_all(&self.pool)
                .await?;

        Ok(ids.into_iter().map(RecordId).collect())
    }
}

fn cycle_date(row: &SqliteRow) -> Result<NaiveDate, RepositoryError> {
    get_optional_date(row, "cycle_date")?
        .ok_or_else(|| RepositoryError::Decode("cycle_date is null".to_string()))
}

fn invoice_reminder_from_row(row: &SqliteRow) -> Result<InvoiceReminder, RepositoryError> {
    let reminder_number: i64 = row.try_get("reminder_number")?;
    let reminder_number = u8::try_from(reminder_number).map_err(|_| {
        RepositoryError::Decode(format!("reminder_number out of range: {reminder_number}"))
    })?;

    Ok(InvoiceReminder {
        id: row.try_get("id")?,
        company_id: CompanyId(row.try_get("company_id")?),
        invoice_id: RecordId(row.try_get("invoice_id")?),
        reminder_number,
        days_overdue: row.try_get("days_overdue")?,
        cycle_date: cycle_date(row)?,
        sent_at: get_timestamp(row, "sent_at")?,
    })
}

fn task_reminder_from_row(row: &SqliteRow) -> Result<TaskReminder, RepositoryError> {
    Ok(TaskReminder {
        id: row.try_get("id")?,
        company_id: CompanyId(row.try_get("company_id")?),
        task_id: RecordId(row.try_get("task_id")?),
        reminder_type: get_enum(row, "reminder_type", TaskReminderType::parse)?,
        cycle_date: cycle_date(row)?,
        sent_at: get_timestamp(row, "sent_at")?,
    })
}

fn win_loss_from_row(row: &SqliteRow) -> Result<WinLossAnalysis, RepositoryError> {
    Ok(WinLossAnalysis {
        id: row.try_get("id")?,
        company_id: CompanyId(row.try_get("company_id")?),
        deal_id: RecordId(row.try_get("deal_id")?),
        deal_title: row.try_get("deal_title")?,
        outcome: get_enum(row, "outcome", DealOutcome::parse)?,
        total_days: row.try_get::<Option<i64>, _>("total_days")?.unwrap_or_default(),
        avg_won_days: row.try_get::<Option<f64>, _>("avg_won_days")?.unwrap_or_default(),
        analysis: row.try_get("analysis")?,
        analyzed_at: get_timestamp(row, "analyzed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use kuria_core::domain::company::CompanyId;
    use kuria_core::domain::event::{Event, EventId, EventPayload};
    use kuria_core::domain::history::{
        DealOutcome, InvoiceReminder, TaskReminder, TaskReminderType, WinLossAnalysis,
    };
    use kuria_core::domain::record::RecordId;

    use super::SqlHistoryRepository;
    use crate::repositories::test_support::{at, insert_company, setup_pool};
    use crate::repositories::{EventRepository, HistoryRepository, SqlEventRepository};

    fn invoice_reminder(company: &CompanyId, id: &str, number: u8) -> (InvoiceReminder, Event) {
        let reminder = InvoiceReminder {
            id: id.to_string(),
            company_id: company.clone(),
            invoice_id: RecordId("inv-1".to_string()),
            reminder_number: number,
            days_overdue: 10,
            cycle_date: NaiveDate::from_ymd_opt(2026, 3, 10).expect("date"),
            sent_at: at(10, 9),
        };
        let event = Event::new(
            EventId(format!("evt-{id}")),
            company.clone(),
            EventPayload::InvoiceReminderDue {
                record_id: reminder.invoice_id.clone(),
                reminder_number: number,
                days_overdue: 10,
            },
            at(10, 9),
        );
        (reminder, event)
    }

    #[tokio::test]
    async fn duplicate_invoice_reminder_is_skipped_with_its_event() {
        let pool = setup_pool().await;
        let acme = insert_company(&pool, "acme").await;
        let repo = SqlHistoryRepository::new(pool.clone());

        let (first, first_event) = invoice_reminder(&acme, "r-1", 1);
        assert!(repo.insert_invoice_reminder(&first, &first_event).await.expect("first"));
        let (again, again_event) = invoice_reminder(&acme, "r-2", 1);
        assert!(!repo.insert_invoice_reminder(&again, &again_event).await.expect("again"));

        assert_eq!(repo.list_invoice_reminders(&acme).await.expect("list"), vec![first]);
        let events = SqlEventRepository::new(pool.clone());
        assert_eq!(events.fetch_unprocessed(&acme, 10).await.expect("events"), vec![first_event]);
    }

    #[tokio::test]
    async fn task_reminders_dedupe_per_type_and_day() {
        let pool = setup_pool().await;
        let acme = insert_company(&pool, "acme").await;
        let repo = SqlHistoryRepository::new(pool.clone());

        let reminder = |id: &str, reminder_type: TaskReminderType, day: u32| {
            let reminder = TaskReminder {
                id: id.to_string(),
                company_id: acme.clone(),
                task_id: RecordId("task-1".to_string()),
                reminder_type,
                cycle_date: NaiveDate::from_ymd_opt(2026, 3, day).expect("date"),
                sent_at: at(day, 9),
            };
            let event = Event::new(
                EventId(format!("evt-{id}")),
                acme.clone(),
                EventPayload::TaskReminderDue {
                    record_id: reminder.task_id.clone(),
                    reminder_type: reminder_type.as_str().to_string(),
                },
                at(day, 9),
            );
            (reminder, event)
        };

        let (a, a_event) = reminder("t-1", TaskReminderType::OverdueAlert, 10);
        let (b, b_event) = reminder("t-2", TaskReminderType::OverdueAlert, 10);
        let (c, c_event) = reminder("t-3", TaskReminderType::Escalation, 10);
        let (d, d_event) = reminder("t-4", TaskReminderType::OverdueAlert, 11);

        assert!(repo.insert_task_reminder(&a, &a_event).await.expect("a"));
        assert!(!repo.insert_task_reminder(&b, &b_event).await.expect("b"));
        assert!(repo.insert_task_reminder(&c, &c_event).await.expect("c"));
        assert!(repo.insert_task_reminder(&d, &d_event).await.expect("d"));
        assert_eq!(repo.list_task_reminders(&acme).await.expect("list"), vec![a, c, d]);
    }

    #[tokio::test]
    async fn win_loss_is_recorded_once_per_deal() {
        let pool = setup_pool().await;
        let acme = insert_company(&pool, "acme").await;
        let repo = SqlHistoryRepository::new(pool.clone());

        let analysis = WinLossAnalysis {
            id: "wl-1".to_string(),
            company_id: acme.clone(),
            deal_id: RecordId("deal-7".to_string()),
            deal_title: Some("Brand refresh".to_string()),
            outcome: DealOutcome::Won,
            total_days: 21,
            avg_won_days: 18.5,
            analysis: None,
            analyzed_at: at(12, 8),
        };
        assert!(repo.insert_win_loss(&analysis).await.expect("insert"));
        let repeat = WinLossAnalysis { id: "wl-2".to_string(), ..analysis.clone() };
        assert!(!repo.insert_win_loss(&repeat).await.expect("repeat"));

        assert_eq!(repo.list_win_loss(&acme).await.expect("list"), vec![analysis]);
        let analyzed = repo.analyzed_deal_ids(&acme).await.expect("ids");
        assert!(analyzed.contains(&RecordId("deal-7".to_string())));
    }
}
