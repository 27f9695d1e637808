//! Field-level merge of connector records into canonical rows.
//!
//! Every field carries the source timestamp that last wrote it. An incoming
//! value replaces the stored one only when the incoming record is at least as
//! new as that timestamp, so out-of-order deliveries cannot roll a field back.
//! Wall-clock time is only used for `synced_at`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::company::CompanyId;
use crate::domain::event::{EventPayload, RecordCreated};
use crate::domain::record::{
    Contact, ConnectorSource, Deal, Expense, Invoice, InvoiceStatus, RawRecord,
    RecordFields, RecordId, RecordKind, RecordMeta, SyncKey, SyncedRecord, Task, TaskStatus,
};
use crate::errors::DomainError;

pub const MAX_RAW_ID_LEN: usize = 255;

/// Currency of a new deal whose source did not send one.
pub const DEFAULT_DEAL_CURRENCY: &str = "EUR";

/// Outcome of merging one raw record, ready to be persisted atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncPlan {
    pub record: SyncedRecord,
    pub created: bool,
    pub changed_fields: Vec<String>,
    pub stale_fields: Vec<String>,
    pub events: Vec<EventPayload>,
}

/// Checks a raw record and resolves its idempotency triple.
pub fn validate_raw(company_id: &CompanyId, raw: &RawRecord) -> Result<SyncKey, DomainError> {
    let raw_id = raw.raw_id.trim();
    if raw_id.is_empty() {
        return Err(DomainError::InvalidRecord("raw_id must not be empty".to_string()));
    }
    if raw_id.chars().count() > MAX_RAW_ID_LEN {
        return Err(DomainError::InvalidRecord(format!(
            "raw_id must be at most {MAX_RAW_ID_LEN} characters"
        )));
    }
    let connector_source = ConnectorSource::parse(&raw.connector_source).ok_or_else(|| {
        DomainError::InvalidRecord(format!(
            "unknown connector_source `{}`",
            raw.connector_source.trim()
        ))
    })?;

    match &raw.fields {
        RecordFields::Deal(fields) => {
            reject_negative("amount", fields.amount)?;
            if let Some(probability) = fields.probability {
                if !(0.0..=1.0).contains(&probability) {
                    return Err(DomainError::InvalidRecord(
                        "probability must be within 0..=1".to_string(),
                    ));
                }
            }
        }
        RecordFields::Contact(fields) => {
            if fields.score.is_some_and(|score| score > 100) {
                return Err(DomainError::InvalidRecord("score must be within 0..=100".to_string()));
            }
        }
        RecordFields::Invoice(fields) => {
            reject_negative("amount", fields.amount)?;
            reject_negative("amount_paid", fields.amount_paid)?;
        }
        RecordFields::Task(_) => {}
        RecordFields::Expense(fields) => reject_negative("amount", fields.amount)?,
    }

    Ok(SyncKey { company_id: company_id.clone(), connector_source, raw_id: raw_id.to_string() })
}

fn reject_negative(field: &str, value: Option<Decimal>) -> Result<(), DomainError> {
    match value {
        Some(amount) if amount.is_sign_negative() && !amount.is_zero() => {
            Err(DomainError::InvalidRecord(format!("{field} must not be negative")))
        }
        _ => Ok(()),
    }
}

/// Builds a brand-new canonical record. Every present field is versioned at
/// the record's source timestamp.
pub fn plan_create(key: &SyncKey, id: RecordId, raw: &RawRecord, now: DateTime<Utc>) -> SyncPlan {
    let meta = RecordMeta {
        id: id.clone(),
        company_id: key.company_id.clone(),
        connector_source: key.connector_source,
        raw_id: key.raw_id.clone(),
        synced_at: now,
        source_updated_at: raw.source_updated_at,
        field_versions: BTreeMap::new(),
        row_version: 1,
    };
    let empty = empty_record(raw.fields.kind(), meta);
    let mut plan = merge(empty, &raw.fields, raw.source_updated_at, now);
    // Left unversioned so the first currency the source sends still applies.
    if let SyncedRecord::Deal(deal) = &mut plan.record {
        deal.currency.get_or_insert_with(|| DEFAULT_DEAL_CURRENCY.to_string());
    }
    plan.created = true;
    plan.events = vec![EventPayload::created(
        raw.fields.kind(),
        RecordCreated {
            record_id: id,
            connector_source: key.connector_source,
            raw_id: key.raw_id.clone(),
        },
    )];
    plan
}

/// Merges a raw record into the stored row for the same triple.
pub fn plan_update(
    existing: SyncedRecord,
    raw: &RawRecord,
    now: DateTime<Utc>,
) -> Result<SyncPlan, DomainError> {
    if existing.kind() != raw.fields.kind() {
        return Err(DomainError::InvariantViolation(format!(
            "stored {} cannot be merged with {} fields",
            existing.kind().as_str(),
            raw.fields.kind().as_str()
        )));
    }
    let before = existing.clone();
    let mut plan = merge(existing, &raw.fields, raw.source_updated_at, now);
    plan.events = significant_changes(&before, &plan.record);
    Ok(plan)
}

struct FieldMerger<'a> {
    versions: &'a mut BTreeMap<String, DateTime<Utc>>,
    at: DateTime<Utc>,
    changed: Vec<String>,
    stale: Vec<String>,
}

impl<'a> FieldMerger<'a> {
    fn new(versions: &'a mut BTreeMap<String, DateTime<Utc>>, at: DateTime<Utc>) -> Self {
        Self { versions, at, changed: Vec::new(), stale: Vec::new() }
    }

    fn merge<T: PartialEq>(&mut self, name: &str, slot: &mut Option<T>, incoming: Option<T>) {
        let Some(value) = incoming else {
            return;
        };
        if self.versions.get(name).is_some_and(|version| *version > self.at) {
            self.stale.push(name.to_string());
            return;
        }
        self.versions.insert(name.to_string(), self.at);
        if slot.as_ref() != Some(&value) {
            *slot = Some(value);
            self.changed.push(name.to_string());
        }
    }

    fn finish(self) -> (Vec<String>, Vec<String>) {
        (self.changed, self.stale)
    }
}

macro_rules! merge_fields {
    ($record:ident, $fields:ident, $at:expr, [$($field:ident),+ $(,)?]) => {{
        let mut merger = FieldMerger::new(&mut $record.meta.field_versions, $at);
        $( merger.merge(stringify!($field), &mut $record.$field, $fields.$field.clone()); )+
        merger.finish()
    }};
}

fn merge(
    mut record: SyncedRecord,
    fields: &RecordFields,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> SyncPlan {
    let (changed_fields, stale_fields) = match (&mut record, fields) {
        (SyncedRecord::Deal(deal), RecordFields::Deal(f)) => merge_fields!(
            deal,
            f,
            at,
            [
                title,
                amount,
                currency,
                stage,
                stage_order,
                probability,
                status,
                created_at,
                last_activity_at,
                closed_at,
                expected_close_date,
                owner_id,
                owner_name,
                source,
            ]
        ),
        (SyncedRecord::Contact(contact), RecordFields::Contact(f)) => merge_fields!(
            contact,
            f,
            at,
            [
                email,
                first_name,
                last_name,
                company_name,
                company_size,
                sector,
                source,
                source_detail,
                score,
                score_label,
                created_at,
                last_activity_at,
            ]
        ),
        (SyncedRecord::Invoice(invoice), RecordFields::Invoice(f)) => merge_fields!(
            invoice,
            f,
            at,
            [
                amount,
                amount_paid,
                currency,
                client_id,
                client_name,
                status,
                issued_at,
                due_at,
                paid_at,
                payment_delay_days,
            ]
        ),
        (SyncedRecord::Task(task), RecordFields::Task(f)) => merge_fields!(
            task,
            f,
            at,
            [
                title,
                description,
                assignee_id,
                assignee_name,
                status,
                created_at,
                due_at,
                completed_at,
                cycle_time_days,
            ]
        ),
        (SyncedRecord::Expense(expense), RecordFields::Expense(f)) => merge_fields!(
            expense,
            f,
            at,
            [amount, currency, vendor, category, is_recurring, date]
        ),
        _ => (Vec::new(), Vec::new()),
    };

    let meta = record.meta_mut();
    meta.synced_at = now;
    if at > meta.source_updated_at {
        meta.source_updated_at = at;
    }

    SyncPlan { record, created: false, changed_fields, stale_fields, events: Vec::new() }
}

fn empty_record(kind: RecordKind, meta: RecordMeta) -> SyncedRecord {
    match kind {
        RecordKind::Deal => SyncedRecord::Deal(Deal {
            meta,
            title: None,
            amount: None,
            currency: None,
            stage: None,
            stage_order: None,
            probability: None,
            status: None,
            created_at: None,
            last_activity_at: None,
            closed_at: None,
            expected_close_date: None,
            owner_id: None,
            owner_name: None,
            source: None,
        }),
        RecordKind::Contact => SyncedRecord::Contact(Contact {
            meta,
            email: None,
            first_name: None,
            last_name: None,
            company_name: None,
            company_size: None,
            sector: None,
            source: None,
            source_detail: None,
            score: None,
            score_label: None,
            created_at: None,
            last_activity_at: None,
        }),
        RecordKind::Invoice => SyncedRecord::Invoice(Invoice {
            meta,
            amount: None,
            amount_paid: None,
            currency: None,
            client_id: None,
            client_name: None,
            status: None,
            issued_at: None,
            due_at: None,
            paid_at: None,
            payment_delay_days: None,
        }),
        RecordKind::Task => SyncedRecord::Task(Task {
            meta,
            title: None,
            description: None,
            assignee_id: None,
            assignee_name: None,
            status: None,
            created_at: None,
            due_at: None,
            completed_at: None,
            cycle_time_days: None,
        }),
        RecordKind::Expense => SyncedRecord::Expense(Expense {
            meta,
            amount: None,
            currency: None,
            vendor: None,
            category: None,
            is_recurring: None,
            date: None,
        }),
    }
}

/// Events for transitions agents care about. Only real transitions count, so
/// re-syncing an unchanged record emits nothing.
fn significant_changes(before: &SyncedRecord, after: &SyncedRecord) -> Vec<EventPayload> {
    let mut events = Vec::new();
    match (before, after) {
        (SyncedRecord::Deal(old), SyncedRecord::Deal(new)) => {
            if old.stage != new.stage {
                events.push(EventPayload::DealStageChanged {
                    record_id: new.meta.id.clone(),
                    from_stage: old.stage.clone(),
                    to_stage: new.stage.clone(),
                });
            }
            if let Some(status) = new.status.as_ref().filter(|status| status.is_closed()) {
                if old.status.as_ref() != Some(status) {
                    events.push(EventPayload::DealClosed {
                        record_id: new.meta.id.clone(),
                        status: status.as_str().to_string(),
                        amount: new.amount,
                    });
                }
            }
        }
        (SyncedRecord::Invoice(old), SyncedRecord::Invoice(new)) => {
            if old.status != new.status {
                match new.status {
                    Some(InvoiceStatus::Paid) => events.push(EventPayload::InvoicePaid {
                        record_id: new.meta.id.clone(),
                        amount_paid: new.amount_paid,
                    }),
                    Some(InvoiceStatus::Overdue) => events.push(EventPayload::InvoiceOverdue {
                        record_id: new.meta.id.clone(),
                        amount: new.amount,
                        due_at: new.due_at,
                    }),
                    _ => {}
                }
            }
        }
        (SyncedRecord::Task(old), SyncedRecord::Task(new)) => {
            if old.status != new.status && new.status == Some(TaskStatus::Done) {
                events.push(EventPayload::TaskCompleted {
                    record_id: new.meta.id.clone(),
                    cycle_time_days: new.cycle_time_days,
                });
            }
        }
        (SyncedRecord::Contact(old), SyncedRecord::Contact(new)) => {
            if old.score_label != new.score_label {
                events.push(EventPayload::ContactScoreChanged {
                    record_id: new.meta.id.clone(),
                    from: old.score_label.as_ref().map(|label| label.as_str().to_string()),
                    to: new.score_label.as_ref().map(|label| label.as_str().to_string()),
                });
            }
        }
        _ => {}
    }
    events
}
