//! Column encoding shared by the SQLite repositories.
//!
//! Timestamps are written as fixed-width RFC 3339 UTC strings with
//! microseconds so that lexical order in SQL matches chronological order.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::RepositoryError;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub(crate) fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn optional_timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp)
}

pub(crate) fn date(value: NaiveDate) -> String {
    value.format(DATE_FORMAT).to_string()
}

pub(crate) fn to_json<T: Serialize + ?Sized>(
    column: &str,
    value: &T,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode `{column}`: {error}")))
}

pub(crate) fn parse_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|parsed| parsed.with_timezone(&Utc)).map_err(|error| {
        RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_decimal(column: &str, value: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(value).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn get_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, RepositoryError> {
    parse_timestamp(column, row.try_get(column)?)
}

pub(crate) fn get_optional_timestamp(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    row.try_get::<Option<String>, _>(column)?
        .map(|value| parse_timestamp(column, value))
        .transpose()
}

pub(crate) fn get_optional_decimal(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<Decimal>, RepositoryError> {
    row.try_get::<Option<String>, _>(column)?
        .map(|value| parse_decimal(column, &value))
        .transpose()
}

pub(crate) fn get_optional_date(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<NaiveDate>, RepositoryError> {
    row.try_get::<Option<String>, _>(column)?
        .map(|value| {
            NaiveDate::parse_from_str(&value, DATE_FORMAT).map_err(|error| {
                RepositoryError::Decode(format!("invalid date in `{column}`: `{value}` ({error})"))
            })
        })
        .transpose()
}

pub(crate) fn get_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T, RepositoryError> {
    let raw: String = row.try_get(column)?;
    parse_json(column, &raw)
}

pub(crate) fn get_optional_json<T: DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<T>, RepositoryError> {
    row.try_get::<Option<String>, _>(column)?.map(|raw| parse_json(column, &raw)).transpose()
}

/// Parses a text column through a `parse(&str) -> Option<T>` constructor.
pub(crate) fn get_enum<T>(
    row: &SqliteRow,
    column: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| RepositoryError::Decode(format!("unknown {column} `{raw}`")))
}
