//! Column encoding shared by the repositories.
//!
//! Timestamps are stored as RFC 3339 text with millisecond precision and a
//! `Z` suffix so that lexicographic order matches chronological order.
//! Status enums are stored as their snake_case names.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;

use crate::workflow::model::{
    AssignmentStatus, DelayCategory, JobStatus, Priority, TaskStatus,
};

pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn conversion_error(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("invalid timestamp '{}'", value).into(),
    )
}

/// Reads a non-null timestamp column.
pub fn get_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, &raw))
}

/// Reads a nullable timestamp column.
pub fn get_opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, &raw)),
        None => Ok(None),
    }
}

pub fn opt_timestamp(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(format_timestamp)
}

macro_rules! text_enum_sql {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    let s = value.as_str()?;
                    s.parse::<$ty>()
                        .map_err(|e| FromSqlError::Other(e.into()))
                }
            }
        )*
    };
}

text_enum_sql!(JobStatus, AssignmentStatus, TaskStatus, Priority, DelayCategory);
