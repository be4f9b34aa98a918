//! External delay repository: `external_delay_records`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::codec::{format_timestamp, get_opt_timestamp, get_timestamp};
use super::DatabaseError;
use crate::workflow::model::{
    AssignmentId, DelayCategory, DelayRecordId, ExternalDelayRecord, JobId,
};

const COLUMNS: &str = "id, job_id, last_progress_assignment_id, next_progress_assignment_id,
     category, reason, external_wait_start, external_wait_end, wait_hours, created_at";

fn from_row(row: &Row<'_>) -> Result<ExternalDelayRecord, rusqlite::Error> {
    Ok(ExternalDelayRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        last_progress_assignment_id: row.get(2)?,
        next_progress_assignment_id: row.get(3)?,
        category: row.get(4)?,
        reason: row.get(5)?,
        external_wait_start: get_timestamp(row, 6)?,
        external_wait_end: get_opt_timestamp(row, 7)?,
        wait_hours: row.get(8)?,
        created_at: get_timestamp(row, 9)?,
    })
}

/// Query filter parameters for delay listing.
#[derive(Debug, Default, Clone)]
pub struct DelayFilter {
    pub job_id: Option<JobId>,
    pub category: Option<DelayCategory>,
    pub open_only: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Opens a wait window with no category or reason.
pub fn insert_open(
    conn: &Connection,
    job_id: JobId,
    last: AssignmentId,
    next: Option<AssignmentId>,
    wait_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DelayRecordId, DatabaseError> {
    conn.execute(
        "INSERT INTO external_delay_records (job_id, last_progress_assignment_id,
         next_progress_assignment_id, external_wait_start, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            job_id,
            last,
            next,
            format_timestamp(wait_start),
            format_timestamp(now)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_by_id(
    conn: &Connection,
    id: DelayRecordId,
) -> Result<Option<ExternalDelayRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM external_delay_records WHERE id = ?1",
        COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![id], from_row)?;
    match rows.next() {
        Some(Ok(record)) => Ok(Some(record)),
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}

/// Open records waiting on `next` to be picked up.
pub fn find_open_for_next(
    conn: &Connection,
    next: AssignmentId,
) -> Result<Vec<ExternalDelayRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM external_delay_records
         WHERE next_progress_assignment_id = ?1 AND external_wait_end IS NULL
         ORDER BY id",
        COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![next], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Writes the closing fields of a record.
pub fn close(
    conn: &Connection,
    id: DelayRecordId,
    wait_end: DateTime<Utc>,
    wait_hours: f64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE external_delay_records SET external_wait_end = ?2, wait_hours = ?3
         WHERE id = ?1",
        params![id, format_timestamp(wait_end), wait_hours],
    )?;
    Ok(())
}

/// Sets category and reason; `None` leaves a field unchanged.
pub fn annotate(
    conn: &Connection,
    id: DelayRecordId,
    category: Option<DelayCategory>,
    reason: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE external_delay_records
         SET category = COALESCE(?2, category), reason = COALESCE(?3, reason)
         WHERE id = ?1",
        params![id, category, reason],
    )?;
    Ok(())
}

/// Queries delay records with filters, returning (rows, total_count).
pub fn query(
    conn: &Connection,
    filter: &DelayFilter,
) -> Result<(Vec<ExternalDelayRecord>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(job_id) = filter.job_id {
        conditions.push(format!("job_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(job_id));
    }
    if let Some(category) = filter.category {
        conditions.push(format!("category = ?{}", param_values.len() + 1));
        param_values.push(Box::new(category));
    }
    if filter.open_only {
        conditions.push("external_wait_end IS NULL".to_string());
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM external_delay_records {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT {} FROM external_delay_records {} ORDER BY external_wait_start DESC, id DESC
         LIMIT ?{} OFFSET ?{}",
        COLUMNS,
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows = stmt
        .query_map(params_ref.as_slice(), from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

/// Removes records that reference an assignment on either side.
pub fn delete_for_assignment(conn: &Connection, id: AssignmentId) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM external_delay_records
         WHERE last_progress_assignment_id = ?1 OR next_progress_assignment_id = ?1",
        params![id],
    )?;
    Ok(())
}

pub fn delete_for_job(conn: &Connection, job_id: JobId) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM external_delay_records WHERE job_id = ?1",
        params![job_id],
    )?;
    Ok(())
}
