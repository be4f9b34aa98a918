//! Job repository: CRUD operations for the `jobs` and `job_events` tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::codec::{format_timestamp, get_opt_timestamp, get_timestamp, opt_timestamp};
use super::DatabaseError;
use crate::workflow::model::{FlowConfigurationId, Job, JobId, JobStatus, Priority};

/// Event kind written the first time a job reaches full completion.
pub const EVENT_JOB_COMPLETED: &str = "job_completed";
pub const EVENT_JOB_REOPENED: &str = "job_reopened";
pub const EVENT_JOB_REJECTED: &str = "job_rejected";
pub const EVENT_JOB_APPROVED: &str = "job_approved";

const COLUMNS: &str = "id, sample_type, title, customer, priority, status, flow_configuration_id,
     notes, rejection_reason, started_at, deadline, finished_at, created_at, updated_at";

fn from_row(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    Ok(Job {
        id: row.get(0)?,
        sample_type: row.get(1)?,
        title: row.get(2)?,
        customer: row.get(3)?,
        priority: row.get(4)?,
        status: row.get(5)?,
        flow_configuration_id: row.get(6)?,
        notes: row.get(7)?,
        rejection_reason: row.get(8)?,
        started_at: get_timestamp(row, 9)?,
        deadline: get_opt_timestamp(row, 10)?,
        finished_at: get_opt_timestamp(row, 11)?,
        created_at: get_timestamp(row, 12)?,
        updated_at: get_timestamp(row, 13)?,
    })
}

/// Fields for a new job row. Status starts as `in_progress`.
#[derive(Debug, Clone)]
pub struct NewJobRow<'a> {
    pub sample_type: &'a str,
    pub title: &'a str,
    pub customer: Option<&'a str>,
    pub priority: Priority,
    pub flow_configuration_id: Option<FlowConfigurationId>,
    pub notes: Option<&'a str>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub sample_type: Option<String>,
    pub pic_id: Option<i64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub fn insert(
    conn: &Connection,
    row: &NewJobRow<'_>,
    now: DateTime<Utc>,
) -> Result<JobId, DatabaseError> {
    let now = format_timestamp(now);
    conn.execute(
        "INSERT INTO jobs (sample_type, title, customer, priority, status, flow_configuration_id,
         notes, started_at, deadline, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?8, ?8)",
        params![
            row.sample_type,
            row.title,
            row.customer,
            row.priority,
            JobStatus::InProgress,
            row.flow_configuration_id,
            row.notes,
            now,
            opt_timestamp(row.deadline),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Overwrites every mutable column of a job.
pub fn update(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET title = ?2, customer = ?3, priority = ?4, status = ?5,
         flow_configuration_id = ?6, notes = ?7, rejection_reason = ?8, deadline = ?9,
         finished_at = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            job.id,
            job.title,
            job.customer,
            job.priority,
            job.status,
            job.flow_configuration_id,
            job.notes,
            job.rejection_reason,
            opt_timestamp(job.deadline),
            opt_timestamp(job.finished_at),
            format_timestamp(job.updated_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: JobId) -> Result<Option<Job>, DatabaseError> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM jobs WHERE id = ?1", COLUMNS))?;
    let mut rows = stmt.query_map(params![id], from_row)?;
    match rows.next() {
        Some(Ok(job)) => Ok(Some(job)),
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<Job>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status));
    }
    if let Some(ref sample_type) = filter.sample_type {
        conditions.push(format!("sample_type = ?{}", param_values.len() + 1));
        param_values.push(Box::new(sample_type.clone()));
    }
    if let Some(pic_id) = filter.pic_id {
        conditions.push(format!(
            "id IN (SELECT job_id FROM progress_assignments WHERE pic_id = ?{})",
            param_values.len() + 1
        ));
        param_values.push(Box::new(pic_id));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT {} FROM jobs {} ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
        COLUMNS,
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<Job> = stmt
        .query_map(params_ref.as_slice(), from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

pub fn delete(conn: &Connection, id: JobId) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(())
}

/// Whether an event of `kind` was ever recorded for the job.
pub fn has_event(conn: &Connection, job_id: JobId, kind: &str) -> Result<bool, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM job_events WHERE job_id = ?1 AND kind = ?2",
        params![job_id, kind],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub fn record_event(
    conn: &Connection,
    job_id: JobId,
    kind: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_events (job_id, kind, created_at) VALUES (?1, ?2, ?3)",
        params![job_id, kind, format_timestamp(now)],
    )?;
    Ok(())
}

pub fn count_events(conn: &Connection, job_id: JobId, kind: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM job_events WHERE job_id = ?1 AND kind = ?2",
        params![job_id, kind],
        |r| r.get(0),
    )?;
    Ok(count)
}

pub fn delete_events(conn: &Connection, job_id: JobId) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM job_events WHERE job_id = ?1", params![job_id])?;
    Ok(())
}
