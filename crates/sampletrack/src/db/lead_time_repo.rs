//! Lead time repository: `lead_time_records`, one row per assignment.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::codec::{format_timestamp, get_timestamp};
use super::DatabaseError;
use crate::workflow::model::{AssignmentId, JobId, LeadTimeRecord};

fn from_row(row: &Row<'_>) -> Result<LeadTimeRecord, rusqlite::Error> {
    Ok(LeadTimeRecord {
        progress_assignment_id: row.get(0)?,
        planned_hours: row.get(1)?,
        actual_hours: row.get(2)?,
        variance_hours: row.get(3)?,
        efficiency_pct: row.get(4)?,
        updated_at: get_timestamp(row, 5)?,
    })
}

pub fn find(
    conn: &Connection,
    assignment_id: AssignmentId,
) -> Result<Option<LeadTimeRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT progress_assignment_id, planned_hours, actual_hours, variance_hours,
                efficiency_pct, updated_at
         FROM lead_time_records WHERE progress_assignment_id = ?1",
    )?;
    let mut rows = stmt.query_map(params![assignment_id], from_row)?;
    match rows.next() {
        Some(Ok(record)) => Ok(Some(record)),
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}

/// Sets the planned input, creating the row if needed. Derived fields are kept.
pub fn upsert_planned(
    conn: &Connection,
    assignment_id: AssignmentId,
    planned_hours: Option<f64>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO lead_time_records (progress_assignment_id, planned_hours, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (progress_assignment_id)
         DO UPDATE SET planned_hours = excluded.planned_hours, updated_at = excluded.updated_at",
        params![assignment_id, planned_hours, format_timestamp(now)],
    )?;
    Ok(())
}

/// Writes a full computed record.
pub fn upsert(conn: &Connection, record: &LeadTimeRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO lead_time_records (progress_assignment_id, planned_hours, actual_hours,
         variance_hours, efficiency_pct, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (progress_assignment_id)
         DO UPDATE SET planned_hours = excluded.planned_hours,
                       actual_hours = excluded.actual_hours,
                       variance_hours = excluded.variance_hours,
                       efficiency_pct = excluded.efficiency_pct,
                       updated_at = excluded.updated_at",
        params![
            record.progress_assignment_id,
            record.planned_hours,
            record.actual_hours,
            record.variance_hours,
            record.efficiency_pct,
            format_timestamp(record.updated_at),
        ],
    )?;
    Ok(())
}

/// Clears the derived fields after an assignment is reopened.
pub fn clear_actuals(
    conn: &Connection,
    assignment_id: AssignmentId,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE lead_time_records SET actual_hours = NULL, variance_hours = NULL,
         efficiency_pct = NULL, updated_at = ?2
         WHERE progress_assignment_id = ?1",
        params![assignment_id, format_timestamp(now)],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, assignment_id: AssignmentId) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM lead_time_records WHERE progress_assignment_id = ?1",
        params![assignment_id],
    )?;
    Ok(())
}

pub fn delete_for_job(conn: &Connection, job_id: JobId) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM lead_time_records WHERE progress_assignment_id IN
         (SELECT id FROM progress_assignments WHERE job_id = ?1)",
        params![job_id],
    )?;
    Ok(())
}
