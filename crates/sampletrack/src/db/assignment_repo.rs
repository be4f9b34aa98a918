//! Assignment repository: `progress_assignments` and `task_assignments`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::codec::{format_timestamp, get_opt_timestamp, opt_timestamp};
use super::DatabaseError;
use crate::workflow::model::{
    AssignmentId, AssignmentStatus, JobId, ProgressAssignment, StepId, TaskAssignment,
    TaskAssignmentId, TaskId, TaskStatus, UserId,
};

const ASSIGNMENT_COLUMNS: &str =
    "id, job_id, progress_step_id, pic_id, status, position, started_at, finished_at, blocked_reason";

const TASK_COLUMNS: &str =
    "id, progress_assignment_id, progress_task_id, status, completed_at, completed_by, notes";

fn assignment_from_row(row: &Row<'_>) -> Result<ProgressAssignment, rusqlite::Error> {
    Ok(ProgressAssignment {
        id: row.get(0)?,
        job_id: row.get(1)?,
        progress_step_id: row.get(2)?,
        pic_id: row.get(3)?,
        status: row.get(4)?,
        position: row.get(5)?,
        started_at: get_opt_timestamp(row, 6)?,
        finished_at: get_opt_timestamp(row, 7)?,
        blocked_reason: row.get(8)?,
    })
}

fn task_from_row(row: &Row<'_>) -> Result<TaskAssignment, rusqlite::Error> {
    Ok(TaskAssignment {
        id: row.get(0)?,
        progress_assignment_id: row.get(1)?,
        progress_task_id: row.get(2)?,
        status: row.get(3)?,
        completed_at: get_opt_timestamp(row, 4)?,
        completed_by: row.get(5)?,
        notes: row.get(6)?,
    })
}

/// Completed and total task counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub completed: u64,
    pub total: u64,
}

impl TaskCounts {
    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

pub fn insert_assignment(
    conn: &Connection,
    job_id: JobId,
    progress_step_id: StepId,
    pic_id: UserId,
    status: AssignmentStatus,
    position: i64,
    started_at: Option<DateTime<Utc>>,
) -> Result<AssignmentId, DatabaseError> {
    conn.execute(
        "INSERT INTO progress_assignments (job_id, progress_step_id, pic_id, status, position, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job_id,
            progress_step_id,
            pic_id,
            status,
            position,
            opt_timestamp(started_at)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Overwrites every mutable column of an assignment.
pub fn update_assignment(
    conn: &Connection,
    assignment: &ProgressAssignment,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE progress_assignments SET pic_id = ?2, status = ?3, position = ?4,
         started_at = ?5, finished_at = ?6, blocked_reason = ?7
         WHERE id = ?1",
        params![
            assignment.id,
            assignment.pic_id,
            assignment.status,
            assignment.position,
            opt_timestamp(assignment.started_at),
            opt_timestamp(assignment.finished_at),
            assignment.blocked_reason,
        ],
    )?;
    Ok(())
}

pub fn find_assignment(
    conn: &Connection,
    id: AssignmentId,
) -> Result<Option<ProgressAssignment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM progress_assignments WHERE id = ?1",
        ASSIGNMENT_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![id], assignment_from_row)?;
    match rows.next() {
        Some(Ok(row)) => Ok(Some(row)),
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}

/// All assignments of a job in client-supplied order.
pub fn assignments_for_job(
    conn: &Connection,
    job_id: JobId,
) -> Result<Vec<ProgressAssignment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM progress_assignments WHERE job_id = ?1 ORDER BY position, id",
        ASSIGNMENT_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![job_id], assignment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_assignment(conn: &Connection, id: AssignmentId) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM task_assignments WHERE progress_assignment_id = ?1",
        params![id],
    )?;
    conn.execute("DELETE FROM progress_assignments WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn insert_task(
    conn: &Connection,
    assignment_id: AssignmentId,
    task_id: TaskId,
) -> Result<TaskAssignmentId, DatabaseError> {
    conn.execute(
        "INSERT INTO task_assignments (progress_assignment_id, progress_task_id, status)
         VALUES (?1, ?2, ?3)",
        params![assignment_id, task_id, TaskStatus::Pending],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_task(
    conn: &Connection,
    id: TaskAssignmentId,
) -> Result<Option<TaskAssignment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_assignments WHERE id = ?1",
        TASK_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![id], task_from_row)?;
    match rows.next() {
        Some(Ok(row)) => Ok(Some(row)),
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}

/// Task assignments of one progress assignment in catalog task order.
pub fn tasks_for_assignment(
    conn: &Connection,
    assignment_id: AssignmentId,
) -> Result<Vec<TaskAssignment>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT ta.id, ta.progress_assignment_id, ta.progress_task_id, ta.status,
                ta.completed_at, ta.completed_by, ta.notes
         FROM task_assignments ta
         JOIN progress_tasks pt ON pt.id = ta.progress_task_id
         WHERE ta.progress_assignment_id = ?1
         ORDER BY pt.task_order, ta.id",
    )?;
    let rows = stmt
        .query_map(params![assignment_id], task_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Writes the completion record of a task.
pub fn complete_task(
    conn: &Connection,
    id: TaskAssignmentId,
    completed_at: DateTime<Utc>,
    completed_by: UserId,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE task_assignments SET status = ?2, completed_at = ?3, completed_by = ?4
         WHERE id = ?1",
        params![
            id,
            TaskStatus::Completed,
            format_timestamp(completed_at),
            completed_by
        ],
    )?;
    Ok(())
}

/// Removes the completion record of a task.
pub fn reopen_task(conn: &Connection, id: TaskAssignmentId) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE task_assignments SET status = ?2, completed_at = NULL, completed_by = NULL
         WHERE id = ?1",
        params![id, TaskStatus::Pending],
    )?;
    Ok(())
}

pub fn set_task_notes(
    conn: &Connection,
    id: TaskAssignmentId,
    notes: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE task_assignments SET notes = ?2 WHERE id = ?1",
        params![id, notes],
    )?;
    Ok(())
}

pub fn delete_task(conn: &Connection, id: TaskAssignmentId) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM task_assignments WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn task_counts_for_assignment(
    conn: &Connection,
    assignment_id: AssignmentId,
) -> Result<TaskCounts, DatabaseError> {
    let (completed, total) = conn.query_row(
        "SELECT COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0), COUNT(*)
         FROM task_assignments WHERE progress_assignment_id = ?1",
        params![assignment_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(TaskCounts { completed, total })
}

/// Task counts across every assignment of a job.
pub fn task_counts_for_job(conn: &Connection, job_id: JobId) -> Result<TaskCounts, DatabaseError> {
    let (completed, total) = conn.query_row(
        "SELECT COALESCE(SUM(CASE WHEN ta.status = 'completed' THEN 1 ELSE 0 END), 0), COUNT(*)
         FROM task_assignments ta
         JOIN progress_assignments pa ON pa.id = ta.progress_assignment_id
         WHERE pa.job_id = ?1",
        params![job_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(TaskCounts { completed, total })
}

/// Deletes every task assignment and progress assignment of a job.
pub fn delete_for_job(conn: &Connection, job_id: JobId) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM task_assignments WHERE progress_assignment_id IN
         (SELECT id FROM progress_assignments WHERE job_id = ?1)",
        params![job_id],
    )?;
    conn.execute(
        "DELETE FROM progress_assignments WHERE job_id = ?1",
        params![job_id],
    )?;
    Ok(())
}
