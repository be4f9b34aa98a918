//! Catalog repository: read access to `progress_steps` and `progress_tasks`.

use rusqlite::{params, Connection, Row};

use super::DatabaseError;
use crate::workflow::model::{ProgressStep, ProgressTask, StepId, TaskId};

const STEP_COLUMNS: &str = "id, sample_type, name, order_hint, default_planned_hours";

fn step_from_row(row: &Row<'_>) -> Result<ProgressStep, rusqlite::Error> {
    Ok(ProgressStep {
        id: row.get(0)?,
        sample_type: row.get(1)?,
        name: row.get(2)?,
        order_hint: row.get(3)?,
        default_planned_hours: row.get(4)?,
        tasks: Vec::new(),
    })
}

fn task_from_row(row: &Row<'_>) -> Result<ProgressTask, rusqlite::Error> {
    Ok(ProgressTask {
        id: row.get(0)?,
        progress_step_id: row.get(1)?,
        name: row.get(2)?,
        task_order: row.get(3)?,
    })
}

/// Returns every sample type that has catalog entries.
pub fn sample_types(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT sample_type FROM progress_steps ORDER BY sample_type")?;
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Steps of a sample type in catalog order, each with its tasks.
pub fn steps_for_sample_type(
    conn: &Connection,
    sample_type: &str,
) -> Result<Vec<ProgressStep>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM progress_steps WHERE sample_type = ?1 ORDER BY order_hint, id",
        STEP_COLUMNS
    ))?;
    let mut steps = stmt
        .query_map(params![sample_type], step_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for step in &mut steps {
        step.tasks = tasks_for_step(conn, step.id)?;
    }
    Ok(steps)
}

/// Finds one step with its tasks.
pub fn find_step(conn: &Connection, id: StepId) -> Result<Option<ProgressStep>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM progress_steps WHERE id = ?1",
        STEP_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![id], step_from_row)?;
    match rows.next() {
        Some(Ok(mut step)) => {
            step.tasks = tasks_for_step(conn, step.id)?;
            Ok(Some(step))
        }
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}

/// Tasks of a step in catalog order.
pub fn tasks_for_step(conn: &Connection, step_id: StepId) -> Result<Vec<ProgressTask>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, progress_step_id, name, task_order FROM progress_tasks
         WHERE progress_step_id = ?1 ORDER BY task_order, id",
    )?;
    let rows = stmt
        .query_map(params![step_id], task_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_task(conn: &Connection, id: TaskId) -> Result<Option<ProgressTask>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, progress_step_id, name, task_order FROM progress_tasks WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![id], task_from_row)?;
    match rows.next() {
        Some(Ok(task)) => Ok(Some(task)),
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}
