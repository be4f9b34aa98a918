//! Flow configuration repository: `flow_configurations` and `flow_steps`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::codec::{format_timestamp, get_timestamp};
use super::DatabaseError;
use crate::workflow::model::{FlowConfiguration, FlowConfigurationId, FlowStep, FlowStepSpec};

const COLUMNS: &str =
    "id, name, sample_type, description, is_default, is_active, is_system, created_at, updated_at";

fn from_row(row: &Row<'_>) -> Result<FlowConfiguration, rusqlite::Error> {
    Ok(FlowConfiguration {
        id: row.get(0)?,
        name: row.get(1)?,
        sample_type: row.get(2)?,
        description: row.get(3)?,
        is_default: row.get(4)?,
        is_active: row.get(5)?,
        is_system: row.get(6)?,
        created_at: get_timestamp(row, 7)?,
        updated_at: get_timestamp(row, 8)?,
        steps: Vec::new(),
    })
}

/// Fields for a new configuration row.
#[derive(Debug, Clone)]
pub struct NewFlowRow<'a> {
    pub name: &'a str,
    pub sample_type: &'a str,
    pub description: Option<&'a str>,
    pub is_active: bool,
}

pub fn insert(
    conn: &Connection,
    row: &NewFlowRow<'_>,
    now: DateTime<Utc>,
) -> Result<FlowConfigurationId, DatabaseError> {
    let now = format_timestamp(now);
    conn.execute(
        "INSERT INTO flow_configurations (name, sample_type, description, is_default, is_active,
         is_system, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, ?4, 0, ?5, ?5)",
        params![row.name, row.sample_type, row.description, row.is_active, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Replaces all steps of a configuration.
pub fn replace_steps(
    conn: &Connection,
    id: FlowConfigurationId,
    steps: &[FlowStepSpec],
) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM flow_steps WHERE flow_configuration_id = ?1",
        params![id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO flow_steps (flow_configuration_id, progress_step_id, is_required, step_order)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for step in steps {
        stmt.execute(params![
            id,
            step.progress_step_id,
            step.is_required,
            step.step_order
        ])?;
    }
    Ok(())
}

pub fn steps(conn: &Connection, id: FlowConfigurationId) -> Result<Vec<FlowStep>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, progress_step_id, is_required, step_order FROM flow_steps
         WHERE flow_configuration_id = ?1 ORDER BY step_order",
    )?;
    let rows = stmt
        .query_map(params![id], |row| {
            Ok(FlowStep {
                id: row.get(0)?,
                progress_step_id: row.get(1)?,
                is_required: row.get(2)?,
                step_order: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn find_one(
    conn: &Connection,
    where_clause: &str,
    param: &dyn rusqlite::types::ToSql,
) -> Result<Option<FlowConfiguration>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM flow_configurations WHERE {} ORDER BY updated_at DESC, id DESC LIMIT 1",
        COLUMNS, where_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map([param], from_row)?;
    match rows.next() {
        Some(Ok(mut config)) => {
            config.steps = steps(conn, config.id)?;
            Ok(Some(config))
        }
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}

/// Finds a configuration with its ordered steps.
pub fn find_by_id(
    conn: &Connection,
    id: FlowConfigurationId,
) -> Result<Option<FlowConfiguration>, DatabaseError> {
    find_one(conn, "id = ?1", &id)
}

/// The user-defined default for a sample type, if one is active.
pub fn find_default(
    conn: &Connection,
    sample_type: &str,
) -> Result<Option<FlowConfiguration>, DatabaseError> {
    find_one(
        conn,
        "sample_type = ?1 AND is_default = 1 AND is_active = 1 AND is_system = 0",
        &sample_type,
    )
}

/// The built-in ordering for a sample type.
pub fn find_system(
    conn: &Connection,
    sample_type: &str,
) -> Result<Option<FlowConfiguration>, DatabaseError> {
    find_one(conn, "sample_type = ?1 AND is_system = 1", &sample_type)
}

/// Lists the configurations of a sample type, system rows last.
pub fn list_for_sample_type(
    conn: &Connection,
    sample_type: &str,
) -> Result<Vec<FlowConfiguration>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM flow_configurations WHERE sample_type = ?1
         ORDER BY is_system, is_default DESC, name, id",
        COLUMNS
    ))?;
    let mut configs = stmt
        .query_map(params![sample_type], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for config in &mut configs {
        config.steps = steps(conn, config.id)?;
    }
    Ok(configs)
}

pub fn update_fields(
    conn: &Connection,
    id: FlowConfigurationId,
    name: &str,
    description: Option<&str>,
    is_active: bool,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE flow_configurations SET name = ?2, description = ?3, is_active = ?4,
         is_default = CASE WHEN ?4 THEN is_default ELSE 0 END, updated_at = ?5
         WHERE id = ?1",
        params![id, name, description, is_active, format_timestamp(now)],
    )?;
    Ok(())
}

/// Marks `id` as the only default of its sample type.
pub fn set_default(
    conn: &Connection,
    id: FlowConfigurationId,
    sample_type: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let now = format_timestamp(now);
    conn.execute(
        "UPDATE flow_configurations SET is_default = 0, updated_at = ?3
         WHERE sample_type = ?2 AND is_default = 1 AND id != ?1",
        params![id, sample_type, now],
    )?;
    conn.execute(
        "UPDATE flow_configurations SET is_default = 1, is_active = 1, updated_at = ?2
         WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

/// Number of jobs pinned to a configuration.
pub fn count_jobs_using(conn: &Connection, id: FlowConfigurationId) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE flow_configuration_id = ?1",
        params![id],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Number of pinned jobs that are not rejected or approved.
pub fn count_open_jobs_using(
    conn: &Connection,
    id: FlowConfigurationId,
) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs
         WHERE flow_configuration_id = ?1 AND status NOT IN ('rejected', 'approved')",
        params![id],
        |r| r.get(0),
    )?;
    Ok(count)
}

pub fn delete(conn: &Connection, id: FlowConfigurationId) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM flow_steps WHERE flow_configuration_id = ?1",
        params![id],
    )?;
    conn.execute("DELETE FROM flow_configurations WHERE id = ?1", params![id])?;
    Ok(())
}
