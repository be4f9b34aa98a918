//! Read-only registry of progress steps and tasks per sample type.

use rusqlite::Connection;

use crate::db::{catalog_repo, Database};
use crate::error::{Result, WorkflowError};
use crate::workflow::model::{ProgressStep, StepId};

#[derive(Clone)]
pub struct ProgressCatalog {
    db: Database,
}

impl ProgressCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn sample_types(&self) -> Result<Vec<String>> {
        self.db
            .with_conn(|conn| Ok(catalog_repo::sample_types(conn)?))
    }

    /// Steps of a sample type in catalog order, each with its ordered tasks.
    pub fn steps_for(&self, sample_type: &str) -> Result<Vec<ProgressStep>> {
        self.db.with_conn(|conn| steps_for(conn, sample_type))
    }

    pub fn step(&self, id: StepId) -> Result<ProgressStep> {
        self.db.with_conn(|conn| step(conn, id))
    }
}

pub(crate) fn steps_for(conn: &Connection, sample_type: &str) -> Result<Vec<ProgressStep>> {
    let steps = catalog_repo::steps_for_sample_type(conn, sample_type)?;
    if steps.is_empty() {
        return Err(WorkflowError::not_found("sample type", sample_type));
    }
    Ok(steps)
}

pub(crate) fn step(conn: &Connection, id: StepId) -> Result<ProgressStep> {
    catalog_repo::find_step(conn, id)?.ok_or_else(|| WorkflowError::not_found("progress step", id))
}
