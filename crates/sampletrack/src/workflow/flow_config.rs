//! Management of user-defined flow configurations.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::db::{catalog_repo, flow_repo, Database};
use crate::error::{Result, WorkflowError};
use crate::workflow::model::{FlowConfiguration, FlowConfigurationId, FlowStepSpec};
use crate::workflow::{system_clock, Clock};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFlowConfiguration {
    pub name: String,
    pub sample_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    pub steps: Vec<FlowStepSpec>,
}

fn default_active() -> bool {
    true
}

/// Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfigurationPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub steps: Option<Vec<FlowStepSpec>>,
}

#[derive(Clone)]
pub struct FlowConfigurationService {
    db: Database,
    clock: Clock,
}

impl FlowConfigurationService {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Configurations of one sample type, or of every sample type.
    pub fn list(&self, sample_type: Option<&str>) -> Result<Vec<FlowConfiguration>> {
        self.db.with_conn(|conn| {
            let sample_types = match sample_type {
                Some(st) => vec![st.to_string()],
                None => catalog_repo::sample_types(conn)?,
            };
            let mut configs = Vec::new();
            for st in &sample_types {
                configs.extend(flow_repo::list_for_sample_type(conn, st)?);
            }
            Ok(configs)
        })
    }

    pub fn get(&self, id: FlowConfigurationId) -> Result<FlowConfiguration> {
        self.db.with_conn(|conn| load(conn, id))
    }

    pub fn create(&self, input: NewFlowConfiguration) -> Result<FlowConfiguration> {
        let _span = info_span!("flow_config.create", sample_type = %input.sample_type).entered();
        let now = (self.clock)();
        let config = self.db.transaction(|tx| {
            validate_name(&input.name)?;
            validate_steps(tx, &input.sample_type, &input.steps)?;

            let id = flow_repo::insert(
                tx,
                &flow_repo::NewFlowRow {
                    name: input.name.trim(),
                    sample_type: &input.sample_type,
                    description: input.description.as_deref(),
                    is_active: input.is_active,
                },
                now,
            )?;
            flow_repo::replace_steps(tx, id, &input.steps)?;
            if input.is_default {
                flow_repo::set_default(tx, id, &input.sample_type, now)?;
            }
            load(tx, id)
        })?;
        info!(id = config.id, name = %config.name, "Flow configuration created");
        Ok(config)
    }

    /// Steps cannot change while a running job is pinned to the
    /// configuration.
    pub fn update(
        &self,
        id: FlowConfigurationId,
        patch: FlowConfigurationPatch,
    ) -> Result<FlowConfiguration> {
        let _span = info_span!("flow_config.update", id).entered();
        let now = (self.clock)();
        self.db.transaction(|tx| {
            let current = load_editable(tx, id)?;

            let name = patch.name.as_deref().unwrap_or(&current.name);
            validate_name(name)?;
            if let Some(steps) = &patch.steps {
                validate_steps(tx, &current.sample_type, steps)?;
                let running = flow_repo::count_open_jobs_using(tx, id)?;
                if running > 0 {
                    return Err(WorkflowError::Conflict(format!(
                        "flow configuration {} has {} running job(s); its steps cannot change",
                        id, running
                    )));
                }
            }

            let description = patch
                .description
                .as_deref()
                .or(current.description.as_deref());
            let is_active = patch.is_active.unwrap_or(current.is_active);
            flow_repo::update_fields(tx, id, name.trim(), description, is_active, now)?;
            if let Some(steps) = &patch.steps {
                flow_repo::replace_steps(tx, id, steps)?;
            }
            load(tx, id)
        })
    }

    /// Fails with `Conflict` while any job is pinned to the configuration.
    pub fn delete(&self, id: FlowConfigurationId) -> Result<()> {
        let _span = info_span!("flow_config.delete", id).entered();
        self.db.transaction(|tx| {
            load_editable(tx, id)?;
            let in_use = flow_repo::count_jobs_using(tx, id)?;
            if in_use > 0 {
                return Err(WorkflowError::Conflict(format!(
                    "flow configuration {} is used by {} job(s)",
                    id, in_use
                )));
            }
            flow_repo::delete(tx, id)?;
            Ok(())
        })?;
        info!(id, "Flow configuration deleted");
        Ok(())
    }

    /// Makes `id` the only default of its sample type. Activates it if needed.
    pub fn set_default(&self, id: FlowConfigurationId) -> Result<FlowConfiguration> {
        let _span = info_span!("flow_config.set_default", id).entered();
        let now = (self.clock)();
        self.db.transaction(|tx| {
            let current = load_editable(tx, id)?;
            flow_repo::set_default(tx, id, &current.sample_type, now)?;
            load(tx, id)
        })
    }
}

fn load(conn: &Connection, id: FlowConfigurationId) -> Result<FlowConfiguration> {
    flow_repo::find_by_id(conn, id)?.ok_or_else(|| WorkflowError::not_found("flow configuration", id))
}

/// Loads a configuration that is not a system row.
fn load_editable(conn: &Connection, id: FlowConfigurationId) -> Result<FlowConfiguration> {
    let config = load(conn, id)?;
    if config.is_system {
        return Err(WorkflowError::Validation(format!(
            "flow configuration {} is a system default and cannot be changed",
            id
        )));
    }
    Ok(config)
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "flow configuration name is required".to_string(),
        ));
    }
    Ok(())
}

fn validate_steps(conn: &Connection, sample_type: &str, steps: &[FlowStepSpec]) -> Result<()> {
    if catalog_repo::steps_for_sample_type(conn, sample_type)?.is_empty() {
        return Err(WorkflowError::not_found("sample type", sample_type));
    }
    if steps.is_empty() {
        return Err(WorkflowError::Validation(
            "a flow configuration needs at least one step".to_string(),
        ));
    }

    let mut orders = HashSet::new();
    let mut step_ids = HashSet::new();
    for spec in steps {
        if spec.step_order < 1 {
            return Err(WorkflowError::Validation(format!(
                "step order must be positive, got {}",
                spec.step_order
            )));
        }
        if !orders.insert(spec.step_order) {
            return Err(WorkflowError::Validation(format!(
                "step order {} is used more than once",
                spec.step_order
            )));
        }
        if !step_ids.insert(spec.progress_step_id) {
            return Err(WorkflowError::Validation(format!(
                "step {} is listed more than once",
                spec.progress_step_id
            )));
        }
        let step = catalog_repo::find_step(conn, spec.progress_step_id)?
            .ok_or_else(|| WorkflowError::not_found("progress step", spec.progress_step_id))?;
        if step.sample_type != sample_type {
            return Err(WorkflowError::InvalidConfiguration(format!(
                "step '{}' belongs to sample type '{}', not '{}'",
                step.name, step.sample_type, sample_type
            )));
        }
    }
    Ok(())
}
