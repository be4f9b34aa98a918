//! Flow resolution.
//!
//! Every ordering question the engine asks ("which steps does this job run",
//! "what comes after this step") goes through [`resolve`]. Configured flows and
//! the built-in per-sample-type flows are both rows in `flow_configurations`,
//! so there is exactly one code path.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::{catalog_repo, flow_repo, Database};
use crate::error::{Result, WorkflowError};
use crate::workflow::model::{FlowConfiguration, FlowConfigurationId, Job, ProgressStep, StepId};

/// Where a resolved ordering came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FlowSource {
    Configured(FlowConfigurationId),
    SystemDefault(FlowConfigurationId),
}

impl FlowSource {
    pub fn configuration_id(&self) -> FlowConfigurationId {
        match self {
            FlowSource::Configured(id) | FlowSource::SystemDefault(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedStep {
    pub step: ProgressStep,
    pub is_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedFlow {
    pub source: FlowSource,
    pub steps: Vec<ResolvedStep>,
}

impl ResolvedFlow {
    /// Index of a step in resolved order.
    pub fn position_of(&self, step_id: StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.step.id == step_id)
    }

    pub fn contains(&self, step_id: StepId) -> bool {
        self.position_of(step_id).is_some()
    }

    pub fn get(&self, step_id: StepId) -> Option<&ResolvedStep> {
        self.steps.iter().find(|s| s.step.id == step_id)
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.step.id).collect()
    }

    pub fn required(&self) -> impl Iterator<Item = &ResolvedStep> {
        self.steps.iter().filter(|s| s.is_required)
    }
}

#[derive(Clone)]
pub struct FlowConfigurationResolver {
    db: Database,
}

impl FlowConfigurationResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn resolve(&self, job: &Job) -> Result<ResolvedFlow> {
        self.db.with_conn(|conn| resolve(conn, job))
    }

    /// Resolves the default (or system) flow without a job.
    pub fn resolve_for_sample_type(&self, sample_type: &str) -> Result<ResolvedFlow> {
        self.db
            .with_conn(|conn| resolve_for(conn, sample_type, None))
    }
}

pub(crate) fn resolve(conn: &Connection, job: &Job) -> Result<ResolvedFlow> {
    resolve_for(conn, &job.sample_type, job.flow_configuration_id)
}

/// Explicit configuration, then the user default, then the system row.
pub(crate) fn resolve_for(
    conn: &Connection,
    sample_type: &str,
    flow_configuration_id: Option<FlowConfigurationId>,
) -> Result<ResolvedFlow> {
    let config = match flow_configuration_id {
        Some(id) => flow_repo::find_by_id(conn, id)?
            .ok_or_else(|| WorkflowError::not_found("flow configuration", id))?,
        None => match flow_repo::find_default(conn, sample_type)? {
            Some(config) => config,
            None => flow_repo::find_system(conn, sample_type)?
                .ok_or_else(|| WorkflowError::not_found("flow for sample type", sample_type))?,
        },
    };
    expand(conn, sample_type, config)
}

fn expand(conn: &Connection, sample_type: &str, config: FlowConfiguration) -> Result<ResolvedFlow> {
    if config.sample_type != sample_type {
        return Err(WorkflowError::InvalidConfiguration(format!(
            "configuration {} is for sample type '{}', not '{}'",
            config.id, config.sample_type, sample_type
        )));
    }
    if config.steps.is_empty() {
        return Err(WorkflowError::InvalidConfiguration(format!(
            "configuration {} has no steps",
            config.id
        )));
    }

    let mut steps = Vec::with_capacity(config.steps.len());
    for flow_step in &config.steps {
        let step = catalog_repo::find_step(conn, flow_step.progress_step_id)?.ok_or_else(|| {
            WorkflowError::InvalidConfiguration(format!(
                "configuration {} references unknown step {}",
                config.id, flow_step.progress_step_id
            ))
        })?;
        if step.sample_type != sample_type {
            return Err(WorkflowError::InvalidConfiguration(format!(
                "step '{}' belongs to sample type '{}'",
                step.name, step.sample_type
            )));
        }
        steps.push(ResolvedStep {
            step,
            is_required: config.is_system || flow_step.is_required,
        });
    }

    let source = if config.is_system {
        FlowSource::SystemDefault(config.id)
    } else {
        FlowSource::Configured(config.id)
    };
    Ok(ResolvedFlow { source, steps })
}
