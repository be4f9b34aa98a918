//! Builder patterns for creating test data programmatically.
//!
//! Steps and tasks are picked by catalog name so tests read like the shop
//! floor describes a job.

#![allow(dead_code)]

use sampletrack::workflow::model::{
    FlowConfigurationId, FlowStepSpec, Priority, ProgressStep, UserId,
};
use sampletrack::workflow::{AssignmentInput, NewFlowConfiguration, NewJob, WorkflowEngine};

/// First PIC id handed out by [`JobBuilder`]; each step gets the next one.
pub const FIRST_PIC: UserId = 100;

pub const ADMIN: UserId = 1;

/// Builder for creating `NewJob` instances against the seeded catalog.
pub struct JobBuilder {
    catalog: Vec<ProgressStep>,
    sample_type: String,
    title: String,
    priority: Priority,
    flow_configuration_id: Option<FlowConfigurationId>,
    entries: Vec<AssignmentInput>,
}

impl JobBuilder {
    /// A job that assigns every catalog step, in catalog order, with all of
    /// its tasks.
    pub fn new(engine: &WorkflowEngine, sample_type: &str) -> Self {
        let catalog = engine
            .catalog()
            .steps_for(sample_type)
            .expect("Unknown sample type");
        let entries = catalog
            .iter()
            .enumerate()
            .map(|(i, step)| AssignmentInput {
                progress_step_id: step.id,
                pic_id: FIRST_PIC + i as UserId,
                task_ids: step.tasks.iter().map(|t| t.id).collect(),
            })
            .collect();
        Self {
            catalog,
            sample_type: sample_type.to_string(),
            title: format!("{} sample", sample_type),
            priority: Priority::Normal,
            flow_configuration_id: None,
            entries,
        }
    }

    pub fn step(&self, name: &str) -> &ProgressStep {
        self.catalog
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("No step named '{}'", name))
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn flow_configuration(mut self, id: FlowConfigurationId) -> Self {
        self.flow_configuration_id = Some(id);
        self
    }

    /// Keeps only the named steps, in the given order.
    pub fn only_steps(mut self, names: &[&str]) -> Self {
        let ids: Vec<_> = names.iter().map(|n| self.step(n).id).collect();
        self.entries = ids
            .iter()
            .map(|id| {
                self.entries
                    .iter()
                    .find(|e| e.progress_step_id == *id)
                    .cloned()
                    .expect("Step not in job")
            })
            .collect();
        self
    }

    /// Tracks only the first `count` tasks of every step.
    pub fn tasks_per_step(mut self, count: usize) -> Self {
        for entry in &mut self.entries {
            entry.task_ids.truncate(count);
        }
        self
    }

    pub fn pic(mut self, step: &str, pic_id: UserId) -> Self {
        let id = self.step(step).id;
        for entry in &mut self.entries {
            if entry.progress_step_id == id {
                entry.pic_id = pic_id;
            }
        }
        self
    }

    pub fn build(self) -> NewJob {
        NewJob {
            sample_type: self.sample_type,
            title: self.title,
            customer: Some("Northwind Foods".to_string()),
            priority: self.priority,
            deadline: None,
            flow_configuration_id: self.flow_configuration_id,
            notes: None,
            assignments: self.entries,
        }
    }
}

/// Builder for creating `NewFlowConfiguration` instances.
pub struct FlowBuilder {
    catalog: Vec<ProgressStep>,
    input: NewFlowConfiguration,
}

impl FlowBuilder {
    pub fn new(engine: &WorkflowEngine, name: &str, sample_type: &str) -> Self {
        let catalog = engine
            .catalog()
            .steps_for(sample_type)
            .expect("Unknown sample type");
        Self {
            catalog,
            input: NewFlowConfiguration {
                name: name.to_string(),
                sample_type: sample_type.to_string(),
                description: None,
                is_active: true,
                is_default: false,
                steps: vec![],
            },
        }
    }

    /// Appends a catalog step by name.
    pub fn step(mut self, name: &str, required: bool) -> Self {
        let step = self
            .catalog
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("No step named '{}'", name));
        let order = self.input.steps.len() as i64 + 1;
        self.input.steps.push(FlowStepSpec {
            progress_step_id: step.id,
            is_required: required,
            step_order: order,
        });
        self
    }

    pub fn as_default(mut self) -> Self {
        self.input.is_default = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.input.is_active = false;
        self
    }

    pub fn build(self) -> NewFlowConfiguration {
        self.input
    }
}
