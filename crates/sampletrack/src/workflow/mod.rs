//! The sample-development workflow: catalog, flow resolution, the job state
//! machine, external delay tracking and lead time metrics.

pub mod catalog;
pub mod delay;
pub mod engine;
pub mod flow_config;
pub mod lead_time;
pub mod model;
pub mod resolver;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use catalog::ProgressCatalog;
pub use delay::{DelayRecordList, ExternalDelayTracker};
pub use engine::{
    AssignmentChange, AssignmentDetail, AssignmentInput, JobDetail, JobListResponse, JobPatch,
    JobSummary, NewJob, TaskDetail, ToggleOutcome, WorkflowEngine,
};
pub use flow_config::{FlowConfigurationPatch, FlowConfigurationService, NewFlowConfiguration};
pub use lead_time::{LeadTimeCalculator, LeadTimeMetrics};
pub use resolver::{FlowConfigurationResolver, FlowSource, ResolvedFlow, ResolvedStep};

/// Source of "now" for every timestamp the workflow writes.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
