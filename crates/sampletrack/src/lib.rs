pub mod app;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod notify;
pub mod workflow;

pub use app::App;
pub use broadcast::{WorkflowEvent, WorkflowEventBroadcaster};
pub use config::{load_config, Config};
pub use db::delay_repo::DelayFilter;
pub use db::job_repo::JobFilter;
pub use db::Database;
pub use error::{ConfigError, ErrorKind, LoggingError, Result, WorkflowError};
pub use notify::{NoopNotifier, Notifier, NotifyError, TracingNotifier};
pub use workflow::model::{
    Actor, AssignmentStatus, DelayCategory, JobStatus, Priority, TaskStatus,
};
pub use workflow::{
    ExternalDelayTracker, FlowConfigurationResolver, FlowConfigurationService,
    LeadTimeCalculator, ProgressCatalog, WorkflowEngine,
};
