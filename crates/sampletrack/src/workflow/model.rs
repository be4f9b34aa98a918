//! Domain types for the sample-development workflow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type JobId = i64;
pub type StepId = i64;
pub type TaskId = i64;
pub type FlowConfigurationId = i64;
pub type AssignmentId = i64;
pub type TaskAssignmentId = i64;
pub type DelayRecordId = i64;
pub type UserId = i64;

/// A stored enum value that does not name any known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a snake_case string enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $text:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)*
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Lifecycle status of a job.
    JobStatus, "job status" {
        InProgress => "in_progress",
        Completed => "completed",
        Rejected => "rejected",
        Approved => "approved",
    }
}

impl JobStatus {
    /// Rejected and approved jobs no longer follow task completion.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Rejected | JobStatus::Approved)
    }
}

string_enum! {
    /// Status of one progress step within a job.
    AssignmentStatus, "assignment status" {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Blocked => "blocked",
    }
}

string_enum! {
    /// Status of one checklist item.
    TaskStatus, "task status" {
        Pending => "pending",
        Completed => "completed",
    }
}

string_enum! {
    Priority, "priority" {
        Low => "low",
        Normal => "normal",
        High => "high",
        Urgent => "urgent",
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

string_enum! {
    /// Who or what a job was waiting on between two steps.
    DelayCategory, "delay category" {
        CustomerApproval => "customer_approval",
        MaterialSupply => "material_supply",
        ExternalVendor => "external_vendor",
        Logistics => "logistics",
        Other => "other",
    }
}

/// The caller on whose behalf an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    #[serde(default)]
    pub admin: bool,
}

impl Actor {
    pub fn user(id: UserId) -> Self {
        Self { id, admin: false }
    }

    pub fn admin(id: UserId) -> Self {
        Self { id, admin: true }
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub sample_type: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    pub priority: Priority,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_configuration_id: Option<FlowConfigurationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Catalog entry: one named phase of a sample type's workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    pub id: StepId,
    pub sample_type: String,
    pub name: String,
    pub order_hint: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_planned_hours: Option<f64>,
    #[serde(default)]
    pub tasks: Vec<ProgressTask>,
}

impl ProgressStep {
    pub fn has_task(&self, task_id: TaskId) -> bool {
        self.tasks.iter().any(|t| t.id == task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressTask {
    pub id: TaskId,
    pub progress_step_id: StepId,
    pub name: String,
    pub task_order: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfiguration {
    pub id: FlowConfigurationId,
    pub name: String,
    pub sample_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_default: bool,
    pub is_active: bool,
    /// Built-in ordering used when no configuration applies.
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered by `step_order`.
    #[serde(default)]
    pub steps: Vec<FlowStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStep {
    pub id: i64,
    pub progress_step_id: StepId,
    pub is_required: bool,
    pub step_order: i64,
}

/// Input shape for one step of a flow configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStepSpec {
    pub progress_step_id: StepId,
    #[serde(default = "default_required")]
    pub is_required: bool,
    pub step_order: i64,
}

fn default_required() -> bool {
    true
}

/// Binds a job to one progress step and its PIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressAssignment {
    pub id: AssignmentId,
    pub job_id: JobId,
    pub progress_step_id: StepId,
    pub pic_id: UserId,
    pub status: AssignmentStatus,
    /// Position in the client-supplied list.
    pub position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub id: TaskAssignmentId,
    pub progress_assignment_id: AssignmentId,
    pub progress_task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A window during which a job waited on a party outside the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDelayRecord {
    pub id: DelayRecordId,
    pub job_id: JobId,
    pub last_progress_assignment_id: AssignmentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_progress_assignment_id: Option<AssignmentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<DelayCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub external_wait_start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_wait_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_hours: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ExternalDelayRecord {
    pub fn is_completed(&self) -> bool {
        self.external_wait_end.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadTimeRecord {
    pub progress_assignment_id: AssignmentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efficiency_pct: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Rounds to two decimal places.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Fractional hours between two instants.
pub(crate) fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 3_600_000.0
}
