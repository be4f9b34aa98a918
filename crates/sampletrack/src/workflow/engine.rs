//! The job state machine.
//!
//! Every mutating operation runs in one `IMMEDIATE` transaction and ends by
//! reconciling the job from fresh task counts, so the
//! "read task statuses, write assignment/job status" section is serialized
//! per database. Notifications raised inside the transaction are dispatched
//! after it commits.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::db::assignment_repo::{self, TaskCounts};
use crate::db::job_repo::{self, JobFilter};
use crate::db::{delay_repo, flow_repo, lead_time_repo, Database};
use crate::error::{Result, WorkflowError};
use crate::notify::{Notification, Notifier, Outbox};
use crate::workflow::delay::{self, ExternalDelayTracker};
use crate::workflow::flow_config::FlowConfigurationService;
use crate::workflow::lead_time;
use crate::workflow::model::{
    round2, Actor, AssignmentId, AssignmentStatus, FlowConfigurationId, Job, JobId, JobStatus,
    LeadTimeRecord, Priority, ProgressAssignment, ProgressStep, StepId, TaskAssignment,
    TaskAssignmentId, TaskId, TaskStatus, UserId,
};
use crate::workflow::resolver::{self, FlowConfigurationResolver, FlowSource, ResolvedFlow};
use crate::workflow::{catalog, system_clock, Clock, ProgressCatalog};

/// One client-supplied entry: a step, its PIC, and the tasks to track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentInput {
    pub progress_step_id: StepId,
    pub pic_id: UserId,
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub sample_type: String,
    pub title: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flow_configuration_id: Option<FlowConfigurationId>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Authoritative order of the job's assignments.
    pub assignments: Vec<AssignmentInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "op",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum AssignmentChange {
    /// Adds a pending assignment.
    Add(AssignmentInput),
    /// Reassigns the PIC; task changes are allowed only while pending.
    Update {
        assignment_id: AssignmentId,
        #[serde(default)]
        pic_id: Option<UserId>,
        #[serde(default)]
        task_ids: Option<Vec<TaskId>>,
    },
    /// Removes a pending assignment.
    Remove { assignment_id: AssignmentId },
}

/// Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    pub title: Option<String>,
    pub customer: Option<String>,
    pub priority: Option<Priority>,
    pub deadline: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    #[serde(default)]
    pub assignments: Vec<AssignmentChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleOutcome {
    pub task_assignment_id: TaskAssignmentId,
    pub task_status: TaskStatus,
    pub assignment_id: AssignmentId,
    pub assignment_status: AssignmentStatus,
    pub job_status: JobStatus,
    pub completion_percentage: f64,
    /// Set when this toggle handed work to the next assignment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_assignment_id: Option<AssignmentId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: TaskAssignment,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentDetail {
    #[serde(flatten)]
    pub assignment: ProgressAssignment,
    pub step_name: String,
    pub is_required: bool,
    pub tasks: Vec<TaskDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_time: Option<LeadTimeRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub flow_source: FlowSource,
    pub completion_percentage: f64,
    /// First in-progress assignment in resolved order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_assignment_id: Option<AssignmentId>,
    pub assignments: Vec<AssignmentDetail>,
}

impl JobDetail {
    pub fn assignment_for_step(&self, step_id: StepId) -> Option<&AssignmentDetail> {
        self.assignments
            .iter()
            .find(|a| a.assignment.progress_step_id == step_id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    #[serde(flatten)]
    pub job: Job,
    pub completion_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
    pub total: u64,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    db: Database,
    notifier: Arc<dyn Notifier>,
    clock: Clock,
}

impl WorkflowEngine {
    pub fn new(db: Database, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            db,
            notifier,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn catalog(&self) -> ProgressCatalog {
        ProgressCatalog::new(self.db.clone())
    }

    pub fn resolver(&self) -> FlowConfigurationResolver {
        FlowConfigurationResolver::new(self.db.clone())
    }

    pub fn flow_configurations(&self) -> FlowConfigurationService {
        FlowConfigurationService::new(self.db.clone()).with_clock(Arc::clone(&self.clock))
    }

    pub fn delay_tracker(&self) -> ExternalDelayTracker {
        ExternalDelayTracker::new(self.db.clone()).with_clock(Arc::clone(&self.clock))
    }

    /// Runs `f` in a transaction, then dispatches what it queued.
    fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, DateTime<Utc>, &mut Outbox) -> Result<T>,
    {
        let now = (self.clock)();
        let mut outbox = Outbox::default();
        let value = self.db.transaction(|tx| {
            let conn: &Connection = tx;
            f(conn, now, &mut outbox)
        })?;
        if !outbox.is_empty() {
            debug!(count = outbox.len(), "Dispatching notifications");
        }
        outbox.dispatch(self.notifier.as_ref());
        Ok(value)
    }

    /// Creates a job and its assignments from a validated client list.
    ///
    /// The first assignment starts `in_progress`, the rest are `pending`.
    pub fn create_job(&self, input: NewJob) -> Result<JobDetail> {
        let _span = info_span!("create_job", sample_type = %input.sample_type).entered();
        let detail = self.run(|conn, now, outbox| {
            if input.title.trim().is_empty() {
                return Err(WorkflowError::Validation("job title is required".to_string()));
            }
            catalog::steps_for(conn, &input.sample_type)?;
            if let Some(id) = input.flow_configuration_id {
                let config = flow_repo::find_by_id(conn, id)?
                    .ok_or_else(|| WorkflowError::not_found("flow configuration", id))?;
                if !config.is_active {
                    return Err(WorkflowError::Validation(format!(
                        "flow configuration {} is inactive",
                        id
                    )));
                }
            }
            let flow = resolver::resolve_for(conn, &input.sample_type, input.flow_configuration_id)?;

            let entries: Vec<PlannedEntry<'_>> = input
                .assignments
                .iter()
                .map(|a| PlannedEntry {
                    step_id: a.progress_step_id,
                    task_ids: Some(&a.task_ids),
                })
                .collect();
            let steps = validate_assignment_set(conn, &flow, &entries, true)?;

            let job_id = job_repo::insert(
                conn,
                &job_repo::NewJobRow {
                    sample_type: &input.sample_type,
                    title: input.title.trim(),
                    customer: input.customer.as_deref(),
                    priority: input.priority,
                    flow_configuration_id: Some(flow.source.configuration_id()),
                    notes: input.notes.as_deref(),
                    deadline: input.deadline,
                },
                now,
            )?;

            for (position, (entry, step)) in input.assignments.iter().zip(&steps).enumerate() {
                let (status, started_at) = if position == 0 {
                    (AssignmentStatus::InProgress, Some(now))
                } else {
                    (AssignmentStatus::Pending, None)
                };
                insert_assignment_with_tasks(
                    conn,
                    job_id,
                    step,
                    entry,
                    status,
                    position as i64,
                    started_at,
                    now,
                )?;
            }

            let job = load_job(conn, job_id)?;
            reconcile_job_in(conn, job, now, outbox)?;
            load_detail(conn, job_id)
        })?;
        info!(
            job_id = detail.job.id,
            assignments = detail.assignments.len(),
            "Job created"
        );
        Ok(detail)
    }

    pub fn get_job(&self, job_id: JobId) -> Result<JobDetail> {
        self.db.with_conn(|conn| load_detail(conn, job_id))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<JobListResponse> {
        self.db.with_conn(|conn| {
            let (jobs, total) = job_repo::query(conn, filter)?;
            let mut summaries = Vec::with_capacity(jobs.len());
            for job in jobs {
                let counts = assignment_repo::task_counts_for_job(conn, job.id)?;
                summaries.push(JobSummary {
                    job,
                    completion_percentage: completion_percentage(counts),
                });
            }
            Ok(JobListResponse {
                jobs: summaries,
                total,
            })
        })
    }

    /// Flips one task between pending and completed and reconciles upward.
    pub fn toggle_task(
        &self,
        task_assignment_id: TaskAssignmentId,
        actor: Actor,
    ) -> Result<ToggleOutcome> {
        let _span = info_span!("toggle_task", task_assignment_id, actor = actor.id).entered();
        self.run(|conn, now, outbox| {
            let task = assignment_repo::find_task(conn, task_assignment_id)?
                .ok_or_else(|| WorkflowError::not_found("task assignment", task_assignment_id))?;
            let assignment = load_assignment(conn, task.progress_assignment_id)?;
            if assignment.pic_id != actor.id && !actor.is_admin() {
                return Err(WorkflowError::Forbidden(format!(
                    "user {} is not the PIC of assignment {}",
                    actor.id, assignment.id
                )));
            }
            let job = load_job(conn, assignment.job_id)?;
            if job.status.is_terminal() {
                return Err(WorkflowError::InvalidState(format!(
                    "job {} is {}",
                    job.id, job.status
                )));
            }
            if assignment.status == AssignmentStatus::Blocked {
                return Err(WorkflowError::InvalidState(format!(
                    "assignment {} is blocked",
                    assignment.id
                )));
            }
            let flow = resolver::resolve(conn, &job)?;
            if !flow.contains(assignment.progress_step_id) {
                return Err(WorkflowError::InvalidState(format!(
                    "step {} of assignment {} is not part of the job's flow",
                    assignment.progress_step_id, assignment.id
                )));
            }

            let task_status = match task.status {
                TaskStatus::Pending => {
                    assignment_repo::complete_task(conn, task.id, now, actor.id)?;
                    delay::on_task_checked(conn, assignment.id, now)?;
                    TaskStatus::Completed
                }
                TaskStatus::Completed => {
                    assignment_repo::reopen_task(conn, task.id)?;
                    TaskStatus::Pending
                }
            };
            debug!(task = task.id, status = %task_status, "Task toggled");

            let (assignment, activated) =
                reconcile_assignment(conn, &job, &flow, assignment, now, outbox)?;
            let (job, completion_percentage) = reconcile_job_in(conn, job, now, outbox)?;

            Ok(ToggleOutcome {
                task_assignment_id: task.id,
                task_status,
                assignment_id: assignment.id,
                assignment_status: assignment.status,
                job_status: job.status,
                completion_percentage,
                activated_assignment_id: activated.map(|a| a.id),
            })
        })
    }

    /// Sets or clears the free-text note on a task. Same permissions as
    /// [`toggle_task`](Self::toggle_task); the task status is untouched.
    pub fn set_task_notes(
        &self,
        task_assignment_id: TaskAssignmentId,
        actor: Actor,
        notes: Option<&str>,
    ) -> Result<TaskAssignment> {
        let _span = info_span!("set_task_notes", task_assignment_id, actor = actor.id).entered();
        self.run(|conn, _, _| {
            let task = assignment_repo::find_task(conn, task_assignment_id)?
                .ok_or_else(|| WorkflowError::not_found("task assignment", task_assignment_id))?;
            let assignment = load_assignment(conn, task.progress_assignment_id)?;
            if assignment.pic_id != actor.id && !actor.is_admin() {
                return Err(WorkflowError::Forbidden(format!(
                    "user {} is not the PIC of assignment {}",
                    actor.id, assignment.id
                )));
            }
            let job = load_job(conn, assignment.job_id)?;
            if job.status.is_terminal() {
                return Err(WorkflowError::InvalidState(format!(
                    "job {} is {}",
                    job.id, job.status
                )));
            }
            let notes = notes.map(str::trim).filter(|n| !n.is_empty());
            assignment_repo::set_task_notes(conn, task.id, notes)?;
            assignment_repo::find_task(conn, task.id)?
                .ok_or_else(|| WorkflowError::not_found("task assignment", task.id))
        })
    }

    /// Brings the job status in line with its task counts. Idempotent.
    pub fn reconcile_job(&self, job_id: JobId) -> Result<JobSummary> {
        let _span = info_span!("reconcile_job", job_id).entered();
        self.run(|conn, now, outbox| {
            let job = load_job(conn, job_id)?;
            let (job, completion_percentage) = reconcile_job_in(conn, job, now, outbox)?;
            Ok(JobSummary {
                job,
                completion_percentage,
            })
        })
    }

    /// The pending assignment that follows `assignment_id` in resolved order.
    pub fn get_next_assignment(
        &self,
        assignment_id: AssignmentId,
    ) -> Result<Option<ProgressAssignment>> {
        self.db.with_conn(|conn| {
            let (assignment, flow) = assignment_in_flow(conn, assignment_id)?;
            next_assignment_in(conn, &flow, &assignment)
        })
    }

    /// True when [`get_next_assignment`](Self::get_next_assignment) has
    /// nothing to hand work to.
    pub fn is_final_step(&self, assignment_id: AssignmentId) -> Result<bool> {
        Ok(self.get_next_assignment(assignment_id)?.is_none())
    }

    /// Edits job fields and the assignment set.
    ///
    /// Only pending assignments may be added, removed, or have their tasks
    /// replaced. Started assignments accept PIC reassignment only.
    pub fn update_job(&self, job_id: JobId, patch: JobPatch) -> Result<JobDetail> {
        let _span = info_span!("update_job", job_id).entered();
        self.run(|conn, now, outbox| {
            let mut job = load_job(conn, job_id)?;
            if job.status.is_terminal() {
                return Err(WorkflowError::InvalidState(format!(
                    "job {} is {}",
                    job.id, job.status
                )));
            }
            if let Some(title) = &patch.title {
                if title.trim().is_empty() {
                    return Err(WorkflowError::Validation("job title is required".to_string()));
                }
            }
            let flow = resolver::resolve(conn, &job)?;
            let existing = assignment_repo::assignments_for_job(conn, job_id)?;

            let mut touched = HashSet::new();
            let mut removed = HashSet::new();
            let mut updates: Vec<(&ProgressAssignment, Option<UserId>, Option<&[TaskId]>)> =
                Vec::new();
            let mut additions: Vec<&AssignmentInput> = Vec::new();
            for change in &patch.assignments {
                match change {
                    AssignmentChange::Add(input) => additions.push(input),
                    AssignmentChange::Update {
                        assignment_id,
                        pic_id,
                        task_ids,
                    } => {
                        let current = find_in(&existing, *assignment_id)?;
                        if !touched.insert(current.id) {
                            return Err(duplicate_change(current.id));
                        }
                        if task_ids.is_some() && current.status != AssignmentStatus::Pending {
                            return Err(WorkflowError::InvalidState(format!(
                                "tasks of {} assignment {} cannot change",
                                current.status, current.id
                            )));
                        }
                        updates.push((current, *pic_id, task_ids.as_deref()));
                    }
                    AssignmentChange::Remove { assignment_id } => {
                        let current = find_in(&existing, *assignment_id)?;
                        if !touched.insert(current.id) {
                            return Err(duplicate_change(current.id));
                        }
                        if current.status != AssignmentStatus::Pending {
                            return Err(WorkflowError::InvalidState(format!(
                                "{} assignment {} cannot be removed",
                                current.status, current.id
                            )));
                        }
                        removed.insert(current.id);
                    }
                }
            }

            let mut entries: Vec<PlannedEntry<'_>> = existing
                .iter()
                .filter(|a| !removed.contains(&a.id))
                .map(|a| PlannedEntry {
                    step_id: a.progress_step_id,
                    task_ids: updates
                        .iter()
                        .find(|(u, _, _)| u.id == a.id)
                        .and_then(|(_, _, tasks)| *tasks),
                })
                .collect();
            entries.extend(additions.iter().map(|a| PlannedEntry {
                step_id: a.progress_step_id,
                task_ids: Some(&a.task_ids),
            }));
            validate_assignment_set(conn, &flow, &entries, false)?;

            for id in &removed {
                remove_assignment(conn, *id)?;
            }
            for (current, pic_id, task_ids) in &updates {
                if let Some(pic_id) = pic_id {
                    let mut assignment = (*current).clone();
                    assignment.pic_id = *pic_id;
                    assignment_repo::update_assignment(conn, &assignment)?;
                }
                if let Some(task_ids) = task_ids {
                    replace_tasks(conn, current.id, task_ids)?;
                }
            }
            for input in &additions {
                let step = catalog::step(conn, input.progress_step_id)?;
                insert_assignment_with_tasks(
                    conn,
                    job_id,
                    &step,
                    input,
                    AssignmentStatus::Pending,
                    0,
                    None,
                    now,
                )?;
            }
            renumber(conn, &flow, job_id)?;

            // A new task set may consist only of tasks checked early.
            let retasked: HashSet<AssignmentId> = updates
                .iter()
                .filter(|(_, _, task_ids)| task_ids.is_some())
                .map(|(current, _, _)| current.id)
                .collect();
            for assignment in assignment_repo::assignments_for_job(conn, job_id)? {
                if retasked.contains(&assignment.id) {
                    let assignment = load_assignment(conn, assignment.id)?;
                    reconcile_assignment(conn, &job, &flow, assignment, now, outbox)?;
                }
            }
            ensure_active(conn, job_id, now)?;

            if let Some(title) = &patch.title {
                job.title = title.trim().to_string();
            }
            if let Some(customer) = &patch.customer {
                job.customer = Some(customer.clone());
            }
            if let Some(priority) = patch.priority {
                job.priority = priority;
            }
            if let Some(deadline) = patch.deadline {
                job.deadline = Some(deadline);
            }
            if let Some(notes) = &patch.notes {
                job.notes = Some(notes.clone());
            }
            job.updated_at = now;
            job_repo::update(conn, &job)?;

            reconcile_job_in(conn, job, now, outbox)?;
            load_detail(conn, job_id)
        })
    }

    /// Moves a job to `rejected`. Work in flight is not touched.
    pub fn reject_job(&self, job_id: JobId, reason: &str) -> Result<Job> {
        let _span = info_span!("reject_job", job_id).entered();
        self.run(|conn, now, _| {
            if reason.trim().is_empty() {
                return Err(WorkflowError::Validation(
                    "a rejection reason is required".to_string(),
                ));
            }
            let mut job = load_job(conn, job_id)?;
            if job.status == JobStatus::Rejected {
                return Err(WorkflowError::Conflict(format!(
                    "job {} is already rejected",
                    job_id
                )));
            }
            job.status = JobStatus::Rejected;
            job.rejection_reason = Some(reason.trim().to_string());
            job.updated_at = now;
            job_repo::update(conn, &job)?;
            job_repo::record_event(conn, job_id, job_repo::EVENT_JOB_REJECTED, now)?;
            info!(job_id, "Job rejected");
            Ok(job)
        })
    }

    /// Moves a completed job to `approved`.
    pub fn approve_job(&self, job_id: JobId) -> Result<Job> {
        let _span = info_span!("approve_job", job_id).entered();
        self.run(|conn, now, _| {
            let mut job = load_job(conn, job_id)?;
            match job.status {
                JobStatus::Approved => {
                    return Err(WorkflowError::Conflict(format!(
                        "job {} is already approved",
                        job_id
                    )))
                }
                JobStatus::Completed => {}
                other => {
                    return Err(WorkflowError::InvalidState(format!(
                        "job {} is {}, only completed jobs can be approved",
                        job_id, other
                    )))
                }
            }
            job.status = JobStatus::Approved;
            job.updated_at = now;
            job_repo::update(conn, &job)?;
            job_repo::record_event(conn, job_id, job_repo::EVENT_JOB_APPROVED, now)?;
            info!(job_id, "Job approved");
            Ok(job)
        })
    }

    /// Blocks or unblocks an assignment that is not completed.
    ///
    /// Unblocking returns it to `in_progress` if it had started, otherwise
    /// to `pending`.
    pub fn set_assignment_blocked(
        &self,
        assignment_id: AssignmentId,
        blocked: bool,
        reason: Option<&str>,
        actor: Actor,
    ) -> Result<ProgressAssignment> {
        let _span = info_span!("set_assignment_blocked", assignment_id, blocked).entered();
        self.run(|conn, _, _| {
            let mut assignment = load_assignment(conn, assignment_id)?;
            if assignment.pic_id != actor.id && !actor.is_admin() {
                return Err(WorkflowError::Forbidden(format!(
                    "user {} is not the PIC of assignment {}",
                    actor.id, assignment.id
                )));
            }
            let job = load_job(conn, assignment.job_id)?;
            if job.status.is_terminal() {
                return Err(WorkflowError::InvalidState(format!(
                    "job {} is {}",
                    job.id, job.status
                )));
            }
            match (assignment.status, blocked) {
                (AssignmentStatus::Completed, _) => {
                    return Err(WorkflowError::InvalidState(format!(
                        "assignment {} is completed",
                        assignment.id
                    )))
                }
                (AssignmentStatus::Blocked, true) => {
                    return Err(WorkflowError::Conflict(format!(
                        "assignment {} is already blocked",
                        assignment.id
                    )))
                }
                (AssignmentStatus::Pending | AssignmentStatus::InProgress, false) => {
                    return Err(WorkflowError::Conflict(format!(
                        "assignment {} is not blocked",
                        assignment.id
                    )))
                }
                (_, true) => {
                    assignment.status = AssignmentStatus::Blocked;
                    assignment.blocked_reason = reason.map(|r| r.to_string());
                }
                (_, false) => {
                    assignment.status = if assignment.started_at.is_some() {
                        AssignmentStatus::InProgress
                    } else {
                        AssignmentStatus::Pending
                    };
                    assignment.blocked_reason = None;
                }
            }
            assignment_repo::update_assignment(conn, &assignment)?;
            Ok(assignment)
        })
    }

    /// Deletes a job and everything that hangs off it.
    pub fn delete_job(&self, job_id: JobId) -> Result<()> {
        let _span = info_span!("delete_job", job_id).entered();
        self.run(|conn, _, _| {
            load_job(conn, job_id)?;
            delay_repo::delete_for_job(conn, job_id)?;
            lead_time_repo::delete_for_job(conn, job_id)?;
            assignment_repo::delete_for_job(conn, job_id)?;
            job_repo::delete_events(conn, job_id)?;
            job_repo::delete(conn, job_id)?;
            Ok(())
        })?;
        info!(job_id, "Job deleted");
        Ok(())
    }

    /// Sets the planned duration of an assignment. `None` clears it.
    pub fn set_planned_hours(
        &self,
        assignment_id: AssignmentId,
        planned_hours: Option<f64>,
    ) -> Result<LeadTimeRecord> {
        let _span = info_span!("set_planned_hours", assignment_id).entered();
        self.run(|conn, now, _| {
            if let Some(hours) = planned_hours {
                if !hours.is_finite() || hours < 0.0 {
                    return Err(WorkflowError::Validation(format!(
                        "planned hours must be a non-negative number, got {}",
                        hours
                    )));
                }
            }
            let assignment = load_assignment(conn, assignment_id)?;
            lead_time_repo::upsert_planned(conn, assignment.id, planned_hours, now)?;
            if assignment.status == AssignmentStatus::Completed {
                return lead_time::record(conn, &assignment, now);
            }
            lead_time_repo::find(conn, assignment.id)?
                .ok_or_else(|| WorkflowError::not_found("lead time record", assignment.id))
        })
    }

    pub fn lead_time(&self, assignment_id: AssignmentId) -> Result<Option<LeadTimeRecord>> {
        self.db.with_conn(|conn| {
            load_assignment(conn, assignment_id)?;
            Ok(lead_time_repo::find(conn, assignment_id)?)
        })
    }
}

/// A step of the assignment set being validated. `task_ids` is `None` when
/// the existing tasks are kept.
struct PlannedEntry<'a> {
    step_id: StepId,
    task_ids: Option<&'a [TaskId]>,
}

/// Checks an assignment set against the resolved flow before any write.
///
/// Returns the catalog step of each entry, in entry order.
fn validate_assignment_set(
    conn: &Connection,
    flow: &ResolvedFlow,
    entries: &[PlannedEntry<'_>],
    check_order: bool,
) -> Result<Vec<ProgressStep>> {
    if entries.is_empty() {
        return Err(WorkflowError::Validation(
            "a job needs at least one assignment".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.step_id) {
            return Err(WorkflowError::Validation(format!(
                "step {} is assigned more than once",
                entry.step_id
            )));
        }
        let step = catalog::step(conn, entry.step_id)?;
        if let Some(task_ids) = entry.task_ids {
            validate_tasks(conn, &step, task_ids)?;
        }
        if !flow.contains(step.id) {
            return Err(WorkflowError::Validation(format!(
                "step '{}' is not part of the job's flow",
                step.name
            )));
        }
        steps.push(step);
    }

    if let Some(missing) = flow.required().find(|r| !seen.contains(&r.step.id)) {
        return Err(WorkflowError::Validation(format!(
            "required step '{}' is missing",
            missing.step.name
        )));
    }

    if check_order {
        let positions: Vec<usize> = steps
            .iter()
            .filter_map(|s| flow.position_of(s.id))
            .collect();
        if positions.windows(2).any(|w| w[0] >= w[1]) {
            return Err(WorkflowError::Validation(
                "assignments are not in the order of the job's flow".to_string(),
            ));
        }
    }
    Ok(steps)
}

fn validate_tasks(conn: &Connection, step: &ProgressStep, task_ids: &[TaskId]) -> Result<()> {
    if task_ids.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "step '{}' needs at least one task",
            step.name
        )));
    }
    let mut seen = HashSet::new();
    for id in task_ids {
        if !seen.insert(*id) {
            return Err(WorkflowError::Validation(format!(
                "task {} is listed more than once",
                id
            )));
        }
        if !step.has_task(*id) {
            return match crate::db::catalog_repo::find_task(conn, *id)? {
                None => Err(WorkflowError::not_found("progress task", id)),
                Some(_) => Err(WorkflowError::Validation(format!(
                    "task {} does not belong to step '{}'",
                    id, step.name
                ))),
            };
        }
    }
    Ok(())
}

fn find_in(existing: &[ProgressAssignment], id: AssignmentId) -> Result<&ProgressAssignment> {
    existing
        .iter()
        .find(|a| a.id == id)
        .ok_or_else(|| WorkflowError::not_found("progress assignment", id))
}

fn duplicate_change(id: AssignmentId) -> WorkflowError {
    WorkflowError::Validation(format!("assignment {} is changed more than once", id))
}

#[allow(clippy::too_many_arguments)]
fn insert_assignment_with_tasks(
    conn: &Connection,
    job_id: JobId,
    step: &ProgressStep,
    input: &AssignmentInput,
    status: AssignmentStatus,
    position: i64,
    started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<AssignmentId> {
    let id = assignment_repo::insert_assignment(
        conn,
        job_id,
        step.id,
        input.pic_id,
        status,
        position,
        started_at,
    )?;
    for task_id in &input.task_ids {
        assignment_repo::insert_task(conn, id, *task_id)?;
    }
    if let Some(hours) = step.default_planned_hours {
        lead_time_repo::upsert_planned(conn, id, Some(hours), now)?;
    }
    Ok(id)
}

fn replace_tasks(conn: &Connection, assignment_id: AssignmentId, task_ids: &[TaskId]) -> Result<()> {
    let current = assignment_repo::tasks_for_assignment(conn, assignment_id)?;
    for task in &current {
        if !task_ids.contains(&task.progress_task_id) {
            assignment_repo::delete_task(conn, task.id)?;
        }
    }
    for task_id in task_ids {
        if !current.iter().any(|t| t.progress_task_id == *task_id) {
            assignment_repo::insert_task(conn, assignment_id, *task_id)?;
        }
    }
    Ok(())
}

fn remove_assignment(conn: &Connection, id: AssignmentId) -> Result<()> {
    delay_repo::delete_for_assignment(conn, id)?;
    lead_time_repo::delete(conn, id)?;
    assignment_repo::delete_assignment(conn, id)?;
    Ok(())
}

/// Rewrites positions to follow resolved order.
fn renumber(conn: &Connection, flow: &ResolvedFlow, job_id: JobId) -> Result<()> {
    let mut assignments = assignment_repo::assignments_for_job(conn, job_id)?;
    assignments.sort_by_key(|a| flow.position_of(a.progress_step_id).unwrap_or(usize::MAX));
    for (position, mut assignment) in assignments.into_iter().enumerate() {
        if assignment.position != position as i64 {
            assignment.position = position as i64;
            assignment_repo::update_assignment(conn, &assignment)?;
        }
    }
    Ok(())
}

/// Starts the first pending assignment when nothing is active and every
/// assignment before it is completed.
fn ensure_active(conn: &Connection, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
    let assignments = assignment_repo::assignments_for_job(conn, job_id)?;
    let active = assignments.iter().any(|a| {
        matches!(
            a.status,
            AssignmentStatus::InProgress | AssignmentStatus::Blocked
        )
    });
    if active {
        return Ok(());
    }
    if let Some(idx) = assignments
        .iter()
        .position(|a| a.status == AssignmentStatus::Pending)
    {
        if assignments[..idx]
            .iter()
            .all(|a| a.status == AssignmentStatus::Completed)
        {
            let mut first = assignments[idx].clone();
            first.status = AssignmentStatus::InProgress;
            first.started_at = Some(now);
            assignment_repo::update_assignment(conn, &first)?;
            debug!(assignment_id = first.id, "Activated assignment");
        }
    }
    Ok(())
}

fn load_job(conn: &Connection, id: JobId) -> Result<Job> {
    job_repo::find_by_id(conn, id)?.ok_or_else(|| WorkflowError::not_found("job", id))
}

fn load_assignment(conn: &Connection, id: AssignmentId) -> Result<ProgressAssignment> {
    assignment_repo::find_assignment(conn, id)?
        .ok_or_else(|| WorkflowError::not_found("progress assignment", id))
}

fn assignment_in_flow(
    conn: &Connection,
    assignment_id: AssignmentId,
) -> Result<(ProgressAssignment, ResolvedFlow)> {
    let assignment = load_assignment(conn, assignment_id)?;
    let job = load_job(conn, assignment.job_id)?;
    let flow = resolver::resolve(conn, &job)?;
    if !flow.contains(assignment.progress_step_id) {
        return Err(WorkflowError::InvalidState(format!(
            "step {} of assignment {} is not part of the job's flow",
            assignment.progress_step_id, assignment.id
        )));
    }
    Ok((assignment, flow))
}

/// Walks resolved order after the assignment's step, skipping steps the job
/// has no assignment for. The first assigned step decides: its assignment is
/// returned only if it is still pending.
fn next_assignment_in(
    conn: &Connection,
    flow: &ResolvedFlow,
    assignment: &ProgressAssignment,
) -> Result<Option<ProgressAssignment>> {
    let position = match flow.position_of(assignment.progress_step_id) {
        Some(position) => position,
        None => return Ok(None),
    };
    let assignments = assignment_repo::assignments_for_job(conn, assignment.job_id)?;
    for resolved in &flow.steps[position + 1..] {
        if let Some(candidate) = assignments
            .iter()
            .find(|a| a.progress_step_id == resolved.step.id)
        {
            if candidate.status == AssignmentStatus::Pending {
                return Ok(Some(candidate.clone()));
            }
            return Ok(None);
        }
    }
    Ok(None)
}

/// Derives the assignment status from its task counts.
///
/// Returns the assignment and, when it just completed, the next assignment
/// that was started.
fn reconcile_assignment(
    conn: &Connection,
    job: &Job,
    flow: &ResolvedFlow,
    mut assignment: ProgressAssignment,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<(ProgressAssignment, Option<ProgressAssignment>)> {
    let counts = assignment_repo::task_counts_for_assignment(conn, assignment.id)?;

    if counts.all_completed() && assignment.status != AssignmentStatus::Completed {
        assignment.status = AssignmentStatus::Completed;
        assignment.finished_at = Some(now);
        if assignment.started_at.is_none() {
            assignment.started_at = Some(now);
        }
        assignment_repo::update_assignment(conn, &assignment)?;
        lead_time::record(conn, &assignment, now)?;

        let next = match next_assignment_in(conn, flow, &assignment)? {
            Some(mut next) => {
                next.status = AssignmentStatus::InProgress;
                next.started_at = Some(now);
                assignment_repo::update_assignment(conn, &next)?;
                Some(next)
            }
            None => None,
        };
        delay::on_assignment_closed(conn, &assignment, next.as_ref(), now)?;

        let step = catalog::step(conn, assignment.progress_step_id)?;
        info!(
            job_id = job.id,
            assignment_id = assignment.id,
            step = %step.name,
            next = ?next.as_ref().map(|n| n.id),
            "Assignment completed"
        );
        outbox.push(Notification::StepCompleted {
            job: job.clone(),
            step,
            pic_id: assignment.pic_id,
        });
        return Ok((assignment, next));
    }

    if !counts.all_completed() && assignment.status == AssignmentStatus::Completed {
        assignment.status = AssignmentStatus::InProgress;
        assignment.finished_at = None;
        assignment_repo::update_assignment(conn, &assignment)?;
        lead_time_repo::clear_actuals(conn, assignment.id, now)?;
        info!(assignment_id = assignment.id, "Assignment reopened");
    }
    Ok((assignment, None))
}

/// Completed task assignments over all task assignments, in percent.
fn completion_percentage(counts: TaskCounts) -> f64 {
    if counts.total == 0 {
        return 0.0;
    }
    let pct = round2(counts.completed as f64 / counts.total as f64 * 100.0);
    if pct >= 100.0 && !counts.all_completed() {
        99.99
    } else {
        pct
    }
}

/// Derives the job status from its task counts in both directions.
///
/// The completion notification is queued only the first time the job ever
/// completes.
fn reconcile_job_in(
    conn: &Connection,
    mut job: Job,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<(Job, f64)> {
    let counts = assignment_repo::task_counts_for_job(conn, job.id)?;
    let pct = completion_percentage(counts);
    if job.status.is_terminal() {
        return Ok((job, pct));
    }

    if counts.all_completed() && job.status != JobStatus::Completed {
        job.status = JobStatus::Completed;
        if job.finished_at.is_none() {
            job.finished_at = Some(now);
        }
        job.updated_at = now;
        job_repo::update(conn, &job)?;
        if !job_repo::has_event(conn, job.id, job_repo::EVENT_JOB_COMPLETED)? {
            job_repo::record_event(conn, job.id, job_repo::EVENT_JOB_COMPLETED, now)?;
            outbox.push(Notification::JobCompleted { job: job.clone() });
        }
        info!(job_id = job.id, "Job completed");
    } else if !counts.all_completed() && job.status == JobStatus::Completed {
        job.status = JobStatus::InProgress;
        job.finished_at = None;
        job.updated_at = now;
        job_repo::update(conn, &job)?;
        job_repo::record_event(conn, job.id, job_repo::EVENT_JOB_REOPENED, now)?;
        info!(job_id = job.id, "Job reopened");
    }
    Ok((job, pct))
}

fn load_detail(conn: &Connection, job_id: JobId) -> Result<JobDetail> {
    let job = load_job(conn, job_id)?;
    let flow = resolver::resolve(conn, &job)?;
    let counts = assignment_repo::task_counts_for_job(conn, job_id)?;

    let mut assignments = Vec::new();
    for assignment in assignment_repo::assignments_for_job(conn, job_id)? {
        let step = catalog::step(conn, assignment.progress_step_id)?;
        let is_required = flow.get(step.id).map(|s| s.is_required).unwrap_or(false);
        let tasks = assignment_repo::tasks_for_assignment(conn, assignment.id)?
            .into_iter()
            .map(|task| {
                let name = step
                    .tasks
                    .iter()
                    .find(|t| t.id == task.progress_task_id)
                    .map(|t| t.name.clone())
                    .unwrap_or_default();
                TaskDetail { task, name }
            })
            .collect();
        let lead_time = lead_time_repo::find(conn, assignment.id)?;
        assignments.push(AssignmentDetail {
            assignment,
            step_name: step.name,
            is_required,
            tasks,
            lead_time,
        });
    }

    let current_assignment_id = flow
        .steps
        .iter()
        .filter_map(|resolved| {
            assignments
                .iter()
                .find(|a| a.assignment.progress_step_id == resolved.step.id)
        })
        .find(|a| a.assignment.status == AssignmentStatus::InProgress)
        .map(|a| a.assignment.id);

    Ok(JobDetail {
        job,
        flow_source: flow.source,
        completion_percentage: completion_percentage(counts),
        current_assignment_id,
        assignments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::notify::NoopNotifier;

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(
            Database::open_in_memory().unwrap(),
            Arc::new(NoopNotifier),
        )
    }

    fn artwork_job(engine: &WorkflowEngine) -> NewJob {
        let steps = engine.catalog().steps_for("artwork_revision").unwrap();
        NewJob {
            sample_type: "artwork_revision".to_string(),
            title: "Yoghurt lid".to_string(),
            customer: Some("Dairy Co".to_string()),
            priority: Priority::High,
            deadline: None,
            flow_configuration_id: None,
            notes: None,
            assignments: steps
                .iter()
                .enumerate()
                .map(|(i, s)| AssignmentInput {
                    progress_step_id: s.id,
                    pic_id: 100 + i as i64,
                    task_ids: s.tasks.iter().map(|t| t.id).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_completion_percentage() {
        assert_eq!(completion_percentage(TaskCounts::default()), 0.0);
        assert_eq!(
            completion_percentage(TaskCounts {
                completed: 1,
                total: 3
            }),
            33.33
        );
        assert_eq!(
            completion_percentage(TaskCounts {
                completed: 19_999,
                total: 20_000
            }),
            99.99
        );
        assert_eq!(
            completion_percentage(TaskCounts {
                completed: 4,
                total: 4
            }),
            100.0
        );
    }

    #[test]
    fn test_create_job_statuses() {
        let engine = engine();
        let detail = engine.create_job(artwork_job(&engine)).unwrap();
        assert_eq!(detail.job.status, JobStatus::InProgress);
        assert_eq!(detail.completion_percentage, 0.0);
        assert!(matches!(detail.flow_source, FlowSource::SystemDefault(_)));

        let statuses: Vec<AssignmentStatus> =
            detail.assignments.iter().map(|a| a.assignment.status).collect();
        assert_eq!(
            statuses,
            vec![
                AssignmentStatus::InProgress,
                AssignmentStatus::Pending,
                AssignmentStatus::Pending
            ]
        );
        assert_eq!(
            detail.assignments[0].assignment.started_at,
            Some(detail.job.started_at)
        );
        assert_eq!(
            detail.current_assignment_id,
            Some(detail.assignments[0].assignment.id)
        );
        assert!(detail.assignments.iter().all(|a| a.is_required));
        assert!(detail.assignments[0].tasks.iter().all(|t| !t.name.is_empty()));
        assert_eq!(
            detail.assignments[0]
                .lead_time
                .as_ref()
                .and_then(|l| l.planned_hours),
            Some(16.0)
        );
    }

    #[test]
    fn test_create_job_validation() {
        let engine = engine();

        let mut input = artwork_job(&engine);
        input.assignments.clear();
        assert_eq!(
            engine.create_job(input).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut input = artwork_job(&engine);
        input.assignments.remove(1);
        assert_eq!(
            engine.create_job(input).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut input = artwork_job(&engine);
        input.assignments.swap(0, 1);
        assert_eq!(
            engine.create_job(input).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut input = artwork_job(&engine);
        input.assignments[0].task_ids.clear();
        assert_eq!(
            engine.create_job(input).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut input = artwork_job(&engine);
        let foreign = input.assignments[1].task_ids[0];
        input.assignments[0].task_ids.push(foreign);
        assert_eq!(
            engine.create_job(input).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut input = artwork_job(&engine);
        input.assignments[0].task_ids.push(99_999);
        assert_eq!(
            engine.create_job(input).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let mut input = artwork_job(&engine);
        input.sample_type = "poster".to_string();
        assert_eq!(
            engine.create_job(input).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let (jobs, total) = engine
            .database()
            .with_conn(|conn| job_repo::query(conn, &JobFilter::default()))
            .unwrap();
        assert!(jobs.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_toggle_requires_pic_or_admin() {
        let engine = engine();
        let detail = engine.create_job(artwork_job(&engine)).unwrap();
        let task = detail.assignments[0].tasks[0].task.id;

        let err = engine.toggle_task(task, Actor::user(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let outcome = engine.toggle_task(task, Actor::admin(1)).unwrap();
        assert_eq!(outcome.task_status, TaskStatus::Completed);

        let outcome = engine.toggle_task(task, Actor::user(100)).unwrap();
        assert_eq!(outcome.task_status, TaskStatus::Pending);
    }

    #[test]
    fn test_blocked_assignment_rejects_toggles() {
        let engine = engine();
        let detail = engine.create_job(artwork_job(&engine)).unwrap();
        let first = &detail.assignments[0];
        let admin = Actor::admin(1);

        let blocked = engine
            .set_assignment_blocked(first.assignment.id, true, Some("plate damaged"), admin)
            .unwrap();
        assert_eq!(blocked.status, AssignmentStatus::Blocked);
        assert_eq!(
            engine
                .toggle_task(first.tasks[0].task.id, admin)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            engine
                .set_assignment_blocked(first.assignment.id, true, None, admin)
                .unwrap_err()
                .kind(),
            ErrorKind::Conflict
        );

        let restored = engine
            .set_assignment_blocked(first.assignment.id, false, None, admin)
            .unwrap();
        assert_eq!(restored.status, AssignmentStatus::InProgress);
        assert!(restored.blocked_reason.is_none());

        let pending = &detail.assignments[1];
        engine
            .set_assignment_blocked(pending.assignment.id, true, None, admin)
            .unwrap();
        let restored = engine
            .set_assignment_blocked(pending.assignment.id, false, None, admin)
            .unwrap();
        assert_eq!(restored.status, AssignmentStatus::Pending);
    }

    #[test]
    fn test_reject_and_approve() {
        let engine = engine();
        let detail = engine.create_job(artwork_job(&engine)).unwrap();
        let id = detail.job.id;

        assert_eq!(
            engine.approve_job(id).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            engine.reject_job(id, " ").unwrap_err().kind(),
            ErrorKind::Validation
        );

        let job = engine.reject_job(id, "Customer cancelled").unwrap();
        assert_eq!(job.status, JobStatus::Rejected);
        assert_eq!(job.rejection_reason.as_deref(), Some("Customer cancelled"));
        assert_eq!(
            engine.reject_job(id, "again").unwrap_err().kind(),
            ErrorKind::Conflict
        );

        let task = detail.assignments[0].tasks[0].task.id;
        assert_eq!(
            engine.toggle_task(task, Actor::admin(1)).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        let summary = engine.reconcile_job(id).unwrap();
        assert_eq!(summary.job.status, JobStatus::Rejected);
    }

    #[test]
    fn test_planned_hours_validation() {
        let engine = engine();
        let detail = engine.create_job(artwork_job(&engine)).unwrap();
        let id = detail.assignments[1].assignment.id;

        assert_eq!(
            engine.set_planned_hours(id, Some(-1.0)).unwrap_err().kind(),
            ErrorKind::Validation
        );
        let record = engine.set_planned_hours(id, Some(6.5)).unwrap();
        assert_eq!(record.planned_hours, Some(6.5));
        assert!(record.actual_hours.is_none());
        assert_eq!(
            engine.lead_time(id).unwrap().unwrap().planned_hours,
            Some(6.5)
        );
        assert_eq!(
            engine.lead_time(9_999).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
