//! Test harness for isolated workflow execution.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use sampletrack::db::delay_repo::DelayFilter;
use sampletrack::notify::{Notifier, NotifyError};
use sampletrack::workflow::model::{
    ExternalDelayRecord, Job, JobId, ProgressStep, TaskStatus, UserId,
};
use sampletrack::workflow::{AssignmentDetail, JobDetail, NewJob, ToggleOutcome, WorkflowEngine};
use sampletrack::{Actor, Database};

/// A notification as the engine delivered it.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    StepCompleted {
        job_id: JobId,
        step: String,
        pic_id: UserId,
    },
    JobCompleted {
        job_id: JobId,
    },
}

/// Notifier that remembers every call, optionally failing each one.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<Recorded>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    pub fn job_completions(&self, job_id: JobId) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == Recorded::JobCompleted { job_id })
            .count()
    }

    pub fn step_completions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Recorded::StepCompleted { step, .. } => Some(step),
                Recorded::JobCompleted { .. } => None,
            })
            .collect()
    }

    fn record(&self, call: Recorded) -> Result<(), NotifyError> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(NotifyError::Delivery("mail relay unreachable".to_string()));
        }
        Ok(())
    }
}

impl Notifier for RecordingNotifier {
    fn notify_step_completed(
        &self,
        job: &Job,
        step: &ProgressStep,
        pic_id: UserId,
    ) -> Result<(), NotifyError> {
        self.record(Recorded::StepCompleted {
            job_id: job.id,
            step: step.name.clone(),
            pic_id,
        })
    }

    fn notify_job_completed(&self, job: &Job) -> Result<(), NotifyError> {
        self.record(Recorded::JobCompleted { job_id: job.id })
    }
}

/// Clock the test moves by hand. Starts at whole seconds so stored
/// timestamps compare equal after the millisecond round trip.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(
                Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
            )),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

/// Isolated engine with its own database, clock and notifier.
pub struct TestHarness {
    temp_dir: TempDir,
    pub db: Database,
    pub engine: WorkflowEngine,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: ManualClock,
}

impl TestHarness {
    /// In-memory database, notifications recorded.
    pub fn new() -> Self {
        Self::with_notifier(RecordingNotifier::default())
    }

    pub fn with_notifier(notifier: RecordingNotifier) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_in_memory().expect("Failed to open database");
        Self::assemble(temp_dir, db, notifier)
    }

    /// File-backed database inside the harness temp directory.
    pub fn with_file_db() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(&temp_dir.path().join("data").join("sampletrack.db"))
            .expect("Failed to open database");
        Self::assemble(temp_dir, db, RecordingNotifier::default())
    }

    fn assemble(temp_dir: TempDir, db: Database, notifier: RecordingNotifier) -> Self {
        let notifier = Arc::new(notifier);
        let clock = ManualClock::new();
        let source = clock.clone();
        let engine = WorkflowEngine::new(db.clone(), notifier.clone())
            .with_clock(Arc::new(move || source.now()));
        Self {
            temp_dir,
            db,
            engine,
            notifier,
            clock,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn create_job(&self, input: NewJob) -> JobDetail {
        self.engine.create_job(input).expect("Failed to create job")
    }

    pub fn job(&self, job_id: JobId) -> JobDetail {
        self.engine.get_job(job_id).expect("Failed to load job")
    }

    /// Assignment at `index` in position order.
    pub fn assignment(&self, job_id: JobId, index: usize) -> AssignmentDetail {
        self.job(job_id).assignments[index].clone()
    }

    /// Toggles a task as the PIC of its assignment.
    pub fn toggle_as_pic(&self, job_id: JobId, index: usize, task: usize) -> ToggleOutcome {
        let assignment = self.assignment(job_id, index);
        self.engine
            .toggle_task(
                assignment.tasks[task].task.id,
                Actor::user(assignment.assignment.pic_id),
            )
            .expect("Failed to toggle task")
    }

    /// Completes every pending task of the assignment at `index`.
    pub fn complete_assignment(&self, job_id: JobId, index: usize) -> Option<ToggleOutcome> {
        let assignment = self.assignment(job_id, index);
        let actor = Actor::user(assignment.assignment.pic_id);
        let mut last = None;
        for task in assignment.tasks.iter().filter(|t| t.task.status == TaskStatus::Pending) {
            last = Some(
                self.engine
                    .toggle_task(task.task.id, actor)
                    .expect("Failed to toggle task"),
            );
        }
        last
    }

    pub fn delays_for(&self, job_id: JobId) -> Vec<ExternalDelayRecord> {
        self.engine
            .delay_tracker()
            .open_delay_records(&DelayFilter {
                job_id: Some(job_id),
                ..Default::default()
            })
            .expect("Failed to list delay records")
            .records
    }

    /// Row count of a table, for orphan checks.
    pub fn count_rows(&self, table: &str) -> i64 {
        self.db
            .with_conn(|conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                    .map_err(sampletrack::db::DatabaseError::from)
            })
            .expect("Failed to count rows")
    }
}
