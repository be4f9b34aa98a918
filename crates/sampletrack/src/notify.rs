//! Notification seam.
//!
//! The engine never calls a [`Notifier`] while its transaction is open.
//! Transition points push a [`Notification`] onto an [`Outbox`], and the
//! outbox is dispatched after the transaction commits. A rolled back unit
//! of work therefore never notifies anybody.

use thiserror::Error;
use tracing::{info, warn};

use crate::workflow::model::{Job, ProgressStep, UserId};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    ChannelClosed,

    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

pub trait Notifier: Send + Sync {
    /// Called once per assignment that moves to `completed`.
    fn notify_step_completed(
        &self,
        job: &Job,
        step: &ProgressStep,
        pic_id: UserId,
    ) -> Result<(), NotifyError>;

    /// Called at most once per job.
    fn notify_job_completed(&self, job: &Job) -> Result<(), NotifyError>;
}

/// No-op notifier for tests and headless use.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_step_completed(
        &self,
        _job: &Job,
        _step: &ProgressStep,
        _pic_id: UserId,
    ) -> Result<(), NotifyError> {
        Ok(())
    }

    fn notify_job_completed(&self, _job: &Job) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes notifications to the log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_step_completed(
        &self,
        job: &Job,
        step: &ProgressStep,
        pic_id: UserId,
    ) -> Result<(), NotifyError> {
        info!(job_id = job.id, step = %step.name, pic_id, "Step completed");
        Ok(())
    }

    fn notify_job_completed(&self, job: &Job) -> Result<(), NotifyError> {
        info!(job_id = job.id, title = %job.title, "Job completed");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StepCompleted {
        job: Job,
        step: ProgressStep,
        pic_id: UserId,
    },
    JobCompleted {
        job: Job,
    },
}

/// Notifications collected inside a transaction.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<Notification>,
}

impl Outbox {
    pub fn push(&mut self, notification: Notification) {
        self.pending.push(notification);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Delivers every queued notification. Failures are logged and skipped.
    pub fn dispatch(self, notifier: &dyn Notifier) {
        for notification in self.pending {
            let result = match &notification {
                Notification::StepCompleted { job, step, pic_id } => {
                    notifier.notify_step_completed(job, step, *pic_id)
                }
                Notification::JobCompleted { job } => notifier.notify_job_completed(job),
            };
            if let Err(e) = result {
                match &notification {
                    Notification::StepCompleted { job, step, .. } => warn!(
                        job_id = job.id,
                        step_id = step.id,
                        "Step completion notification failed: {}",
                        e
                    ),
                    Notification::JobCompleted { job } => {
                        warn!(job_id = job.id, "Job completion notification failed: {}", e)
                    }
                }
            }
        }
    }
}
