//! Workflow event broadcaster.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::notify::{Notifier, NotifyError};
use crate::workflow::{system_clock, Clock};
use crate::workflow::model::{Job, JobId, JobStatus, ProgressStep, StepId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    StepCompleted,
    JobCompleted,
}

impl std::fmt::Display for WorkflowEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowEventKind::StepCompleted => write!(f, "Step completed"),
            WorkflowEventKind::JobCompleted => write!(f, "Job completed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub kind: WorkflowEventKind,
    pub job_id: JobId,
    pub job_title: String,
    pub sample_type: String,
    pub job_status: JobStatus,
    /// Set for step events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// PIC of the completed step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pic_id: Option<UserId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn step_completed(
        job: &Job,
        step: &ProgressStep,
        pic_id: UserId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: WorkflowEventKind::StepCompleted,
            job_id: job.id,
            job_title: job.title.clone(),
            sample_type: job.sample_type.clone(),
            job_status: job.status,
            step_id: Some(step.id),
            step_name: Some(step.name.clone()),
            pic_id: Some(pic_id),
            message: format!("{} finished for '{}'", step.name, job.title),
            timestamp,
        }
    }

    /// Stamped with the job's finish time when it has one.
    pub fn job_completed(job: &Job, fallback: DateTime<Utc>) -> Self {
        Self {
            kind: WorkflowEventKind::JobCompleted,
            job_id: job.id,
            job_title: job.title.clone(),
            sample_type: job.sample_type.clone(),
            job_status: job.status,
            step_id: None,
            step_name: None,
            pic_id: None,
            message: format!("'{}' is ready for approval", job.title),
            timestamp: job.finished_at.unwrap_or(fallback),
        }
    }
}

/// Fans workflow events out to every subscriber.
#[derive(Clone)]
pub struct WorkflowEventBroadcaster {
    sender: Arc<broadcast::Sender<WorkflowEvent>>,
    clock: Clock,
}

impl WorkflowEventBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
            clock: system_clock(),
        }
    }

    /// Stamps events with `clock`; pass the engine's clock so event times
    /// match what was persisted.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Sends an event to all subscribers. No active receivers is fine.
    pub fn send(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WorkflowEventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Notifier for WorkflowEventBroadcaster {
    fn notify_step_completed(
        &self,
        job: &Job,
        step: &ProgressStep,
        pic_id: UserId,
    ) -> Result<(), NotifyError> {
        self.send(WorkflowEvent::step_completed(job, step, pic_id, (self.clock)()));
        Ok(())
    }

    fn notify_job_completed(&self, job: &Job) -> Result<(), NotifyError> {
        self.send(WorkflowEvent::job_completed(job, (self.clock)()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Priority;
    use chrono::TimeZone;

    fn job() -> Job {
        let now = Utc::now();
        Job {
            id: 7,
            sample_type: "new_product".to_string(),
            title: "Shampoo sleeve".to_string(),
            customer: Some("Acme".to_string()),
            priority: Priority::Urgent,
            status: JobStatus::InProgress,
            flow_configuration_id: None,
            notes: None,
            rejection_reason: None,
            started_at: now,
            deadline: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn step() -> ProgressStep {
        ProgressStep {
            id: 2,
            sample_type: "new_product".to_string(),
            name: "Mastercard Preparation".to_string(),
            order_hint: 20,
            default_planned_hours: Some(16.0),
            tasks: vec![],
        }
    }

    #[test]
    fn test_broadcaster_creation() {
        let broadcaster = WorkflowEventBroadcaster::new(10);
        assert_eq!(broadcaster.receiver_count(), 0);
    }

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = WorkflowEventBroadcaster::default();
        broadcaster.send(WorkflowEvent::job_completed(&job(), Utc::now()));
    }

    #[test]
    fn test_notifier_fans_out() {
        let broadcaster = WorkflowEventBroadcaster::default();
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();

        broadcaster
            .notify_step_completed(&job(), &step(), 42)
            .unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.kind, WorkflowEventKind::StepCompleted);
            assert_eq!(event.job_id, 7);
            assert_eq!(event.step_name.as_deref(), Some("Mastercard Preparation"));
            assert_eq!(event.pic_id, Some(42));
        }
    }

    #[test]
    fn test_job_completed_event() {
        let broadcaster = WorkflowEventBroadcaster::default();
        let mut rx = broadcaster.subscribe();

        let mut done = job();
        done.status = JobStatus::Completed;
        done.finished_at = Some(Utc::now());
        broadcaster.notify_job_completed(&done).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, WorkflowEventKind::JobCompleted);
        assert_eq!(event.job_status, JobStatus::Completed);
        assert_eq!(event.timestamp, done.finished_at.unwrap());
        assert!(event.step_id.is_none());
    }

    #[test]
    fn test_events_use_injected_clock() {
        let fixed = Utc.with_ymd_and_hms(2026, 4, 1, 10, 30, 0).unwrap();
        let broadcaster = WorkflowEventBroadcaster::default().with_clock(Arc::new(move || fixed));
        let mut rx = broadcaster.subscribe();

        broadcaster.notify_step_completed(&job(), &step(), 42).unwrap();
        broadcaster.notify_job_completed(&job()).unwrap();

        assert_eq!(rx.try_recv().unwrap().timestamp, fixed);
        let unfinished = rx.try_recv().unwrap();
        assert_eq!(unfinished.kind, WorkflowEventKind::JobCompleted);
        assert_eq!(unfinished.timestamp, fixed);
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::step_completed(&job(), &step(), 3, Utc::now());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"step_completed\""));
        assert!(json.contains("\"jobTitle\":\"Shampoo sleeve\""));
        assert!(json.contains("\"picId\":3"));
    }
}
