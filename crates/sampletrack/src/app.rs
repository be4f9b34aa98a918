//! Wiring from a loaded [`Config`] to a ready engine.

use std::sync::Arc;

use tracing::info;

use crate::broadcast::WorkflowEventBroadcaster;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Result, WorkflowError};
use crate::notify::{Notifier, TracingNotifier};
use crate::workflow::{system_clock, Clock, WorkflowEngine};

pub struct App {
    pub engine: WorkflowEngine,
    /// Present when notifications are enabled.
    pub events: Option<WorkflowEventBroadcaster>,
}

impl App {
    /// Opens the configured database and builds the engine. With
    /// notifications disabled, completions are only logged.
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with_clock(config, system_clock())
    }

    /// Like [`open`](Self::open), with one clock shared by the engine and
    /// the event channel.
    pub fn open_with_clock(config: &Config, clock: Clock) -> Result<Self> {
        let path = config.database.resolved_path().ok_or_else(|| {
            WorkflowError::Validation(
                "no database path configured and no home directory found".to_string(),
            )
        })?;
        let db = Database::open(&path)?;

        let events = config
            .notifications
            .enabled
            .then(|| {
                WorkflowEventBroadcaster::new(config.notifications.channel_capacity)
                    .with_clock(Arc::clone(&clock))
            });
        let notifier: Arc<dyn Notifier> = match &events {
            Some(events) => Arc::new(events.clone()),
            None => Arc::new(TracingNotifier),
        };

        info!(path = %path.display(), notifications = events.is_some(), "Workflow engine ready");
        Ok(Self {
            engine: WorkflowEngine::new(db, notifier).with_clock(clock),
            events,
        })
    }
}
