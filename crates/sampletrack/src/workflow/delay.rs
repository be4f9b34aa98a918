//! External wait windows between two steps of a job.
//!
//! The engine opens a window when an assignment completes and hands work to
//! the next one, and closes it at the next check of one of that assignment's
//! tasks. Tasks checked before the hand-off do not count. Category and reason
//! are left for an operator.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use crate::db::delay_repo::{self, DelayFilter};
use crate::db::Database;
use crate::error::{Result, WorkflowError};
use crate::workflow::model::{
    hours_between, AssignmentId, DelayCategory, DelayRecordId, ExternalDelayRecord,
    ProgressAssignment,
};
use crate::workflow::{system_clock, Clock};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRecordList {
    pub records: Vec<ExternalDelayRecord>,
    pub total: u64,
}

#[derive(Clone)]
pub struct ExternalDelayTracker {
    db: Database,
    clock: Clock,
}

impl ExternalDelayTracker {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn open_delay_records(&self, filter: &DelayFilter) -> Result<DelayRecordList> {
        self.db.with_conn(|conn| {
            let (records, total) = delay_repo::query(conn, filter)?;
            Ok(DelayRecordList { records, total })
        })
    }

    pub fn get(&self, id: DelayRecordId) -> Result<ExternalDelayRecord> {
        self.db.with_conn(|conn| load(conn, id))
    }

    /// Closes a record by hand and annotates it.
    ///
    /// `end_time` defaults to now. On a record that is already closed the
    /// end time is kept and only the annotation is applied.
    pub fn close_delay_record(
        &self,
        id: DelayRecordId,
        end_time: Option<DateTime<Utc>>,
        category: Option<DelayCategory>,
        reason: Option<&str>,
    ) -> Result<ExternalDelayRecord> {
        let _span = info_span!("delay.close", id).entered();
        let now = (self.clock)();
        self.db.transaction(|tx| {
            let record = load(tx, id)?;
            if !record.is_completed() {
                let end = end_time.unwrap_or(now);
                if end < record.external_wait_start {
                    return Err(WorkflowError::Validation(format!(
                        "end time {} is before wait start {}",
                        end, record.external_wait_start
                    )));
                }
                delay_repo::close(tx, id, end, wait_hours(record.external_wait_start, end))?;
            }
            delay_repo::annotate(tx, id, category, reason)?;
            load(tx, id)
        })
    }
}

fn load(conn: &Connection, id: DelayRecordId) -> Result<ExternalDelayRecord> {
    delay_repo::find_by_id(conn, id)?.ok_or_else(|| WorkflowError::not_found("delay record", id))
}

fn wait_hours(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    hours_between(start, end).max(0.0)
}

/// Opens a window from `last` to `next`. No window when there is no next.
pub(crate) fn on_assignment_closed(
    conn: &Connection,
    last: &ProgressAssignment,
    next: Option<&ProgressAssignment>,
    now: DateTime<Utc>,
) -> Result<Option<DelayRecordId>> {
    let next = match next {
        Some(next) => next,
        None => return Ok(None),
    };
    if !delay_repo::find_open_for_next(conn, next.id)?.is_empty() {
        return Ok(None);
    }
    let wait_start = last.finished_at.unwrap_or(now);
    let id = delay_repo::insert_open(conn, last.job_id, last.id, Some(next.id), wait_start, now)?;
    debug!(
        delay_id = id,
        last = last.id,
        next = next.id,
        "Opened external delay window"
    );
    Ok(Some(id))
}

/// Closes every open window waiting on `assignment_id`. Runs on every check;
/// once a window is closed later checks leave it alone.
pub(crate) fn on_task_checked(
    conn: &Connection,
    assignment_id: AssignmentId,
    now: DateTime<Utc>,
) -> Result<usize> {
    let open = delay_repo::find_open_for_next(conn, assignment_id)?;
    for record in &open {
        let hours = wait_hours(record.external_wait_start, now);
        delay_repo::close(conn, record.id, now, hours)?;
        debug!(delay_id = record.id, wait_hours = hours, "Closed external delay window");
    }
    Ok(open.len())
}
