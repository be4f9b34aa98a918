//! Planned vs. actual duration per assignment.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::lead_time_repo;
use crate::error::{Result, WorkflowError};
use crate::workflow::model::{hours_between, LeadTimeRecord, ProgressAssignment};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadTimeMetrics {
    pub actual_hours: f64,
    pub variance_hours: Option<f64>,
    pub efficiency_pct: Option<f64>,
}

pub struct LeadTimeCalculator;

impl LeadTimeCalculator {
    /// Metrics for an assignment that has both a start and a finish.
    pub fn calculate(
        assignment: &ProgressAssignment,
        planned_hours: Option<f64>,
    ) -> Result<LeadTimeMetrics> {
        let (started, finished) = match (assignment.started_at, assignment.finished_at) {
            (Some(s), Some(f)) => (s, f),
            _ => {
                return Err(WorkflowError::InvalidState(format!(
                    "assignment {} has no start and finish time",
                    assignment.id
                )))
            }
        };
        let actual_hours = hours_between(started, finished);
        let variance_hours = planned_hours.map(|planned| actual_hours - planned);
        let efficiency_pct = match planned_hours {
            Some(planned) if actual_hours > 0.0 => Some(planned / actual_hours * 100.0),
            _ => None,
        };
        Ok(LeadTimeMetrics {
            actual_hours,
            variance_hours,
            efficiency_pct,
        })
    }
}

/// Computes and stores the metrics of a completed assignment.
pub(crate) fn record(
    conn: &Connection,
    assignment: &ProgressAssignment,
    now: DateTime<Utc>,
) -> Result<LeadTimeRecord> {
    let planned_hours = lead_time_repo::find(conn, assignment.id)?.and_then(|r| r.planned_hours);
    let metrics = LeadTimeCalculator::calculate(assignment, planned_hours)?;
    let record = LeadTimeRecord {
        progress_assignment_id: assignment.id,
        planned_hours,
        actual_hours: Some(metrics.actual_hours),
        variance_hours: metrics.variance_hours,
        efficiency_pct: metrics.efficiency_pct,
        updated_at: now,
    };
    lead_time_repo::upsert(conn, &record)?;
    Ok(record)
}
