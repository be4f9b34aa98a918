//! Invariants that must hold after any sequence of toggles.

mod common;

use std::thread;

use common::{FlowBuilder, JobBuilder, TestHarness, ADMIN};
use sampletrack::workflow::model::{AssignmentStatus, JobId, JobStatus};
use sampletrack::workflow::ToggleOutcome;
use sampletrack::Actor;

fn assert_percentage_matches_status(h: &TestHarness, id: JobId) {
    let detail = h.job(id);
    assert_eq!(
        detail.completion_percentage == 100.0,
        detail.job.status == JobStatus::Completed,
        "percentage {} with status {}",
        detail.completion_percentage,
        detail.job.status
    );
}

fn assert_next_matches_final(h: &TestHarness, id: JobId) {
    for a in h.job(id).assignments {
        let next = h.engine.get_next_assignment(a.assignment.id).unwrap();
        let is_final = h.engine.is_final_step(a.assignment.id).unwrap();
        assert_eq!(next.is_none(), is_final, "assignment {}", a.assignment.id);
        if let Some(next) = next {
            assert_eq!(next.status, AssignmentStatus::Pending);
        }
    }
}

#[test]
fn test_percentage_is_100_iff_completed_in_both_directions() {
    let h = TestHarness::new();
    let id = h
        .create_job(JobBuilder::new(&h.engine, "material_trial").build())
        .job
        .id;
    let task_ids: Vec<_> = h
        .job(id)
        .assignments
        .iter()
        .flat_map(|a| a.tasks.iter().map(|t| t.task.id))
        .collect();
    let admin = Actor::admin(ADMIN);

    // Forward to 100%, back down to zero, then up again in reverse order.
    let mut sequence = task_ids.clone();
    sequence.extend(task_ids.iter().rev());
    sequence.extend(task_ids.iter().rev());
    for task in sequence {
        let outcome = h.engine.toggle_task(task, admin).unwrap();
        assert_eq!(
            outcome.completion_percentage == 100.0,
            outcome.job_status == JobStatus::Completed
        );
        assert_percentage_matches_status(&h, id);
    }
    assert_eq!(h.job(id).job.status, JobStatus::Completed);
    assert_eq!(h.notifier.job_completions(id), 1);
}

#[test]
fn test_toggle_twice_restores_statuses_and_percentage() {
    let h = TestHarness::new();
    let id = h
        .create_job(JobBuilder::new(&h.engine, "new_product").build())
        .job
        .id;
    h.complete_assignment(id, 0);

    let detail = h.job(id);
    for (index, assignment) in detail.assignments.iter().enumerate() {
        for task in &assignment.tasks {
            let before = h.job(id);
            let actor = Actor::user(assignment.assignment.pic_id);
            h.engine.toggle_task(task.task.id, actor).unwrap();
            h.engine.toggle_task(task.task.id, actor).unwrap();
            let after = h.job(id);

            assert_eq!(
                after.assignments[index].assignment.status,
                before.assignments[index].assignment.status
            );
            assert_eq!(after.job.status, before.job.status);
            assert_eq!(after.completion_percentage, before.completion_percentage);
        }
    }
}

#[test]
fn test_next_assignment_none_iff_final_step() {
    let h = TestHarness::new();
    let flow = h
        .engine
        .flow_configurations()
        .create(
            FlowBuilder::new(&h.engine, "Proof optional", "new_product")
                .step("Design & Artwork Approval", true)
                .step("Mastercard Preparation", false)
                .step("Proof Print", false)
                .step("Quality Validation", true)
                .build(),
        )
        .unwrap();

    let jobs = vec![
        h.create_job(JobBuilder::new(&h.engine, "new_product").build()),
        h.create_job(JobBuilder::new(&h.engine, "artwork_revision").build()),
        h.create_job(
            JobBuilder::new(&h.engine, "new_product")
                .flow_configuration(flow.id)
                .only_steps(&["Design & Artwork Approval", "Proof Print", "Quality Validation"])
                .build(),
        ),
    ];

    for job in &jobs {
        let id = job.job.id;
        assert_next_matches_final(&h, id);
        for index in 0..job.assignments.len() {
            h.complete_assignment(id, index);
            assert_next_matches_final(&h, id);
        }
        // Reopen the first step while its successor is running.
        h.toggle_as_pic(id, 0, 0);
        assert_next_matches_final(&h, id);
    }
}

#[test]
fn test_delete_job_leaves_no_orphans() {
    let h = TestHarness::new();
    let keep = h
        .create_job(JobBuilder::new(&h.engine, "artwork_revision").build())
        .job
        .id;
    let tables = [
        "jobs",
        "progress_assignments",
        "task_assignments",
        "external_delay_records",
        "lead_time_records",
        "job_events",
    ];
    let before: Vec<i64> = tables.iter().map(|t| h.count_rows(t)).collect();

    let id = h
        .create_job(JobBuilder::new(&h.engine, "new_product").build())
        .job
        .id;
    for index in 0..5 {
        h.complete_assignment(id, index);
    }
    h.toggle_as_pic(id, 4, 0);
    assert!(h.count_rows("external_delay_records") > before[3]);

    h.engine.delete_job(id).unwrap();

    let after: Vec<i64> = tables.iter().map(|t| h.count_rows(t)).collect();
    assert_eq!(after, before);
    assert!(h.engine.get_job(keep).is_ok());
    assert!(h.engine.get_job(id).is_err());
    assert!(h.engine.delete_job(id).is_err());
}

#[test]
fn test_concurrent_toggles_close_assignment_once() {
    let h = TestHarness::new();
    let job = h.create_job(JobBuilder::new(&h.engine, "new_product").build());
    let first = &job.assignments[0];
    let actor = Actor::user(first.assignment.pic_id);

    let handles: Vec<_> = first
        .tasks
        .iter()
        .map(|t| {
            let engine = h.engine.clone();
            let task = t.task.id;
            thread::spawn(move || engine.toggle_task(task, actor).unwrap())
        })
        .collect();
    let outcomes: Vec<ToggleOutcome> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| o.activated_assignment_id.is_some())
            .count(),
        1
    );
    assert_eq!(h.notifier.step_completions().len(), 1);
    assert_eq!(h.delays_for(job.job.id).len(), 1);

    let detail = h.job(job.job.id);
    assert_eq!(
        detail.assignments[0].assignment.status,
        AssignmentStatus::Completed
    );
    assert_eq!(
        detail
            .assignments
            .iter()
            .filter(|a| a.assignment.status == AssignmentStatus::InProgress)
            .count(),
        1
    );
}

#[test]
fn test_delay_wait_hours_never_negative() {
    let h = TestHarness::new();
    let id = h
        .create_job(JobBuilder::new(&h.engine, "artwork_revision").build())
        .job
        .id;
    for index in 0..3 {
        h.complete_assignment(id, index);
    }
    for record in h.delays_for(id) {
        assert!(record.wait_hours.unwrap() >= 0.0);
        assert!(record.external_wait_end.unwrap() >= record.external_wait_start);
    }
}
