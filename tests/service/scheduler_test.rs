//! Admission limits, cancellation, and liveness handling.

use std::time::Duration;

use keyward::types::{FailureReason, JobId, JobOutcome, JobState, Subject};
use keyward::Keyward;

use crate::support::{
    assert_limit_error, build_service, build_service_with_store, spec, wait_terminal,
    FakeBehavior, StallingStore,
};

async fn wait_running(service: &Keyward, requester: &Subject, job_id: JobId) {
    let poll = async {
        loop {
            let record = service.job(requester, job_id).await.expect("job lookup");
            if record.state == JobState::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("job never started running");
}

#[tokio::test]
async fn full_queue_rejects_instead_of_dropping() {
    let harness = build_service(FakeBehavior::Succeed, |config| {
        config.scheduler.per_requester_queue_depth = 2;
        // No dispatch: everything stays queued.
        config.scheduler.max_concurrent = 0;
    });
    let alice = Subject::new("alice");

    harness
        .service
        .submit_install(&alice, spec("one"), vec![])
        .await
        .expect("first");
    harness
        .service
        .submit_install(&alice, spec("two"), vec![])
        .await
        .expect("second");
    let third = harness
        .service
        .submit_install(&alice, spec("three"), vec![])
        .await;
    assert_limit_error(third).await;

    // Another requester has their own queue.
    harness
        .service
        .submit_install(&Subject::new("bob"), spec("four"), vec![])
        .await
        .expect("other requester admitted");
}

#[tokio::test]
async fn queued_job_cancels_without_running() {
    let harness = build_service(FakeBehavior::Succeed, |config| {
        config.scheduler.max_concurrent = 0;
    });
    let alice = Subject::new("alice");

    let job_id = harness
        .service
        .submit_install(&alice, spec("left-pad"), vec![])
        .await
        .expect("submit");

    // The queued job is followable before it is cancelled.
    let follower = harness.service.follow(&alice, job_id).await;
    assert!(follower.is_ok());

    harness.service.cancel(&alice, job_id).await.expect("cancel");
    let record = harness.service.job(&alice, job_id).await.expect("job");
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.outcome, Some(JobOutcome::Cancelled));
    assert_eq!(harness.runner.runs(), 0);

    // Cancelling a terminal job is a no-op, and following it is not.
    harness
        .service
        .cancel(&alice, job_id)
        .await
        .expect("idempotent cancel");
    assert!(harness.service.follow(&alice, job_id).await.is_err());
}

#[tokio::test]
async fn cancel_during_dispatch_handoff_still_cancels() {
    // Hold the Queued -> Running persist open so the cancel lands after
    // the job left the queue but before it is recorded as running.
    let store = StallingStore::new(Duration::from_millis(400));
    let harness = build_service_with_store(store, FakeBehavior::Succeed, |_| {});
    let alice = Subject::new("alice");

    let job_id = harness
        .service
        .submit_install(&alice, spec("left-pad"), vec![])
        .await
        .expect("submit");
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.service.cancel(&alice, job_id).await.expect("cancel");

    let record = wait_terminal(&harness.service, &alice, job_id).await;
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.outcome, Some(JobOutcome::Cancelled));
    // The cancel won: no sandbox ever ran.
    assert_eq!(harness.runner.runs(), 0);
}

#[tokio::test]
async fn running_job_is_killed_on_cancel() {
    let harness = build_service(FakeBehavior::HangUntilKilled, |_| {});
    let alice = Subject::new("alice");

    let job_id = harness
        .service
        .submit_install(&alice, spec("left-pad"), vec![])
        .await
        .expect("submit");
    wait_running(&harness.service, &alice, job_id).await;

    harness.service.cancel(&alice, job_id).await.expect("cancel");
    let record = wait_terminal(&harness.service, &alice, job_id).await;
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.outcome, Some(JobOutcome::Cancelled));
}

#[tokio::test]
async fn timed_out_job_fails_with_timeout() {
    let harness = build_service(FakeBehavior::Timeout, |_| {});
    let alice = Subject::new("alice");

    let job_id = harness
        .service
        .submit_install(&alice, spec("left-pad"), vec![])
        .await
        .expect("submit");

    let record = wait_terminal(&harness.service, &alice, job_id).await;
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(
        record.outcome,
        Some(JobOutcome::Failed(FailureReason::Timeout))
    );
}

#[tokio::test(start_paused = true)]
async fn unresponsive_runner_is_declared_lost() {
    let harness = build_service(FakeBehavior::Unresponsive, |config| {
        config.scheduler.job_timeout_secs = 1;
        config.scheduler.liveness_grace_secs = 1;
    });
    let alice = Subject::new("alice");

    let job_id = harness
        .service
        .submit_install(&alice, spec("left-pad"), vec![])
        .await
        .expect("submit");

    let record = wait_terminal(&harness.service, &alice, job_id).await;
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(
        record.outcome,
        Some(JobOutcome::Failed(FailureReason::RunnerLost))
    );
}

#[tokio::test]
async fn global_cap_holds_later_jobs_until_a_slot_frees() {
    let harness = build_service(FakeBehavior::HangUntilKilled, |config| {
        config.scheduler.max_concurrent = 1;
        config.scheduler.per_requester_running = 2;
    });
    let alice = Subject::new("alice");

    let first = harness
        .service
        .submit_install(&alice, spec("one"), vec![])
        .await
        .expect("first");
    wait_running(&harness.service, &alice, first).await;

    let second = harness
        .service
        .submit_install(&alice, spec("two"), vec![])
        .await
        .expect("second");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let record = harness.service.job(&alice, second).await.expect("job");
    assert_eq!(record.state, JobState::Queued);
    assert_eq!(harness.runner.runs(), 1);

    // Freeing the slot lets the queued job through.
    harness.service.cancel(&alice, first).await.expect("cancel");
    wait_running(&harness.service, &alice, second).await;
    harness.service.cancel(&alice, second).await.expect("cleanup");
    wait_terminal(&harness.service, &alice, second).await;
}
