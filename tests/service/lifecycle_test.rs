//! End-to-end lifecycle: store, grant, submit, run, audit.

use keyward::types::{Action, FailureReason, JobOutcome, JobState, SecretRef, Subject};
use keyward::vault::SecretValue;

use crate::support::{build_service, spec, wait_terminal, FakeBehavior};

#[tokio::test]
async fn granted_job_succeeds_with_full_audit_trail() {
    let harness = build_service(FakeBehavior::Succeed, |_| {});
    let alice = Subject::new("alice");
    let bob = Subject::new("bob");

    let secret_id = harness
        .service
        .store_secret(&alice, "npm-token", Some("npm"), SecretValue::new("abc123"))
        .await
        .expect("store secret");
    harness
        .service
        .grant(&alice, secret_id, &bob, &[Action::UseInJob], None)
        .await
        .expect("grant");

    let job_id = harness
        .service
        .submit_install(
            &bob,
            spec("left-pad"),
            vec![SecretRef {
                secret_id,
                env_name: "NPM_TOKEN".to_owned(),
            }],
        )
        .await
        .expect("submit");

    let record = wait_terminal(&harness.service, &bob, job_id).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.outcome, Some(JobOutcome::Succeeded));
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());
    assert!(record.output.iter().any(|l| l.line.contains("added 1 package")));
    assert_eq!(harness.runner.runs(), 1);

    let trail = harness.service.export_audit(None).expect("export");
    let actions: Vec<String> = trail
        .iter()
        .map(|r| serde_json::to_value(r.action).expect("action").as_str().expect("str").to_owned())
        .collect();
    for expected in [
        "secret_stored",
        "grant_issued",
        "job_submitted",
        "job_started",
        "bundle_materialized",
        "job_succeeded",
    ] {
        assert!(
            actions.contains(&expected.to_owned()),
            "missing audit action {expected}, got {actions:?}"
        );
    }
    // The submission must be audited before the start, and the start
    // before the bundle.
    let position = |name: &str| actions.iter().position(|a| a == name).expect("present");
    assert!(position("job_submitted") < position("job_started"));
    assert!(position("job_started") < position("bundle_materialized"));
    assert!(position("bundle_materialized") < position("job_succeeded"));
}

#[tokio::test]
async fn output_and_audit_never_contain_plaintext() {
    let harness = build_service(FakeBehavior::EchoEnv, |_| {});
    let alice = Subject::new("alice");
    let plaintext = "tok_super_secret_value";

    let secret_id = harness
        .service
        .store_secret(&alice, "npm-token", None, SecretValue::new(plaintext))
        .await
        .expect("store secret");

    let job_id = harness
        .service
        .submit_install(
            &alice,
            spec("left-pad"),
            vec![SecretRef {
                secret_id,
                env_name: "NPM_TOKEN".to_owned(),
            }],
        )
        .await
        .expect("submit");

    let record = wait_terminal(&harness.service, &alice, job_id).await;
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.output.len(), 1);
    assert_eq!(record.output[0].line, "NPM_TOKEN=[REDACTED]");

    let rendered = serde_json::to_string(&record).expect("serialize record");
    assert!(!rendered.contains(plaintext));

    let trail = harness.service.export_audit(None).expect("export");
    let rendered = serde_json::to_string(&trail).expect("serialize trail");
    assert!(!rendered.contains(plaintext));
}

#[tokio::test]
async fn jobs_are_visible_only_to_their_requester() {
    let harness = build_service(FakeBehavior::Succeed, |_| {});
    let alice = Subject::new("alice");
    let mallory = Subject::new("mallory");

    let job_id = harness
        .service
        .submit_install(&alice, spec("left-pad"), vec![])
        .await
        .expect("submit");
    wait_terminal(&harness.service, &alice, job_id).await;

    let result = harness.service.job(&mallory, job_id).await;
    assert!(matches!(result, Err(keyward::Error::NotFound(_))));
    let cancel = harness.service.cancel(&mallory, job_id).await;
    assert!(matches!(cancel, Err(keyward::Error::NotFound(_))));
}

#[tokio::test]
async fn nonzero_exit_fails_the_job_with_its_code() {
    let harness = build_service(FakeBehavior::Exit(1), |_| {});
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
        Some(JobOutcome::Failed(FailureReason::Exit(1)))
    );
    assert!(record.output.iter().any(|l| l.line.contains("npm ERR!")));
}

#[tokio::test]
async fn malformed_spec_is_rejected_without_a_job() {
    let harness = build_service(FakeBehavior::Succeed, |_| {});
    let alice = Subject::new("alice");

    let result = harness
        .service
        .submit_install(&alice, spec("Invalid Name!"), vec![])
        .await;
    assert!(matches!(result, Err(keyward::Error::Validation(_))));

    let mut bad_ref = spec("left-pad");
    bad_ref.registry = Some("https://evil.example".to_owned());
    let result = harness.service.submit_install(&alice, bad_ref, vec![]).await;
    assert!(matches!(result, Err(keyward::Error::Validation(_))));

    // Nothing was audited for rejected submissions.
    let trail = harness.service.export_audit(None).expect("export");
    assert!(trail.is_empty());
    assert_eq!(harness.runner.runs(), 0);
}
