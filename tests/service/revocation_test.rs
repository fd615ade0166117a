//! Revocation takes effect before any new sandbox is created.

use keyward::audit::{AuditAction, AuditOutcome};
use keyward::types::{Action, FailureReason, JobOutcome, JobState, SecretId, SecretRef, Subject};
use keyward::vault::SecretValue;

use crate::support::{build_service, spec, wait_terminal, FakeBehavior};

#[tokio::test]
async fn revoked_secret_fails_the_next_job_before_any_sandbox() {
    let harness = build_service(FakeBehavior::Succeed, |_| {});
    let alice = Subject::new("alice");
    let bob = Subject::new("bob");

    let secret_id = harness
        .service
        .store_secret(&alice, "npm-token", None, SecretValue::new("abc123"))
        .await
        .expect("store secret");
    harness
        .service
        .grant(&alice, secret_id, &bob, &[Action::UseInJob], None)
        .await
        .expect("grant");
    harness
        .service
        .revoke_secret(&alice, secret_id)
        .await
        .expect("revoke");

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
    assert_eq!(record.state, JobState::Failed);
    assert!(matches!(
        record.outcome,
        Some(JobOutcome::Failed(FailureReason::Authorization(_)))
    ));
    // The sandbox was never created.
    assert_eq!(harness.runner.runs(), 0);

    let trail = harness.service.export_audit(None).expect("export");
    assert!(trail
        .iter()
        .any(|r| r.action == AuditAction::MaterializeDenied && r.outcome == AuditOutcome::Denied));
    assert!(trail
        .iter()
        .any(|r| r.action == AuditAction::JobFailed && r.outcome == AuditOutcome::Denied));
}

#[tokio::test]
async fn revoked_grant_blocks_the_subject() {
    let harness = build_service(FakeBehavior::Succeed, |_| {});
    let alice = Subject::new("alice");
    let bob = Subject::new("bob");

    let secret_id = harness
        .service
        .store_secret(&alice, "npm-token", None, SecretValue::new("abc123"))
        .await
        .expect("store secret");
    harness
        .service
        .grant(&alice, secret_id, &bob, &[Action::UseInJob], None)
        .await
        .expect("grant");
    harness
        .service
        .revoke_grant(&alice, secret_id, &bob)
        .await
        .expect("revoke grant");

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
    assert!(matches!(
        record.outcome,
        Some(JobOutcome::Failed(FailureReason::Authorization(_)))
    ));
    assert_eq!(harness.runner.runs(), 0);

    // The owner is unaffected.
    let owner_job = harness
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
    let record = wait_terminal(&harness.service, &alice, owner_job).await;
    assert_eq!(record.state, JobState::Succeeded);
}

#[tokio::test]
async fn unknown_secret_ref_is_an_authorization_failure() {
    let harness = build_service(FakeBehavior::Succeed, |_| {});
    let alice = Subject::new("alice");

    let job_id = harness
        .service
        .submit_install(
            &alice,
            spec("left-pad"),
            vec![SecretRef {
                secret_id: SecretId::generate(),
                env_name: "NPM_TOKEN".to_owned(),
            }],
        )
        .await
        .expect("submit");

    let record = wait_terminal(&harness.service, &alice, job_id).await;
    assert!(matches!(
        record.outcome,
        Some(JobOutcome::Failed(FailureReason::Authorization(_)))
    ));
    assert_eq!(harness.runner.runs(), 0);
}
