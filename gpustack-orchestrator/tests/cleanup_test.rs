// Explicit teardown of persisted stacks.

mod common;

use common::{request, Harness};
use gpustack_common::{DeployError, DeploymentType, Phase, ResourceKind, ResourceRef};
use gpustack_orchestrator::state_machine::{CleanupOutcome, DeployOutcome};
use gpustack_providers::inventory::InfraAllocation;

async fn deployed(h: &Harness, stack: &str) {
    let outcome = h
        .orchestrator()
        .deploy(&request(stack, DeploymentType::Spot, 2.00))
        .await
        .unwrap();
    let DeployOutcome::Monitoring { handle, .. } = outcome else {
        panic!("expected monitoring");
    };
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_releases_and_archives() {
    let h = Harness::new();
    deployed(&h, "done").await;

    let outcome = h.orchestrator().cleanup("done").await.unwrap();
    let CleanupOutcome::Released { report, archived_to } = outcome else {
        panic!("expected released");
    };
    assert!(report.succeeded());
    assert_eq!(report.attempted(), 1);
    assert_eq!(h.cloud.terminated(), h.cloud.instance_ids());

    let archived = archived_to.unwrap();
    assert!(archived.exists());
    assert!(h.store().load("done").unwrap().is_none());
    let raw = std::fs::read_to_string(archived).unwrap();
    let state: gpustack_common::DeploymentState = serde_json::from_str(&raw).unwrap();
    assert_eq!(state.phase, Phase::Terminated);
    assert!(state.resource_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_without_state_is_noop() {
    let h = Harness::new();
    assert_eq!(h.orchestrator().cleanup("never").await.unwrap(), CleanupOutcome::NothingToDo);
    assert!(h.cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_partial_failure_keeps_what_is_left() {
    let allocation = InfraAllocation {
        created: vec![ResourceRef::new(ResourceKind::Storage, "fs-9", "us-east-1")],
        ..InfraAllocation::default()
    };
    let h = Harness::with(|_| {}, allocation);
    deployed(&h, "stuck").await;
    h.cloud.fail_termination_of("i-mock0001");

    let failure = h.orchestrator().cleanup("stuck").await.err().unwrap();
    assert_eq!(
        failure.error,
        DeployError::TeardownPartialFailure {
            failed: 1,
            attempted: 2
        }
    );
    assert_eq!(failure.exit_code(), 3);
    assert_eq!(h.infra.released(), vec!["fs-9".to_string()]);

    let state = h.store().load("stuck").unwrap().unwrap();
    assert_eq!(
        state.resource_ids,
        vec![ResourceRef::new(ResourceKind::Instance, "i-mock0001", "us-east-1")]
    );
    assert_eq!(state.last_error.unwrap().kind, "TeardownPartialFailure");
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_retries_leaked_resources() {
    let h = Harness::new();
    h.cloud.set_running_after(None);
    h.cloud.fail_termination_of("i-mock0001");
    let failure = h
        .orchestrator()
        .deploy(&request("retry", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();
    assert_eq!(failure.exit_code(), 3);

    // termination is still denied: the instance stays owned by the stack
    let failure = h.orchestrator().cleanup("retry").await.err().unwrap();
    assert_eq!(failure.exit_code(), 3);
    assert_eq!(h.cloud.terminated(), vec!["i-mock0001".to_string(), "i-mock0001".to_string()]);
    let state = h.store().load("retry").unwrap().unwrap();
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.resource_ids.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_refuses_names_outside_state_dir() {
    let h = Harness::with(|s| s.state_dir = s.state_dir.join("state"), InfraAllocation::default());
    let outside = h.dir.path().join("outside.json");
    let mut state = gpustack_common::DeploymentState::new("outside", DeploymentType::Spot).unwrap();
    state
        .resource_ids
        .push(ResourceRef::new(ResourceKind::Instance, "i-elsewhere", "us-east-1"));
    std::fs::write(&outside, serde_json::to_vec(&state).unwrap()).unwrap();

    let failure = h.orchestrator().cleanup("../outside").await.err().unwrap();
    assert_eq!(failure.error.kind(), "ValidationFailure");
    assert_eq!(failure.exit_code(), 1);
    assert!(outside.exists());
    assert!(h.cloud.calls().is_empty());
    assert!(h.cloud.terminated().is_empty());

    let failure = h
        .orchestrator()
        .deploy(&request("../outside", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();
    assert_eq!(failure.exit_code(), 1);
    assert!(outside.exists());
}

#[tokio::test(start_paused = true)]
async fn test_redeploy_after_cleanup() {
    let h = Harness::new();
    deployed(&h, "again").await;
    h.orchestrator().cleanup("again").await.unwrap();
    deployed(&h, "again").await;
    assert_eq!(h.cloud.instance_ids().len(), 2);
    assert_eq!(h.store().load("again").unwrap().unwrap().phase, Phase::Monitoring);
}
