// End-to-end deployment runs against the mock provider.
// Time is paused: provisioning polls and health retries advance instantly.

mod common;

use common::{request, Harness};
use gpustack_common::{
    Architecture, DeployError, DeploymentType, Phase, PhaseOutcome, ResourceKind, ResourceRef, Severity,
};
use gpustack_orchestrator::interruption_monitor::MonitorOutcome;
use gpustack_orchestrator::logger::ActionLog;
use gpustack_orchestrator::state_machine::DeployOutcome;
use gpustack_providers::inventory::InfraAllocation;
use gpustack_providers::mock::{CreateBehavior, MockCall, WorkloadCall};
use std::time::Duration;
use tokio::sync::watch;

/// Phases never move backwards; `failed` may only appear last.
fn assert_monotonic(phases: &[Phase]) {
    for pair in phases.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b == Phase::Failed || b == Phase::Terminated {
            continue;
        }
        assert!(b.ordinal() == a.ordinal() + 1, "{} -> {} in {:?}", a, b, phases);
    }
    if let Some(pos) = phases.iter().position(|p| *p == Phase::Failed) {
        assert!(phases[pos + 1..].iter().all(|p| *p == Phase::Terminated));
    }
}

#[tokio::test(start_paused = true)]
async fn test_spot_deploy_reaches_monitoring() {
    let h = Harness::new();
    let outcome = h
        .orchestrator()
        .deploy(&request("happy", DeploymentType::Spot, 2.00))
        .await
        .unwrap();
    let DeployOutcome::Monitoring { state, health, handle } = outcome else {
        panic!("expected monitoring");
    };

    assert_eq!(state.phase, Phase::Monitoring);
    assert_eq!(state.phases_visited(), Phase::FORWARD.to_vec());
    assert_eq!(state.public_address.as_deref(), Some("127.0.0.1"));
    assert_eq!(state.selection.as_ref().unwrap().chosen.instance_type, "typeB");
    assert_eq!(health.len(), 2);
    assert!(health.overall_healthy());
    assert!(handle.has_interruption_monitor());
    assert!(!handle.has_revalidation());

    let id = h.cloud.instance_ids().remove(0);
    assert_eq!(state.resource_ids, vec![ResourceRef::new(ResourceKind::Instance, id.clone(), "us-east-1")]);
    assert!(h.cloud.calls().contains(&MockCall::PushBootstrap { resource_id: id.clone() }));
    assert_eq!(
        h.workload.calls(),
        vec![WorkloadCall::Start {
            resource_id: id,
            project_name: "happy".into()
        }]
    );

    let persisted = h.store().load("happy").unwrap().unwrap();
    assert_eq!(persisted.phase, Phase::Monitoring);
    let sent = h.notifier.sent();
    assert_eq!(sent.last().map(|(_, s)| *s), Some(Severity::Info));

    let log = ActionLog::new(h.dir.path(), "happy").read_all().unwrap();
    let transitions = log.iter().filter(|r| r.action_type == "PHASE_TRANSITION").count();
    assert_eq!(transitions, 5);

    assert_eq!(handle.shutdown().await, Some(MonitorOutcome::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_client_token_recorded_before_create() {
    let h = Harness::new();
    h.cloud.set_create_behavior(CreateBehavior::Fail);
    let failure = h
        .orchestrator()
        .deploy(&request("token", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();
    assert!(matches!(failure.error, DeployError::ProvisioningFailure(_)));

    let token = h
        .cloud
        .calls()
        .into_iter()
        .find_map(|c| match c {
            MockCall::CreateInstance { client_token, .. } => Some(client_token),
            _ => None,
        })
        .unwrap();
    assert!(token.starts_with("token-"));
    assert!(token.len() <= 64);

    let state = h.store().load("token").unwrap().unwrap();
    assert_eq!(state.resource_ids, vec![ResourceRef::pending_instance(token.clone(), "us-east-1")]);
    assert!(h.cloud.calls().contains(&MockCall::FindByClientToken { client_token: token }));
    assert!(failure.teardown.as_ref().unwrap().succeeded());
    assert_eq!(failure.exit_code(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_provision_timeout_tears_down() {
    let h = Harness::new();
    h.cloud.set_running_after(None);
    let failure = h
        .orchestrator()
        .deploy(&request("slow", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();

    assert_eq!(failure.phase, Phase::Provisioning);
    assert!(matches!(
        failure.error,
        DeployError::ProvisioningTimeout { waited_secs: 600, .. }
    ));
    let report = failure.teardown.clone().unwrap();
    assert_eq!(report.attempted(), 1);
    assert!(report.succeeded());
    assert_eq!(h.cloud.terminated(), h.cloud.instance_ids());
    assert_eq!(h.cloud.terminated().len(), 1);
    assert_eq!(failure.exit_code(), 2);

    let state = h.store().load("slow").unwrap().unwrap();
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.last_error.as_ref().unwrap().kind, "ProvisioningTimeout");
    assert_eq!(state.last_error.as_ref().unwrap().phase, Phase::Provisioning);
    assert_eq!(state.resource_ids.len(), 1);
    assert_monotonic(&state.phases_visited());
}

#[tokio::test(start_paused = true)]
async fn test_scenario_e_one_service_never_healthy() {
    let h = Harness::new();
    h.probe.hang_on(":6333");
    let failure = h
        .orchestrator()
        .deploy(&request("sick", DeploymentType::OnDemand, 5.00))
        .await
        .err()
        .unwrap();

    assert_eq!(failure.phase, Phase::HealthChecking);
    assert_eq!(
        failure.error,
        DeployError::HealthCheckFailure {
            unhealthy: vec!["qdrant".to_string()]
        }
    );
    let matrix = failure.health.clone().unwrap();
    assert_eq!(matrix.len(), 2);
    assert_eq!(matrix.get("n8n").unwrap().status, gpustack_common::HealthStatus::Healthy);
    assert_eq!(matrix.get("qdrant").unwrap().status, gpustack_common::HealthStatus::Unhealthy);
    assert_eq!(matrix.get("qdrant").unwrap().attempt_count, 5);
    assert_eq!(h.probe.call_count(":6333"), 5);
    assert!(!matrix.overall_healthy());

    assert_eq!(h.cloud.terminated().len(), 1);
    assert_eq!(failure.exit_code(), 2);
    let state = h.store().load("sick").unwrap().unwrap();
    assert_eq!(state.phase, Phase::Failed);
    assert_monotonic(&state.phases_visited());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_reverse_order_exactly_once() {
    let allocation = InfraAllocation {
        created: vec![
            ResourceRef::new(ResourceKind::Storage, "fs-1", "us-east-1"),
            ResourceRef::new(ResourceKind::Network, "sg-1", "us-east-1"),
        ],
        ..InfraAllocation::default()
    };
    let h = Harness::with(|_| {}, allocation);
    h.cloud.fail_bootstrap("ssm agent offline");
    let failure = h
        .orchestrator()
        .deploy(&request("order", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();

    assert_eq!(failure.phase, Phase::Configuring);
    assert!(matches!(failure.error, DeployError::ConfigurationFailure(_)));
    let report = failure.teardown.unwrap();
    let ids: Vec<&str> = report.outcomes.iter().map(|o| o.resource.id.as_str()).collect();
    assert_eq!(ids, vec!["i-mock0001", "sg-1", "fs-1"]);
    assert_eq!(h.cloud.terminated(), vec!["i-mock0001".to_string()]);
    assert_eq!(h.infra.released(), vec!["sg-1".to_string(), "fs-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_workload_start_failure_tears_down() {
    let allocation = InfraAllocation {
        created: vec![ResourceRef::new(ResourceKind::Storage, "fs-2", "us-east-1")],
        ..InfraAllocation::default()
    };
    let h = Harness::with(|_| {}, allocation);
    h.workload.fail_start("compose pull: manifest unknown");
    let failure = h
        .orchestrator()
        .deploy(&request("nostart", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();

    assert_eq!(failure.phase, Phase::Deploying);
    match &failure.error {
        DeployError::ConfigurationFailure(msg) => assert!(msg.contains("manifest unknown"), "{}", msg),
        other => panic!("unexpected error {:?}", other),
    }
    let report = failure.teardown.clone().unwrap();
    let ids: Vec<&str> = report.outcomes.iter().map(|o| o.resource.id.as_str()).collect();
    assert_eq!(ids, vec!["i-mock0001", "fs-2"]);
    assert!(report.succeeded());
    assert_eq!(failure.exit_code(), 2);
    assert!(h.probe.calls.lock().unwrap().is_empty());

    let state = h.store().load("nostart").unwrap().unwrap();
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(state.last_error.as_ref().unwrap().phase, Phase::Deploying);
    assert_monotonic(&state.phases_visited());
}

#[tokio::test(start_paused = true)]
async fn test_infra_release_failure_still_attempts_the_rest() {
    let allocation = InfraAllocation {
        created: vec![
            ResourceRef::new(ResourceKind::Storage, "fs-1", "us-east-1"),
            ResourceRef::new(ResourceKind::Network, "sg-1", "us-east-1"),
        ],
        ..InfraAllocation::default()
    };
    let h = Harness::with(|_| {}, allocation);
    h.cloud.fail_bootstrap("cloud-init exited 1");
    h.infra.fail_release_of("sg-1");
    let failure = h
        .orchestrator()
        .deploy(&request("sticky", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();

    let report = failure.teardown.clone().unwrap();
    assert_eq!(report.attempted(), 3);
    assert_eq!(report.failed_count(), 1);
    let failed: Vec<&str> = report
        .outcomes
        .iter()
        .filter(|o| !o.released)
        .map(|o| o.resource.id.as_str())
        .collect();
    assert_eq!(failed, vec!["sg-1"]);
    assert_eq!(h.cloud.terminated(), vec!["i-mock0001".to_string()]);
    assert_eq!(h.infra.released(), vec!["sg-1".to_string(), "fs-1".to_string()]);
    assert_eq!(failure.exit_code(), 3);
    assert!(h.notifier.sent().iter().any(|(_, sev)| *sev == Severity::Critical));
}

#[tokio::test(start_paused = true)]
async fn test_image_gone_before_commit_is_validation_failure() {
    let h = Harness::new();
    // the collector sees the image once, the commit-time check does not
    h.cloud.expire_image_after("us-east-1", Architecture::X86_64, 1);
    let failure = h
        .orchestrator()
        .deploy(&request("noimage", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();

    assert_eq!(failure.phase, Phase::Validating);
    assert_eq!(failure.error.kind(), "ValidationFailure");
    assert_eq!(failure.exit_code(), 1);
    assert!(failure.teardown.is_none());
    assert!(h.cloud.instance_ids().is_empty());
    assert!(!h
        .cloud
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::CreateInstance { .. })));

    // with no image at all the region offers nothing
    let h = Harness::new();
    h.cloud.remove_image("us-east-1", Architecture::X86_64);
    let failure = h
        .orchestrator()
        .deploy(&request("noimage", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();
    assert_eq!(failure.error.kind(), "NoCapacityAvailable");
    assert_eq!(failure.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_health_checks_target_the_reported_address() {
    let h = Harness::new();
    h.cloud.set_public_address("203.0.113.7");
    let outcome = h
        .orchestrator()
        .deploy(&request("addr", DeploymentType::OnDemand, 5.00))
        .await
        .unwrap();
    let DeployOutcome::Monitoring { state, handle, .. } = outcome else {
        panic!("expected monitoring");
    };
    assert_eq!(state.public_address.as_deref(), Some("203.0.113.7"));
    assert_eq!(h.probe.call_count("http://203.0.113.7:5678/"), 1);
    assert_eq!(h.probe.call_count("http://203.0.113.7:6333/"), 1);
    assert_eq!(h.probe.call_count("127.0.0.1"), 0);
    assert_eq!(
        h.store().load("addr").unwrap().unwrap().public_address.as_deref(),
        Some("203.0.113.7")
    );
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_teardown_exits_three() {
    let h = Harness::new();
    h.cloud.set_running_after(None);
    h.cloud.fail_termination_of("i-mock0001");
    let failure = h
        .orchestrator()
        .deploy(&request("leak", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();

    assert!(!failure.teardown.as_ref().unwrap().succeeded());
    assert_eq!(failure.exit_code(), 3);
    assert!(h
        .notifier
        .sent()
        .iter()
        .any(|(msg, sev)| *sev == Severity::Critical && msg.contains("leak")));
}

#[tokio::test(start_paused = true)]
async fn test_validate_only_creates_nothing() {
    let h = Harness::new();
    let mut req = request("dry", DeploymentType::Spot, 2.00);
    req.validate_only = true;
    let outcome = h.orchestrator().deploy(&req).await.unwrap();
    let DeployOutcome::Validated { selection } = outcome else {
        panic!("expected validated");
    };
    assert_eq!(selection.chosen.instance_type, "typeB");
    assert!(h.cloud.instance_ids().is_empty());

    let state = h.store().load("dry").unwrap().unwrap();
    assert_eq!(state.phase, Phase::Validating);
    assert_eq!(state.phase_history.last().unwrap().outcome, PhaseOutcome::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_quota_shortfall_is_validation_failure() {
    let h = Harness::new();
    h.cloud.set_quota(Some(4.0));
    let failure = h
        .orchestrator()
        .deploy(&request("quota", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();
    assert_eq!(failure.phase, Phase::Validating);
    assert!(matches!(failure.error, DeployError::ValidationFailure(_)));
    assert!(failure.teardown.is_none());
    assert_eq!(failure.exit_code(), 1);
    assert!(h.cloud.instance_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lost_create_response_is_found_by_token() {
    let h = Harness::new();
    h.cloud.set_create_behavior(CreateBehavior::FailAfterCreate);
    let failure = h
        .orchestrator()
        .deploy(&request("lost", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();
    assert!(matches!(failure.error, DeployError::ProvisioningFailure(_)));
    assert_eq!(h.cloud.instance_ids().len(), 1);
    assert_eq!(h.cloud.terminated(), h.cloud.instance_ids());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_provisioning_tears_down() {
    let h = Harness::new();
    h.cloud.set_running_after(None);
    let orchestrator = h.orchestrator();
    let task = tokio::spawn(async move {
        orchestrator
            .deploy(&request("abort", DeploymentType::Spot, 2.00))
            .await
            .err()
    });
    tokio::time::sleep(Duration::from_secs(35)).await;
    h.cancel.send(true).unwrap();

    let failure = task.await.unwrap().unwrap();
    assert_eq!(failure.error, DeployError::Cancelled);
    assert_eq!(failure.phase, Phase::Provisioning);
    assert_eq!(failure.exit_code(), 2);
    assert_eq!(h.cloud.terminated().len(), 1);
    let state = h.store().load("abort").unwrap().unwrap();
    assert_eq!(state.last_error.unwrap().kind, "Cancelled");
}

#[tokio::test(start_paused = true)]
async fn test_ondemand_runs_without_interruption_monitor() {
    let h = Harness::new();
    let outcome = h
        .orchestrator()
        .deploy(&request("steady", DeploymentType::OnDemand, 5.00))
        .await
        .unwrap();
    let DeployOutcome::Monitoring { handle, state, .. } = outcome else {
        panic!("expected monitoring");
    };
    assert!(!handle.has_interruption_monitor());
    assert_eq!(state.selection.unwrap().chosen.market, gpustack_common::Market::OnDemand);
    assert_eq!(handle.shutdown().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_reclaim_notice_stops_workload() {
    let h = Harness::new();
    let outcome = h
        .orchestrator()
        .deploy(&request("reclaim", DeploymentType::Spot, 2.00))
        .await
        .unwrap();
    let DeployOutcome::Monitoring { handle, .. } = outcome else {
        panic!("expected monitoring");
    };
    h.cloud.announce_reclaim();

    let (_stop_tx, stop_rx) = watch::channel(false);
    assert_eq!(handle.wait(stop_rx).await, Some(MonitorOutcome::Interrupted));
    let calls = h.workload.calls();
    assert_eq!(calls.len(), 4);
    assert!(matches!(calls[1], WorkloadCall::Stop { .. }));
    assert!(matches!(calls[2], WorkloadCall::Unmount { .. }));
    assert!(matches!(calls[3], WorkloadCall::ScheduleShutdown { .. }));
    assert!(h.notifier.sent().iter().any(|(_, s)| *s == Severity::Critical));
}

#[tokio::test(start_paused = true)]
async fn test_revalidation_warns_when_service_degrades() {
    let h = Harness::with(
        |s| s.timings.revalidation_interval_secs = 300,
        InfraAllocation::default(),
    );
    let outcome = h
        .orchestrator()
        .deploy(&request("reval", DeploymentType::OnDemand, 5.00))
        .await
        .unwrap();
    let DeployOutcome::Monitoring { handle, .. } = outcome else {
        panic!("expected monitoring");
    };
    assert!(handle.has_revalidation());
    h.probe.hang_on(":5678");
    tokio::time::sleep(Duration::from_secs(500)).await;

    assert!(h
        .notifier
        .sent()
        .iter()
        .any(|(msg, sev)| *sev == Severity::Warning && msg.contains("n8n")));
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_live_stack_is_not_overwritten() {
    let h = Harness::new();
    let first = h
        .orchestrator()
        .deploy(&request("twice", DeploymentType::Spot, 2.00))
        .await
        .unwrap();
    if let DeployOutcome::Monitoring { handle, .. } = first {
        handle.shutdown().await;
    }

    let failure = h
        .orchestrator()
        .deploy(&request("twice", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();
    assert!(matches!(failure.error, DeployError::ValidationFailure(ref m) if m.contains("--cleanup")));
    assert_eq!(failure.exit_code(), 1);
    assert_eq!(h.cloud.instance_ids().len(), 1);
    assert_eq!(h.store().load("twice").unwrap().unwrap().phase, Phase::Monitoring);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_stack_name_rejected() {
    let h = Harness::new();
    let failure = h
        .orchestrator()
        .deploy(&request("bad name!", DeploymentType::Spot, 2.00))
        .await
        .err()
        .unwrap();
    assert!(matches!(failure.error, DeployError::ValidationFailure(_)));
    assert!(h.cloud.calls().is_empty());
}
