use gpustack_common::Severity;
use gpustack_providers::inventory::WorkloadTarget;
use gpustack_providers::{CloudProvider, Notifier, WorkloadRuntime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::logger::ActionLog;

/// Slack on top of the stop grace period for the remote round trip.
const STOP_HEADROOM: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// A reclaim notice arrived and the graceful shutdown sequence ran.
    Interrupted,
    Cancelled,
    /// The instance was already gone (torn down elsewhere).
    ResourceGone,
}

/// job-interruption: polls a spot instance for a reclaim notice and runs the
/// shutdown sequence once when one shows up.
pub struct InterruptionMonitor {
    pub provider: Arc<dyn CloudProvider>,
    pub workload: Arc<dyn WorkloadRuntime>,
    pub notifier: Arc<dyn Notifier>,
    pub target: WorkloadTarget,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub shutdown_delay: Duration,
    pub action_log: Option<ActionLog>,
}

impl InterruptionMonitor {
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> MonitorOutcome {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "🐶 [job-interruption] watching {} every {}s",
            self.target.resource_id,
            self.poll_interval.as_secs()
        );

        loop {
            if *cancel.borrow() {
                return MonitorOutcome::Cancelled;
            }
            tokio::select! {
                changed = cancel.changed() => {
                    // a dropped sender means the owner is gone: stop as well
                    if changed.is_err() || *cancel.borrow() {
                        tracing::info!("🛑 [job-interruption] cancelled for {}", self.target.resource_id);
                        return MonitorOutcome::Cancelled;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            match self
                .provider
                .describe_instance(&self.target.region, &self.target.resource_id)
                .await
            {
                Ok(desc) if desc.state.is_gone() => {
                    tracing::info!(
                        "🐶 [job-interruption] {} is {:?}, stopping monitor",
                        self.target.resource_id,
                        desc.state
                    );
                    return MonitorOutcome::ResourceGone;
                }
                Ok(desc) => {
                    if let Some(at) = desc.reclaim_notice {
                        tracing::warn!(
                            "🚨 [job-interruption] reclaim notice for {} at {}",
                            self.target.resource_id,
                            at
                        );
                        self.handle_reclaim().await;
                        return MonitorOutcome::Interrupted;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ [job-interruption] describe {} failed: {:#}",
                        self.target.resource_id,
                        e
                    );
                }
            }
        }
    }

    /// Best-effort shutdown sequence; every step runs regardless of the previous one.
    async fn handle_reclaim(&self) {
        let t = &self.target;
        let log_id = self.action_log.as_ref().map(|l| {
            l.log_event_with_metadata(
                "SPOT_INTERRUPTION",
                "in_progress",
                None,
                Some(serde_json::json!({"resource_id": t.resource_id, "region": t.region})),
            )
        });
        let started = Instant::now();

        self.notifier
            .notify(
                &format!(
                    "Spot interruption for stack {} ({}): stopping workload, host shuts down in {}s",
                    t.stack_name,
                    t.resource_id,
                    self.shutdown_delay.as_secs()
                ),
                Severity::Critical,
            )
            .await;

        let mut failures: Vec<String> = Vec::new();
        let stop_bound = self.stop_grace + STOP_HEADROOM;
        match tokio::time::timeout(stop_bound, self.workload.stop(t, self.stop_grace)).await {
            Ok(Ok(())) => tracing::info!("✅ [job-interruption] workload stopped on {}", t.resource_id),
            Ok(Err(e)) => failures.push(format!("stop: {:#}", e)),
            Err(_) => failures.push(format!(
                "stop: no answer within {}s ({}s grace)",
                stop_bound.as_secs(),
                self.stop_grace.as_secs()
            )),
        }
        if let Err(e) = self.workload.unmount_storage(t).await {
            failures.push(format!("unmount: {:#}", e));
        }
        if let Err(e) = self.workload.schedule_host_shutdown(t, self.shutdown_delay).await {
            failures.push(format!("shutdown: {:#}", e));
        }

        for f in &failures {
            tracing::warn!("⚠️ [job-interruption] {} {}", t.resource_id, f);
        }
        if let (Some(log), Some(id)) = (&self.action_log, log_id) {
            let status = if failures.is_empty() { "success" } else { "partial" };
            let err = (!failures.is_empty()).then(|| failures.join("; "));
            log.log_event_complete(
                id,
                "SPOT_INTERRUPTION",
                status,
                started.elapsed().as_millis() as u64,
                err.as_deref(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpustack_common::{Architecture, Market};
    use gpustack_providers::inventory::{InfraAllocation, InstanceSpec, InstanceState};
    use gpustack_providers::mock::{MockCloud, MockNotifier, MockWorkload, WorkloadCall};

    async fn running_instance(cloud: &MockCloud) -> String {
        let spec = InstanceSpec {
            stack_name: "demo".into(),
            client_token: "tok".into(),
            region: "us-east-1".into(),
            availability_zone: "us-east-1a".into(),
            instance_type: "g4dn.xlarge".into(),
            architecture: Architecture::X86_64,
            image_id: "ami-1".into(),
            market: Market::Spot,
            max_price: Some(0.75),
            infra: InfraAllocation::default(),
            root_volume_gb: 100,
        };
        cloud.create_instance(&spec).await.unwrap()
    }

    fn monitor(
        cloud: Arc<MockCloud>,
        workload: Arc<MockWorkload>,
        notifier: Arc<MockNotifier>,
        id: &str,
    ) -> InterruptionMonitor {
        InterruptionMonitor {
            provider: cloud,
            workload,
            notifier,
            target: WorkloadTarget {
                stack_name: "demo".into(),
                resource_id: id.into(),
                region: "us-east-1".into(),
                address: Some("127.0.0.1".into()),
            },
            poll_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(30),
            shutdown_delay: Duration::from_secs(60),
            action_log: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_runs_shutdown_sequence_once() {
        let cloud = Arc::new(MockCloud::new());
        let workload = Arc::new(MockWorkload::new());
        let notifier = Arc::new(MockNotifier::new());
        let id = running_instance(&cloud).await;
        let (_tx, rx) = watch::channel(false);

        let handle = tokio::spawn(monitor(cloud.clone(), workload.clone(), notifier.clone(), &id).run(rx));
        tokio::time::sleep(Duration::from_secs(12)).await;
        cloud.announce_reclaim();

        assert_eq!(handle.await.unwrap(), MonitorOutcome::Interrupted);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Severity::Critical);
        assert_eq!(
            workload.calls(),
            vec![
                WorkloadCall::Stop {
                    resource_id: id.clone(),
                    grace_period: Duration::from_secs(30)
                },
                WorkloadCall::Unmount { resource_id: id.clone() },
                WorkloadCall::ScheduleShutdown {
                    resource_id: id,
                    delay: Duration::from_secs(60)
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_stop_does_not_skip_later_steps() {
        let cloud = Arc::new(MockCloud::new());
        let workload = Arc::new(MockWorkload::new());
        workload.fail_stop("ssh: connection refused");
        let notifier = Arc::new(MockNotifier::new());
        let id = running_instance(&cloud).await;
        cloud.announce_reclaim();
        let (_tx, rx) = watch::channel(false);

        let outcome = monitor(cloud, workload.clone(), notifier, &id).run(rx).await;
        assert_eq!(outcome, MonitorOutcome::Interrupted);
        assert_eq!(workload.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stop_gets_headroom_past_the_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(MockCloud::new());
        let id = running_instance(&cloud).await;
        cloud.announce_reclaim();
        let (_tx, rx) = watch::channel(false);

        // ssh connect plus the container grace period overruns the bare grace
        let workload = Arc::new(MockWorkload::new());
        workload.delay_stop(Duration::from_secs(40));
        let mut m = monitor(cloud.clone(), workload, Arc::new(MockNotifier::new()), &id);
        m.action_log = Some(ActionLog::new(dir.path(), "demo"));
        assert_eq!(m.run(rx.clone()).await, MonitorOutcome::Interrupted);

        // a stop that never answers is still cut off
        let workload = Arc::new(MockWorkload::new());
        workload.delay_stop(Duration::from_secs(3600));
        let mut m = monitor(cloud, workload.clone(), Arc::new(MockNotifier::new()), &id);
        m.action_log = Some(ActionLog::new(dir.path(), "demo"));
        assert_eq!(m.run(rx).await, MonitorOutcome::Interrupted);
        assert_eq!(workload.calls().len(), 3);

        let done: Vec<_> = ActionLog::new(dir.path(), "demo")
            .read_all()
            .unwrap()
            .into_iter()
            .filter(|r| r.action_type == "SPOT_INTERRUPTION" && r.status != "in_progress")
            .collect();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].status, "success");
        assert_eq!(done[1].status, "partial");
        assert!(done[1].error_message.as_deref().unwrap().contains("no answer within 60s"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_quietly() {
        let cloud = Arc::new(MockCloud::new());
        let workload = Arc::new(MockWorkload::new());
        let notifier = Arc::new(MockNotifier::new());
        let id = running_instance(&cloud).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(monitor(cloud, workload.clone(), notifier.clone(), &id).run(rx));
        tokio::time::sleep(Duration::from_secs(7)).await;
        tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), MonitorOutcome::Cancelled);
        assert!(workload.calls().is_empty());
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gone_instance_ends_monitor() {
        let cloud = Arc::new(MockCloud::new());
        let id = running_instance(&cloud).await;
        cloud.force_state(&id, InstanceState::Terminated);
        let (_tx, rx) = watch::channel(false);

        let outcome = monitor(
            cloud,
            Arc::new(MockWorkload::new()),
            Arc::new(MockNotifier::new()),
            &id,
        )
        .run(rx)
        .await;
        assert_eq!(outcome, MonitorOutcome::ResourceGone);
    }
}
