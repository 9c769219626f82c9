use gpustack_common::{ReleaseOutcome, ResourceKind, ResourceRef, TeardownReport};
use gpustack_providers::{CloudProvider, InfraProvisioner};
use std::time::Duration;
use tokio::time::Instant;

use crate::logger::ActionLog;

/// job-terminator: releases resources in the order given, one attempt each.
pub struct Terminator<'a> {
    provider: &'a dyn CloudProvider,
    infra: &'a dyn InfraProvisioner,
    action_log: Option<&'a ActionLog>,
    release_timeout: Duration,
}

impl<'a> Terminator<'a> {
    pub fn new(provider: &'a dyn CloudProvider, infra: &'a dyn InfraProvisioner) -> Self {
        Self {
            provider,
            infra,
            action_log: None,
            release_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_action_log(mut self, log: &'a ActionLog) -> Self {
        self.action_log = Some(log);
        self
    }

    /// Failures are collected, never short-circuit: every resource gets its attempt.
    pub async fn release_all<'r>(&self, resources: impl IntoIterator<Item = &'r ResourceRef>) -> TeardownReport {
        let mut report = TeardownReport::default();
        for resource in resources {
            let started = Instant::now();
            let log_id = self.action_log.map(|l| {
                l.log_event_with_metadata(
                    "RELEASE_RESOURCE",
                    "in_progress",
                    None,
                    Some(serde_json::json!({
                        "kind": resource.kind.as_str(),
                        "id": resource.id,
                        "region": resource.region,
                        "pending": resource.pending,
                    })),
                )
            });

            let result = match tokio::time::timeout(self.release_timeout, self.release_one(resource)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow::anyhow!(
                    "release timed out after {}s",
                    self.release_timeout.as_secs()
                )),
            };
            let elapsed = started.elapsed().as_millis() as u64;
            let outcome = match result {
                Ok(()) => {
                    println!("🗑️ [job-terminator] released {}", resource);
                    ReleaseOutcome {
                        resource: resource.clone(),
                        released: true,
                        error: None,
                    }
                }
                Err(e) => {
                    eprintln!("❌ [job-terminator] failed to release {}: {:#}", resource, e);
                    ReleaseOutcome {
                        resource: resource.clone(),
                        released: false,
                        error: Some(format!("{:#}", e)),
                    }
                }
            };
            if let (Some(log), Some(id)) = (self.action_log, log_id) {
                let status = if outcome.released { "success" } else { "failed" };
                log.log_event_complete(id, "RELEASE_RESOURCE", status, elapsed, outcome.error.as_deref());
            }
            report.outcomes.push(outcome);
        }
        report
    }

    async fn release_one(&self, resource: &ResourceRef) -> anyhow::Result<()> {
        match resource.kind {
            ResourceKind::Instance if resource.pending => {
                // the create request may or may not have produced an instance
                match self
                    .provider
                    .find_by_client_token(&resource.region, &resource.id)
                    .await?
                {
                    Some(id) => self.provider.terminate_instance(&resource.region, &id).await,
                    None => Ok(()),
                }
            }
            ResourceKind::Instance => {
                self.provider
                    .terminate_instance(&resource.region, &resource.id)
                    .await
            }
            ResourceKind::Storage | ResourceKind::Network => self.infra.release(resource).await,
        }
    }
}

pub fn render_report(report: &TeardownReport) -> String {
    let mut out = String::new();
    for o in &report.outcomes {
        match &o.error {
            None => out.push_str(&format!("  released  {}\n", o.resource)),
            Some(e) => out.push_str(&format!("  FAILED    {}: {}\n", o.resource, e)),
        }
    }
    out
}
