// Shared fixtures for the orchestrator integration tests.
// Every test runs against the in-memory mock provider.
#![allow(dead_code)]

use async_trait::async_trait;
use gpustack_common::{Architecture, DeploymentType, Market};
use gpustack_orchestrator::config::Settings;
use gpustack_orchestrator::health_check::EndpointProbe;
use gpustack_orchestrator::state_machine::{Collaborators, DeployRequest, Orchestrator};
use gpustack_orchestrator::state_store::StateStore;
use gpustack_providers::inventory::InfraAllocation;
use gpustack_providers::mock::{MockCloud, MockInfra, MockNotifier, MockWorkload};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

pub const REGION: &str = "us-east-1";

/// Two x86_64 types: typeA at $0.50 scores 70/$, typeB at $0.90 scores 85/$.
pub const SETTINGS_TOML: &str = r#"
provider = "mock"
default_region = "us-east-1"
cross_regions = ["us-east-1"]
architecture_preference = ["x86_64", "arm64"]

[[profiles]]
instance_type = "typeA"
architecture = "x86_64"
performance_score = 35.0
vcpus = 4
on_demand_price = 1.00

[[profiles]]
instance_type = "typeB"
architecture = "x86_64"
performance_score = 76.5
vcpus = 8
on_demand_price = 2.00

[health]
max_attempts = 5
per_try_timeout_secs = 10
base_delay_secs = 2
overall_timeout_secs = 600

[[health.services]]
name = "n8n"
endpoint = "http://{host}:5678/healthz"

[[health.services]]
name = "qdrant"
endpoint = "http://{host}:6333/healthz"
"#;

/// Probe that answers immediately for healthy URLs and hangs for the rest.
pub struct ScriptedProbe {
    unhealthy: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self {
            unhealthy: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Any URL containing `fragment` never answers.
    pub fn hang_on(&self, fragment: &str) {
        self.unhealthy.lock().unwrap().insert(fragment.to_string());
    }

    pub fn call_count(&self, fragment: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.contains(fragment))
            .count()
    }
}

#[async_trait]
impl EndpointProbe for ScriptedProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), String> {
        self.calls.lock().unwrap().push(url.to_string());
        let hangs = self
            .unhealthy
            .lock()
            .unwrap()
            .iter()
            .any(|f| url.contains(f.as_str()));
        if hangs {
            tokio::time::sleep(timeout * 2).await;
            return Err("no answer".into());
        }
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub settings: Arc<Settings>,
    pub cloud: Arc<MockCloud>,
    pub infra: Arc<MockInfra>,
    pub workload: Arc<MockWorkload>,
    pub notifier: Arc<MockNotifier>,
    pub probe: Arc<ScriptedProbe>,
    pub cancel: watch::Sender<bool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {}, InfraAllocation::default())
    }

    pub fn with(tweak: impl FnOnce(&mut Settings), allocation: InfraAllocation) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_toml_str(SETTINGS_TOML).unwrap();
        settings.state_dir = dir.path().to_path_buf();
        tweak(&mut settings);
        settings.validate().unwrap();

        let cloud = MockCloud::new();
        cloud.add_price(REGION, "typeA", "us-east-1a", 0.50, Market::Spot);
        cloud.add_price(REGION, "typeB", "us-east-1b", 0.90, Market::Spot);
        cloud.add_price(REGION, "typeA", "us-east-1a", 1.00, Market::OnDemand);
        cloud.add_price(REGION, "typeB", "us-east-1b", 2.00, Market::OnDemand);
        cloud.add_image(REGION, Architecture::X86_64, "ami-x86");

        let (cancel, _) = watch::channel(false);
        Self {
            dir,
            settings: Arc::new(settings),
            cloud: Arc::new(cloud),
            infra: Arc::new(MockInfra::new(allocation)),
            workload: Arc::new(MockWorkload::new()),
            notifier: Arc::new(MockNotifier::new()),
            probe: Arc::new(ScriptedProbe::healthy()),
            cancel,
        }
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.settings.state_dir.clone())
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let collab = Collaborators {
            provider: self.cloud.clone(),
            infra: self.infra.clone(),
            workload: self.workload.clone(),
            notifier: self.notifier.clone(),
            probe: self.probe.clone(),
        };
        Orchestrator::new(self.settings.clone(), collab, self.store(), self.cancel.subscribe())
    }
}

pub fn request(stack: &str, deployment_type: DeploymentType, max_price: f64) -> DeployRequest {
    DeployRequest {
        stack_name: stack.to_string(),
        deployment_type,
        max_price,
        regions: vec![REGION.to_string()],
        validate_only: false,
    }
}
