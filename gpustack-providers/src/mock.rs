//! In-memory collaborators for dry runs and tests.
//!
//! Every mock records the calls it receives so callers can assert on ordering,
//! and exposes `&self` setters so behavior can change while a deployment runs.
use crate::inventory::{
    InfraAllocation, InstanceDescription, InstanceSpec, InstanceState, PriceSample, WorkloadConfig,
    WorkloadTarget,
};
use crate::{CloudProvider, InfraProvisioner, Notifier, TransientError, WorkloadRuntime};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpustack_common::{Architecture, Market, ResourceRef, Severity};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum MockCall {
    ListPrices { region: String, market: Market },
    ResolveImage { region: String, architecture: Architecture },
    CreateInstance { client_token: String, instance_type: String, availability_zone: String },
    FindByClientToken { client_token: String },
    Describe { resource_id: String },
    Terminate { resource_id: String },
    PushBootstrap { resource_id: String },
    VcpuQuota { region: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateBehavior {
    Succeed,
    Fail,
    /// The instance is created but the response is lost.
    FailAfterCreate,
}

#[derive(Clone, Debug)]
struct PriceFailure {
    remaining: u32,
    transient: bool,
}

#[derive(Clone, Debug)]
struct MockInstance {
    client_token: String,
    describes: u32,
    forced_state: Option<InstanceState>,
}

struct CloudState {
    prices: HashMap<String, Vec<PriceSample>>,
    price_failures: HashMap<String, PriceFailure>,
    images: HashMap<(String, Architecture), String>,
    image_lookups_left: HashMap<(String, Architecture), u32>,
    create_behavior: CreateBehavior,
    running_after: Option<u32>,
    reclaim_notice: Option<DateTime<Utc>>,
    public_address: String,
    terminate_failures: HashSet<String>,
    bootstrap_error: Option<String>,
    quota: Option<f64>,
    instances: HashMap<String, MockInstance>,
    next_id: u32,
    calls: Vec<MockCall>,
}

pub struct MockCloud {
    state: Mutex<CloudState>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CloudState {
                prices: HashMap::new(),
                price_failures: HashMap::new(),
                images: HashMap::new(),
                image_lookups_left: HashMap::new(),
                create_behavior: CreateBehavior::Succeed,
                running_after: Some(1),
                reclaim_notice: None,
                public_address: "127.0.0.1".to_string(),
                terminate_failures: HashSet::new(),
                bootstrap_error: None,
                quota: None,
                instances: HashMap::new(),
                next_id: 0,
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        // a poisoned lock only means a test panicked mid-call; the data is still usable
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_price(&self, region: &str, instance_type: &str, az: &str, price: f64, market: Market) {
        self.add_price_at(region, instance_type, az, price, market, Utc::now());
    }

    pub fn add_price_at(
        &self,
        region: &str,
        instance_type: &str,
        az: &str,
        price: f64,
        market: Market,
        sampled_at: DateTime<Utc>,
    ) {
        self.lock()
            .prices
            .entry(region.to_string())
            .or_default()
            .push(PriceSample {
                instance_type: instance_type.to_string(),
                availability_zone: az.to_string(),
                hourly_price: price,
                market,
                sampled_at,
            });
    }

    /// Fail the next `times` price queries for `region`.
    pub fn fail_prices(&self, region: &str, times: u32, transient: bool) {
        self.lock().price_failures.insert(
            region.to_string(),
            PriceFailure {
                remaining: times,
                transient,
            },
        );
    }

    pub fn add_image(&self, region: &str, architecture: Architecture, image_id: &str) {
        self.lock()
            .images
            .insert((region.to_string(), architecture), image_id.to_string());
    }

    pub fn remove_image(&self, region: &str, architecture: Architecture) {
        self.lock().images.remove(&(region.to_string(), architecture));
    }

    /// The image resolves for `lookups` more queries, then is gone.
    pub fn expire_image_after(&self, region: &str, architecture: Architecture, lookups: u32) {
        self.lock()
            .image_lookups_left
            .insert((region.to_string(), architecture), lookups);
    }

    pub fn set_create_behavior(&self, behavior: CreateBehavior) {
        self.lock().create_behavior = behavior;
    }

    /// Report `running` from the n-th describe of an instance on; `None` never does.
    pub fn set_running_after(&self, describes: Option<u32>) {
        self.lock().running_after = describes;
    }

    pub fn announce_reclaim(&self) {
        self.lock().reclaim_notice = Some(Utc::now());
    }

    pub fn set_public_address(&self, address: &str) {
        self.lock().public_address = address.to_string();
    }

    pub fn fail_termination_of(&self, resource_id: &str) {
        self.lock().terminate_failures.insert(resource_id.to_string());
    }

    pub fn fail_bootstrap(&self, message: &str) {
        self.lock().bootstrap_error = Some(message.to_string());
    }

    pub fn set_quota(&self, quota: Option<f64>) {
        self.lock().quota = quota;
    }

    pub fn force_state(&self, resource_id: &str, state: InstanceState) {
        if let Some(inst) = self.lock().instances.get_mut(resource_id) {
            inst.forced_state = Some(state);
        }
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Terminate { resource_id } => Some(resource_id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn list_prices(
        &self,
        instance_types: &[String],
        region: &str,
        market: Market,
    ) -> Result<Vec<PriceSample>> {
        let mut st = self.lock();
        st.calls.push(MockCall::ListPrices {
            region: region.to_string(),
            market,
        });
        if let Some(failure) = st.price_failures.get_mut(region) {
            if failure.remaining > 0 {
                failure.remaining -= 1;
                let msg = format!("mock price query failed for {}", region);
                return if failure.transient {
                    Err(TransientError(msg).into())
                } else {
                    Err(anyhow::anyhow!(msg))
                };
            }
        }
        Ok(st
            .prices
            .get(region)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.market == market && instance_types.contains(&s.instance_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn resolve_image(&self, region: &str, architecture: Architecture) -> Result<Option<String>> {
        let mut st = self.lock();
        st.calls.push(MockCall::ResolveImage {
            region: region.to_string(),
            architecture,
        });
        let key = (region.to_string(), architecture);
        let found = st.images.get(&key).cloned();
        let exhausted = match st.image_lookups_left.get_mut(&key) {
            Some(left) => {
                *left = left.saturating_sub(1);
                *left == 0
            }
            None => false,
        };
        if exhausted {
            st.image_lookups_left.remove(&key);
            st.images.remove(&key);
        }
        Ok(found)
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let mut st = self.lock();
        st.calls.push(MockCall::CreateInstance {
            client_token: spec.client_token.clone(),
            instance_type: spec.instance_type.clone(),
            availability_zone: spec.availability_zone.clone(),
        });
        if st.create_behavior == CreateBehavior::Fail {
            return Err(anyhow::anyhow!(
                "InsufficientInstanceCapacity: no {} capacity in {}",
                spec.instance_type,
                spec.availability_zone
            ));
        }
        st.next_id += 1;
        let id = format!("i-mock{:04}", st.next_id);
        st.instances.insert(
            id.clone(),
            MockInstance {
                client_token: spec.client_token.clone(),
                describes: 0,
                forced_state: None,
            },
        );
        if st.create_behavior == CreateBehavior::FailAfterCreate {
            return Err(TransientError("RequestTimeout waiting for RunInstances".into()).into());
        }
        Ok(id)
    }

    async fn find_by_client_token(&self, _region: &str, client_token: &str) -> Result<Option<String>> {
        let mut st = self.lock();
        st.calls.push(MockCall::FindByClientToken {
            client_token: client_token.to_string(),
        });
        Ok(st
            .instances
            .iter()
            .find(|(_, inst)| inst.client_token == client_token)
            .map(|(id, _)| id.clone()))
    }

    async fn describe_instance(&self, _region: &str, resource_id: &str) -> Result<InstanceDescription> {
        let mut st = self.lock();
        st.calls.push(MockCall::Describe {
            resource_id: resource_id.to_string(),
        });
        let running_after = st.running_after;
        let reclaim_notice = st.reclaim_notice;
        let address = st.public_address.clone();
        let Some(inst) = st.instances.get_mut(resource_id) else {
            return Err(anyhow::anyhow!(
                "InvalidInstanceID.NotFound: {}",
                resource_id
            ));
        };
        inst.describes += 1;
        let state = match inst.forced_state {
            Some(forced) => forced,
            None => match running_after {
                Some(n) if inst.describes >= n => InstanceState::Running,
                _ => InstanceState::Pending,
            },
        };
        let running = state == InstanceState::Running;
        Ok(InstanceDescription {
            state,
            reclaim_notice: if running { reclaim_notice } else { None },
            public_address: if running { Some(address) } else { None },
        })
    }

    async fn terminate_instance(&self, _region: &str, resource_id: &str) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(MockCall::Terminate {
            resource_id: resource_id.to_string(),
        });
        if st.terminate_failures.contains(resource_id) {
            return Err(anyhow::anyhow!(
                "UnauthorizedOperation: cannot terminate {}",
                resource_id
            ));
        }
        if let Some(inst) = st.instances.get_mut(resource_id) {
            inst.forced_state = Some(InstanceState::Terminated);
        }
        Ok(())
    }

    async fn push_bootstrap(&self, _region: &str, resource_id: &str, _script: &str) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(MockCall::PushBootstrap {
            resource_id: resource_id.to_string(),
        });
        match &st.bootstrap_error {
            Some(msg) => Err(anyhow::anyhow!(msg.clone())),
            None => Ok(()),
        }
    }

    async fn vcpu_quota(&self, region: &str, _market: Market) -> Result<Option<f64>> {
        let mut st = self.lock();
        st.calls.push(MockCall::VcpuQuota {
            region: region.to_string(),
        });
        Ok(st.quota)
    }
}

#[derive(Default)]
struct InfraState {
    allocation: InfraAllocation,
    release_failures: HashSet<String>,
    released: Vec<String>,
}

/// Infra collaborator returning a fixed allocation.
#[derive(Default)]
pub struct MockInfra {
    state: Mutex<InfraState>,
}

impl MockInfra {
    pub fn new(allocation: InfraAllocation) -> Self {
        Self {
            state: Mutex::new(InfraState {
                allocation,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InfraState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn fail_release_of(&self, resource_id: &str) {
        self.lock().release_failures.insert(resource_id.to_string());
    }

    pub fn released(&self) -> Vec<String> {
        self.lock().released.clone()
    }
}

#[async_trait]
impl InfraProvisioner for MockInfra {
    async fn allocate(&self, _stack: &str, _region: &str, _az: &str) -> Result<InfraAllocation> {
        Ok(self.lock().allocation.clone())
    }

    async fn release(&self, resource: &ResourceRef) -> Result<()> {
        let mut st = self.lock();
        st.released.push(resource.id.clone());
        if st.release_failures.contains(&resource.id) {
            return Err(anyhow::anyhow!("DependencyViolation: {} still in use", resource.id));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkloadCall {
    Start { resource_id: String, project_name: String },
    Stop { resource_id: String, grace_period: Duration },
    Unmount { resource_id: String },
    ScheduleShutdown { resource_id: String, delay: Duration },
}

#[derive(Default)]
struct WorkloadState {
    start_error: Option<String>,
    stop_error: Option<String>,
    stop_takes: Option<Duration>,
    calls: Vec<WorkloadCall>,
}

#[derive(Default)]
pub struct MockWorkload {
    state: Mutex<WorkloadState>,
}

impl MockWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WorkloadState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn fail_start(&self, message: &str) {
        self.lock().start_error = Some(message.to_string());
    }

    pub fn fail_stop(&self, message: &str) {
        self.lock().stop_error = Some(message.to_string());
    }

    /// `stop` returns only after `took` has elapsed.
    pub fn delay_stop(&self, took: Duration) {
        self.lock().stop_takes = Some(took);
    }

    pub fn calls(&self) -> Vec<WorkloadCall> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl WorkloadRuntime for MockWorkload {
    async fn start(&self, target: &WorkloadTarget, config: &WorkloadConfig) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(WorkloadCall::Start {
            resource_id: target.resource_id.clone(),
            project_name: config.project_name.clone(),
        });
        match &st.start_error {
            Some(msg) => Err(anyhow::anyhow!(msg.clone())),
            None => Ok(()),
        }
    }

    async fn stop(&self, target: &WorkloadTarget, grace_period: Duration) -> Result<()> {
        let (error, took) = {
            let mut st = self.lock();
            st.calls.push(WorkloadCall::Stop {
                resource_id: target.resource_id.clone(),
                grace_period,
            });
            (st.stop_error.clone(), st.stop_takes)
        };
        if let Some(took) = took {
            tokio::time::sleep(took).await;
        }
        match error {
            Some(msg) => Err(anyhow::anyhow!(msg)),
            None => Ok(()),
        }
    }

    async fn unmount_storage(&self, target: &WorkloadTarget) -> Result<()> {
        self.lock().calls.push(WorkloadCall::Unmount {
            resource_id: target.resource_id.clone(),
        });
        Ok(())
    }

    async fn schedule_host_shutdown(&self, target: &WorkloadTarget, delay: Duration) -> Result<()> {
        self.lock().calls.push(WorkloadCall::ScheduleShutdown {
            resource_id: target.resource_id.clone(),
            delay,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<(String, Severity)>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, Severity)> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, message: &str, severity: Severity) {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((message.to_string(), severity));
    }
}
