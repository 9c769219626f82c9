use anyhow::Result;
use async_trait::async_trait;
use gpustack_common::{Architecture, Market, ResourceRef, Severity};
use std::time::Duration;

pub mod infra;
pub mod notify;
pub mod ssh;

/// Marker for provider failures worth retrying (throttling, timeouts, connection resets).
/// Adapters wrap such failures in this type; callers test with [`is_transient`].
#[derive(Debug, thiserror::Error)]
#[error("transient provider error: {0}")]
pub struct TransientError(pub String);

pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<TransientError>().is_some())
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Latest price samples for `instance_types` across every zone of `region`.
    async fn list_prices(
        &self,
        instance_types: &[String],
        region: &str,
        market: Market,
    ) -> Result<Vec<inventory::PriceSample>>;

    /// Newest machine image usable for `architecture` in `region`, `None` if there is none.
    async fn resolve_image(&self, region: &str, architecture: Architecture)
        -> Result<Option<String>>;

    /// Submit a create request and return the provider resource id.
    /// `spec.client_token` makes the request idempotent and discoverable.
    async fn create_instance(&self, spec: &inventory::InstanceSpec) -> Result<String>;

    /// Resolve a create request's client token to the instance it produced, if any.
    async fn find_by_client_token(&self, region: &str, client_token: &str)
        -> Result<Option<String>>;

    async fn describe_instance(
        &self,
        region: &str,
        resource_id: &str,
    ) -> Result<inventory::InstanceDescription>;

    /// Request termination. Already-gone instances are a success.
    async fn terminate_instance(&self, region: &str, resource_id: &str) -> Result<()>;

    /// Deliver a bootstrap script out-of-band (metadata / remote command channel).
    async fn push_bootstrap(&self, region: &str, resource_id: &str, script: &str) -> Result<()>;

    // Optional: vCPU quota available to GPU instances in this market.
    // Default implementation returns None (quota not checked).
    async fn vcpu_quota(&self, _region: &str, _market: Market) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// Network / security / storage identifiers required to launch an instance.
/// Anything the provisioner creates is reported back so teardown can release it.
#[async_trait]
pub trait InfraProvisioner: Send + Sync {
    async fn allocate(
        &self,
        stack_name: &str,
        region: &str,
        availability_zone: &str,
    ) -> Result<inventory::InfraAllocation>;

    async fn release(&self, resource: &ResourceRef) -> Result<()>;
}

/// The container stack running on the provisioned host.
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    async fn start(
        &self,
        target: &inventory::WorkloadTarget,
        config: &inventory::WorkloadConfig,
    ) -> Result<()>;

    async fn stop(&self, target: &inventory::WorkloadTarget, grace_period: Duration) -> Result<()>;

    // Optional: unmount network storage before the host goes away.
    async fn unmount_storage(&self, _target: &inventory::WorkloadTarget) -> Result<()> {
        Ok(())
    }

    // Optional: ask the host to power itself off after `delay`.
    async fn schedule_host_shutdown(
        &self,
        _target: &inventory::WorkloadTarget,
        _delay: Duration,
    ) -> Result<()> {
        Ok(())
    }
}

/// Fire-and-forget operator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, severity: Severity);
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use gpustack_common::{Architecture, Market};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct PriceSample {
        pub instance_type: String,
        pub availability_zone: String,
        pub hourly_price: f64,
        pub market: Market,
        pub sampled_at: DateTime<Utc>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct InstanceSpec {
        pub stack_name: String,
        pub client_token: String,
        pub region: String,
        pub availability_zone: String,
        pub instance_type: String,
        pub architecture: Architecture,
        pub image_id: String,
        pub market: Market,
        /// Spot bid ceiling, ignored for on-demand.
        pub max_price: Option<f64>,
        pub infra: InfraAllocation,
        pub root_volume_gb: u32,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct InfraAllocation {
        pub subnet_id: Option<String>,
        pub security_group_ids: Vec<String>,
        pub key_name: Option<String>,
        pub instance_profile: Option<String>,
        /// Storage the workload mounts (e.g. a shared file system id).
        pub storage_id: Option<String>,
        /// Resources created by the provisioner for this allocation, in creation order.
        pub created: Vec<gpustack_common::ResourceRef>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum InstanceState {
        Pending,
        Running,
        Stopping,
        Stopped,
        ShuttingDown,
        Terminated,
        Unknown,
    }

    impl InstanceState {
        pub fn parse(raw: &str) -> Self {
            match raw.trim().to_ascii_lowercase().as_str() {
                "pending" => InstanceState::Pending,
                "running" => InstanceState::Running,
                "stopping" => InstanceState::Stopping,
                "stopped" => InstanceState::Stopped,
                "shutting-down" | "shutting_down" => InstanceState::ShuttingDown,
                "terminated" => InstanceState::Terminated,
                _ => InstanceState::Unknown,
            }
        }

        /// The instance is gone or on its way out.
        pub fn is_gone(&self) -> bool {
            matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
        }
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct InstanceDescription {
        pub state: InstanceState,
        /// Set when the provider has announced it will reclaim the instance.
        pub reclaim_notice: Option<DateTime<Utc>>,
        pub public_address: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct WorkloadTarget {
        pub stack_name: String,
        pub resource_id: String,
        pub region: String,
        pub address: Option<String>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct WorkloadConfig {
        pub compose_file: String,
        pub project_name: String,
        pub environment: BTreeMap<String, String>,
        /// Mount points of network storage on the host.
        pub mount_points: Vec<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "aws")]
pub mod aws;
