use crate::inventory::InfraAllocation;
use crate::InfraProvisioner;
use anyhow::Result;
use async_trait::async_trait;
use gpustack_common::ResourceRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pre-existing network/security/storage ids taken from configuration.
///
/// Nothing is created, so nothing is released: the deployment only owns its instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticInfra {
    /// Subnet per availability zone.
    #[serde(default)]
    pub subnets: BTreeMap<String, String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub instance_profile: Option<String>,
    #[serde(default)]
    pub storage_id: Option<String>,
}

#[async_trait]
impl InfraProvisioner for StaticInfra {
    async fn allocate(
        &self,
        stack_name: &str,
        region: &str,
        availability_zone: &str,
    ) -> Result<InfraAllocation> {
        let subnet_id = self.subnets.get(availability_zone).cloned();
        if subnet_id.is_none() && !self.subnets.is_empty() {
            anyhow::bail!(
                "no subnet configured for {} ({}), stack {}",
                availability_zone,
                region,
                stack_name
            );
        }
        Ok(InfraAllocation {
            subnet_id,
            security_group_ids: self.security_group_ids.clone(),
            key_name: self.key_name.clone(),
            instance_profile: self.instance_profile.clone(),
            storage_id: self.storage_id.clone(),
            created: Vec::new(),
        })
    }

    async fn release(&self, resource: &ResourceRef) -> Result<()> {
        tracing::debug!("[infra] {} is not managed here, nothing to release", resource);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn picks_subnet_by_zone() {
        let mut infra = StaticInfra {
            security_group_ids: vec!["sg-1".into()],
            ..Default::default()
        };
        infra.subnets.insert("us-east-1a".into(), "subnet-a".into());

        let alloc = infra.allocate("demo", "us-east-1", "us-east-1a").await.unwrap();
        assert_eq!(alloc.subnet_id.as_deref(), Some("subnet-a"));
        assert!(alloc.created.is_empty());
        assert!(infra.allocate("demo", "us-east-1", "us-east-1b").await.is_err());
    }

    #[tokio::test]
    async fn no_subnets_means_provider_default() {
        let alloc = StaticInfra::default()
            .allocate("demo", "us-west-2", "us-west-2c")
            .await
            .unwrap();
        assert_eq!(alloc.subnet_id, None);
    }
}
