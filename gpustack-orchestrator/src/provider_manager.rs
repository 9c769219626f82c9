use anyhow::{bail, Result};
use gpustack_providers::notify::{LogNotifier, WebhookNotifier};
use gpustack_providers::Notifier;
use std::sync::Arc;

use crate::config::Settings;
use crate::health_check::HttpProbe;
use crate::state_machine::Collaborators;

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name(settings: &Settings) -> String {
        settings.provider.trim().to_lowercase()
    }

    /// Wire the collaborators for the configured provider.
    pub fn build(settings: &Settings) -> Result<Collaborators> {
        let notifier = Self::notifier(settings);
        let probe = Arc::new(HttpProbe::new()?);

        match Self::current_provider_name(settings).as_str() {
            #[cfg(feature = "provider-aws")]
            "aws" => {
                use gpustack_providers::aws::AwsCliProvider;
                use gpustack_providers::ssh::{SshComposeRuntime, SshComposeWorkload};

                let w = &settings.workload;
                let provider = AwsCliProvider::new(settings.aws_profile.clone(), settings.on_demand_prices());
                let workload = SshComposeRuntime {
                    ssh: SshComposeWorkload::new(&w.ssh_user, w.ssh_key_path.clone(), &w.remote_dir),
                    mount_points: w.mounts.keys().cloned().collect(),
                };
                Ok(Collaborators {
                    provider: Arc::new(provider),
                    infra: Arc::new(settings.infra.clone()),
                    workload: Arc::new(workload),
                    notifier,
                    probe,
                })
            }
            #[cfg(feature = "provider-mock")]
            "mock" => {
                use gpustack_providers::inventory::InfraAllocation;
                use gpustack_providers::mock::{MockInfra, MockWorkload};

                Ok(Collaborators {
                    provider: Arc::new(seeded_mock(settings)),
                    infra: Arc::new(MockInfra::new(InfraAllocation::default())),
                    workload: Arc::new(MockWorkload::new()),
                    notifier,
                    probe,
                })
            }
            other => bail!(
                "provider {:?} is not available in this build (features: {})",
                other,
                enabled_features().join(", ")
            ),
        }
    }

    fn notifier(settings: &Settings) -> Arc<dyn Notifier> {
        let Some(url) = settings.notify_webhook.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Arc::new(LogNotifier);
        };
        match WebhookNotifier::new(url, "gpustack") {
            Ok(n) => Arc::new(n),
            Err(e) => {
                tracing::warn!("⚠️ [provider_manager] webhook disabled: {:#}", e);
                Arc::new(LogNotifier)
            }
        }
    }
}

fn enabled_features() -> Vec<&'static str> {
    let mut out = Vec::new();
    if cfg!(feature = "provider-aws") {
        out.push("provider-aws");
    }
    if cfg!(feature = "provider-mock") {
        out.push("provider-mock");
    }
    out
}

/// Offline provider: every configured profile gets a spot price at 35% of its
/// on-demand reference in zones `a` and `b` of each cross region.
#[cfg(feature = "provider-mock")]
fn seeded_mock(settings: &Settings) -> gpustack_providers::mock::MockCloud {
    use gpustack_common::Market;
    use gpustack_providers::mock::MockCloud;

    let cloud = MockCloud::new();
    let mut regions = settings.cross_regions.clone();
    if !regions.contains(&settings.default_region) {
        regions.push(settings.default_region.clone());
    }
    for region in &regions {
        for profile in &settings.profiles {
            let arch = settings.architecture_of(profile);
            cloud.add_image(region, arch, &format!("ami-mock-{}", arch.as_str()));
            let on_demand = profile.on_demand_price.unwrap_or(1.0);
            for (i, zone) in ["a", "b"].iter().enumerate() {
                let az = format!("{}{}", region, zone);
                let spot = on_demand * (0.35 + 0.02 * i as f64);
                cloud.add_price(region, &profile.instance_type, &az, spot, Market::Spot);
                if profile.on_demand_price.is_some() {
                    cloud.add_price(region, &profile.instance_type, &az, on_demand, Market::OnDemand);
                }
            }
        }
    }
    cloud
}
