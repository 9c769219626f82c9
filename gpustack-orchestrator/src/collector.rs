use futures_util::future::join_all;
use gpustack_common::{Architecture, InstanceCandidate, Market};
use gpustack_providers::inventory::PriceSample;
use gpustack_providers::{is_transient, CloudProvider};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use crate::config::Settings;

/// Candidates plus the reasons anything was left out.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub candidates: Vec<InstanceCandidate>,
    pub warnings: Vec<String>,
}

/// Retry `op` on transient errors, sleeping `attempt * base_delay` in between.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, base_delay: Duration, what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt < max_attempts => {
                tracing::warn!(
                    "⚠️ [collector] {} failed (attempt {}/{}): {:#}",
                    what,
                    attempt,
                    max_attempts,
                    e
                );
                tokio::time::sleep(base_delay * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Keep the most recent sample per (type, az); ties go to the lower price.
pub fn dedupe_samples(samples: Vec<PriceSample>) -> Vec<PriceSample> {
    let mut latest: BTreeMap<(String, String), PriceSample> = BTreeMap::new();
    for s in samples {
        let key = (s.instance_type.clone(), s.availability_zone.clone());
        match latest.get(&key) {
            Some(kept)
                if kept.sampled_at > s.sampled_at
                    || (kept.sampled_at == s.sampled_at && kept.hourly_price <= s.hourly_price) => {}
            _ => {
                latest.insert(key, s);
            }
        }
    }
    latest.into_values().collect()
}

pub struct Collector<'a> {
    provider: &'a dyn CloudProvider,
    settings: &'a Settings,
}

impl<'a> Collector<'a> {
    pub fn new(provider: &'a dyn CloudProvider, settings: &'a Settings) -> Self {
        Self { provider, settings }
    }

    fn retry_policy(&self) -> (u32, Duration) {
        (
            self.settings.timings.collector_max_attempts,
            self.settings.timings.collector_retry_base_delay(),
        )
    }

    pub async fn collect(&self, instance_types: &[String], regions: &[String], market: Market) -> Collection {
        let mut warnings = Vec::new();

        let mut known: Vec<String> = Vec::new();
        for t in instance_types {
            if self.settings.profile(t).is_some() {
                known.push(t.clone());
            } else {
                warnings.push(format!("{}: no performance profile configured, skipped", t));
            }
        }
        if known.is_empty() || regions.is_empty() {
            return Collection {
                candidates: Vec::new(),
                warnings,
            };
        }

        let per_region = join_all(regions.iter().map(|r| self.collect_region(&known, r, market))).await;

        let mut candidates = Vec::new();
        for (mut found, mut region_warnings) in per_region {
            candidates.append(&mut found);
            warnings.append(&mut region_warnings);
        }
        candidates.sort_by(|a, b| {
            (&a.region, &a.availability_zone, &a.instance_type)
                .cmp(&(&b.region, &b.availability_zone, &b.instance_type))
        });

        for w in &warnings {
            tracing::warn!("⚠️ [collector] {}", w);
        }
        tracing::info!(
            "🔍 [collector] {} candidate(s) from {} region(s), {} warning(s)",
            candidates.len(),
            regions.len(),
            warnings.len()
        );
        Collection {
            candidates,
            warnings,
        }
    }

    async fn collect_region(
        &self,
        instance_types: &[String],
        region: &str,
        market: Market,
    ) -> (Vec<InstanceCandidate>, Vec<String>) {
        let mut warnings = Vec::new();
        let (max_attempts, base_delay) = self.retry_policy();

        let what = format!("price query in {}", region);
        let samples = match with_retry(max_attempts, base_delay, &what, || {
            self.provider.list_prices(instance_types, region, market)
        })
        .await
        {
            Ok(samples) => samples,
            Err(e) => {
                warnings.push(format!("{}: price query failed, region skipped: {:#}", region, e));
                return (Vec::new(), warnings);
            }
        };

        let usable: Vec<PriceSample> = samples
            .into_iter()
            .filter(|s| s.market == market && instance_types.contains(&s.instance_type))
            .filter(|s| {
                let ok = s.hourly_price.is_finite() && s.hourly_price > 0.0;
                if !ok {
                    warnings.push(format!(
                        "{}/{}: unusable price {}",
                        s.instance_type, s.availability_zone, s.hourly_price
                    ));
                }
                ok
            })
            .collect();
        let samples = dedupe_samples(usable);
        if samples.is_empty() {
            warnings.push(format!("{}: no {} price samples", region, market.as_str()));
            return (Vec::new(), warnings);
        }

        let arch_of = |t: &str| {
            self.settings
                .profile(t)
                .map(|p| self.settings.architecture_of(p))
                .unwrap_or(Architecture::X86_64)
        };
        let needed: BTreeSet<Architecture> = samples.iter().map(|s| arch_of(&s.instance_type)).collect();

        let mut images: HashMap<Architecture, String> = HashMap::new();
        for arch in needed {
            let what = format!("{} image lookup in {}", arch, region);
            match with_retry(max_attempts, base_delay, &what, || {
                self.provider.resolve_image(region, arch)
            })
            .await
            {
                Ok(Some(id)) => {
                    images.insert(arch, id);
                }
                Ok(None) => warnings.push(format!("{}: no {} image, those types excluded", region, arch)),
                Err(e) => warnings.push(format!(
                    "{}: {} image lookup failed, those types excluded: {:#}",
                    region, arch, e
                )),
            }
        }

        let candidates = samples
            .into_iter()
            .filter_map(|s| {
                let profile = self.settings.profile(&s.instance_type)?;
                let architecture = self.settings.architecture_of(profile);
                let image = images.get(&architecture)?;
                Some(InstanceCandidate {
                    instance_type: s.instance_type,
                    architecture,
                    region: region.to_string(),
                    availability_zone: s.availability_zone,
                    hourly_price: s.hourly_price,
                    performance_score: profile.performance_score,
                    machine_image_id: image.clone(),
                    market,
                    on_demand_price: profile.on_demand_price,
                })
            })
            .collect();
        (candidates, warnings)
    }
}
