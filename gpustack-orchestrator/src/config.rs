//! Runtime configuration.
//!
//! `Settings::load` is the only place that reads the process environment:
//! the optional TOML file, `.env`, then a handful of scalar overrides.
use gpustack_common::{instance_family, Architecture, DeploymentType};
use gpustack_providers::infra::StaticInfra;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceProfile {
    pub instance_type: String,
    /// Inferred from `arm64_patterns` when absent.
    #[serde(default)]
    pub architecture: Option<Architecture>,
    pub performance_score: f64,
    #[serde(default)]
    pub vcpus: u32,
    #[serde(default)]
    pub gpu: String,
    /// Reference on-demand hourly price.
    #[serde(default)]
    pub on_demand_price: Option<f64>,
}

impl InstanceProfile {
    fn new(instance_type: &str, score: f64, vcpus: u32, gpu: &str, on_demand: Option<f64>) -> Self {
        Self {
            instance_type: instance_type.to_string(),
            architecture: None,
            performance_score: score,
            vcpus,
            gpu: gpu.to_string(),
            on_demand_price: on_demand,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub margin_fraction: f64,
    pub default_max_price: f64,
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            margin_fraction: 0.10,
            default_max_price: 0.75,
            low: 0.50,
            medium: 1.00,
            high: 2.00,
        }
    }
}

impl BudgetSettings {
    pub fn tier_price(&self, tier: BudgetTier) -> f64 {
        match tier {
            BudgetTier::Low => self.low,
            BudgetTier::Medium => self.medium,
            BudgetTier::High => self.high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub name: String,
    /// URL template, `{host}` is replaced by the instance address.
    pub endpoint: String,
    #[serde(default)]
    pub warmup_secs: u64,
    /// Overrides `health.max_attempts` for this service.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ServiceCheck {
    fn new(name: &str, endpoint: &str, warmup_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            warmup_secs,
            max_attempts: None,
        }
    }

    pub fn render_endpoint(&self, host: &str) -> String {
        self.endpoint.replace("{host}", host)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub services: Vec<ServiceCheck>,
    pub max_attempts: u32,
    pub per_try_timeout_secs: u64,
    pub base_delay_secs: u64,
    /// Bound on the whole health_checking phase.
    pub overall_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            services: vec![
                ServiceCheck::new("n8n", "http://{host}:5678/healthz", 0),
                ServiceCheck::new("ollama", "http://{host}:11434/api/tags", 10),
                ServiceCheck::new("qdrant", "http://{host}:6333/healthz", 0),
                ServiceCheck::new("crawl4ai", "http://{host}:11235/health", 0),
            ],
            max_attempts: 5,
            per_try_timeout_secs: 10,
            base_delay_secs: 2,
            overall_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub provision_poll_secs: u64,
    pub provision_timeout_secs: u64,
    pub interruption_poll_secs: u64,
    pub stop_grace_secs: u64,
    pub shutdown_delay_secs: u64,
    /// 0 disables periodic re-validation while monitoring.
    pub revalidation_interval_secs: u64,
    pub collector_max_attempts: u32,
    pub collector_retry_base_delay_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            provision_poll_secs: 10,
            provision_timeout_secs: 600,
            interruption_poll_secs: 5,
            stop_grace_secs: 30,
            shutdown_delay_secs: 60,
            revalidation_interval_secs: 0,
            collector_max_attempts: 3,
            collector_retry_base_delay_ms: 1000,
        }
    }
}

impl Timings {
    pub fn provision_poll(&self) -> Duration {
        Duration::from_secs(self.provision_poll_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn interruption_poll(&self) -> Duration {
        Duration::from_secs(self.interruption_poll_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.shutdown_delay_secs)
    }

    pub fn revalidation_interval(&self) -> Option<Duration> {
        (self.revalidation_interval_secs > 0)
            .then(|| Duration::from_secs(self.revalidation_interval_secs))
    }

    pub fn collector_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.collector_retry_base_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSettings {
    pub compose_file: String,
    pub remote_dir: String,
    pub ssh_user: String,
    pub ssh_key_path: Option<String>,
    pub environment: BTreeMap<String, String>,
    /// Network storage mounted on the host: mount point -> device/remote spec.
    pub mounts: BTreeMap<String, String>,
    pub root_volume_gb: u32,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            compose_file: "docker-compose.gpu-optimized.yml".to_string(),
            remote_dir: "/opt/gpustack".to_string(),
            ssh_user: "ubuntu".to_string(),
            ssh_key_path: None,
            environment: BTreeMap::new(),
            mounts: BTreeMap::new(),
            root_volume_gb: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `aws` or `mock`.
    pub provider: String,
    pub aws_profile: Option<String>,
    pub default_region: String,
    /// Regions scanned with `--cross-region`.
    pub cross_regions: Vec<String>,
    pub state_dir: PathBuf,
    pub notify_webhook: Option<String>,
    /// The only type considered by `simple` deployments.
    pub default_instance_type: String,
    pub profiles: Vec<InstanceProfile>,
    /// Comma-separated patterns of arm64 instance types.
    pub arm64_patterns: Option<String>,
    pub architecture_preference: Vec<Architecture>,
    pub budget: BudgetSettings,
    pub health: HealthSettings,
    pub timings: Timings,
    pub workload: WorkloadSettings,
    pub infra: StaticInfra,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "aws".to_string(),
            aws_profile: None,
            default_region: "us-east-1".to_string(),
            cross_regions: vec![
                "us-east-1".to_string(),
                "us-west-2".to_string(),
                "eu-west-1".to_string(),
            ],
            state_dir: PathBuf::from(".gpustack"),
            notify_webhook: None,
            default_instance_type: "g4dn.xlarge".to_string(),
            profiles: vec![
                InstanceProfile::new("g4dn.xlarge", 70.0, 4, "T4", Some(1.19)),
                InstanceProfile::new("g4dn.2xlarge", 80.0, 8, "T4", Some(2.38)),
                InstanceProfile::new("g4dn.4xlarge", 85.0, 16, "T4", None),
                InstanceProfile::new("g4ad.xlarge", 65.0, 4, "Radeon Pro V520", Some(0.95)),
                InstanceProfile::new("g5.xlarge", 90.0, 4, "A10G", Some(1.21)),
                InstanceProfile::new("g5g.xlarge", 75.0, 4, "T4G", None),
            ],
            arm64_patterns: None,
            architecture_preference: vec![Architecture::X86_64, Architecture::Arm64],
            budget: BudgetSettings::default(),
            health: HealthSettings::default(),
            timings: Timings::default(),
            workload: WorkloadSettings::default(),
            infra: StaticInfra::default(),
        }
    }
}

impl Settings {
    /// Built-in defaults, then the config file, then env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("GPUSTACK_CONFIG").ok().map(PathBuf::from));
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(region) = non_empty("AWS_REGION") {
            self.default_region = region;
        }
        if let Some(dir) = non_empty("GPUSTACK_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(provider) = non_empty("GPUSTACK_PROVIDER") {
            self.provider = provider.to_ascii_lowercase();
        }
        if let Some(hook) = non_empty("GPUSTACK_NOTIFY_WEBHOOK") {
            self.notify_webhook = Some(hook);
        }
        if let Some(profile) = non_empty("AWS_PROFILE") {
            self.aws_profile = Some(profile);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.profiles.is_empty() {
            return invalid("at least one instance profile is required".into());
        }
        for p in &self.profiles {
            if !(p.performance_score.is_finite() && p.performance_score > 0.0) {
                return invalid(format!(
                    "performance_score for {} must be positive",
                    p.instance_type
                ));
            }
            if let Some(price) = p.on_demand_price {
                if !(price.is_finite() && price > 0.0) {
                    return invalid(format!("on_demand_price for {} must be positive", p.instance_type));
                }
            }
        }
        if self.profile(&self.default_instance_type).is_none() {
            return invalid(format!(
                "default_instance_type {} has no profile",
                self.default_instance_type
            ));
        }
        let b = &self.budget;
        for (name, v) in [
            ("margin_fraction", b.margin_fraction),
            ("default_max_price", b.default_max_price),
            ("low", b.low),
            ("medium", b.medium),
            ("high", b.high),
        ] {
            if !v.is_finite() || v < 0.0 {
                return invalid(format!("budget.{} must be a non-negative number", name));
            }
        }
        if self.default_region.trim().is_empty() {
            return invalid("default_region is empty".into());
        }
        let h = &self.health;
        if h.max_attempts == 0 || h.per_try_timeout_secs == 0 {
            return invalid("health.max_attempts and health.per_try_timeout_secs must be > 0".into());
        }
        let mut seen = std::collections::HashSet::new();
        for s in &h.services {
            if !seen.insert(s.name.as_str()) {
                return invalid(format!("health service {} is listed twice", s.name));
            }
        }
        let t = &self.timings;
        if t.provision_poll_secs == 0 || t.interruption_poll_secs == 0 || t.collector_max_attempts == 0 {
            return invalid("poll intervals and collector attempts must be > 0".into());
        }
        // one service sweep must fit between two re-validations
        let sweep = h.per_try_timeout_secs * u64::from(h.max_attempts);
        if t.revalidation_interval_secs > 0 && t.revalidation_interval_secs <= sweep {
            return invalid(format!(
                "timings.revalidation_interval_secs must exceed {}s (health retry cadence)",
                sweep
            ));
        }
        if !matches!(self.provider.as_str(), "aws" | "mock") {
            return invalid(format!("unknown provider {}", self.provider));
        }
        Ok(())
    }

    pub fn profile(&self, instance_type: &str) -> Option<&InstanceProfile> {
        self.profiles.iter().find(|p| p.instance_type == instance_type)
    }

    pub fn architecture_of(&self, profile: &InstanceProfile) -> Architecture {
        profile.architecture.unwrap_or_else(|| {
            let patterns = instance_family::parse_patterns(self.arm64_patterns.as_deref());
            instance_family::infer_architecture(&profile.instance_type, &patterns)
        })
    }

    pub fn instance_types_for(&self, deployment_type: DeploymentType) -> Vec<String> {
        match deployment_type {
            DeploymentType::Simple => vec![self.default_instance_type.clone()],
            _ => self.profiles.iter().map(|p| p.instance_type.clone()).collect(),
        }
    }

    /// `--region` overrides the default; `--cross-region` scans every configured region.
    pub fn regions_for(&self, region: Option<&str>, cross_region: bool) -> Vec<String> {
        let primary = region.unwrap_or(&self.default_region).to_string();
        if !cross_region {
            return vec![primary];
        }
        let mut regions = vec![primary];
        for r in &self.cross_regions {
            if !regions.contains(r) {
                regions.push(r.clone());
            }
        }
        regions
    }

    pub fn resolve_max_price(&self, tier: Option<BudgetTier>, max_price: Option<f64>) -> f64 {
        match (max_price, tier) {
            (Some(price), _) => price,
            (None, Some(tier)) => self.budget.tier_price(tier),
            (None, None) => self.budget.default_max_price,
        }
    }

    pub fn on_demand_prices(&self) -> BTreeMap<String, f64> {
        self.profiles
            .iter()
            .filter_map(|p| p.on_demand_price.map(|price| (p.instance_type.clone(), price)))
            .collect()
    }
}
