use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod error;
pub mod instance_family;

pub use error::{DeployError, ModelError};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl FromStr for Architecture {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x86" => Ok(Architecture::X86_64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            other => Err(ModelError::UnknownValue {
                field: "architecture",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pricing market a candidate was sampled from.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Spot,
    OnDemand,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::OnDemand => "on_demand",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    Spot,   // interruptible capacity, interruption monitor active
    OnDemand,
    Simple, // single default instance type, on-demand, no monitor
}

impl DeploymentType {
    pub fn market(&self) -> Market {
        match self {
            DeploymentType::Spot => Market::Spot,
            DeploymentType::OnDemand | DeploymentType::Simple => Market::OnDemand,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Spot => "spot",
            DeploymentType::OnDemand => "ondemand",
            DeploymentType::Simple => "simple",
        }
    }
}

/// Deployment phases in forward order. `Failed` and `Terminated` are terminal.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validating,
    Provisioning,
    Configuring,
    Deploying,
    HealthChecking,
    Monitoring,
    Failed,
    Terminated,
}

impl Phase {
    pub const FORWARD: [Phase; 6] = [
        Phase::Validating,
        Phase::Provisioning,
        Phase::Configuring,
        Phase::Deploying,
        Phase::HealthChecking,
        Phase::Monitoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validating => "validating",
            Phase::Provisioning => "provisioning",
            Phase::Configuring => "configuring",
            Phase::Deploying => "deploying",
            Phase::HealthChecking => "health_checking",
            Phase::Monitoring => "monitoring",
            Phase::Failed => "failed",
            Phase::Terminated => "terminated",
        }
    }

    pub fn ordinal(&self) -> usize {
        match self {
            Phase::Validating => 0,
            Phase::Provisioning => 1,
            Phase::Configuring => 2,
            Phase::Deploying => 3,
            Phase::HealthChecking => 4,
            Phase::Monitoring => 5,
            Phase::Failed => 6,
            Phase::Terminated => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Failed | Phase::Terminated)
    }

    /// Next phase in the linear order, `None` after `Monitoring`.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Validating => Some(Phase::Provisioning),
            Phase::Provisioning => Some(Phase::Configuring),
            Phase::Configuring => Some(Phase::Deploying),
            Phase::Deploying => Some(Phase::HealthChecking),
            Phase::HealthChecking => Some(Phase::Monitoring),
            Phase::Monitoring | Phase::Failed | Phase::Terminated => None,
        }
    }

    /// Forward by exactly one step, any non-terminal phase to `Failed`,
    /// and any phase to `Terminated` through explicit teardown.
    pub fn can_transition_to(&self, to: Phase) -> bool {
        match to {
            Phase::Terminated => *self != Phase::Terminated,
            Phase::Failed => !self.is_terminal(),
            _ => self.next() == Some(to),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

// --- Selection ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceCandidate {
    pub instance_type: String,
    pub architecture: Architecture,
    pub region: String,
    pub availability_zone: String,
    pub hourly_price: f64,
    pub performance_score: f64,
    pub machine_image_id: String,
    pub market: Market,
    /// Reference on-demand price for the same type, when known.
    #[serde(default)]
    pub on_demand_price: Option<f64>,
}

impl InstanceCandidate {
    /// Price/performance: higher is better.
    pub fn score(&self) -> f64 {
        self.performance_score / self.hourly_price
    }
}

/// Price ceiling for a deployment attempt. The effective ceiling can be
/// widened exactly once, and never drops below the requested ceiling.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct BudgetConstraint {
    requested_max_price: f64,
    margin_fraction: f64,
    effective_max_price: f64,
    relaxed: bool,
}

impl BudgetConstraint {
    pub const DEFAULT_MARGIN: f64 = 0.10;

    pub fn new(requested_max_price: f64, margin_fraction: f64) -> Result<Self, ModelError> {
        if !requested_max_price.is_finite() || requested_max_price < 0.0 {
            return Err(ModelError::InvalidBudget(format!(
                "max price must be a non-negative number, got {}",
                requested_max_price
            )));
        }
        if !margin_fraction.is_finite() || margin_fraction < 0.0 {
            return Err(ModelError::InvalidBudget(format!(
                "margin fraction must be a non-negative number, got {}",
                margin_fraction
            )));
        }
        Ok(Self {
            requested_max_price,
            margin_fraction,
            effective_max_price: requested_max_price,
            relaxed: false,
        })
    }

    pub fn with_default_margin(requested_max_price: f64) -> Result<Self, ModelError> {
        Self::new(requested_max_price, Self::DEFAULT_MARGIN)
    }

    pub fn requested_max_price(&self) -> f64 {
        self.requested_max_price
    }

    pub fn effective_max_price(&self) -> f64 {
        self.effective_max_price
    }

    pub fn admits(&self, price: f64) -> bool {
        price <= self.effective_max_price
    }

    /// Widen the ceiling to `cheapest_price * (1 + margin)`.
    /// Returns false (and changes nothing) if the ceiling was already relaxed.
    pub fn relax_to(&mut self, cheapest_price: f64) -> bool {
        if self.relaxed {
            return false;
        }
        let widened = cheapest_price * (1.0 + self.margin_fraction);
        self.effective_max_price = widened.max(self.requested_max_price);
        self.relaxed = true;
        true
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SelectionResult {
    pub chosen: InstanceCandidate,
    pub budget_adjusted: bool,
    pub original_budget: f64,
    pub final_budget: f64,
    /// Size of the comparison set.
    pub considered: usize,
}

// --- Deployment state ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    Storage,
    Network,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::Storage => "storage",
            ResourceKind::Network => "network",
        }
    }
}

/// A provider resource owned by a deployment.
///
/// A `pending` instance entry holds the client token of a create request whose
/// provider id is not known yet; teardown resolves it through the token.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
    pub region: String,
    #[serde(default)]
    pub pending: bool,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            region: region.into(),
            pending: false,
        }
    }

    pub fn pending_instance(client_token: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Instance,
            id: client_token.into(),
            region: region.into(),
            pending: true,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pending {
            write!(f, "{}:{} (pending, {})", self.kind.as_str(), self.id, self.region)
        } else {
            write!(f, "{}:{} ({})", self.kind.as_str(), self.id, self.region)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PhaseOutcome {
    InProgress,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub at: DateTime<Utc>,
    pub outcome: PhaseOutcome,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FailureRecord {
    pub phase: Phase,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeploymentState {
    pub stack_name: String,
    pub deployment_type: DeploymentType,
    pub phase: Phase,
    /// Creation order; teardown walks it in reverse.
    pub resource_ids: Vec<ResourceRef>,
    pub started_at: DateTime<Utc>,
    pub phase_history: Vec<PhaseRecord>,
    #[serde(default)]
    pub selection: Option<SelectionResult>,
    #[serde(default)]
    pub public_address: Option<String>,
    #[serde(default)]
    pub last_error: Option<FailureRecord>,
}

impl DeploymentState {
    pub fn new(stack_name: &str, deployment_type: DeploymentType) -> Result<Self, ModelError> {
        validate_stack_name(stack_name)?;
        let now = Utc::now();
        Ok(Self {
            stack_name: stack_name.to_string(),
            deployment_type,
            phase: Phase::Validating,
            resource_ids: Vec::new(),
            started_at: now,
            phase_history: vec![PhaseRecord {
                phase: Phase::Validating,
                at: now,
                outcome: PhaseOutcome::InProgress,
            }],
            selection: None,
            public_address: None,
            last_error: None,
        })
    }

    /// Close the current phase record and enter `to`.
    pub fn transition_to(&mut self, to: Phase) -> Result<(), ModelError> {
        if !self.phase.can_transition_to(to) {
            return Err(ModelError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.close_current(PhaseOutcome::Succeeded);
        self.enter(to, PhaseOutcome::InProgress);
        Ok(())
    }

    /// Jump to `Failed`, marking the interrupted phase with the reason.
    pub fn fail(&mut self, kind: &str, message: &str) -> Result<(), ModelError> {
        if !self.phase.can_transition_to(Phase::Failed) {
            return Err(ModelError::InvalidTransition {
                from: self.phase,
                to: Phase::Failed,
            });
        }
        let failed_phase = self.phase;
        self.close_current(PhaseOutcome::Failed(format!("{}: {}", kind, message)));
        self.last_error = Some(FailureRecord {
            phase: failed_phase,
            kind: kind.to_string(),
            message: message.to_string(),
        });
        self.enter(Phase::Failed, PhaseOutcome::InProgress);
        Ok(())
    }

    /// Mark the current phase as finished without leaving it
    /// (used by `--validate-only` and when monitoring ends).
    pub fn complete_current(&mut self, outcome: PhaseOutcome) {
        self.close_current(outcome);
    }

    fn close_current(&mut self, outcome: PhaseOutcome) {
        if let Some(last) = self.phase_history.last_mut() {
            if last.phase == self.phase && last.outcome == PhaseOutcome::InProgress {
                last.outcome = outcome;
            }
        }
    }

    fn enter(&mut self, phase: Phase, outcome: PhaseOutcome) {
        self.phase = phase;
        self.phase_history.push(PhaseRecord {
            phase,
            at: Utc::now(),
            outcome,
        });
    }

    pub fn record_resource(&mut self, resource: ResourceRef) {
        self.resource_ids.push(resource);
    }

    /// Replace a pending instance entry with the provider id, keeping its position.
    pub fn resolve_pending(&mut self, client_token: &str, resource_id: &str) -> bool {
        match self
            .resource_ids
            .iter_mut()
            .find(|r| r.pending && r.id == client_token)
        {
            Some(entry) => {
                entry.id = resource_id.to_string();
                entry.pending = false;
                true
            }
            None => false,
        }
    }

    /// The most recently created, confirmed instance.
    pub fn instance(&self) -> Option<&ResourceRef> {
        self.resource_ids
            .iter()
            .rev()
            .find(|r| r.kind == ResourceKind::Instance && !r.pending)
    }

    pub fn teardown_order(&self) -> impl Iterator<Item = &ResourceRef> {
        self.resource_ids.iter().rev()
    }

    /// Phases entered, in order.
    pub fn phases_visited(&self) -> Vec<Phase> {
        self.phase_history.iter().map(|r| r.phase).collect()
    }
}

/// Stack names are used as file names and provider tags: `[a-zA-Z0-9-]+`.
pub fn validate_stack_name(name: &str) -> Result<(), ModelError> {
    let ok = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ModelError::InvalidStackName(name.to_string()))
    }
}

// --- Health ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HealthCheckResult {
    pub service_name: String,
    pub endpoint: String,
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl HealthCheckResult {
    pub fn unknown(service_name: &str, endpoint: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            endpoint: endpoint.to_string(),
            status: HealthStatus::Unknown,
            latency_ms: None,
            checked_at: Utc::now(),
            attempt_count: 0,
            last_error: None,
        }
    }
}

/// One result per configured service, in configuration order.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct HealthMatrix {
    entries: Vec<HealthCheckResult>,
}

impl HealthMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `result.service_name`.
    pub fn insert(&mut self, result: HealthCheckResult) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.service_name == result.service_name)
        {
            Some(existing) => *existing = result,
            None => self.entries.push(result),
        }
    }

    pub fn get(&self, service_name: &str) -> Option<&HealthCheckResult> {
        self.entries.iter().find(|e| e.service_name == service_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.entries.iter()
    }

    pub fn overall_healthy(&self) -> bool {
        self.entries.iter().all(|e| e.status == HealthStatus::Healthy)
    }

    pub fn unhealthy_services(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.status != HealthStatus::Healthy)
            .map(|e| e.service_name.clone())
            .collect()
    }
}

// --- Teardown ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReleaseOutcome {
    pub resource: ResourceRef,
    pub released: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TeardownReport {
    pub outcomes: Vec<ReleaseOutcome>,
}

impl TeardownReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.released)
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.released).count()
    }

    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }
}
