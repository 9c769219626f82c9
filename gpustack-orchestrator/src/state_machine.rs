//! Deployment state machine.
//!
//! validating -> provisioning -> configuring -> deploying -> health_checking -> monitoring,
//! with a single jump to `failed` from any of them. The state is persisted on
//! every transition before the next phase has any side effect, and every
//! provider resource is recorded before (or, for the instance, as a pending
//! client token while) it is created, so teardown can always find it.
use gpustack_common::{
    validate_stack_name, BudgetConstraint, DeployError, DeploymentState, DeploymentType, HealthMatrix, Market,
    Phase, PhaseOutcome, ResourceKind, ResourceRef, SelectionResult, Severity, TeardownReport,
};
use gpustack_providers::inventory::{InstanceSpec, InstanceState, WorkloadConfig, WorkloadTarget};
use gpustack_providers::{is_transient, CloudProvider, InfraProvisioner, Notifier, WorkloadRuntime};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::bootstrap::render_bootstrap;
use crate::collector::Collector;
use crate::config::Settings;
use crate::cost_report::CostReport;
use crate::health_check::{EndpointProbe, HealthValidator};
use crate::interruption_monitor::InterruptionMonitor;
use crate::logger::ActionLog;
use crate::monitoring::{revalidation_loop, MonitoringHandle};
use crate::selection::select;
use crate::state_store::StateStore;
use crate::teardown::Terminator;

/// Everything the state machine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn CloudProvider>,
    pub infra: Arc<dyn InfraProvisioner>,
    pub workload: Arc<dyn WorkloadRuntime>,
    pub notifier: Arc<dyn Notifier>,
    pub probe: Arc<dyn EndpointProbe>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    pub stack_name: String,
    pub deployment_type: DeploymentType,
    pub max_price: f64,
    pub regions: Vec<String>,
    pub validate_only: bool,
}

pub enum DeployOutcome {
    /// `--validate-only`: a candidate was chosen and still validates.
    Validated { selection: SelectionResult },
    Monitoring {
        state: DeploymentState,
        health: HealthMatrix,
        handle: MonitoringHandle,
    },
}

#[derive(Debug, Clone)]
pub struct DeployFailure {
    pub phase: Phase,
    pub error: DeployError,
    pub teardown: Option<TeardownReport>,
    pub health: Option<HealthMatrix>,
}

impl DeployFailure {
    fn new(phase: Phase, error: DeployError) -> Self {
        Self {
            phase,
            error,
            teardown: None,
            health: None,
        }
    }

    /// A failed teardown always wins: resources may be leaked.
    pub fn exit_code(&self) -> i32 {
        match &self.teardown {
            Some(report) if !report.succeeded() => 3,
            _ => self.error.exit_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CleanupOutcome {
    NothingToDo,
    Released {
        report: TeardownReport,
        archived_to: Option<std::path::PathBuf>,
    },
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    collab: Collaborators,
    store: StateStore,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        collab: Collaborators,
        store: StateStore,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            collab,
            store,
            cancel,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn check_cancel(&self) -> Result<(), DeployError> {
        if *self.cancel.borrow() {
            return Err(DeployError::Cancelled);
        }
        Ok(())
    }

    fn persist(&self, state: &DeploymentState) -> Result<(), DeployError> {
        self.store
            .save(state)
            .map_err(|e| DeployError::ProvisioningFailure(format!("cannot persist state: {}", e)))
    }

    fn advance(&self, state: &mut DeploymentState, log: &ActionLog, to: Phase) -> Result<(), DeployError> {
        let from = state.phase;
        state
            .transition_to(to)
            .map_err(|e| DeployError::ProvisioningFailure(e.to_string()))?;
        self.persist(state)?;
        eprintln!("🔄 [state_machine] {}: {} -> {}", state.stack_name, from, to);
        log.log_quick(
            "PHASE_TRANSITION",
            Some(serde_json::json!({"from": from.as_str(), "to": to.as_str()})),
        );
        Ok(())
    }

    /// Refuse to overwrite a stack that may still own resources.
    fn begin(&self, req: &DeployRequest) -> Result<DeploymentState, DeployError> {
        validate_stack_name(&req.stack_name).map_err(|e| DeployError::ValidationFailure(e.to_string()))?;
        let existing = self
            .store
            .load(&req.stack_name)
            .map_err(|e| DeployError::ValidationFailure(e.to_string()))?;
        if let Some(prev) = existing {
            // terminated, or an earlier run that stopped before creating anything
            if prev.phase == Phase::Terminated || prev.resource_ids.is_empty() {
                self.store
                    .archive(&req.stack_name)
                    .map_err(|e| DeployError::ValidationFailure(e.to_string()))?;
            } else {
                return Err(DeployError::ValidationFailure(format!(
                    "stack {} already exists in phase {} with {} resource(s); run with --cleanup first",
                    req.stack_name,
                    prev.phase,
                    prev.resource_ids.len()
                )));
            }
        }
        let state = DeploymentState::new(&req.stack_name, req.deployment_type)
            .map_err(|e| DeployError::ValidationFailure(e.to_string()))?;
        self.store
            .save(&state)
            .map_err(|e| DeployError::ValidationFailure(format!("cannot persist state: {}", e)))?;
        Ok(state)
    }

    pub async fn deploy(&self, req: &DeployRequest) -> Result<DeployOutcome, DeployFailure> {
        let mut state = self
            .begin(req)
            .map_err(|e| DeployFailure::new(Phase::Validating, e))?;
        let log = ActionLog::new(self.store.dir(), &req.stack_name);
        let log_id = log.log_event_with_metadata(
            "DEPLOY",
            "in_progress",
            None,
            Some(serde_json::json!({
                "type": req.deployment_type.as_str(),
                "max_price": req.max_price,
                "regions": req.regions,
                "validate_only": req.validate_only,
            })),
        );
        let started = Instant::now();
        let mut health: Option<HealthMatrix> = None;

        match self.drive(req, &mut state, &log, &mut health).await {
            Ok(outcome) => {
                log.log_event_complete(log_id, "DEPLOY", "success", started.elapsed().as_millis() as u64, None);
                Ok(outcome)
            }
            Err(error) => {
                log.log_event_complete(
                    log_id,
                    "DEPLOY",
                    "failed",
                    started.elapsed().as_millis() as u64,
                    Some(error.to_string().as_str()),
                );
                Err(self.fail(&mut state, &log, error, health).await)
            }
        }
    }

    async fn drive(
        &self,
        req: &DeployRequest,
        state: &mut DeploymentState,
        log: &ActionLog,
        health_out: &mut Option<HealthMatrix>,
    ) -> Result<DeployOutcome, DeployError> {
        // validating
        let selection = self.choose(req).await?;
        state.selection = Some(selection.clone());
        self.persist(state)?;
        log.log_quick(
            "INSTANCE_SELECTED",
            Some(serde_json::to_value(&selection).unwrap_or_default()),
        );
        let image_id = self.revalidate(&selection, req.deployment_type.market()).await?;
        if req.validate_only {
            state.complete_current(PhaseOutcome::Succeeded);
            self.persist(state)?;
            return Ok(DeployOutcome::Validated { selection });
        }
        self.check_cancel()?;

        self.advance(state, log, Phase::Provisioning)?;
        let (resource_id, address) = self.provision(state, log, &selection, &image_id).await?;
        self.check_cancel()?;

        let target = WorkloadTarget {
            stack_name: state.stack_name.clone(),
            resource_id: resource_id.clone(),
            region: selection.chosen.region.clone(),
            address: address.clone(),
        };

        self.advance(state, log, Phase::Configuring)?;
        let storage_id = self.settings.infra.storage_id.clone();
        let script = render_bootstrap(&state.stack_name, &self.settings.workload, storage_id.as_deref());
        self.collab
            .provider
            .push_bootstrap(&target.region, &resource_id, &script)
            .await
            .map_err(|e| DeployError::ConfigurationFailure(format!("bootstrap: {:#}", e)))?;
        self.check_cancel()?;

        self.advance(state, log, Phase::Deploying)?;
        let config = WorkloadConfig {
            compose_file: self.settings.workload.compose_file.clone(),
            project_name: state.stack_name.clone(),
            environment: self.settings.workload.environment.clone(),
            mount_points: self.settings.workload.mounts.keys().cloned().collect(),
        };
        self.collab
            .workload
            .start(&target, &config)
            .await
            .map_err(|e| DeployError::ConfigurationFailure(format!("workload start: {:#}", e)))?;
        log.log_quick("WORKLOAD_STARTED", Some(serde_json::json!({"resource_id": resource_id})));
        self.check_cancel()?;

        self.advance(state, log, Phase::HealthChecking)?;
        let validator = HealthValidator::from_settings(self.collab.probe.clone(), &self.settings.health);
        let host = address.clone().unwrap_or_default();
        let overall = std::time::Duration::from_secs(self.settings.health.overall_timeout_secs);
        let (matrix, timed_out) = validator.validate_within(&host, overall).await;
        *health_out = Some(matrix.clone());
        if timed_out || !matrix.overall_healthy() {
            return Err(DeployError::HealthCheckFailure {
                unhealthy: matrix.unhealthy_services(),
            });
        }
        self.check_cancel()?;

        self.advance(state, log, Phase::Monitoring)?;
        let handle = self.start_monitoring(state, target, validator, host);
        self.collab
            .notifier
            .notify(
                &format!(
                    "Stack {} is up: {} in {} at ${:.4}/h",
                    state.stack_name,
                    selection.chosen.instance_type,
                    selection.chosen.availability_zone,
                    selection.chosen.hourly_price
                ),
                Severity::Info,
            )
            .await;
        Ok(DeployOutcome::Monitoring {
            state: state.clone(),
            health: matrix,
            handle,
        })
    }

    /// Collect candidates and pick one.
    pub async fn choose(&self, req: &DeployRequest) -> Result<SelectionResult, DeployError> {
        let market = req.deployment_type.market();
        let types = self.settings.instance_types_for(req.deployment_type);
        let collection = Collector::new(self.collab.provider.as_ref(), &self.settings)
            .collect(&types, &req.regions, market)
            .await;
        if collection.candidates.is_empty() {
            return Err(DeployError::NoCapacityAvailable(format!(
                "no {} candidates in {} ({} warning(s))",
                market.as_str(),
                req.regions.join(", "),
                collection.warnings.len()
            )));
        }
        let budget = BudgetConstraint::new(req.max_price, self.settings.budget.margin_fraction)
            .map_err(|e| DeployError::ValidationFailure(e.to_string()))?;
        let selection = select(
            &collection.candidates,
            budget,
            &self.settings.architecture_preference,
        )?;

        let c = &selection.chosen;
        println!(
            "🎯 [selection] {} ({}) in {} at ${:.4}/h, score {:.1}, {} candidate(s) considered{}",
            c.instance_type,
            c.architecture,
            c.availability_zone,
            c.hourly_price,
            c.score(),
            selection.considered,
            if selection.budget_adjusted {
                format!(
                    ", budget relaxed ${:.4} -> ${:.4}",
                    selection.original_budget, selection.final_budget
                )
            } else {
                String::new()
            }
        );
        if market == Market::Spot {
            let report = CostReport::build(std::slice::from_ref(c), selection.final_budget);
            for line in &report.lines {
                tracing::info!(
                    "💰 [selection] {:.1}% below on-demand (${:.2}/month saved)",
                    line.savings_percent,
                    line.monthly_savings
                );
            }
        }
        Ok(selection)
    }

    /// The chosen image must still resolve and quota must cover the type.
    /// Returns the image id to launch.
    async fn revalidate(&self, selection: &SelectionResult, market: Market) -> Result<String, DeployError> {
        let c = &selection.chosen;
        let image = self
            .collab
            .provider
            .resolve_image(&c.region, c.architecture)
            .await
            .map_err(|e| DeployError::ValidationFailure(format!("image lookup in {}: {:#}", c.region, e)))?
            .ok_or_else(|| {
                DeployError::ValidationFailure(format!(
                    "no {} image available in {} anymore",
                    c.architecture, c.region
                ))
            })?;
        if image != c.machine_image_id {
            tracing::info!(
                "[state_machine] image for {} {} moved {} -> {}",
                c.region,
                c.architecture,
                c.machine_image_id,
                image
            );
        }

        match self.collab.provider.vcpu_quota(&c.region, market).await {
            Ok(Some(quota)) => {
                let needed = self
                    .settings
                    .profile(&c.instance_type)
                    .map(|p| f64::from(p.vcpus))
                    .unwrap_or(0.0);
                if needed > quota {
                    return Err(DeployError::ValidationFailure(format!(
                        "vCPU quota {} in {} is below the {} needed by {}",
                        quota, c.region, needed, c.instance_type
                    )));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("⚠️ [state_machine] quota check skipped: {:#}", e),
        }
        Ok(image)
    }

    async fn provision(
        &self,
        state: &mut DeploymentState,
        log: &ActionLog,
        selection: &SelectionResult,
        image_id: &str,
    ) -> Result<(String, Option<String>), DeployError> {
        let c = &selection.chosen;
        let infra = self
            .collab
            .infra
            .allocate(&state.stack_name, &c.region, &c.availability_zone)
            .await
            .map_err(|e| DeployError::ProvisioningFailure(format!("infra allocation: {:#}", e)))?;
        for r in &infra.created {
            state.record_resource(r.clone());
        }

        let client_token = client_token(&state.stack_name);
        state.record_resource(ResourceRef::pending_instance(client_token.clone(), c.region.clone()));
        self.persist(state)?;

        let spec = InstanceSpec {
            stack_name: state.stack_name.clone(),
            client_token: client_token.clone(),
            region: c.region.clone(),
            availability_zone: c.availability_zone.clone(),
            instance_type: c.instance_type.clone(),
            architecture: c.architecture,
            image_id: image_id.to_string(),
            market: c.market,
            max_price: (c.market == Market::Spot).then_some(selection.final_budget),
            infra,
            root_volume_gb: self.settings.workload.root_volume_gb,
        };
        let log_id = log.log_event_with_metadata(
            "PROVIDER_CREATE",
            "in_progress",
            None,
            Some(serde_json::json!({
                "client_token": client_token,
                "instance_type": spec.instance_type,
                "zone": spec.availability_zone,
            })),
        );
        let started = Instant::now();
        let resource_id = match self.collab.provider.create_instance(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let msg = format!("create {} in {}: {:#}", spec.instance_type, spec.availability_zone, e);
                log.log_event_complete(
                    log_id,
                    "PROVIDER_CREATE",
                    "failed",
                    started.elapsed().as_millis() as u64,
                    Some(msg.as_str()),
                );
                return Err(DeployError::ProvisioningFailure(msg));
            }
        };
        log.log_event_complete(log_id, "PROVIDER_CREATE", "success", started.elapsed().as_millis() as u64, None);
        if !state.resolve_pending(&client_token, &resource_id) {
            state.record_resource(ResourceRef::new(ResourceKind::Instance, resource_id.clone(), c.region.clone()));
        }
        self.persist(state)?;
        println!("🚀 [state_machine] created {} ({})", resource_id, spec.instance_type);

        let address = self.wait_running(&c.region, &resource_id).await?;
        state.public_address = address.clone();
        self.persist(state)?;
        Ok((resource_id, address))
    }

    async fn wait_running(&self, region: &str, resource_id: &str) -> Result<Option<String>, DeployError> {
        let timings = &self.settings.timings;
        let timeout = timings.provision_timeout();
        let mut interval = tokio::time::interval(timings.provision_poll());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();

        loop {
            interval.tick().await;
            self.check_cancel()?;
            match self.collab.provider.describe_instance(region, resource_id).await {
                Ok(desc) if desc.state == InstanceState::Running => {
                    println!(
                        "✅ [state_machine] {} running after {}s",
                        resource_id,
                        started.elapsed().as_secs()
                    );
                    return Ok(desc.public_address);
                }
                Ok(desc) if desc.state.is_gone() => {
                    return Err(DeployError::ProvisioningFailure(format!(
                        "{} went {:?} while starting",
                        resource_id, desc.state
                    )));
                }
                Ok(desc) => {
                    tracing::debug!("[state_machine] {} is {:?}", resource_id, desc.state);
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!("⚠️ [state_machine] describe {}: {:#}", resource_id, e);
                }
                Err(e) => {
                    return Err(DeployError::ProvisioningFailure(format!(
                        "describe {}: {:#}",
                        resource_id, e
                    )));
                }
            }
            if started.elapsed() >= timeout {
                return Err(DeployError::ProvisioningTimeout {
                    resource_id: resource_id.to_string(),
                    waited_secs: timeout.as_secs(),
                });
            }
        }
    }

    fn start_monitoring(
        &self,
        state: &DeploymentState,
        target: WorkloadTarget,
        validator: HealthValidator,
        host: String,
    ) -> MonitoringHandle {
        let (tx, rx) = watch::channel(false);
        let mut handle = MonitoringHandle::new(tx);
        let timings = &self.settings.timings;

        if state.deployment_type == DeploymentType::Spot {
            let monitor = InterruptionMonitor {
                provider: self.collab.provider.clone(),
                workload: self.collab.workload.clone(),
                notifier: self.collab.notifier.clone(),
                target,
                poll_interval: timings.interruption_poll(),
                stop_grace: timings.stop_grace(),
                shutdown_delay: timings.shutdown_delay(),
                action_log: Some(ActionLog::new(self.store.dir(), &state.stack_name)),
            };
            handle.set_interruption(tokio::spawn(monitor.run(rx.clone())));
        }
        if let Some(every) = timings.revalidation_interval() {
            handle.set_revalidation(tokio::spawn(revalidation_loop(
                validator,
                host,
                every,
                self.collab.notifier.clone(),
                state.stack_name.clone(),
                rx,
            )));
        }
        handle
    }

    async fn fail(
        &self,
        state: &mut DeploymentState,
        log: &ActionLog,
        error: DeployError,
        health: Option<HealthMatrix>,
    ) -> DeployFailure {
        let phase = state.phase;
        eprintln!(
            "❌ [state_machine] {} failed in {}: {} ({})",
            state.stack_name,
            phase,
            error,
            error.kind()
        );
        if let Err(e) = state.fail(error.kind(), &error.to_string()) {
            tracing::warn!("[state_machine] cannot mark failed: {}", e);
        }
        if let Err(e) = self.store.save(state) {
            eprintln!("⚠️ [state_machine] cannot persist failed state: {}", e);
        }

        let mut failure = DeployFailure::new(phase, error);
        failure.health = health;
        if state.resource_ids.is_empty() || !failure.error.triggers_teardown() {
            return failure;
        }

        let report = Terminator::new(self.collab.provider.as_ref(), self.collab.infra.as_ref())
            .with_action_log(log)
            .release_all(state.teardown_order())
            .await;
        if !report.succeeded() {
            self.collab
                .notifier
                .notify(
                    &format!(
                        "Teardown of stack {} failed for {} of {} resource(s); resources may be leaked",
                        state.stack_name,
                        report.failed_count(),
                        report.attempted()
                    ),
                    Severity::Critical,
                )
                .await;
        }
        failure.teardown = Some(report);
        failure
    }

    /// Explicit teardown of a persisted stack.
    pub async fn cleanup(&self, stack_name: &str) -> Result<CleanupOutcome, DeployFailure> {
        validate_stack_name(stack_name)
            .map_err(|e| DeployFailure::new(Phase::Validating, DeployError::ValidationFailure(e.to_string())))?;
        let loaded = self
            .store
            .load(stack_name)
            .map_err(|e| DeployFailure::new(Phase::Validating, DeployError::ValidationFailure(e.to_string())))?;
        let Some(mut state) = loaded else {
            println!("ℹ️ [cleanup] no state for {}, nothing to do", stack_name);
            return Ok(CleanupOutcome::NothingToDo);
        };
        let log = ActionLog::new(self.store.dir(), stack_name);
        let report = Terminator::new(self.collab.provider.as_ref(), self.collab.infra.as_ref())
            .with_action_log(&log)
            .release_all(state.teardown_order())
            .await;

        if report.succeeded() {
            state.resource_ids.clear();
            if state.phase != Phase::Terminated {
                if let Err(e) = state.transition_to(Phase::Terminated) {
                    tracing::warn!("[cleanup] {}", e);
                }
            }
            state.complete_current(PhaseOutcome::Succeeded);
            self.store
                .save(&state)
                .map_err(|e| DeployFailure::new(state.phase, DeployError::ProvisioningFailure(e.to_string())))?;
            let archived_to = self
                .store
                .archive(stack_name)
                .map_err(|e| DeployFailure::new(state.phase, DeployError::ProvisioningFailure(e.to_string())))?;
            log.log_quick("STACK_TERMINATED", None);
            return Ok(CleanupOutcome::Released { report, archived_to });
        }

        // keep only what is still owned so a retry does not repeat released ids
        let failed: Vec<ResourceRef> = report
            .outcomes
            .iter()
            .filter(|o| !o.released)
            .map(|o| o.resource.clone())
            .rev()
            .collect();
        state.resource_ids = failed;
        let error = DeployError::TeardownPartialFailure {
            failed: report.failed_count(),
            attempted: report.attempted(),
        };
        state.last_error = Some(gpustack_common::FailureRecord {
            phase: state.phase,
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        if let Err(e) = self.store.save(&state) {
            eprintln!("⚠️ [cleanup] cannot persist state: {}", e);
        }
        Err(DeployFailure {
            phase: state.phase,
            error,
            teardown: Some(report),
            health: None,
        })
    }
}

/// Idempotency token for the create request: `<stack>-<uuid>`, at most 64 chars.
pub fn client_token(stack_name: &str) -> String {
    // stack names are ASCII, byte slicing is safe
    let prefix = &stack_name[..stack_name.len().min(28)];
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}
