//! Background tasks owned by a deployment that reached `monitoring`.
use gpustack_common::{Phase, Severity};
use gpustack_providers::Notifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::health_check::HealthValidator;
use crate::interruption_monitor::MonitorOutcome;
use crate::state_store::StateStore;

/// Resolves once `rx` holds `true`. A closed channel never resolves.
pub async fn wait_for_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct MonitoringHandle {
    cancel: watch::Sender<bool>,
    interruption: Option<JoinHandle<MonitorOutcome>>,
    revalidation: Option<JoinHandle<()>>,
}

impl MonitoringHandle {
    pub fn new(cancel: watch::Sender<bool>) -> Self {
        Self {
            cancel,
            interruption: None,
            revalidation: None,
        }
    }

    pub fn set_interruption(&mut self, handle: JoinHandle<MonitorOutcome>) {
        self.interruption = Some(handle);
    }

    pub fn set_revalidation(&mut self, handle: JoinHandle<()>) {
        self.revalidation = Some(handle);
    }

    pub fn has_interruption_monitor(&self) -> bool {
        self.interruption.is_some()
    }

    pub fn has_revalidation(&self) -> bool {
        self.revalidation.is_some()
    }

    /// Cancel every task and wait for them to exit.
    pub async fn shutdown(mut self) -> Option<MonitorOutcome> {
        let _ = self.cancel.send(true);
        let outcome = match self.interruption.take() {
            Some(h) => h.await.ok(),
            None => None,
        };
        if let Some(h) = self.revalidation.take() {
            let _ = h.await;
        }
        outcome
    }

    /// Block until the interruption monitor ends on its own or `stop` fires.
    pub async fn wait(mut self, mut stop: watch::Receiver<bool>) -> Option<MonitorOutcome> {
        let Some(mut interruption) = self.interruption.take() else {
            wait_for_true(&mut stop).await;
            return self.shutdown().await;
        };
        tokio::select! {
            res = &mut interruption => {
                let _ = self.cancel.send(true);
                if let Some(h) = self.revalidation.take() {
                    let _ = h.await;
                }
                res.ok()
            }
            _ = wait_for_true(&mut stop) => {
                self.interruption = Some(interruption);
                self.shutdown().await
            }
        }
    }
}

/// Periodic health sweep while monitoring; unhealthy services raise a warning.
pub async fn revalidation_loop(
    validator: HealthValidator,
    host: String,
    every: Duration,
    notifier: Arc<dyn Notifier>,
    stack_name: String,
    mut cancel: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!("🩺 [job-revalidation] {} every {}s", stack_name, every.as_secs());

    loop {
        tokio::select! {
            _ = wait_for_true(&mut cancel) => return,
            _ = interval.tick() => {}
        }
        let matrix = tokio::select! {
            _ = wait_for_true(&mut cancel) => return,
            m = validator.validate(&host) => m,
        };
        if matrix.overall_healthy() {
            tracing::debug!("[job-revalidation] {} healthy", stack_name);
            continue;
        }
        let unhealthy = matrix.unhealthy_services();
        notifier
            .notify(
                &format!(
                    "Stack {}: services unhealthy on re-validation: {}",
                    stack_name,
                    unhealthy.join(", ")
                ),
                Severity::Warning,
            )
            .await;
    }
}

/// Fire `stop` when the persisted state disappears or reaches `terminated`,
/// which is how an explicit teardown from another process shows up here.
pub async fn watch_for_external_teardown(
    store: StateStore,
    stack_name: String,
    every: Duration,
    stop: Arc<watch::Sender<bool>>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if *stop.borrow() {
            return;
        }
        match store.load(&stack_name) {
            Ok(None) => {
                tracing::info!("🛑 [monitoring] {} state archived, stopping", stack_name);
                let _ = stop.send(true);
                return;
            }
            Ok(Some(state)) if state.phase == Phase::Terminated => {
                tracing::info!("🛑 [monitoring] {} terminated, stopping", stack_name);
                let _ = stop.send(true);
                return;
            }
            Ok(Some(_)) => {}
            Err(e) => tracing::warn!("⚠️ [monitoring] cannot read state for {}: {}", stack_name, e),
        }
    }
}
