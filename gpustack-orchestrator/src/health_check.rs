// ============================================================================
// SERVICE HEALTH VALIDATION
// ============================================================================

use async_trait::async_trait;
use chrono::Utc;
use gpustack_common::{HealthCheckResult, HealthMatrix, HealthStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{HealthSettings, ServiceCheck};

/// One request against one endpoint. `Ok` iff the endpoint answered 2xx.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), String>;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> anyhow::Result<Self> {
        // the per-request timeout is set on every call
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EndpointProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), String> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("timed out after {}s", timeout.as_secs())
                } else {
                    format!("request failed: {}", e)
                }
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("http {}", resp.status().as_u16()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    pub max_attempts: u32,
    pub per_try_timeout: Duration,
    pub base_delay: Duration,
}

impl From<&HealthSettings> for HealthPolicy {
    fn from(s: &HealthSettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            per_try_timeout: Duration::from_secs(s.per_try_timeout_secs),
            base_delay: Duration::from_secs(s.base_delay_secs),
        }
    }
}

#[derive(Clone)]
pub struct HealthValidator {
    probe: Arc<dyn EndpointProbe>,
    services: Vec<ServiceCheck>,
    policy: HealthPolicy,
}

impl HealthValidator {
    pub fn new(probe: Arc<dyn EndpointProbe>, services: Vec<ServiceCheck>, policy: HealthPolicy) -> Self {
        Self {
            probe,
            services,
            policy,
        }
    }

    pub fn from_settings(probe: Arc<dyn EndpointProbe>, settings: &HealthSettings) -> Self {
        Self::new(probe, settings.services.clone(), HealthPolicy::from(settings))
    }

    fn unknown_matrix(&self, host: &str) -> HealthMatrix {
        let mut matrix = HealthMatrix::new();
        for s in &self.services {
            matrix.insert(HealthCheckResult::unknown(&s.name, &s.render_endpoint(host)));
        }
        matrix
    }

    /// Check every service in order. The matrix has one entry per service.
    pub async fn validate(&self, host: &str) -> HealthMatrix {
        let mut matrix = self.unknown_matrix(host);
        self.fill(host, &mut matrix).await;
        matrix
    }

    /// Like [`validate`](Self::validate) but bounded by `overall`; services not
    /// finished in time stay `unknown`. Returns whether the bound was hit.
    pub async fn validate_within(&self, host: &str, overall: Duration) -> (HealthMatrix, bool) {
        let mut matrix = self.unknown_matrix(host);
        let timed_out = tokio::time::timeout(overall, self.fill(host, &mut matrix))
            .await
            .is_err();
        if timed_out {
            tracing::warn!(
                "⏱️ [health] validation bound of {}s reached",
                overall.as_secs()
            );
        }
        (matrix, timed_out)
    }

    async fn fill(&self, host: &str, matrix: &mut HealthMatrix) {
        for service in &self.services {
            let result = self.check_service(service, host).await;
            match result.status {
                HealthStatus::Healthy => tracing::info!(
                    "✅ [health] {} healthy after {} attempt(s) ({}ms)",
                    result.service_name,
                    result.attempt_count,
                    result.latency_ms.unwrap_or(0)
                ),
                _ => tracing::warn!(
                    "❌ [health] {} unhealthy after {} attempt(s): {}",
                    result.service_name,
                    result.attempt_count,
                    result.last_error.as_deref().unwrap_or("-")
                ),
            }
            matrix.insert(result);
        }
    }

    pub async fn check_service(&self, service: &ServiceCheck, host: &str) -> HealthCheckResult {
        let endpoint = service.render_endpoint(host);
        if service.warmup_secs > 0 {
            tokio::time::sleep(Duration::from_secs(service.warmup_secs)).await;
        }
        let max_attempts = service.max_attempts.unwrap_or(self.policy.max_attempts).max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.policy.per_try_timeout,
                self.probe.probe(&endpoint, self.policy.per_try_timeout),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(format!(
                    "timed out after {}s",
                    self.policy.per_try_timeout.as_secs()
                )),
            };
            match outcome {
                Ok(()) => {
                    return HealthCheckResult {
                        service_name: service.name.clone(),
                        endpoint,
                        status: HealthStatus::Healthy,
                        latency_ms: Some(started.elapsed().as_millis() as u64),
                        checked_at: Utc::now(),
                        attempt_count: attempt,
                        last_error,
                    };
                }
                Err(e) => {
                    tracing::debug!("[health] {} attempt {}/{}: {}", service.name, attempt, max_attempts, e);
                    last_error = Some(e);
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.base_delay * attempt).await;
            }
        }

        HealthCheckResult {
            service_name: service.name.clone(),
            endpoint,
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            checked_at: Utc::now(),
            attempt_count: max_attempts,
            last_error,
        }
    }
}

pub fn render_matrix(matrix: &HealthMatrix) -> String {
    let mut out = String::new();
    for r in matrix.iter() {
        out.push_str(&format!(
            "{:<10} {:<9} attempts={} latency={} {}{}\n",
            r.service_name,
            r.status.as_str(),
            r.attempt_count,
            r.latency_ms.map(|ms| format!("{}ms", ms)).unwrap_or_else(|| "-".into()),
            r.endpoint,
            r.last_error
                .as_deref()
                .filter(|_| r.status != HealthStatus::Healthy)
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        ));
    }
    out
}
