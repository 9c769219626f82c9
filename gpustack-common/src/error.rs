use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Phase;

/// Deployment failure taxonomy. Every fatal error maps to a CLI exit code.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DeployError {
    #[error("no usable capacity: {0}")]
    NoCapacityAvailable(String),

    #[error("candidate no longer valid: {0}")]
    ValidationFailure(String),

    #[error("resource {resource_id} did not reach running within {waited_secs}s")]
    ProvisioningTimeout { resource_id: String, waited_secs: u64 },

    #[error("provisioning failed: {0}")]
    ProvisioningFailure(String),

    #[error("configuration failed: {0}")]
    ConfigurationFailure(String),

    #[error("health check failed for: {}", unhealthy.join(", "))]
    HealthCheckFailure { unhealthy: Vec<String> },

    #[error("teardown failed for {failed} of {attempted} resource(s)")]
    TeardownPartialFailure { failed: usize, attempted: usize },

    #[error("deployment cancelled by operator")]
    Cancelled,
}

impl DeployError {
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::NoCapacityAvailable(_) => "NoCapacityAvailable",
            DeployError::ValidationFailure(_) => "ValidationFailure",
            DeployError::ProvisioningTimeout { .. } => "ProvisioningTimeout",
            DeployError::ProvisioningFailure(_) => "ProvisioningFailure",
            DeployError::ConfigurationFailure(_) => "ConfigurationFailure",
            DeployError::HealthCheckFailure { .. } => "HealthCheckFailure",
            DeployError::TeardownPartialFailure { .. } => "TeardownPartialFailure",
            DeployError::Cancelled => "Cancelled",
        }
    }

    /// Whether entering `failed` with this error releases resources.
    pub fn triggers_teardown(&self) -> bool {
        !matches!(
            self,
            DeployError::NoCapacityAvailable(_)
                | DeployError::ValidationFailure(_)
                | DeployError::TeardownPartialFailure { .. }
        )
    }

    /// Exit code assuming any triggered teardown completed.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::NoCapacityAvailable(_) | DeployError::ValidationFailure(_) => 1,
            DeployError::TeardownPartialFailure { .. } => 3,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("invalid budget: {0}")]
    InvalidBudget(String),

    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("invalid stack name '{0}' (expected [a-zA-Z0-9-]+)")]
    InvalidStackName(String),

    #[error("unknown {field} '{value}'")]
    UnknownValue { field: &'static str, value: String },
}
