//! Error taxonomy for the tracing core.
//!
//! - contract violations are programmer errors and carry the offending
//!   ray's rendered state;
//! - setup errors surface before propagation, never during;
//! - geometric failures may be tolerated (ray killed, counted, summarized);
//! - claim failures are always fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RayTracingError {
    /// Programmer error against the Ray/hook contracts. Includes the full
    /// state of the offending ray.
    #[error("ray contract violation: {reason}\n\n{ray_info}")]
    ContractViolation { reason: String, ray_info: String },

    /// Configuration or coverage error detected at setup.
    #[error("study setup error: {0}")]
    Setup(String),

    /// A trace could not make progress. Fatal unless the study tolerates
    /// failures, in which case the executor kills the ray and counts it.
    #[error("trace failed: {reason}\n\n{state}")]
    TraceFailed { reason: String, state: String },

    /// A replicated ray was claimed by zero or multiple ranks.
    #[error("claim failed: {0}")]
    ClaimFailed(String),
}

impl RayTracingError {
    pub fn contract(reason: impl Into<String>, ray_info: impl Into<String>) -> Self {
        Self::ContractViolation {
            reason: reason.into(),
            ray_info: ray_info.into(),
        }
    }

    pub fn setup(reason: impl Into<String>) -> Self {
        Self::Setup(reason.into())
    }

    /// Whether this error may be downgraded to a warning in tolerant mode.
    pub fn tolerable(&self) -> bool {
        matches!(self, Self::TraceFailed { .. })
    }
}

pub type Result<T, E = RayTracingError> = std::result::Result<T, E>;
