use thiserror::Error;

/// Failures this crate originates at the sandbox boundary.
///
/// Exactly one kind exists today: a capability denied by policy.
/// Failures of the underlying loader or spawn facility are never
/// converted into this type; they propagate with their original
/// diagnostics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SandboxFailure {
    /// The requested module is not admitted by the applicable allow-set.
    #[error("module '{0}' is not allowed by the sandbox policy")]
    DisallowedCapability(String),
}

/// Uniform envelope for all failures surfaced at the sandbox boundary.
///
/// Callers match on one outer kind regardless of cause, and can
/// downcast to [`SandboxFailure`] via [`ExecutionError::failure`]
/// for the specific reason.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("execution error: {0}")]
pub struct ExecutionError(#[from] pub SandboxFailure);

impl ExecutionError {
    /// The rejected module name, for diagnostics.
    pub fn module_name(&self) -> &str {
        let SandboxFailure::DisallowedCapability(name) = &self.0;
        name
    }

    /// The underlying failure kind.
    pub fn failure(&self) -> &SandboxFailure {
        &self.0
    }
}
