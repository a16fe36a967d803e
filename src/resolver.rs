//! Capability gate.
//!
//! The single chokepoint through which untrusted code acquires host
//! facilities. The sandbox's load-interception hook calls
//! [`CapabilityResolver::resolve`] with a module name; the gate
//! classifies it, checks the matching allow-set, performs the load,
//! and — for the process-spawning facility only — substitutes the raw
//! handle with a credential-filtered one before returning it.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::{ExecutionError, SandboxFailure};
use crate::policy::{ModuleClass, SandboxPolicy};
use crate::spawn::{ambient_env, EnvMap, ProcessSpawner, SanitizedSpawner};

/// Name of the built-in process-spawning facility. Matched exactly —
/// no patterns, no aliases.
pub const PROCESS_MODULE: &str = "process";

/// The host runtime's registry of built-in facility names.
///
/// Treated as ground truth for classification: a name it recognizes
/// is checked only against the builtin allow-set, every other name
/// only against the external one.
pub trait BuiltinRegistry: Send + Sync {
    fn is_builtin(&self, name: &str) -> bool;
}

/// Registry backed by a fixed set of names.
pub struct StaticBuiltinRegistry {
    names: HashSet<String>,
}

impl StaticBuiltinRegistry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl BuiltinRegistry for StaticBuiltinRegistry {
    fn is_builtin(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// A loaded facility handle returned to the sandbox.
#[derive(Clone)]
pub enum Capability {
    /// The process-spawning facility.
    Process(Arc<dyn ProcessSpawner>),
    /// Any other facility, opaque to the gate.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Process(_) => f.write_str("Capability::Process(..)"),
            Capability::Opaque(_) => f.write_str("Capability::Opaque(..)"),
        }
    }
}

/// The host's capability-loading mechanism.
///
/// Invoked only after admission. Load failures ("module not found",
/// host-level permission errors) propagate to the caller unchanged;
/// the gate never catches or reinterprets them.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Capability>;
}

/// Protective wrappers applied post-load, keyed by exact module name.
/// Adding a protected capability is an entry here, not a new branch
/// in `resolve`.
const PROTECTED_CAPABILITIES: &[(&str, fn(Capability, &EnvMap) -> Capability)] =
    &[(PROCESS_MODULE, wrap_process)];

fn wrap_process(capability: Capability, ambient: &EnvMap) -> Capability {
    match capability {
        Capability::Process(raw) => {
            Capability::Process(Arc::new(SanitizedSpawner::new(raw, ambient.clone())))
        }
        // Loader produced an unexpected shape for this name; nothing
        // spawn-capable to wrap
        other => other,
    }
}

/// Stateless admission gate over an immutable [`SandboxPolicy`].
///
/// Every request is re-resolved independently; nothing is cached
/// across calls.
pub struct CapabilityResolver {
    policy: SandboxPolicy,
    registry: Arc<dyn BuiltinRegistry>,
    loader: Arc<dyn ModuleLoader>,
    /// Environment base handed to protective wrappers, captured once
    /// at construction.
    ambient: EnvMap,
}

impl CapabilityResolver {
    /// Builds a resolver with a snapshot of the current process
    /// environment.
    pub fn new(
        policy: SandboxPolicy,
        registry: Arc<dyn BuiltinRegistry>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Self {
        Self::with_ambient_env(policy, registry, loader, ambient_env())
    }

    /// Builds a resolver with an explicit environment snapshot
    /// (tests inject a synthetic one instead of touching real
    /// process state).
    pub fn with_ambient_env(
        policy: SandboxPolicy,
        registry: Arc<dyn BuiltinRegistry>,
        loader: Arc<dyn ModuleLoader>,
        ambient: EnvMap,
    ) -> Self {
        Self {
            policy,
            registry,
            loader,
            ambient,
        }
    }

    /// Classifies `name`, checks the matching allow-set, and loads
    /// the facility on admission.
    ///
    /// Denial fails with an [`ExecutionError`] wrapping
    /// [`SandboxFailure::DisallowedCapability`] before any load is
    /// attempted. For [`PROCESS_MODULE`] the returned handle is the
    /// credential-filtered facility, never the raw one.
    pub fn resolve(&self, name: &str) -> Result<Capability> {
        let class = if self.registry.is_builtin(name) {
            ModuleClass::Builtin
        } else {
            ModuleClass::External
        };

        if !self.policy.admits(class, name) {
            warn!("Denied {class:?} module '{name}'");
            return Err(
                ExecutionError::from(SandboxFailure::DisallowedCapability(name.to_string()))
                    .into(),
            );
        }

        debug!("Admitted {class:?} module '{name}', loading");
        let capability = self.loader.load(name)?;

        match PROTECTED_CAPABILITIES
            .iter()
            .find(|(protected, _)| *protected == name)
        {
            Some((_, wrap)) => Ok(wrap(capability, &self.ambient)),
            None => Ok(capability),
        }
    }
}
