//! capgate — capability gate and subprocess credential filter for
//! agent sandboxes.
//!
//! Untrusted, user-authored code running in a sandbox acquires host
//! facilities through exactly one chokepoint: the sandbox's
//! load-interception hook calls [`CapabilityResolver::resolve`] with
//! a module name and gets back either a usable handle or a policy
//! denial. The gate also guarantees that any subprocess spawned from
//! inside the sandbox never inherits the host's credentials: when the
//! admitted capability is the process-spawning facility, the returned
//! handle is a [`SanitizedSpawner`] that strips [`SECRET_ENV_KEYS`]
//! from the child environment of every spawn-style operation.
//!
//! Out of scope: memory/CPU sandboxing, filesystem access control,
//! and the allowlist policy itself (supplied by the caller as a
//! [`SandboxPolicy`]).

pub mod config;
pub mod error;
pub mod policy;
pub mod resolver;
pub mod spawn;

pub use config::Config;
pub use error::{ExecutionError, SandboxFailure};
pub use policy::{AllowSet, ModuleClass, SandboxPolicy};
pub use resolver::{
    BuiltinRegistry, Capability, CapabilityResolver, ModuleLoader, StaticBuiltinRegistry,
    PROCESS_MODULE,
};
pub use spawn::{
    sanitize_env, EnvMap, ProcessSpawner, SanitizedSpawner, SpawnOptions, StdioMode,
    SystemSpawner, SECRET_ENV_KEYS,
};
