//! Subprocess credential filter.
//!
//! The process-spawning facility handed to untrusted code is never the
//! raw one: the capability gate wraps it in [`SanitizedSpawner`], which
//! strips the [`SECRET_ENV_KEYS`] entries from the child environment on
//! every spawn-style operation before delegating. This is the single
//! enforcement point — every spawn-capable method on [`ProcessSpawner`]
//! must go through the same sanitation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

/// Environment variable names holding credentials that must never
/// reach a subprocess spawned from inside the sandbox.
///
/// Deliberately a build-time constant, disjoint from the configurable
/// allow-sets: the surface that controls module allowlisting must not
/// be able to weaken credential stripping.
pub const SECRET_ENV_KEYS: [&str; 3] = [
    "ANTHROPIC_API_KEY",
    "AGENT_RUNNER_AUTH_TOKEN",
    "AGENT_RUNNER_GRANT_TOKEN",
];

/// A snapshot of environment variables, name → value.
pub type EnvMap = HashMap<String, String>;

/// Captures the current process environment as a snapshot.
pub fn ambient_env() -> EnvMap {
    std::env::vars().collect()
}

/// Builds the environment a subprocess will receive.
///
/// The explicit `env` option fully replaces the ambient snapshot when
/// present (it is not merged). The result is always a fresh map with
/// every [`SECRET_ENV_KEYS`] entry removed; neither input is mutated.
pub fn sanitize_env(explicit: Option<&EnvMap>, ambient: &EnvMap) -> EnvMap {
    let mut env = explicit.unwrap_or(ambient).clone();
    for key in SECRET_ENV_KEYS {
        env.remove(key);
    }
    env
}

/// How a spawned child's stdio streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Inherit the parent's streams.
    #[default]
    Inherit,
    /// Pipe all three streams.
    Piped,
    /// Discard all three streams.
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

/// Options forwarded to a spawn-style operation.
///
/// The credential filter substitutes `env` and forwards every other
/// field verbatim.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Explicit child environment. When `None`, the ambient snapshot
    /// of the facility is used as the base.
    pub env: Option<EnvMap>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Time limit for the run-to-completion operations (`exec`,
    /// `exec_file`); the child is killed on expiry. Ignored by the
    /// handle-returning operations, whose lifetime the caller owns.
    pub timeout: Option<Duration>,
    /// Stdio wiring for the handle-returning operations (`spawn`,
    /// `fork`); the run-to-completion operations always pipe.
    pub stdio: StdioMode,
}

/// The process-spawning facility.
///
/// Four operations start a subprocess; `default_shell` is a
/// non-spawning member forwarded untouched by the credential filter.
/// Any new spawn-capable method added here must receive the same
/// sanitation treatment in [`SanitizedSpawner`].
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Starts `program` with `args` and returns the child handle.
    async fn spawn(&self, program: &str, args: &[String], options: SpawnOptions) -> Result<Child>;

    /// Runs `command` through the shell to completion and returns its
    /// captured output.
    async fn exec(&self, command: &str, options: SpawnOptions) -> Result<Output>;

    /// Runs the executable at `path` directly (no shell) to completion
    /// and returns its captured output.
    async fn exec_file(&self, path: &Path, args: &[String], options: SpawnOptions)
        -> Result<Output>;

    /// Starts a worker process running `module` in a fresh copy of the
    /// current executable and returns the child handle.
    async fn fork(&self, module: &Path, args: &[String], options: SpawnOptions) -> Result<Child>;

    /// Shell used by `exec`. Non-spawning.
    fn default_shell(&self) -> String;
}

// ── Host implementation ─────────────────────────────────────────────

/// Default shell for `exec`. An absolute path, so lookup does not
/// depend on the child's `PATH`.
const DEFAULT_SHELL: &str = "/bin/sh";

/// The real process-spawning facility, over `tokio::process`.
pub struct SystemSpawner {
    shell: String,
}

impl SystemSpawner {
    pub fn new() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
        }
    }

    /// Applies the common options to a command builder.
    fn configure(cmd: &mut Command, options: &SpawnOptions) {
        if let Some(env) = &options.env {
            cmd.env_clear().envs(env);
        }
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
    }

    /// Runs a configured command to completion, enforcing the timeout
    /// if one was supplied.
    async fn run_to_completion(mut cmd: Command, timeout: Option<Duration>) -> Result<Output> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // On timeout the wait future is dropped; make sure the
            // child does not outlive it
            .kill_on_drop(true);

        let child = cmd.spawn().context("failed to spawn subprocess")?;
        match timeout {
            None => Ok(child.wait_with_output().await?),
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => Ok(output?),
                Err(_) => bail!("subprocess timed out after {}ms", limit.as_millis()),
            },
        }
    }
}

impl Default for SystemSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSpawner for SystemSpawner {
    async fn spawn(&self, program: &str, args: &[String], options: SpawnOptions) -> Result<Child> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(options.stdio.to_stdio())
            .stdout(options.stdio.to_stdio())
            .stderr(options.stdio.to_stdio());
        Self::configure(&mut cmd, &options);
        debug!("Spawning {program} with {} args", args.len());
        cmd.spawn()
            .with_context(|| format!("failed to spawn '{program}'"))
    }

    async fn exec(&self, command: &str, options: SpawnOptions) -> Result<Output> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        Self::configure(&mut cmd, &options);
        debug!("Executing shell command via {}", self.shell);
        Self::run_to_completion(cmd, options.timeout).await
    }

    async fn exec_file(
        &self,
        path: &Path,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<Output> {
        let mut cmd = Command::new(path);
        cmd.args(args);
        Self::configure(&mut cmd, &options);
        debug!("Executing file {}", path.display());
        Self::run_to_completion(cmd, options.timeout).await
    }

    async fn fork(&self, module: &Path, args: &[String], options: SpawnOptions) -> Result<Child> {
        let exe = std::env::current_exe().context("cannot locate current executable")?;
        let mut cmd = Command::new(&exe);
        cmd.arg(module)
            .args(args)
            .stdin(options.stdio.to_stdio())
            .stdout(options.stdio.to_stdio())
            .stderr(options.stdio.to_stdio());
        Self::configure(&mut cmd, &options);
        debug!("Forking worker for module {}", module.display());
        cmd.spawn()
            .with_context(|| format!("failed to fork worker for '{}'", module.display()))
    }

    fn default_shell(&self) -> String {
        self.shell.clone()
    }
}

// ── Credential filter ───────────────────────────────────────────────

/// Drop-in replacement for a [`ProcessSpawner`] that strips the
/// [`SECRET_ENV_KEYS`] entries from the child environment of every
/// spawn-style operation before delegating.
///
/// Observably transparent apart from the environment substitution:
/// all other options are forwarded verbatim, results come back
/// unmodified, and non-spawning members delegate directly. The ambient
/// snapshot is injected at construction rather than read per call, so
/// the filter is a pure function of its inputs.
pub struct SanitizedSpawner {
    inner: Arc<dyn ProcessSpawner>,
    ambient: EnvMap,
}

impl SanitizedSpawner {
    /// Wraps `inner`, using `ambient` as the environment base when a
    /// spawn call carries no explicit `env` option.
    pub fn new(inner: Arc<dyn ProcessSpawner>, ambient: EnvMap) -> Self {
        Self { inner, ambient }
    }

    /// Wraps `inner` with a snapshot of the current process environment.
    pub fn from_ambient(inner: Arc<dyn ProcessSpawner>) -> Self {
        Self::new(inner, ambient_env())
    }

    /// The uniform sanitation step: replace `env`, forward the rest.
    fn sanitized(&self, options: SpawnOptions) -> SpawnOptions {
        SpawnOptions {
            env: Some(sanitize_env(options.env.as_ref(), &self.ambient)),
            ..options
        }
    }
}

#[async_trait]
impl ProcessSpawner for SanitizedSpawner {
    async fn spawn(&self, program: &str, args: &[String], options: SpawnOptions) -> Result<Child> {
        let options = self.sanitized(options);
        self.inner.spawn(program, args, options).await
    }

    async fn exec(&self, command: &str, options: SpawnOptions) -> Result<Output> {
        let options = self.sanitized(options);
        self.inner.exec(command, options).await
    }

    async fn exec_file(
        &self,
        path: &Path,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<Output> {
        let options = self.sanitized(options);
        self.inner.exec_file(path, args, options).await
    }

    async fn fork(&self, module: &Path, args: &[String], options: SpawnOptions) -> Result<Child> {
        let options = self.sanitized(options);
        self.inner.fork(module, args, options).await
    }

    fn default_shell(&self) -> String {
        self.inner.default_shell()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn env_of(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ── sanitize_env tests ──────────────────────────────

    #[test]
    fn test_sanitize_strips_all_secret_keys_from_ambient() {
        let ambient = env_of(&[
            ("PATH", "/usr/bin"),
            ("ANTHROPIC_API_KEY", "sk-ant-xxx"),
            ("AGENT_RUNNER_AUTH_TOKEN", "auth"),
            ("AGENT_RUNNER_GRANT_TOKEN", "grant"),
        ]);
        let env = sanitize_env(None, &ambient);
        assert_eq!(env, env_of(&[("PATH", "/usr/bin")]));
    }

    #[test]
    fn test_sanitize_explicit_env_replaces_ambient() {
        let ambient = env_of(&[("ANTHROPIC_API_KEY", "sk-ant-xxx"), ("HOME", "/root")]);
        let explicit = env_of(&[("SECRET", "x")]);
        // Explicit option fully replaces ambient, then gets filtered:
        // HOME from ambient must not leak through
        let env = sanitize_env(Some(&explicit), &ambient);
        assert_eq!(env, env_of(&[("SECRET", "x")]));
    }

    #[test]
    fn test_sanitize_explicit_env_is_filtered_too() {
        let ambient = EnvMap::new();
        let explicit = env_of(&[("ANTHROPIC_API_KEY", "smuggled"), ("KEEP", "1")]);
        let env = sanitize_env(Some(&explicit), &ambient);
        assert_eq!(env, env_of(&[("KEEP", "1")]));
    }

    #[test]
    fn test_sanitize_preserves_keys_absent_from_ambient() {
        let ambient = env_of(&[("PATH", "/usr/bin")]);
        let explicit = env_of(&[("ONLY_IN_EXPLICIT", "yes")]);
        let env = sanitize_env(Some(&explicit), &ambient);
        assert_eq!(env, env_of(&[("ONLY_IN_EXPLICIT", "yes")]));
    }

    #[test]
    fn test_sanitize_idempotent_on_clean_env() {
        let clean = env_of(&[("PATH", "/usr/bin"), ("LANG", "C")]);
        assert_eq!(sanitize_env(None, &clean), clean);
        assert_eq!(sanitize_env(Some(&clean), &EnvMap::new()), clean);
    }

    #[test]
    fn test_sanitize_does_not_mutate_inputs() {
        let ambient = env_of(&[("ANTHROPIC_API_KEY", "sk-ant-xxx")]);
        let _ = sanitize_env(None, &ambient);
        assert!(ambient.contains_key("ANTHROPIC_API_KEY"));
    }

    // ── SanitizedSpawner tests ──────────────────────────

    /// Which spawn-style operation a recorded call went through.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Spawn,
        Exec,
        ExecFile,
        Fork,
    }

    /// Fake facility recording the options each operation received.
    /// Child handles are real but trivial ("true" exits immediately).
    struct RecordingSpawner {
        calls: Mutex<Vec<(Op, Option<EnvMap>)>>,
    }

    impl RecordingSpawner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, op: Op, options: &SpawnOptions) {
            self.calls.lock().unwrap().push((op, options.env.clone()));
        }

        fn recorded_env(&self, index: usize) -> Option<EnvMap> {
            self.calls.lock().unwrap()[index].1.clone()
        }

        fn trivial_child() -> Result<Child> {
            Ok(Command::new("true").spawn()?)
        }

        fn trivial_output() -> Result<Output> {
            use std::os::unix::process::ExitStatusExt;
            Ok(Output {
                status: std::process::ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl ProcessSpawner for RecordingSpawner {
        async fn spawn(
            &self,
            _program: &str,
            _args: &[String],
            options: SpawnOptions,
        ) -> Result<Child> {
            self.record(Op::Spawn, &options);
            Self::trivial_child()
        }

        async fn exec(&self, _command: &str, options: SpawnOptions) -> Result<Output> {
            self.record(Op::Exec, &options);
            Self::trivial_output()
        }

        async fn exec_file(
            &self,
            _path: &Path,
            _args: &[String],
            options: SpawnOptions,
        ) -> Result<Output> {
            self.record(Op::ExecFile, &options);
            Self::trivial_output()
        }

        async fn fork(
            &self,
            _module: &Path,
            _args: &[String],
            options: SpawnOptions,
        ) -> Result<Child> {
            self.record(Op::Fork, &options);
            Self::trivial_child()
        }

        fn default_shell(&self) -> String {
            "/bin/recorded-shell".to_string()
        }
    }

    fn ambient_with_secrets() -> EnvMap {
        env_of(&[
            ("PATH", "/usr/bin"),
            ("HOME", "/home/agent"),
            ("ANTHROPIC_API_KEY", "sk-ant-xxx"),
            ("AGENT_RUNNER_AUTH_TOKEN", "auth"),
            ("AGENT_RUNNER_GRANT_TOKEN", "grant"),
        ])
    }

    #[tokio::test]
    async fn test_all_four_operations_sanitize_ambient() {
        let raw = RecordingSpawner::new();
        let filtered = SanitizedSpawner::new(raw.clone(), ambient_with_secrets());
        let expected = env_of(&[("PATH", "/usr/bin"), ("HOME", "/home/agent")]);

        filtered
            .spawn("ls", &[], SpawnOptions::default())
            .await
            .unwrap();
        filtered.exec("ls", SpawnOptions::default()).await.unwrap();
        filtered
            .exec_file(Path::new("/bin/ls"), &[], SpawnOptions::default())
            .await
            .unwrap();
        filtered
            .fork(Path::new("worker.rs"), &[], SpawnOptions::default())
            .await
            .unwrap();

        for index in 0..4 {
            assert_eq!(raw.recorded_env(index), Some(expected.clone()));
        }
    }

    #[tokio::test]
    async fn test_explicit_env_replaces_ambient_then_filtered() {
        // Spec scenario: options.env = {SECRET: "x"} with
        // ANTHROPIC_API_KEY in the ambient environment — the child
        // must receive {SECRET: "x"} only
        let raw = RecordingSpawner::new();
        let filtered = SanitizedSpawner::new(raw.clone(), ambient_with_secrets());

        let options = SpawnOptions {
            env: Some(env_of(&[("SECRET", "x")])),
            ..Default::default()
        };
        filtered.spawn("ls", &[], options).await.unwrap();

        assert_eq!(raw.recorded_env(0), Some(env_of(&[("SECRET", "x")])));
    }

    #[tokio::test]
    async fn test_secret_in_explicit_env_is_stripped() {
        let raw = RecordingSpawner::new();
        let filtered = SanitizedSpawner::new(raw.clone(), EnvMap::new());

        let options = SpawnOptions {
            env: Some(env_of(&[("ANTHROPIC_API_KEY", "smuggled"), ("OK", "1")])),
            ..Default::default()
        };
        filtered.exec("ls", options).await.unwrap();

        assert_eq!(raw.recorded_env(0), Some(env_of(&[("OK", "1")])));
    }

    #[tokio::test]
    async fn test_non_env_options_forwarded_verbatim() {
        struct OptionsCheck;

        #[async_trait]
        impl ProcessSpawner for OptionsCheck {
            async fn spawn(
                &self,
                _program: &str,
                _args: &[String],
                options: SpawnOptions,
            ) -> Result<Child> {
                assert_eq!(options.cwd.as_deref(), Some(Path::new("/tmp/work")));
                assert_eq!(options.timeout, Some(Duration::from_secs(5)));
                assert_eq!(options.stdio, StdioMode::Piped);
                Ok(Command::new("true").spawn()?)
            }
            async fn exec(&self, _command: &str, _options: SpawnOptions) -> Result<Output> {
                unreachable!()
            }
            async fn exec_file(
                &self,
                _path: &Path,
                _args: &[String],
                _options: SpawnOptions,
            ) -> Result<Output> {
                unreachable!()
            }
            async fn fork(
                &self,
                _module: &Path,
                _args: &[String],
                _options: SpawnOptions,
            ) -> Result<Child> {
                unreachable!()
            }
            fn default_shell(&self) -> String {
                unreachable!()
            }
        }

        let filtered = SanitizedSpawner::new(Arc::new(OptionsCheck), EnvMap::new());
        let options = SpawnOptions {
            env: None,
            cwd: Some(PathBuf::from("/tmp/work")),
            timeout: Some(Duration::from_secs(5)),
            stdio: StdioMode::Piped,
        };
        filtered.spawn("ls", &[], options).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_spawning_member_passes_through() {
        let raw = RecordingSpawner::new();
        let filtered = SanitizedSpawner::new(raw.clone(), EnvMap::new());
        assert_eq!(filtered.default_shell(), raw.default_shell());
    }

    // ── SystemSpawner tests ─────────────────────────────

    #[tokio::test]
    async fn test_system_exec_receives_explicit_env_only() {
        let spawner = SystemSpawner::new();
        let options = SpawnOptions {
            env: Some(env_of(&[("MARKER", "visible")])),
            ..Default::default()
        };
        let output = spawner
            .exec("printf '%s' \"$MARKER-$ANTHROPIC_API_KEY\"", options)
            .await
            .unwrap();
        assert!(output.status.success());
        // MARKER set, ANTHROPIC_API_KEY empty (env was cleared)
        assert_eq!(String::from_utf8_lossy(&output.stdout), "visible-");
    }

    #[tokio::test]
    async fn test_system_exec_file_runs_without_shell() {
        let spawner = SystemSpawner::new();
        let output = spawner
            .exec_file(
                Path::new("/bin/echo"),
                &["hello".to_string()],
                SpawnOptions::default(),
            )
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
    }

    #[tokio::test]
    async fn test_system_exec_honors_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = SystemSpawner::new();
        let options = SpawnOptions {
            cwd: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let output = spawner.exec("pwd", options).await.unwrap();
        let reported = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim().to_string());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_system_exec_timeout_kills_child() {
        let spawner = SystemSpawner::new();
        let options = SpawnOptions {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let result = spawner.exec("sleep 5", options).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_system_spawn_returns_waitable_child() {
        let spawner = SystemSpawner::new();
        let options = SpawnOptions {
            stdio: StdioMode::Null,
            ..Default::default()
        };
        let mut child = spawner
            .spawn("/bin/sh", &["-c".to_string(), "exit 0".to_string()], options)
            .await
            .unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
