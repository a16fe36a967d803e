use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use capgate::resolver::{Capability, ModuleLoader};
use capgate::{AllowSet, CapabilityResolver, Config, StaticBuiltinRegistry};

/// Loader that never touches the host: every admitted name resolves
/// to a placeholder handle. Good enough to lint a policy file.
struct DryRunLoader;

impl ModuleLoader for DryRunLoader {
    fn load(&self, _name: &str) -> Result<Capability> {
        Ok(Capability::Opaque(Arc::new(())))
    }
}

fn describe(set: &AllowSet) -> String {
    match set {
        AllowSet::Wildcard => "* (all)".to_string(),
        AllowSet::Explicit(names) => {
            let mut sorted: Vec<_> = names.iter().cloned().collect();
            sorted.sort();
            if sorted.is_empty() {
                "(none)".to_string()
            } else {
                sorted.join(", ")
            }
        }
    }
}

fn print_help() {
    println!(
        "\
capgate v{}

Checks module names against a sandbox capability policy.

USAGE:
    capgate [OPTIONS] CONFIG_PATH [MODULE...]

ARGUMENTS:
    CONFIG_PATH    Path to TOML policy configuration file
    MODULE...      Module names to check; with none, the policy
                   summary is printed and nothing is resolved

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, capgate=debug,warn)

EXAMPLES:
    capgate config/sandbox.toml fs net lodash
    RUST_LOG=debug capgate config/sandbox.toml process",
        env!("CARGO_PKG_VERSION"),
    );
}

fn main() -> Result<()> {
    let mut args = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("capgate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => args.push(arg),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("capgate=info")),
        )
        .init();

    let Some((config_path, modules)) = args.split_first() else {
        print_help();
        std::process::exit(2);
    };

    info!("Loading policy from {config_path}");
    let config = Config::load(config_path)?;

    info!(
        "Allowed builtins: {}",
        describe(&config.policy.allowed_builtin_modules)
    );
    info!(
        "Allowed externals: {}",
        describe(&config.policy.allowed_external_modules)
    );
    info!(
        "Host builtins: {}",
        config.runtime.builtin_modules.join(", ")
    );

    let registry = Arc::new(StaticBuiltinRegistry::new(
        config.runtime.builtin_modules.clone(),
    ));
    let resolver = CapabilityResolver::new(config.policy, registry, Arc::new(DryRunLoader));

    let mut denials = 0;
    for module in modules {
        match resolver.resolve(module) {
            Ok(_) => println!("ALLOW  {module}"),
            Err(e) => {
                println!("DENY   {module}  ({e})");
                denials += 1;
            }
        }
    }

    if denials > 0 {
        std::process::exit(1);
    }
    Ok(())
}
