//! Command-line wiring for the glue-code inspector.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use glue_rs::{CapabilityRegistry, DeviceClass, GlueConfig, ShapeFunctionRegistry};
use tracing::{info, warn};

use crate::report::{
    identifier_rows, load_config, load_plan, parse_device, shape_function_rows, version_rows,
};

#[derive(Parser, Debug)]
#[command(name = "glue-rs", about = "Inspect glue-code plug-ins and validate shape plans")]
pub struct Cli {
    /// JSON configuration; the GC_KERNEL_PATH/GLUE_* environment is used when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the identifiers registered for a device.
    List {
        #[arg(long, value_parser = parse_device, default_value = "gaudi2")]
        device: DeviceClass,
    },
    /// Print the version of every loaded library and any load failures.
    Versions {
        #[arg(long, value_parser = parse_device, default_value = "gaudi2")]
        device: DeviceClass,
    },
    /// List every shape function a compilation could call.
    ShapeFunctions,
    /// Check a persisted shape plan against the currently installed plug-ins.
    ValidatePlan { plan: PathBuf },
    /// Print a shape plan as JSON.
    DumpPlan { plan: PathBuf },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli { config, command } = cli;
    let config = load_config(config.as_deref())?;

    match command {
        Command::List { device } => {
            let registry = init_registry(config, &[device])?;
            for row in identifier_rows(&registry, device) {
                println!("{row}");
            }
        }
        Command::Versions { device } => {
            let registry = init_registry(config, &[device])?;
            for row in version_rows(&registry) {
                println!("{row}");
            }
            for failure in registry.load_failures() {
                println!("failed\t{failure}");
            }
        }
        Command::ShapeFunctions => {
            let shape_functions = live_shape_functions(config)?;
            for row in shape_function_rows(&shape_functions) {
                println!("{row}");
            }
        }
        Command::ValidatePlan { plan } => {
            let artifact = load_plan(&plan)?;
            let shape_functions = live_shape_functions(config)?;
            if let Err(err) = artifact.validate(&shape_functions) {
                bail!("{} is stale: {err}", plan.display());
            }
            info!(nodes = artifact.nodes.len(), "shape plan is valid");
            println!("ok\t{}", plan.display());
        }
        Command::DumpPlan { plan } => {
            let artifact = load_plan(&plan)?;
            println!("{}", artifact.to_json_string()?);
        }
    }
    Ok(())
}

fn init_registry(config: GlueConfig, devices: &[DeviceClass]) -> Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new(config);
    for device in devices {
        registry.init(*device)?;
    }
    if !registry.load_failures().is_empty() {
        warn!(
            failures = registry.load_failures().len(),
            "some plug-ins could not be loaded"
        );
    }
    Ok(registry)
}

fn live_shape_functions(config: GlueConfig) -> Result<ShapeFunctionRegistry> {
    let mut registry = CapabilityRegistry::new(config);
    registry.init_all()?;
    let mut shape_functions = ShapeFunctionRegistry::with_core_functions();
    let published = registry.register_shape_functions(&mut shape_functions)?;
    info!(published, total = shape_functions.len(), "shape functions registered");
    Ok(shape_functions)
}
