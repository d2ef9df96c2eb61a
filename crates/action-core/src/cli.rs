//! Shared CLI helpers for workspace tools.

use std::path::Path;
use std::process::Command;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::RunConfig;
use crate::{Error, Result};

pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

/// Load the YAML run config (defaults when no file is given) and apply `KEY VALUE` overrides.
pub fn load_run_config(path: Option<&Path>, opts: &[String]) -> Result<RunConfig> {
    let mut config = match path {
        Some(path) => RunConfig::from_yaml_file(path)?,
        None => RunConfig::default(),
    };
    config.apply_overrides(opts)?;
    Ok(config)
}

/// Current git revision of the working directory, or `N/A` outside a checkout.
pub fn git_revision() -> String {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| String::from("N/A"))
}
