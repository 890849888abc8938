// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the LwM2M bootstrap server.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the LwM2M bootstrap server.

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use env_logger::Env;
use log::{error, LevelFilter};

use lwm2m_bootstrap::server::DEFAULT_PORT;
use lwm2m_bootstrap::{BootstrapConfig, BootstrapServer, ServerConfig};

const DEFAULT_PROFILE_FILE: &str = "bootstrap_server.ini";

/// Bootstrap server command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author = "Lukas Bower",
    version,
    about = "LwM2M bootstrap server",
    long_about = None
)]
struct Cli {
    /// Bootstrap profile file (TOML). Defaults to $BOOTSTRAP_SERVER_FILE, then bootstrap_server.ini.
    #[arg(short = 'f', value_name = "FILE")]
    file: Option<PathBuf>,

    /// UDP port to listen on. Defaults to $BOOTSTRAP_SERVER_PORT, then 5685.
    #[arg(short = 'p', value_name = "PORT")]
    port: Option<u16>,

    /// Fail a client whose current command stays unanswered for SECS seconds.
    #[arg(short = 't', value_name = "SECS")]
    timeout: Option<u64>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short = 'v')]
    verbose: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    let _ = err.print();
                }
                _ => println!("{}", Cli::command().render_usage()),
            }
            process::exit(0);
        }
    };

    init_logging(cli.verbose);
    if let Err(err) = run(cli) {
        error!("{err:#}");
        eprintln!("bootstrap_server: {err:#}");
        process::exit(-1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let profile_path = resolve_profile_path(cli.file);
    let port = env_override(cli.port, "BOOTSTRAP_SERVER_PORT")?.unwrap_or(DEFAULT_PORT);
    let profiles = BootstrapConfig::load(&profile_path)
        .with_context(|| format!("failed to load profiles from {}", profile_path.display()))?;

    let config = ServerConfig {
        bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        command_timeout: cli.timeout.filter(|secs| *secs > 0).map(Duration::from_secs),
        ..ServerConfig::default()
    };
    let mut server = BootstrapServer::bind(config, Arc::new(profiles))
        .context("failed to start bootstrap server")?;
    server.run().context("bootstrap server stopped on error")?;
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn resolve_profile_path(cli_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_path {
        return path;
    }
    if let Ok(value) = env::var("BOOTSTRAP_SERVER_FILE") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_PROFILE_FILE)
}

fn env_override<T>(cli_value: Option<T>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if cli_value.is_some() {
        return Ok(cli_value);
    }
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                trimmed
                    .parse::<T>()
                    .map(Some)
                    .map_err(|err| anyhow!("invalid {key} value '{trimmed}': {err}"))
            }
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed to read {key}: {err}")),
    }
}
