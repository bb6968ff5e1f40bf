// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli::chain;

#[derive(Debug, Subcommand)]
pub enum Command {
    Check(chain::CheckCli),
    Fix(chain::FixCli),
}

/// Check and repair Android Verified Boot chains of trust.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging.
    ///
    /// This only changes the default level. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Check(c) => chain::check_main(&c),
        Command::Fix(c) => chain::fix_main(&c),
    }
}
