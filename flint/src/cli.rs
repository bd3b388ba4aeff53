// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use flint::Project;

mod build;
mod clean;
mod deps;
mod size;

#[derive(Debug, Parser)]
#[command(name = "flint", about = "Firmware build orchestrator", version)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        default_value = ".",
        help = "Project root directory"
    )]
    project: PathBuf,

    #[arg(short, long, global = true, action = ArgAction::Count, help = "Increase log verbosity")]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Build(build::Command),
    Deps(deps::Command),
    Size(size::Command),
    Clean(clean::Command),
}

pub fn process() -> Result<(), Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let project = Project::open(&cli.project).map_err(Error::Project)?;

    match cli.command {
        Command::Build(command) => build::handle(command, &project)?,
        Command::Deps(command) => deps::handle(command, &project)?,
        Command::Size(command) => size::handle(command, &project)?,
        Command::Clean(command) => clean::handle(command, &project)?,
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };

    let filter = tracing_subscriber::filter::Targets::new().with_default(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("open project")]
    Project(#[source] flint::project::Error),

    #[error("build")]
    Build(#[from] build::Error),

    #[error("deps")]
    Deps(#[from] deps::Error),

    #[error("size")]
    Size(#[from] size::Error),

    #[error("clean")]
    Clean(#[from] clean::Error),
}
