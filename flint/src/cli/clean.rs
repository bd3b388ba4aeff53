// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::PathBuf;

use clap::Parser;
use fs_err as fs;
use thiserror::Error;

use flint::{Project, Target, target};

#[derive(Debug, Parser)]
#[command(about = "Remove a target's build outputs")]
pub struct Command {
    #[arg(help = "Target package to clean")]
    target: String,
}

pub fn handle(command: Command, project: &Project) -> Result<(), Error> {
    let target = Target::load(project, &command.target)?;
    let bin = target.paths(project).target_bin();

    if bin.exists() {
        fs::remove_dir_all(&bin).map_err(|source| Error::Io { path: bin, source })?;
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Target(#[from] target::Error),

    #[error("i/o on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
