// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use thiserror::Error;

use flint::paths::BuildName;
use flint::size::{self, RenderMode};
use flint::{Builder, Project, Target, target, util};

#[derive(Debug, Parser)]
#[command(about = "Report image sizes from the linker map")]
pub struct Command {
    #[arg(help = "Target package to report on")]
    target: String,

    #[arg(short, long, help = "Memory region to break down per source file")]
    section: Option<String>,

    #[arg(long, help = "Diff-friendly output: no percents, bare container lines", default_value_t = false)]
    diffable: bool,

    #[arg(long, help = "Report on the loader image of a split target", default_value_t = false)]
    loader: bool,
}

pub fn handle(command: Command, project: &Project) -> Result<(), Error> {
    let target = Target::load(project, &command.target)?;

    let build = if command.loader { BuildName::Loader } else { BuildName::App };
    let builder = Builder::new(project, &target, build, util::num_cpus())?;

    let image = builder.image_pkg().clone();
    let elf = builder.paths().elf(build, &image);

    match command.section {
        Some(section) => {
            let mode = if command.diffable {
                RenderMode::Diffable
            } else {
                RenderMode::Default
            };
            let report = size::section_report(builder.toolchain(), &elf, project.root(), &section, mode)?;
            print!("{report}");
        }
        None => {
            let parsed = size::load_map(&elf)?;
            print!("{}", size::package_summary(&parsed));
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Target(#[from] target::Error),

    #[error(transparent)]
    Build(#[from] flint::builder::Error),

    #[error(transparent)]
    Size(#[from] size::Error),
}
