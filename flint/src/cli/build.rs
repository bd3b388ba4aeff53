// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::num::NonZeroUsize;

use clap::Parser;
use thiserror::Error;
use tracing::warn;

use flint::paths::BuildName;
use flint::stage::{self, Stage};
use flint::{Builder, Project, Target, relink, target, util};

#[derive(Debug, Parser)]
#[command(about = "Build a target's firmware image(s)")]
pub struct Command {
    #[arg(help = "Target package to build")]
    target: String,

    #[arg(short, long, help = "Number of parallel compile jobs")]
    jobs: Option<NonZeroUsize>,
}

pub fn handle(command: Command, project: &Project) -> Result<(), Error> {
    let target = Target::load(project, &command.target)?;
    let jobs = command.jobs.unwrap_or_else(util::num_cpus);

    if target.spec.is_split() {
        build_split(project, &target, jobs)
    } else {
        build_single(project, &target, jobs)
    }
}

fn build_single(project: &Project, target: &Target, jobs: NonZeroUsize) -> Result<(), Error> {
    let mut builder = Builder::new(project, target, BuildName::App, jobs)?;
    emit_warnings(&builder);

    builder.prep_build()?;
    stage::run(Stage::PreBuild, &builder)?;
    builder.build()?;
    stage::run(Stage::PreLink, &builder)?;

    let image = builder.image_pkg().clone();
    let elf = builder.paths().elf(BuildName::App, &image);
    builder.link(&elf, &builder.linker_scripts(false), vec![], None)?;

    let bin = builder.paths().elf_bin(BuildName::App, &image);
    builder.toolchain().objcopy_bin(&elf, &bin).map_err(Error::Toolchain)?;
    builder.write_build_manifest(&elf)?;

    stage::run(Stage::PostLink, &builder)?;

    println!("Built {}", elf.display());
    Ok(())
}

fn build_split(project: &Project, target: &Target, jobs: NonZeroUsize) -> Result<(), Error> {
    let mut loader = Builder::new(project, target, BuildName::Loader, jobs)?;
    let mut app = Builder::new(project, target, BuildName::App, jobs)?;
    emit_warnings(&loader);
    emit_warnings(&app);

    loader.prep_build()?;
    app.prep_build()?;
    stage::run(Stage::PreBuild, &loader)?;
    stage::run(Stage::PreBuild, &app)?;
    stage::run(Stage::PreLink, &loader)?;
    stage::run(Stage::PreLink, &app)?;

    let elf = relink::run(&mut app, &mut loader)?;

    let image = app.image_pkg().clone();
    let bin = app.paths().elf_bin(BuildName::App, &image);
    app.toolchain().objcopy_bin(&elf, &bin).map_err(Error::Toolchain)?;
    app.write_build_manifest(&elf)?;

    stage::run(Stage::PostLink, &loader)?;
    stage::run(Stage::PostLink, &app)?;

    println!("Built split images, app at {}", elf.display());
    Ok(())
}

/// Print resolution decode warnings, once each
fn emit_warnings(builder: &Builder<'_>) {
    for warning in builder.resolution().warnings() {
        warn!("{warning}");
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Target(#[from] target::Error),

    #[error(transparent)]
    Build(#[from] flint::builder::Error),

    #[error(transparent)]
    Stage(#[from] flint::stage::Error),

    #[error(transparent)]
    Relink(#[from] relink::Error),

    #[error(transparent)]
    Toolchain(flint::toolchain::Error),
}
