// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;
use thiserror::Error;

use flint::paths::BuildName;
use flint::resolver::Resolution;
use flint::{Builder, Project, Target, target, util};

#[derive(Debug, Parser)]
#[command(about = "Show a target's resolved dependency graph")]
pub struct Command {
    #[arg(help = "Target package to resolve")]
    target: String,

    #[arg(short, long, help = "Show reverse dependencies instead", default_value_t = false)]
    reverse: bool,
}

pub fn handle(command: Command, project: &Project) -> Result<(), Error> {
    let target = Target::load(project, &command.target)?;
    let builder = Builder::new(project, &target, BuildName::App, util::num_cpus())?;

    print!("{}", render(builder.resolution(), command.reverse));
    Ok(())
}

/// Deterministic text rendering of the dependency graph. API-satisfying
/// edges carry their capability.
pub fn render(resolution: &Resolution, reverse: bool) -> String {
    use std::fmt::Write as _;

    let graph = if reverse {
        resolution.graph().transpose()
    } else {
        resolution.graph().clone()
    };

    let mut out = String::new();

    for name in resolution.package_names() {
        let _ = writeln!(out, "{name}");

        let Some(index) = graph.get_index(&name) else {
            continue;
        };

        let mut lines: Vec<String> = graph
            .iter_edges()
            .filter(|(from, _, _)| **from == *graph.node(index))
            .map(|(_, to, tag)| match tag {
                Some(capability) => format!("    {to} ({capability})"),
                None => format!("    {to}"),
            })
            .collect();
        lines.sort();
        lines.dedup();

        for line in lines {
            let _ = writeln!(out, "{line}");
        }
    }

    out
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Target(#[from] target::Error),

    #[error(transparent)]
    Build(#[from] flint::builder::Error),
}
