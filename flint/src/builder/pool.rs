// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The parallel compile pool.
//!
//! Exactly `N` workers drain the job queue. The first failing job
//! cancels the remainder; completion order is never observable because
//! archives, link inputs and compile-commands are produced by the
//! caller after the pool has joined.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use fs_err as fs;
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use super::jobs::CompilerJob;
use crate::package::PkgName;
use crate::toolchain::Toolchain;

/// Run every stale job in `jobs`; returns the number executed
pub fn run(jobs: &[CompilerJob], toolchain: &Toolchain, workers: NonZeroUsize) -> Result<usize, Error> {
    let stale: Vec<&CompilerJob> = jobs.iter().filter(|j| !j.up_to_date).collect();

    if stale.is_empty() {
        return Ok(0);
    }

    debug!(num_jobs = stale.len(), num_workers = workers.get(), "compiling");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.get())
        .build()
        .map_err(Error::Pool)?;

    pool.install(|| {
        stale.par_iter().try_for_each(|job| {
            if let Some(parent) = job.object.parent() {
                fs::create_dir_all(parent).map_err(|source| Error::Io {
                    path: parent.to_owned(),
                    source,
                })?;
            }

            toolchain.run_compile(&job.argv).map_err(|source| Error::Compile {
                package: job.package.clone(),
                source_file: job.source.clone(),
                source,
            })
        })
    })?;

    Ok(stale.len())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("building worker pool")]
    Pool(#[source] rayon::ThreadPoolBuildError),

    #[error("compiling {source_file:?} ({package})")]
    Compile {
        package: PkgName,
        source_file: PathBuf,
        #[source]
        source: crate::toolchain::Error,
    },

    #[error("i/o under {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
