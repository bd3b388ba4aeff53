// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! User script hooks around the build.
//!
//! Scripts run with a fully materialized environment and their owning
//! package as working directory. Pre-build and pre-link scripts write
//! into fresh temporary src/include directories; only when every
//! script of the stage succeeds are the outputs diffed against the
//! previous run and swapped in, so a failed stage never publishes
//! partial artifacts and an unchanged stage dirties nothing.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs_err as fs;
use thiserror::Error;
use tracing::{debug, info};

use crate::builder::Builder;
use crate::package::{Package, PkgName};
use crate::paths::BuildName;
use crate::util;

/// When a stage's scripts run relative to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    PreBuild,
    PreLink,
    PostLink,
}

impl Stage {
    fn manifest_key(&self) -> &'static str {
        match self {
            Stage::PreBuild => "pkg.pre_build_cmds",
            Stage::PreLink => "pkg.pre_link_cmds",
            Stage::PostLink => "pkg.post_link_cmds",
        }
    }

    /// Pre stages may deposit generated sources and headers
    fn produces_outputs(&self) -> bool {
        matches!(self, Stage::PreBuild | Stage::PreLink)
    }
}

/// Run every script of `stage` declared by the builder's packages
pub fn run(stage: Stage, builder: &Builder<'_>) -> Result<(), Error> {
    let generated = builder.paths().generated();
    let stage_dir = generated.base.join("stage").join(stage.to_string());
    let work_src = stage_dir.join("work_src");
    let work_include = stage_dir.join("work_include");

    let mut ran_any = false;

    for name in builder.build_packages() {
        // generated packages are not in the catalog and carry no scripts
        let Some(package) = builder.project().catalog().get(&name) else {
            continue;
        };

        let features = builder.resolution().syscfg().features_for(package);
        let commands = package
            .manifest
            .get_string_list(stage.manifest_key(), &features)
            .map_err(|source| Error::Manifest {
                package: name.clone(),
                source,
            })?;

        if commands.is_empty() {
            continue;
        }

        if stage.produces_outputs() && !ran_any {
            util::recreate_dir(&work_src).map_err(|source| Error::Io {
                path: work_src.clone(),
                source,
            })?;
            util::recreate_dir(&work_include).map_err(|source| Error::Io {
                path: work_include.clone(),
                source,
            })?;
        }
        ran_any = true;

        let mut env = environment(builder, package);
        if stage.produces_outputs() {
            env.insert("MYNEWT_USER_SRC_DIR".to_owned(), work_src.display().to_string());
            env.insert("MYNEWT_USER_INCLUDE_DIR".to_owned(), work_include.display().to_string());
        }

        for command in &commands {
            run_script(&name, &package.base, command, &env)?;
        }
    }

    if !ran_any || !stage.produces_outputs() {
        return Ok(());
    }

    // publish only on change, atomically per directory
    let live_src = stage_dir.join("src");
    let live_include = stage_dir.join("include");
    for (work, live) in [(&work_src, &live_src), (&work_include, &live_include)] {
        let changed = util::dirs_differ(work, live).map_err(|source| Error::Io {
            path: work.clone(),
            source,
        })?;

        if changed {
            info!(stage = %stage, dir = %live.display(), "stage outputs changed, replacing");
            if live.exists() {
                fs::remove_dir_all(live).map_err(|source| Error::Io {
                    path: live.clone(),
                    source,
                })?;
            }
            fs::rename(work, live).map_err(|source| Error::Io {
                path: live.clone(),
                source,
            })?;
        } else {
            fs::remove_dir_all(work).map_err(|source| Error::Io {
                path: work.clone(),
                source,
            })?;
        }
    }

    Ok(())
}

/// Tokenize with shell quoting rules, expand each token against the
/// environment, resolve the program on PATH and execute from the
/// package base. Non-zero exit is fatal.
fn run_script(package: &PkgName, cwd: &Path, command: &str, env: &BTreeMap<String, String>) -> Result<(), Error> {
    let tokens = shell_words::split(command).map_err(|source| Error::Tokenize {
        package: package.clone(),
        command: command.to_owned(),
        source,
    })?;

    let expanded: Vec<String> = tokens.iter().map(|t| expand(t, env)).collect();

    let Some((program, args)) = expanded.split_first() else {
        return Ok(());
    };

    let program = if program.contains('/') {
        PathBuf::from(program)
    } else {
        which::which(program).map_err(|source| Error::ProgramNotFound {
            package: package.clone(),
            program: program.clone(),
            source,
        })?
    };

    debug!(package = %package, program = %program.display(), "running stage script");

    let status = Command::new(&program)
        .args(args)
        .current_dir(cwd)
        .envs(env)
        .status()
        .map_err(|source| Error::Spawn {
            package: package.clone(),
            program: program.display().to_string(),
            source,
        })?;

    if !status.success() {
        return Err(Error::ScriptFailed {
            package: package.clone(),
            command: command.to_owned(),
            code: status.code(),
        });
    }

    Ok(())
}

/// Expand `$NAME` and `${NAME}` against `env`; unknown variables
/// expand to nothing, matching shell behavior
fn expand(token: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some((_, c)) = chars.peek().copied() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if braced && matches!(chars.peek(), Some((_, '}'))) {
            chars.next();
        }

        if name.is_empty() {
            out.push('$');
        } else if let Some(value) = env.get(&name) {
            out.push_str(value);
        }
    }

    out
}

/// The full environment one package's scripts observe
pub fn environment(builder: &Builder<'_>, package: &Package) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let project = builder.project();
    let paths = builder.paths();
    let build = builder.build_name();
    let image = builder.image_pkg().clone();
    let spec = &builder.target().spec;

    // basic locations
    let root = project.root().display().to_string();
    env.insert("CORE_PATH".to_owned(), root.clone());
    env.insert("MYNEWT_PROJECT_ROOT".to_owned(), root);
    if let Some(bsp) = project.catalog().get(&builder.resolution().roles().bsp) {
        env.insert("BSP_PATH".to_owned(), bsp.base.display().to_string());
    }
    env.insert("BIN_ROOT".to_owned(), paths.target_bin().display().to_string());
    env.insert(
        "BIN_BASENAME".to_owned(),
        paths
            .pkg_bin(build, &image)
            .join(image.basename())
            .display()
            .to_string(),
    );

    // image slot variables
    let slot = match build {
        BuildName::Loader => 0,
        BuildName::App if spec.is_split() => 1,
        BuildName::App => 0,
    };
    env.insert("IMAGE_SLOT".to_owned(), slot.to_string());
    env.insert("BOOT_LOADER".to_owned(), u8::from(build == BuildName::Loader).to_string());

    let features = builder.resolution().syscfg().features_for(package);
    if let Some(bsp) = project.catalog().get(&builder.resolution().roles().bsp) {
        let offset = bsp
            .manifest
            .get_string(&format!("bsp.flash_offset_{slot}"), &features)
            .unwrap_or_default();
        let size = bsp
            .manifest
            .get_string(&format!("bsp.flash_area_size_{slot}"), &features)
            .unwrap_or_default();
        env.insert("FLASH_OFFSET".to_owned(), if offset.is_empty() { "0".to_owned() } else { offset });
        env.insert("FLASH_AREA_SIZE".to_owned(), if size.is_empty() { "0".to_owned() } else { size });
    }

    // configuration: every setting, plus the enabled feature list
    for (key, value) in builder.resolution().syscfg().to_map() {
        env.insert(format!("MYNEWT_VAL_{}", util::sanitize_ident(&key)), value);
    }
    env.insert(
        "FEATURES".to_owned(),
        builder.resolution().syscfg().features().iter().collect::<Vec<_>>().join(" "),
    );

    // toolchain
    let toolchain = builder.toolchain();
    env.insert("MYNEWT_CC_PATH".to_owned(), toolchain.cc.clone());
    env.insert("MYNEWT_AS_PATH".to_owned(), toolchain.asm.clone());
    env.insert("MYNEWT_AR_PATH".to_owned(), toolchain.ar.clone());
    env.insert("MYNEWT_CPP_PATH".to_owned(), toolchain.cxx.clone());
    env.insert("MYNEWT_OBJCOPY_PATH".to_owned(), toolchain.objcopy.clone());
    env.insert("MYNEWT_OBJDUMP_PATH".to_owned(), toolchain.objdump.clone());
    env.insert("MYNEWT_SIZE_PATH".to_owned(), toolchain.nm.clone());

    // package specifics
    env.insert("MYNEWT_PKG_NAME".to_owned(), package.name.to_string());
    env.insert(
        "MYNEWT_PKG_BIN_DIR".to_owned(),
        paths.pkg_bin(build, &package.name).display().to_string(),
    );
    env.insert(
        "MYNEWT_PKG_BIN_ARCHIVE".to_owned(),
        paths.archive(build, &package.name).display().to_string(),
    );
    env.insert("MYNEWT_APP_BIN_DIR".to_owned(), paths.pkg_bin(build, &image).display().to_string());
    env.insert(
        "MYNEWT_USER_WORK_DIR".to_owned(),
        paths.generated().base.join("work").display().to_string(),
    );

    env.insert("MYNEWT_BUILD_PROFILE".to_owned(), spec.build_profile.clone());
    env.insert(
        "MYNEWT_PACKAGES".to_owned(),
        builder
            .build_packages()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" "),
    );

    env
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest of {package}")]
    Manifest {
        package: PkgName,
        #[source]
        source: pkg_manifest::Error,
    },

    #[error("{package}: cannot tokenize {command:?}")]
    Tokenize {
        package: PkgName,
        command: String,
        #[source]
        source: shell_words::ParseError,
    },

    #[error("{package}: program {program:?} not found on PATH")]
    ProgramNotFound {
        package: PkgName,
        program: String,
        #[source]
        source: which::Error,
    },

    #[error("{package}: spawn {program}")]
    Spawn {
        package: PkgName,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{package}: script {command:?} exited with status {code:?}")]
    ScriptFailed {
        package: PkgName,
        command: String,
        code: Option<i32>,
    },

    #[error("i/o on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
