// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The synthesized `sysinit` package.
//!
//! Packages declare init functions with a stage number (`pkg.init`);
//! the generated source calls them in ascending stage order. The file
//! is only rewritten when its content changes so an unchanged project
//! recompiles nothing.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;

use crate::package::{Package, PkgName};
use crate::paths::GeneratedPaths;
use crate::project::Project;
use crate::resolver::Resolution;

/// Catalog path of the injected package
pub const SYSINIT_PKG_PATH: &str = "generated/sysinit";

/// Collect every `pkg.init` entry of the resolution and materialize
/// the generated package. Returns the injectable package.
pub fn generate(project: &Project, resolution: &Resolution, generated: &GeneratedPaths) -> Result<Package, Error> {
    // (stage, function, declaring package)
    let mut entries: Vec<(i64, String, PkgName)> = vec![];

    for name in resolution.package_names() {
        let Some(package) = project.catalog().get(&name) else {
            continue;
        };
        let features = resolution.syscfg().features_for(package);

        let init = package
            .manifest
            .get_string_map("pkg.init", &features)
            .map_err(|source| Error::Manifest {
                package: name.clone(),
                source,
            })?;

        for (function, stage) in init {
            let stage = stage.parse().map_err(|_| Error::BadStage {
                package: name.clone(),
                function: function.clone(),
                stage,
            })?;
            entries.push((stage, function, name.clone()));
        }
    }

    entries.sort();

    let mut content = String::new();
    let _ = writeln!(content, "/* Generated by flint, do not edit. */");
    let _ = writeln!(content);

    for (_, function, package) in &entries {
        let _ = writeln!(content, "void {function}(void); /* {package} */");
    }

    let _ = writeln!(content);
    let _ = writeln!(content, "void\nsysinit_app(void)\n{{");
    for (_, function, _) in &entries {
        let _ = writeln!(content, "    {function}();");
    }
    let _ = writeln!(content, "}}");

    let src_dir = generated.base.join("src");
    fs::create_dir_all(&src_dir).map_err(|source| Error::Io {
        path: src_dir.clone(),
        source,
    })?;

    write_if_changed(&src_dir.join("flint_sysinit.c"), content.as_bytes())?;

    Ok(Package::generated(
        PkgName::new(project.local_repo(), SYSINIT_PKG_PATH),
        generated.base.clone(),
    ))
}

fn write_if_changed(path: &Path, content: &[u8]) -> Result<(), Error> {
    let unchanged = matches!(fs::read(path), Ok(existing) if existing == content);

    if !unchanged {
        fs::write(path, content).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest of {package}")]
    Manifest {
        package: PkgName,
        #[source]
        source: pkg_manifest::Error,
    },

    #[error("{package}: init function {function} has unparsable stage {stage:?}")]
    BadStage {
        package: PkgName,
        function: String,
        stage: String,
    },

    #[error("i/o on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
