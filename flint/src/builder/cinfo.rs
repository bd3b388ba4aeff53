// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-package compiler info aggregation.
//!
//! Flags and include paths are computed lazily per package and cached
//! until the builder is discarded. Include paths close over the
//! dependency graph: a package sees its own private include dirs plus
//! the public include dirs of every package reachable from it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use itertools::Itertools;
use pkg_manifest::FeatureSet;
use regex::Regex;
use thiserror::Error;

use crate::package::{Package, PackageType, PkgName};
use crate::project::Project;
use crate::resolver::Resolution;
use crate::syscfg::Syscfg;

/// Aggregated compile inputs for one package. Concatenation is
/// order-preserving append on every field; the empty value is the
/// identity.
#[derive(Debug, Clone, Default)]
pub struct CompilerInfo {
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub aflags: Vec<String>,
    pub lflags: Vec<String>,
    pub includes: Vec<PathBuf>,
    pub ignore_files: Vec<Regex>,
    pub ignore_dirs: Vec<Regex>,
    /// Explicit source roots, relative to the package base
    pub source_dirs: Vec<String>,
    /// Explicit source files overriding directory discovery
    pub source_files: Vec<String>,
}

impl CompilerInfo {
    /// Append `other`'s fields after this one's
    pub fn concat(mut self, other: &CompilerInfo) -> Self {
        self.cflags.extend(other.cflags.iter().cloned());
        self.cxxflags.extend(other.cxxflags.iter().cloned());
        self.aflags.extend(other.aflags.iter().cloned());
        self.lflags.extend(other.lflags.iter().cloned());
        self.includes.extend(other.includes.iter().cloned());
        self.ignore_files.extend(other.ignore_files.iter().cloned());
        self.ignore_dirs.extend(other.ignore_dirs.iter().cloned());
        self.source_dirs.extend(other.source_dirs.iter().cloned());
        self.source_files.extend(other.source_files.iter().cloned());
        self
    }
}

/// Everything include/flag aggregation needs to see
pub struct Aggregator<'a> {
    project: &'a Project,
    resolution: &'a Resolution,
    bsp: &'a Package,
    arch: String,
    cache: BTreeMap<PkgName, CompilerInfo>,
}

impl<'a> Aggregator<'a> {
    pub fn new(project: &'a Project, resolution: &'a Resolution, bsp: &'a Package, arch: impl Into<String>) -> Self {
        Self {
            project,
            resolution,
            bsp,
            arch: arch.into(),
            cache: BTreeMap::new(),
        }
    }

    /// Compute (or fetch cached) compiler info for `package`
    pub fn compiler_info(&mut self, package: &Package) -> Result<CompilerInfo, Error> {
        if let Some(cached) = self.cache.get(&package.name) {
            return Ok(cached.clone());
        }

        let syscfg = self.resolution.syscfg();
        let features = syscfg.features_for(package);

        let mut info = CompilerInfo {
            cflags: self.flag_list(package, "pkg.cflags", &features)?,
            cxxflags: self.flag_list(package, "pkg.cxxflags", &features)?,
            aflags: self.flag_list(package, "pkg.aflags", &features)?,
            lflags: self.flag_list(package, "pkg.lflags", &features)?,
            ..CompilerInfo::default()
        };

        // settings injected into this package become plain defines;
        // the encoding is the syscfg adapter's business
        let injected = package
            .manifest
            .get_string_map("pkg.syscfg_vals", &features)
            .map_err(|source| self.manifest_err(package, source))?;
        for (key, value) in injected {
            info.cflags.push(Syscfg::define(&key, &value));
        }

        info.ignore_files = self.regex_list(package, &["pkg.ignore_files", "pkg.ign_files"], &features)?;
        info.ignore_dirs = self.regex_list(package, &["pkg.ignore_dirs", "pkg.ign_dirs"], &features)?;

        info.source_dirs = package
            .manifest
            .first_string_list(&["pkg.source_dirs", "pkg.src_dirs"], &features)
            .map_err(|source| self.manifest_err(package, source))?;
        info.source_files = package
            .manifest
            .get_string_list("pkg.source_files", &features)
            .map_err(|source| self.manifest_err(package, source))?;

        info.includes = self.include_paths(package, &features)?;

        self.cache.insert(package.name.clone(), info.clone());
        Ok(info)
    }

    fn flag_list(&self, package: &Package, key: &str, features: &FeatureSet) -> Result<Vec<String>, Error> {
        Ok(package
            .manifest
            .get_string_list(key, features)
            .map_err(|source| self.manifest_err(package, source))?
            .iter()
            .map(|flag| self.project.expand_designators(flag))
            .collect())
    }

    /// Malformed patterns are configuration errors, not build errors
    fn regex_list(&self, package: &Package, keys: &[&str], features: &FeatureSet) -> Result<Vec<Regex>, Error> {
        package
            .manifest
            .first_string_list(keys, features)
            .map_err(|source| self.manifest_err(package, source))?
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| Error::BadPattern {
                    package: package.name.clone(),
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect()
    }

    /// This package's private include dirs followed by the public
    /// include dirs of every reachable package, itself included
    fn include_paths(&self, package: &Package, features: &FeatureSet) -> Result<Vec<PathBuf>, Error> {
        let mut out = self.private_includes(package, features)?;

        for name in self.resolution.reachable_from(&package.name) {
            let Some(reached) = self.project.catalog().get(&name) else {
                continue;
            };
            let reached_features = self.resolution.syscfg().features_for(reached);
            out.extend(self.public_includes(reached, &reached_features)?);
        }

        Ok(out.into_iter().unique().collect())
    }

    fn public_includes(&self, package: &Package, features: &FeatureSet) -> Result<Vec<PathBuf>, Error> {
        let mut out = vec![];

        let include = package.base.join("include");
        if include.exists() {
            out.push(include.clone());
            out.push(
                include
                    .join(package.name.basename())
                    .join("arch")
                    .join(&self.arch),
            );
        }

        if package.kind == PackageType::Sdk {
            out.extend(self.sdk_includes(package, features)?);
        }

        Ok(out)
    }

    fn private_includes(&self, package: &Package, features: &FeatureSet) -> Result<Vec<PathBuf>, Error> {
        let mut out = vec![];

        let src = package.base.join("src");
        if src.exists() {
            out.push(src.clone());
            out.push(src.join("arch").join(&self.arch));
        } else {
            out.push(src);
        }

        if package.kind == PackageType::Sdk {
            out.extend(self.sdk_includes(package, features)?);
        }

        // a unit test compiles against the innards of the package it
        // exercises: the nearest non-unittest ancestor on disk
        if package.kind == PackageType::Unittest
            && let Some(owner) = self.test_owner(package)
        {
            let owner_features = self.resolution.syscfg().features_for(owner);
            out.extend(self.private_includes(owner, &owner_features)?);
        }

        Ok(out)
    }

    fn sdk_includes(&self, package: &Package, features: &FeatureSet) -> Result<Vec<PathBuf>, Error> {
        let mut out = vec![self.bsp.base.join("include").join("bsp")];

        let ext = package.base.join("src").join("ext");
        if ext.is_dir() {
            let mut subdirs = vec![ext];
            while let Some(dir) = subdirs.pop() {
                out.push(dir.clone());
                let children = crate::util::list_dirs(&dir).map_err(|source| Error::Io {
                    path: dir.clone(),
                    source,
                })?;
                subdirs.extend(children);
            }
        }

        let declared = package
            .manifest
            .get_string_list("pkg.include_dirs", features)
            .map_err(|source| self.manifest_err(package, source))?;
        for dir in declared {
            if let Some(designated) = dir.strip_prefix('@') {
                out.push(self.project.root().join("repos").join(designated));
            } else {
                out.push(package.base.join(dir));
            }
        }

        Ok(out)
    }

    fn test_owner(&self, package: &'_ Package) -> Option<&'a Package> {
        let mut dir = package.base.parent();

        while let Some(candidate) = dir {
            if let Some(owner) = self
                .project
                .catalog()
                .iter()
                .find(|p| p.base == candidate && p.kind != PackageType::Unittest)
            {
                return Some(owner);
            }
            dir = candidate.parent();
        }

        None
    }

    fn manifest_err(&self, package: &Package, source: pkg_manifest::Error) -> Error {
        Error::Manifest {
            package: package.name.clone(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest of {package}")]
    Manifest {
        package: PkgName,
        #[source]
        source: pkg_manifest::Error,
    },

    #[error("bad ignore pattern {pattern:?} in {package}")]
    BadPattern {
        package: PkgName,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("i/o under {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{self, Roles};
    use fs_err as fs;
    use std::path::Path;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture() -> (tempfile::TempDir, Project, Resolution) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(
            &root.join("apps/blinky/pkg.yml"),
            "pkg.type: app\npkg.deps: [sys/log]\npkg.cflags: [-DBLINKY]",
        );
        write(&root.join("apps/blinky/src/main.c"), "");

        write(&root.join("sys/log/pkg.yml"), "pkg.type: lib");
        write(&root.join("sys/log/include/log/log.h"), "");
        write(&root.join("sys/log/src/log.c"), "");
        write(&root.join("sys/log/test/pkg.yml"), "pkg.type: unittest");
        write(&root.join("sys/log/test/src/log_test.c"), "");

        write(&root.join("hw/bsp/native/pkg.yml"), "pkg.type: bsp\nbsp.arch: native");
        write(&root.join("compiler/gcc/pkg.yml"), "pkg.type: compiler");
        write(&root.join("targets/t/pkg.yml"), "pkg.type: target");

        let project = Project::open(root).unwrap();
        let roles = Roles {
            target: PkgName::new("local", "targets/t"),
            app: Some(PkgName::new("local", "apps/blinky")),
            bsp: PkgName::new("local", "hw/bsp/native"),
            compiler: PkgName::new("local", "compiler/gcc"),
        };
        let resolution = resolver::resolve(&project, roles, crate::syscfg::Syscfg::default()).unwrap();

        (dir, project, resolution)
    }

    #[test]
    fn include_closure_spans_reachable_packages() {
        let (dir, project, resolution) = fixture();
        let root = dir.path();

        let bsp = project.catalog().get(&PkgName::new("local", "hw/bsp/native")).unwrap();
        let mut aggregator = Aggregator::new(&project, &resolution, bsp, "native");

        let app = project.catalog().get(&PkgName::new("local", "apps/blinky")).unwrap();
        let info = aggregator.compiler_info(app).unwrap();

        // own private dirs first, public dirs of every reachable
        // package afterwards
        assert!(info.includes.contains(&root.join("apps/blinky/src")));
        assert!(info.includes.contains(&root.join("sys/log/include")));
        // another package's private src never leaks in
        assert!(!info.includes.contains(&root.join("sys/log/src")));

        assert!(info.cflags.contains(&"-DBLINKY".to_owned()));
    }

    #[test]
    fn unittest_sees_owner_private_includes() {
        let (dir, project, resolution) = fixture();
        let root = dir.path();

        let bsp = project.catalog().get(&PkgName::new("local", "hw/bsp/native")).unwrap();
        let mut aggregator = Aggregator::new(&project, &resolution, bsp, "native");

        let test = project.catalog().get(&PkgName::new("local", "sys/log/test")).unwrap();
        let info = aggregator.compiler_info(test).unwrap();

        assert!(info.includes.contains(&root.join("sys/log/test/src")));
        assert!(info.includes.contains(&root.join("sys/log/src")));
    }

    #[test]
    fn cached_info_is_stable() {
        let (_dir, project, resolution) = fixture();

        let bsp = project.catalog().get(&PkgName::new("local", "hw/bsp/native")).unwrap();
        let mut aggregator = Aggregator::new(&project, &resolution, bsp, "native");

        let app = project.catalog().get(&PkgName::new("local", "apps/blinky")).unwrap();
        let first = aggregator.compiler_info(app).unwrap();
        let second = aggregator.compiler_info(app).unwrap();

        assert_eq!(first.includes, second.includes);
        assert_eq!(first.cflags, second.cflags);
    }

    #[test]
    fn malformed_ignore_pattern_is_config_error() {
        let (dir, _, _) = fixture();
        let root = dir.path();

        write(
            &root.join("sys/bad/pkg.yml"),
            "pkg.type: lib\npkg.ignore_files: [\"([\"]",
        );
        let project = Project::open(root).unwrap();
        let roles = Roles {
            target: PkgName::new("local", "targets/t"),
            app: Some(PkgName::new("local", "apps/blinky")),
            bsp: PkgName::new("local", "hw/bsp/native"),
            compiler: PkgName::new("local", "compiler/gcc"),
        };
        let resolution = resolver::resolve(&project, roles, crate::syscfg::Syscfg::default()).unwrap();

        let bsp = project.catalog().get(&PkgName::new("local", "hw/bsp/native")).unwrap();
        let mut aggregator = Aggregator::new(&project, &resolution, bsp, "native");

        let bad = project.catalog().get(&PkgName::new("local", "sys/bad")).unwrap();
        assert!(matches!(
            aggregator.compiler_info(bad),
            Err(Error::BadPattern { .. })
        ));
    }
}
