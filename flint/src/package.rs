// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use pkg_manifest::{FeatureSet, Manifest};
use thiserror::Error;

/// Qualified package identity: `(repository, path)`, rendered `repo:path`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PkgName {
    repo: String,
    path: String,
}

impl PkgName {
    pub fn new(repo: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            path: path.into(),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Final path segment, used for artifact file names
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for PkgName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.path)
    }
}

/// Package kind, read from `pkg.type`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PackageType {
    App,
    Bsp,
    Compiler,
    #[default]
    #[strum(serialize = "lib", serialize = "library")]
    Library,
    Sdk,
    Unittest,
    Target,
    Transient,
    Generated,
    Config,
}

impl PackageType {
    /// Only one package of a singleton type may appear in a resolution
    pub fn is_singleton(&self) -> bool {
        matches!(self, PackageType::App | PackageType::Bsp | PackageType::Compiler | PackageType::Target)
    }
}

/// BSP specific fields, read under the resolution's feature set
#[derive(Debug, Clone, Default)]
pub struct BspDetails {
    pub arch: String,
    pub linker_scripts: Vec<String>,
    pub part2_linker_scripts: Vec<String>,
    pub download_script: Option<String>,
    pub debug_script: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Package {
    pub name: PkgName,
    pub kind: PackageType,
    pub base: PathBuf,
    pub manifest: Manifest,
    /// Transient packages forward to another package, one hop only
    pub linked_name: Option<PkgName>,
}

impl Package {
    /// A generated package has no on-disk manifest; it participates in
    /// later stages like any other package
    pub fn generated(name: PkgName, base: PathBuf) -> Self {
        Self {
            name,
            kind: PackageType::Generated,
            base,
            manifest: Manifest::default(),
            linked_name: None,
        }
    }

    pub fn bsp_details(&self, features: &FeatureSet) -> Result<BspDetails, pkg_manifest::Error> {
        Ok(BspDetails {
            arch: self.manifest.get_string("bsp.arch", features)?,
            linker_scripts: self.manifest.get_string_list("bsp.linkerscript", features)?,
            part2_linker_scripts: self.manifest.get_string_list("bsp.part2linkerscript", features)?,
            download_script: opt(self.manifest.get_string("bsp.downloadscript", features)?),
            debug_script: opt(self.manifest.get_string("bsp.debugscript", features)?),
        })
    }
}

fn opt(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Every package the project knows, keyed by identity
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    packages: BTreeMap<PkgName, Package>,
}

impl Catalog {
    pub fn insert(&mut self, package: Package) {
        self.packages.insert(package.name.clone(), package);
    }

    pub fn get(&self, name: &PkgName) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'_ Package> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Resolve a dependency string to a package.
    ///
    /// Accepted spellings: `repo:path`, `@repo/path`, or a bare path
    /// looked up first in `from_repo` then across every repository.
    /// Transient packages are followed exactly one hop.
    pub fn resolve(&self, spec: &str, from_repo: &str) -> Result<&Package, Error> {
        let direct = if let Some((repo, path)) = spec.split_once(':') {
            self.packages.get(&PkgName::new(repo, path))
        } else if let Some(designated) = spec.strip_prefix('@') {
            let (repo, path) = designated.split_once('/').unwrap_or((designated, ""));
            self.packages.get(&PkgName::new(repo, path))
        } else {
            self.packages
                .get(&PkgName::new(from_repo, spec))
                .or_else(|| self.packages.values().find(|p| p.name.path() == spec))
        };

        let package = direct.ok_or_else(|| Error::Unknown {
            spec: spec.to_owned(),
            from_repo: from_repo.to_owned(),
        })?;

        if let Some(linked) = &package.linked_name {
            return self.packages.get(linked).ok_or_else(|| Error::BrokenLink {
                package: package.name.clone(),
                linked: linked.clone(),
            });
        }

        Ok(package)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown package {spec:?} (referenced from repository {from_repo})")]
    Unknown { spec: String, from_repo: String },

    #[error("transient package {package} links to unknown package {linked}")]
    BrokenLink { package: PkgName, linked: PkgName },
}
