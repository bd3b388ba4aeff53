// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Project discovery: repositories and the package catalog.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;
use tracing::debug;

use crate::package::{Catalog, Package, PackageType, PkgName};

/// Package manifest file name
const PKG_MANIFEST: &str = "pkg.yml";
/// Sibling files merged over the package manifest when present
const OVERLAY_MANIFESTS: &[&str] = &["target.yml", "syscfg.yml"];
/// Directories never scanned for packages
const SKIPPED_DIRS: &[&str] = &["bin", "repos"];

#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    local_repo: String,
    repos: BTreeMap<String, PathBuf>,
    catalog: Catalog,
}

impl Project {
    /// Open the project rooted at `root`: the root itself is the local
    /// repository, every directory under `repos/` is an external one.
    /// All repositories are scanned for package manifests.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();

        let local_repo = match pkg_manifest::load(&root.join("project.yml")) {
            Ok(manifest) => {
                let name = manifest.get_string("project.name", &pkg_manifest::FeatureSet::new())?;
                if name.is_empty() { "local".to_owned() } else { name }
            }
            Err(pkg_manifest::Error::Read { .. }) => "local".to_owned(),
            Err(e) => return Err(e.into()),
        };

        let mut repos = BTreeMap::new();
        repos.insert(local_repo.clone(), root.clone());

        let repos_dir = root.join("repos");
        if repos_dir.is_dir() {
            for dir in crate::util::list_dirs(&repos_dir).map_err(|source| Error::Io {
                path: repos_dir.clone(),
                source,
            })? {
                if let Some(name) = dir.file_name().and_then(|n| n.to_str()) {
                    repos.insert(name.to_owned(), dir.clone());
                }
            }
        }

        let mut catalog = Catalog::default();
        for (name, base) in &repos {
            scan_repo(&mut catalog, name, base, base)?;
        }

        debug!(
            num_repositories = repos.len(),
            num_packages = catalog.len(),
            "project opened"
        );

        Ok(Self {
            root,
            local_repo,
            repos,
            catalog,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_repo(&self) -> &str {
        &self.local_repo
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn repo_path(&self, name: &str) -> Option<&Path> {
        self.repos.get(name).map(PathBuf::as_path)
    }

    /// Replace `@<repo>` designators with the repository's on-disk path
    pub fn expand_designators(&self, value: &str) -> String {
        let mut out = value.to_owned();

        for (name, path) in &self.repos {
            let designator = format!("@{name}");
            if out.contains(&designator) {
                out = out.replace(&designator, &path.display().to_string());
            }
        }

        out
    }

    /// Inject a generated package into the catalog after resolution
    pub fn inject_generated(&mut self, package: Package) {
        self.catalog.insert(package);
    }
}

fn scan_repo(catalog: &mut Catalog, repo: &str, repo_base: &Path, dir: &Path) -> Result<(), Error> {
    let manifest_path = dir.join(PKG_MANIFEST);

    if manifest_path.is_file() {
        let mut manifest = pkg_manifest::load(&manifest_path)?;

        for overlay in OVERLAY_MANIFESTS {
            let path = dir.join(overlay);
            if path.is_file() {
                manifest = manifest.merge(pkg_manifest::load(&path)?);
            }
        }

        let features = pkg_manifest::FeatureSet::new();
        let kind_str = manifest.get_string("pkg.type", &features)?;
        let kind = if kind_str.is_empty() {
            PackageType::default()
        } else {
            kind_str.parse().map_err(|_| Error::UnknownType {
                path: manifest_path.clone(),
                value: kind_str,
            })?
        };

        let rel = dir
            .strip_prefix(repo_base)
            .unwrap_or(dir)
            .to_string_lossy()
            .replace('\\', "/");
        let name = PkgName::new(repo, rel);

        let linked_name = match manifest.get_string("pkg.link", &features)? {
            s if s.is_empty() => None,
            s => Some(match s.split_once(':') {
                Some((r, p)) => PkgName::new(r, p),
                None => PkgName::new(repo, s),
            }),
        };

        catalog.insert(Package {
            name,
            kind,
            base: dir.to_owned(),
            manifest,
            linked_name,
        });
    }

    // unittest packages nest below their owning package, keep walking
    let entries = fs::read_dir(dir).map_err(|source| Error::Io {
        path: dir.to_owned(),
        source,
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if file_name.starts_with('.') {
            continue;
        }
        if dir == repo_base && SKIPPED_DIRS.contains(&file_name) {
            continue;
        }
        if path.is_dir() {
            scan_repo(catalog, repo, repo_base, &path)?;
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o under {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown package type {value:?} in {path:?}")]
    UnknownType { path: PathBuf, value: String },

    #[error(transparent)]
    Manifest(#[from] pkg_manifest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn discovery_and_designators() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(&root.join("project.yml"), "project.name: blinky_proj");
        write(&root.join("apps/blinky/pkg.yml"), "pkg.type: app");
        write(&root.join("repos/core/sys/log/pkg.yml"), "pkg.type: lib");
        write(&root.join("repos/core/sys/log/test/pkg.yml"), "pkg.type: unittest");

        let project = Project::open(root).unwrap();

        assert_eq!(project.local_repo(), "blinky_proj");
        assert_eq!(project.catalog().len(), 3);

        let log = project.catalog().resolve("sys/log", "blinky_proj").unwrap();
        assert_eq!(log.kind, PackageType::Library);
        assert_eq!(log.name.repo(), "core");

        let expanded = project.expand_designators("-I@core/include");
        assert_eq!(expanded, format!("-I{}/include", root.join("repos/core").display()));
    }

    #[test]
    fn missing_project_manifest_defaults_local() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("apps/demo/pkg.yml"), "pkg.type: app");

        let project = Project::open(dir.path()).unwrap();
        assert_eq!(project.local_repo(), "local");
        assert!(project.catalog().resolve("apps/demo", "local").is_ok());
    }
}
