// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use pkg_manifest::{FeatureSet, TargetSpec, target};
use thiserror::Error;

use crate::package::{PackageType, PkgName};
use crate::paths::Paths;
use crate::project::Project;

/// A named build anchor: the target package plus its decoded spec
#[derive(Debug, Clone)]
pub struct Target {
    pub name: PkgName,
    pub spec: TargetSpec,
}

impl Target {
    /// Load the target package `name` from the project catalog
    pub fn load(project: &Project, name: &str) -> Result<Self, Error> {
        let package = project
            .catalog()
            .resolve(name, project.local_repo())
            .map_err(Error::Lookup)?;

        if package.kind != PackageType::Target {
            return Err(Error::NotATarget {
                name: package.name.clone(),
                kind: package.kind,
            });
        }

        // the seed feature set is empty; gated target values only see
        // features once a resolution exists
        let spec = TargetSpec::from_manifest(&package.manifest, &FeatureSet::new())?;

        Ok(Self {
            name: package.name.clone(),
            spec,
        })
    }

    pub fn paths(&self, project: &Project) -> Paths {
        Paths::new(project.root(), self.name.path())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Lookup(crate::package::Error),

    #[error("{name} is a {kind} package, not a target")]
    NotATarget { name: PkgName, kind: PackageType },

    #[error(transparent)]
    Spec(#[from] target::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_err as fs;
    use std::path::Path;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn load_target_package() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(&root.join("targets/blinky/pkg.yml"), "pkg.type: target");
        write(
            &root.join("targets/blinky/target.yml"),
            "target.app: apps/blinky\ntarget.bsp: hw/bsp/native",
        );
        write(&root.join("apps/blinky/pkg.yml"), "pkg.type: app");

        let project = Project::open(root).unwrap();
        let target = Target::load(&project, "targets/blinky").unwrap();

        assert_eq!(target.spec.app.as_deref(), Some("apps/blinky"));
        assert_eq!(target.name.path(), "targets/blinky");

        // a non-target package is rejected
        assert!(Target::load(&project, "apps/blinky").is_err());
    }
}
