// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use crate::package::PkgName;

/// Which image of the target a builder produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BuildName {
    App,
    Loader,
}

/// Output path model. Everything a build run writes lands below
/// `bin/<target>/`, partitioned per image and per package.
#[derive(Debug, Clone)]
pub struct Paths {
    project_root: PathBuf,
    target_path: String,
}

impl Paths {
    pub fn new(project_root: impl Into<PathBuf>, target_path: impl Into<String>) -> Self {
        Self {
            project_root: project_root.into(),
            target_path: target_path.into(),
        }
    }

    pub fn project_root(&self) -> &PathBuf {
        &self.project_root
    }

    pub fn target_bin(&self) -> PathBuf {
        self.project_root.join("bin").join(&self.target_path)
    }

    pub fn build_bin(&self, build: BuildName) -> PathBuf {
        self.target_bin().join(build.to_string())
    }

    /// Per-package output directory; workers only ever write below
    /// their own package's directory
    pub fn pkg_bin(&self, build: BuildName, pkg: &PkgName) -> PathBuf {
        self.build_bin(build).join(pkg.path())
    }

    pub fn archive(&self, build: BuildName, pkg: &PkgName) -> PathBuf {
        self.pkg_bin(build, pkg).join(format!("{}.a", pkg.basename()))
    }

    pub fn elf(&self, build: BuildName, app: &PkgName) -> PathBuf {
        self.pkg_bin(build, app).join(format!("{}.elf", app.basename()))
    }

    pub fn elf_bin(&self, build: BuildName, app: &PkgName) -> PathBuf {
        self.pkg_bin(build, app).join(format!("{}.elf.bin", app.basename()))
    }

    /// Tentative pre-relink image used by split builds
    pub fn tmp_elf(&self, build: BuildName, app: &PkgName) -> PathBuf {
        self.pkg_bin(build, app).join(format!("{}_tmp.elf", app.basename()))
    }

    /// The loader-derived symbol donor for the app link
    pub fn rom_elf(&self, app: &PkgName) -> PathBuf {
        self.pkg_bin(BuildName::Loader, app)
            .join(format!("{}linker.elf", app.basename()))
    }

    pub fn build_manifest(&self, build: BuildName, app: &PkgName) -> PathBuf {
        self.pkg_bin(build, app).join("manifest.json")
    }

    pub fn compile_commands(&self, build: BuildName) -> PathBuf {
        self.build_bin(build).join("compile_commands.json")
    }

    pub fn generated(&self) -> GeneratedPaths {
        let base = self.target_bin().join("generated");

        GeneratedPaths {
            src: base.join("src"),
            include: base.join("include"),
            bin: base.join("bin"),
            base,
        }
    }
}

/// Home of the synthesized sysinit package and script stage outputs
#[derive(Debug, Clone)]
pub struct GeneratedPaths {
    pub base: PathBuf,
    pub src: PathBuf,
    pub include: PathBuf,
    pub bin: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let paths = Paths::new("/proj", "targets/blinky");
        let app = PkgName::new("local", "apps/blinky");

        assert_eq!(
            paths.archive(BuildName::App, &app),
            PathBuf::from("/proj/bin/targets/blinky/app/apps/blinky/blinky.a")
        );
        assert_eq!(
            paths.elf(BuildName::App, &app),
            PathBuf::from("/proj/bin/targets/blinky/app/apps/blinky/blinky.elf")
        );
        assert_eq!(
            paths.compile_commands(BuildName::Loader),
            PathBuf::from("/proj/bin/targets/blinky/loader/compile_commands.json")
        );
        assert_eq!(paths.generated().src, PathBuf::from("/proj/bin/targets/blinky/generated/src"));
    }
}
