// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! One builder per image: it owns a resolution and drives the
//! compile → archive → link pipeline for it. Split targets run two
//! builders (app and loader) over the shared project catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use fs_err as fs;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::package::{BspDetails, Package, PkgName};
use crate::paths::{BuildName, Paths};
use crate::project::Project;
use crate::resolver::{self, Resolution, Roles};
use crate::syscfg::Syscfg;
use crate::target::Target;
use crate::toolchain::{LinkSpec, Toolchain};
use crate::util;

use self::cinfo::{Aggregator, CompilerInfo};
use self::jobs::CompilerJob;

pub mod cinfo;
pub mod jobs;
pub mod pool;
pub mod sysinit;

/// Feature granted to the loader image of a split target
const SPLIT_LOADER: &str = "SPLIT_LOADER";
/// Feature granted to the app image of a split target
const SPLIT_APPLICATION: &str = "SPLIT_APPLICATION";

#[derive(Debug)]
pub struct Builder<'a> {
    project: &'a Project,
    target: Target,
    build_name: BuildName,
    paths: Paths,
    resolution: Resolution,
    toolchain: Toolchain,
    arch: String,
    bsp_details: BspDetails,
    workers: NonZeroUsize,
    /// Fully merged per-package compiler infos, populated by
    /// `prep_build` before the pool starts
    infos: BTreeMap<PkgName, CompilerInfo>,
    /// Toolchains keyed by build profile; packages may override the
    /// target profile (`target.package_profiles`, `pkg.build_profile`)
    profile_toolchains: BTreeMap<String, Toolchain>,
    pkg_profiles: BTreeMap<PkgName, String>,
    /// Generated packages injected after resolution
    generated: Vec<Package>,
    /// Packages dropped from this image's archives (split relink)
    excluded: BTreeSet<PkgName>,
    compiler: PkgName,
    prepared: bool,
}

/// What one `build` invocation did
#[derive(Debug, Clone, Copy)]
pub struct BuildOutcome {
    pub jobs_total: usize,
    pub jobs_run: usize,
}

impl<'a> Builder<'a> {
    pub fn new(
        project: &'a Project,
        target: &Target,
        build_name: BuildName,
        workers: NonZeroUsize,
    ) -> Result<Self, Error> {
        let spec = &target.spec;

        let image = match build_name {
            BuildName::App => spec.require_app().map_err(Error::Target)?.to_owned(),
            BuildName::Loader => spec
                .loader
                .clone()
                .ok_or(Error::NotSplit { target: target.name.clone() })?,
        };

        let local = project.local_repo();
        let lookup = |name: &str| -> Result<PkgName, Error> {
            Ok(project
                .catalog()
                .resolve(name, local)
                .map_err(Error::Lookup)?
                .name
                .clone())
        };

        let app = lookup(&image)?;
        let bsp = lookup(&spec.bsp)?;

        let compiler = match &spec.compiler {
            Some(compiler) => lookup(compiler)?,
            None => {
                // inherited from the BSP when the target names none
                let bsp_pkg = project.catalog().resolve(&spec.bsp, local).map_err(Error::Lookup)?;
                let declared = bsp_pkg
                    .manifest
                    .get_string("pkg.compiler", &pkg_manifest::FeatureSet::new())
                    .map_err(|source| Error::Manifest {
                        package: bsp.clone(),
                        source,
                    })?;
                if declared.is_empty() {
                    return Err(Error::NoCompiler { target: target.name.clone() });
                }
                lookup(&declared)?
            }
        };

        let mut syscfg = Syscfg::new(spec.vals.clone());
        if spec.is_split() {
            syscfg.add_identity(match build_name {
                BuildName::App => SPLIT_APPLICATION,
                BuildName::Loader => SPLIT_LOADER,
            });
        }

        let roles = Roles {
            target: target.name.clone(),
            app: Some(app),
            bsp: bsp.clone(),
            compiler: compiler.clone(),
        };

        let resolution = resolver::resolve(project, roles, syscfg)?;

        let bsp_pkg = project
            .catalog()
            .get(&bsp)
            .ok_or_else(|| Error::MissingFromCatalog { package: bsp.clone() })?;
        let bsp_details = bsp_pkg
            .bsp_details(&resolution.syscfg().features_for(bsp_pkg))
            .map_err(|source| Error::Manifest {
                package: bsp.clone(),
                source,
            })?;

        let compiler_pkg = project
            .catalog()
            .get(&compiler)
            .ok_or_else(|| Error::MissingFromCatalog { package: compiler.clone() })?;
        let profile = spec.profile_for(compiler.path());
        let toolchain = Toolchain::load(
            project,
            compiler_pkg,
            profile,
            &resolution.syscfg().features_for(compiler_pkg),
        )
        .map_err(Error::Toolchain)?;

        Ok(Self {
            project,
            target: target.clone(),
            build_name,
            paths: target.paths(project),
            arch: bsp_details.arch.clone(),
            bsp_details,
            resolution,
            toolchain,
            workers,
            infos: BTreeMap::new(),
            profile_toolchains: BTreeMap::new(),
            pkg_profiles: BTreeMap::new(),
            generated: vec![],
            excluded: BTreeSet::new(),
            compiler,
            prepared: false,
        })
    }

    pub fn project(&self) -> &'a Project {
        self.project
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn build_name(&self) -> BuildName {
        self.build_name
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn bsp_details(&self) -> &BspDetails {
        &self.bsp_details
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn image_pkg(&self) -> &PkgName {
        // roles.app is always set by new()
        self.resolution.roles().app.as_ref().unwrap_or(&self.resolution.roles().bsp)
    }

    /// Every package this image compiles, stable alphabetical order
    pub fn build_packages(&self) -> Vec<PkgName> {
        let mut names: Vec<_> = self
            .resolution
            .package_names()
            .into_iter()
            .filter(|n| !self.excluded.contains(n))
            .collect();
        names.extend(self.generated.iter().map(|p| p.name.clone()));
        names.sort();
        names
    }

    /// Drop packages from this image's archive set (their code now
    /// lives in the other image)
    pub fn exclude(&mut self, packages: &[PkgName]) {
        let bsp = self.resolution.roles().bsp.clone();
        self.excluded.extend(packages.iter().cloned());
        // the BSP is always linked into both images
        self.excluded.remove(&bsp);
    }

    /// Aggregate base info, inject the generated sysinit package and
    /// warm every per-package compiler info cache
    pub fn prep_build(&mut self) -> Result<(), Error> {
        let generated_paths = self.paths.generated();
        util::ensure_dir_exists(&generated_paths.include).map_err(|source| Error::Io {
            path: generated_paths.include.clone(),
            source,
        })?;

        let sysinit_pkg = sysinit::generate(self.project, &self.resolution, &generated_paths)?;
        self.generated = vec![sysinit_pkg];

        let roles = self.resolution.roles().clone();
        let bsp_pkg = self.catalog_pkg(&roles.bsp)?;

        let mut aggregator = Aggregator::new(self.project, &self.resolution, bsp_pkg, self.arch.as_str());

        // priority order: target first, then app, then bsp
        let mut base = aggregator.compiler_info(self.catalog_pkg(&roles.target)?)?;
        if let Some(app) = &roles.app {
            base = base.concat(&aggregator.compiler_info(self.catalog_pkg(app)?)?);
        }
        base = base.concat(&aggregator.compiler_info(bsp_pkg)?);

        // identity defines
        let arch_ident = util::sanitize_ident(&self.arch);
        base.cflags.push(format!("-DARCH_{arch_ident}"));
        base.cflags.push(format!("-DARCH_NAME={}", self.arch));
        let bsp_ident = util::sanitize_ident(roles.bsp.basename());
        base.cflags.push(format!("-DBSP_{bsp_ident}"));
        base.cflags.push(format!("-DBSP_NAME={}", roles.bsp.basename()));
        if let Some(app) = &roles.app {
            let app_ident = util::sanitize_ident(app.basename());
            base.cflags.push(format!("-DAPP_{app_ident}"));
            base.cflags.push(format!("-DAPP_NAME={}", app.basename()));
        }

        base.includes.push(generated_paths.include.clone());

        // merge base over every build package, fixing the full info
        // set before any worker runs
        let mut infos = BTreeMap::new();
        let mut profiles = BTreeMap::new();
        for name in self.build_packages() {
            let package = self.pkg(&name)?.clone();
            let own = if package.manifest.is_empty() {
                CompilerInfo::default()
            } else {
                aggregator.compiler_info(&package)?
            };

            let mut merged = base.clone().concat(&own);
            // discovery fields are never inherited from the base
            merged.source_dirs = own.source_dirs.clone();
            merged.source_files = own.source_files.clone();
            merged.ignore_files = own.ignore_files.clone();
            merged.ignore_dirs = own.ignore_dirs.clone();

            profiles.insert(name.clone(), self.package_profile(&name, &package)?);
            infos.insert(name, merged);
        }

        // one toolchain per distinct profile, loaded before any worker
        // runs
        let compiler_pkg = self.catalog_pkg(&self.compiler)?;
        let compiler_features = self.resolution.syscfg().features_for(compiler_pkg);
        let mut toolchains = BTreeMap::new();
        for profile in profiles.values() {
            if toolchains.contains_key(profile) {
                continue;
            }
            let toolchain = Toolchain::load(self.project, compiler_pkg, profile, &compiler_features)
                .map_err(Error::Toolchain)?;
            toolchains.insert(profile.clone(), toolchain);
        }

        self.infos = infos;
        self.pkg_profiles = profiles;
        self.profile_toolchains = toolchains;
        self.prepared = true;

        debug!(
            build = %self.build_name,
            num_packages = self.infos.len(),
            "build prepared"
        );

        Ok(())
    }

    /// Compile every package and archive the results
    pub fn build(&mut self) -> Result<BuildOutcome, Error> {
        if !self.prepared {
            self.prep_build()?;
        }

        // gather jobs in deterministic package order
        let mut all_jobs: Vec<CompilerJob> = vec![];
        let mut per_package: BTreeMap<PkgName, jobs::PackageJobs> = BTreeMap::new();

        for name in self.build_packages() {
            let package = self.pkg(&name)?.clone();
            let info = self.info(&name)?;
            let out_dir = self.paths.pkg_bin(self.build_name, &name);

            let collected = jobs::collect(&package, info, self.toolchain_for(&name), &self.arch, &out_dir)?;
            all_jobs.extend(collected.jobs.iter().cloned());
            per_package.insert(name, collected);
        }

        let jobs_run = pool::run(&all_jobs, &self.toolchain, self.workers)?;

        // per-package archives, produced only from packages with jobs
        for (name, collected) in &per_package {
            let bin_dir = self.paths.pkg_bin(self.build_name, name);

            for found in &collected.found_archives {
                let Some(file_name) = found.file_name() else {
                    continue;
                };
                let dest = bin_dir.join(file_name);
                util::ensure_dir_exists(&bin_dir).map_err(|source| Error::Io {
                    path: bin_dir.clone(),
                    source,
                })?;
                fs::copy(found, &dest).map_err(|source| Error::Io {
                    path: dest.clone(),
                    source,
                })?;
            }

            if collected.jobs.is_empty() {
                continue;
            }

            let archive = self.paths.archive(self.build_name, name);
            let stale = collected.jobs.iter().any(|j| !j.up_to_date);
            if !stale && archive.exists() {
                continue;
            }

            util::ensure_dir_exists(&bin_dir).map_err(|source| Error::Io {
                path: bin_dir.clone(),
                source,
            })?;
            let objects: Vec<_> = collected.jobs.iter().map(|j| j.object.clone()).collect();
            self.toolchain.archive(&archive, &objects).map_err(Error::Toolchain)?;
        }

        self.write_compile_commands(&all_jobs)?;

        info!(
            build = %self.build_name,
            jobs_total = all_jobs.len(),
            jobs_run,
            "build complete"
        );

        Ok(BuildOutcome {
            jobs_total: all_jobs.len(),
            jobs_run,
        })
    }

    /// Every archive below this image's package bin dirs, sorted by
    /// package then file name
    pub fn archives(&self) -> Result<Vec<PathBuf>, Error> {
        let mut out = vec![];

        for name in self.build_packages() {
            let bin_dir = self.paths.pkg_bin(self.build_name, &name);
            if !bin_dir.is_dir() {
                continue;
            }
            let archives = util::enumerate_files(&bin_dir, |p| {
                p.extension().is_some_and(|e| e == std::ffi::OsStr::new("a"))
            })
            .map_err(|source| Error::Io {
                path: bin_dir.clone(),
                source,
            })?;
            out.extend(archives);
        }

        Ok(out)
    }

    /// Link this image's archives into an ELF at `elf`
    pub fn link(
        &self,
        elf: &PathBuf,
        scripts: &[String],
        keep_symbols: Vec<String>,
        just_symbols: Option<PathBuf>,
    ) -> Result<(), Error> {
        let image = self.image_pkg().clone();
        let archives = self.archives()?;

        let mut lflags = vec![];
        if let Some(info) = self.infos.get(&image) {
            lflags.extend(info.lflags.iter().cloned());
        }

        let spec = LinkSpec {
            archives,
            scripts: scripts.iter().map(|s| self.project.expand_designators(s)).collect(),
            lflags,
            keep_symbols,
            just_symbols,
        };

        if let Some(parent) = elf.parent() {
            util::ensure_dir_exists(parent).map_err(|source| Error::Io {
                path: parent.to_owned(),
                source,
            })?;
        }

        self.toolchain.link(elf, &spec).map_err(Error::Toolchain)?;
        Ok(())
    }

    /// Default linker scripts of this image
    pub fn linker_scripts(&self, part2: bool) -> Vec<String> {
        if part2 {
            self.bsp_details.part2_linker_scripts.clone()
        } else {
            self.bsp_details.linker_scripts.clone()
        }
    }

    /// Emit `manifest.json` beside the linked image
    pub fn write_build_manifest(&self, elf: &PathBuf) -> Result<(), Error> {
        #[derive(Serialize)]
        struct BuildManifest<'m> {
            name: String,
            target: String,
            build_profile: &'m str,
            image: String,
            packages: Vec<String>,
        }

        let manifest = BuildManifest {
            name: self.image_pkg().to_string(),
            target: self.target.name.to_string(),
            build_profile: &self.target.spec.build_profile,
            image: elf.display().to_string(),
            packages: self.build_packages().iter().map(ToString::to_string).collect(),
        };

        let path = self.paths.build_manifest(self.build_name, self.image_pkg());
        let json = serde_json::to_string_pretty(&manifest).map_err(Error::Encode)?;
        fs::write(&path, json).map_err(|source| Error::Io { path, source })?;
        Ok(())
    }

    fn write_compile_commands(&self, all_jobs: &[CompilerJob]) -> Result<(), Error> {
        #[derive(Serialize)]
        struct Entry {
            file: String,
            directory: String,
            command: String,
        }

        let mut entries: Vec<Entry> = all_jobs
            .iter()
            .map(|job| Entry {
                file: job.source.display().to_string(),
                directory: self.project.root().display().to_string(),
                command: job.argv.join(" "),
            })
            .collect();
        entries.sort_by(|a, b| a.file.cmp(&b.file));

        let path = self.paths.compile_commands(self.build_name);
        if let Some(parent) = path.parent() {
            util::ensure_dir_exists(parent).map_err(|source| Error::Io {
                path: parent.to_owned(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(&entries).map_err(Error::Encode)?;
        fs::write(&path, json).map_err(|source| Error::Io { path, source })?;
        Ok(())
    }

    /// Profile for one package: target override first, then the
    /// package's own declaration, then the target default
    fn package_profile(&self, name: &PkgName, package: &Package) -> Result<String, Error> {
        let spec = &self.target.spec;

        if let Some(profile) = spec
            .package_profiles
            .get(&name.to_string())
            .or_else(|| spec.package_profiles.get(name.path()))
        {
            return Ok(profile.clone());
        }

        let declared = if package.manifest.is_empty() {
            String::new()
        } else {
            let features = self.resolution.syscfg().features_for(package);
            package
                .manifest
                .get_string("pkg.build_profile", &features)
                .map_err(|source| Error::Manifest {
                    package: name.clone(),
                    source,
                })?
        };

        Ok(if declared.is_empty() {
            spec.build_profile.clone()
        } else {
            declared
        })
    }

    fn toolchain_for(&self, name: &PkgName) -> &Toolchain {
        self.pkg_profiles
            .get(name)
            .and_then(|profile| self.profile_toolchains.get(profile))
            .unwrap_or(&self.toolchain)
    }

    fn catalog_pkg(&self, name: &PkgName) -> Result<&'a Package, Error> {
        self.project
            .catalog()
            .get(name)
            .ok_or_else(|| Error::MissingFromCatalog { package: name.clone() })
    }

    /// A build package: catalog first, then the generated set
    fn pkg(&self, name: &PkgName) -> Result<&'_ Package, Error> {
        if let Some(package) = self.generated.iter().find(|p| p.name == *name) {
            return Ok(package);
        }
        self.catalog_pkg(name)
    }

    fn info(&self, name: &PkgName) -> Result<&'_ CompilerInfo, Error> {
        self.infos
            .get(name)
            .ok_or_else(|| Error::MissingFromCatalog { package: name.clone() })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Target(pkg_manifest::target::Error),

    #[error("{target} declares no loader, split build impossible")]
    NotSplit { target: PkgName },

    #[error("{target} names no compiler and its bsp declares none")]
    NoCompiler { target: PkgName },

    #[error(transparent)]
    Lookup(crate::package::Error),

    #[error(transparent)]
    Resolve(#[from] resolver::Error),

    #[error("manifest of {package}")]
    Manifest {
        package: PkgName,
        #[source]
        source: pkg_manifest::Error,
    },

    #[error("package {package} resolved but missing from catalog")]
    MissingFromCatalog { package: PkgName },

    #[error(transparent)]
    Cinfo(#[from] cinfo::Error),

    #[error(transparent)]
    Jobs(#[from] jobs::Error),

    #[error(transparent)]
    Pool(#[from] pool::Error),

    #[error(transparent)]
    Sysinit(#[from] sysinit::Error),

    #[error(transparent)]
    Toolchain(crate::toolchain::Error),

    #[error("encoding build outputs")]
    Encode(#[source] serde_json::Error),

    #[error("i/o on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
