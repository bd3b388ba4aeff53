// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Compile job collection.
//!
//! Source roots come from the manifest (`pkg.source_dirs`) or default
//! to `<base>/src`. The base walk gathers C and C++ sources and
//! prebuilt archives, skipping `arch/`; the architecture subtree is
//! walked afterwards and additionally yields assembly sources.

use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;

use super::cinfo::CompilerInfo;
use crate::package::{Package, PkgName};
use crate::toolchain::Toolchain;

/// Directory holding architecture specific sources, skipped by the
/// base recursion
const ARCH_DIR: &str = "arch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    C,
    Cxx,
    Asm,
}

impl SourceKind {
    fn of(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str())? {
            "c" => Some(SourceKind::C),
            "cc" | "cpp" | "cxx" => Some(SourceKind::Cxx),
            "s" | "S" => Some(SourceKind::Asm),
            _ => None,
        }
    }
}

/// One materialized compiler invocation
#[derive(Debug, Clone)]
pub struct CompilerJob {
    pub package: PkgName,
    pub source: PathBuf,
    pub object: PathBuf,
    pub kind: SourceKind,
    pub argv: Vec<String>,
    /// Object newer than source: recorded for compile-commands but not
    /// re-executed
    pub up_to_date: bool,
}

/// Everything collected below one package
#[derive(Debug, Clone, Default)]
pub struct PackageJobs {
    pub jobs: Vec<CompilerJob>,
    /// Prebuilt archives found in the source tree, copied to the
    /// package bin dir for linking
    pub found_archives: Vec<PathBuf>,
}

pub fn collect(
    package: &Package,
    info: &CompilerInfo,
    toolchain: &Toolchain,
    arch: &str,
    out_dir: &Path,
) -> Result<PackageJobs, Error> {
    let mut roots = vec![];

    if info.source_dirs.is_empty() {
        let default = package.base.join("src");
        if default.is_dir() {
            roots.push(default);
        }
    } else {
        for dir in &info.source_dirs {
            let root = package.base.join(dir);
            if !root.is_dir() {
                return Err(Error::MissingSourceDir {
                    package: package.name.clone(),
                    dir: root,
                });
            }
            roots.push(root);
        }
    }

    let mut out = PackageJobs::default();

    for root in &roots {
        walk(package, info, toolchain, root, root, out_dir, false, &mut out)?;

        let arch_root = root.join(ARCH_DIR).join(arch);
        if arch_root.is_dir() {
            walk(package, info, toolchain, &arch_root, root, out_dir, true, &mut out)?;
        }
    }

    // explicit source files bypass discovery entirely
    if !info.source_files.is_empty() {
        out.jobs.clear();
        for file in &info.source_files {
            let source = package.base.join(file);
            if let Some(kind) = SourceKind::of(&source) {
                out.jobs
                    .push(make_job(package, info, toolchain, &source, &package.base, out_dir, kind)?);
            }
        }
    }

    out.jobs.sort_by(|a, b| a.source.cmp(&b.source));
    out.found_archives.sort();

    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn walk(
    package: &Package,
    info: &CompilerInfo,
    toolchain: &Toolchain,
    dir: &Path,
    root: &Path,
    out_dir: &Path,
    in_arch: bool,
    out: &mut PackageJobs,
) -> Result<(), Error> {
    let entries = fs::read_dir(dir).map_err(|source| Error::Io {
        path: dir.to_owned(),
        source,
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().into_owned();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if path.is_dir() {
            if !in_arch && name == ARCH_DIR {
                continue;
            }
            if info.ignore_dirs.iter().any(|re| re.is_match(&rel)) {
                continue;
            }
            walk(package, info, toolchain, &path, root, out_dir, in_arch, out)?;
            continue;
        }

        if info.ignore_files.iter().any(|re| re.is_match(&rel)) {
            continue;
        }

        if name.ends_with(".a") {
            out.found_archives.push(path);
            continue;
        }

        let Some(kind) = SourceKind::of(&path) else {
            continue;
        };
        // assembly only participates below arch/<arch>/
        if kind == SourceKind::Asm && !in_arch {
            continue;
        }

        out.jobs.push(make_job(package, info, toolchain, &path, root, out_dir, kind)?);
    }

    Ok(())
}

fn make_job(
    package: &Package,
    info: &CompilerInfo,
    toolchain: &Toolchain,
    source: &Path,
    root: &Path,
    out_dir: &Path,
    kind: SourceKind,
) -> Result<CompilerJob, Error> {
    let rel = source.strip_prefix(root).unwrap_or(source);
    let object = out_dir.join("obj").join(rel).with_extension("o");

    let (tool, base_flags, pkg_flags) = match kind {
        SourceKind::C => (&toolchain.cc, &toolchain.cflags, &info.cflags),
        SourceKind::Cxx => (&toolchain.cxx, &toolchain.cxxflags, &info.cxxflags),
        SourceKind::Asm => (&toolchain.asm, &toolchain.aflags, &info.aflags),
    };

    let mut argv = vec![tool.clone(), "-c".to_owned()];
    argv.extend(base_flags.iter().cloned());
    // assembly still sees the C defines
    if kind == SourceKind::Asm {
        argv.extend(info.cflags.iter().cloned());
    }
    argv.extend(pkg_flags.iter().cloned());
    argv.extend(info.includes.iter().map(|i| format!("-I{}", i.display())));
    argv.push("-o".to_owned());
    argv.push(object.display().to_string());
    argv.push(source.display().to_string());

    let up_to_date = is_up_to_date(source, &object)?;

    Ok(CompilerJob {
        package: package.name.clone(),
        source: source.to_owned(),
        object,
        kind,
        argv,
        up_to_date,
    })
}

fn is_up_to_date(source: &Path, object: &Path) -> Result<bool, Error> {
    if !object.exists() {
        return Ok(false);
    }

    let mtime = |path: &Path| -> Result<std::time::SystemTime, Error> {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|source| Error::Io {
                path: path.to_owned(),
                source,
            })
    };

    Ok(mtime(object)? >= mtime(source)?)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{package}: declared source dir {dir:?} does not exist")]
    MissingSourceDir { package: PkgName, dir: PathBuf },

    #[error("i/o under {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageType;
    use pkg_manifest::Manifest;
    use regex::Regex;

    fn fixture() -> (tempfile::TempDir, Package) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sys/log");

        for file in [
            "src/log.c",
            "src/log_shell.cc",
            "src/util/fmt.c",
            "src/log_old.c.bak",
            "src/arch/cortex_m4/log_asm.s",
            "src/arch/other/na.s",
            "src/prebuilt.a",
        ] {
            let path = base.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "").unwrap();
        }

        let package = Package {
            name: PkgName::new("core", "sys/log"),
            kind: PackageType::Library,
            base,
            manifest: Manifest::default(),
            linked_name: None,
        };

        (dir, package)
    }

    fn toolchain() -> Toolchain {
        Toolchain {
            cc: "cc".into(),
            cxx: "c++".into(),
            asm: "cc".into(),
            ar: "ar".into(),
            objcopy: "objcopy".into(),
            objdump: "objdump".into(),
            nm: "nm".into(),
            addr2line: "addr2line".into(),
            cflags: vec!["-Os".into()],
            cxxflags: vec![],
            aflags: vec![],
            lflags: vec![],
        }
    }

    #[test]
    fn gathers_sources_by_kind_and_arch() {
        let (dir, package) = fixture();
        let out_dir = dir.path().join("bin");

        let jobs = collect(&package, &CompilerInfo::default(), &toolchain(), "cortex_m4", &out_dir).unwrap();

        let sources: Vec<_> = jobs
            .jobs
            .iter()
            .map(|j| j.source.strip_prefix(&package.base).unwrap().display().to_string())
            .collect();

        // sorted, arch-matched assembly included, foreign arch skipped
        assert_eq!(
            sources,
            vec!["src/arch/cortex_m4/log_asm.s", "src/log.c", "src/log_shell.cc", "src/util/fmt.c"]
        );
        assert_eq!(jobs.found_archives.len(), 1);
        assert!(jobs.jobs.iter().all(|j| !j.up_to_date));
    }

    #[test]
    fn ignore_patterns_filter() {
        let (dir, package) = fixture();
        let out_dir = dir.path().join("bin");

        let info = CompilerInfo {
            ignore_files: vec![Regex::new("log_shell").unwrap()],
            ignore_dirs: vec![Regex::new("util").unwrap()],
            ..CompilerInfo::default()
        };

        let jobs = collect(&package, &info, &toolchain(), "cortex_m4", &out_dir).unwrap();
        let sources: Vec<_> = jobs.jobs.iter().map(|j| j.source.clone()).collect();

        assert!(sources.iter().all(|s| !s.to_string_lossy().contains("log_shell")));
        assert!(sources.iter().all(|s| !s.to_string_lossy().contains("util")));
    }

    #[test]
    fn missing_declared_source_dir_errors() {
        let (dir, package) = fixture();
        let out_dir = dir.path().join("bin");

        let info = CompilerInfo {
            source_dirs: vec!["generated".into()],
            ..CompilerInfo::default()
        };

        assert!(matches!(
            collect(&package, &info, &toolchain(), "cortex_m4", &out_dir),
            Err(Error::MissingSourceDir { .. })
        ));
    }

    #[test]
    fn package_without_src_yields_no_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let package = Package {
            name: PkgName::new("core", "sys/empty"),
            kind: PackageType::Library,
            base: dir.path().join("sys/empty"),
            manifest: Manifest::default(),
            linked_name: None,
        };

        let jobs = collect(&package, &CompilerInfo::default(), &toolchain(), "native", dir.path()).unwrap();
        assert!(jobs.jobs.is_empty());
    }
}
