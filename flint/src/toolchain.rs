// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The toolchain boundary: how compiler, archiver, linker and the
//! binutils inspectors are actually spawned. The rest of the build
//! consumes this as a typed interface and never touches `Command`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs_err as fs;
use pkg_manifest::FeatureSet;
use thiserror::Error;
use tracing::debug;

use crate::package::Package;
use crate::project::Project;

/// Built-in linker symbols renamed with a `_loader` suffix when
/// deriving a ROM ELF, freeing the names for the app image
pub const ROM_ELF_RENAMED_SYMBOLS: &[&str] = &[
    "__HeapBase",
    "__bss_start__",
    "__bss_end__",
    "__etext",
    "__data_start__",
    "__data_end__",
    "__vector_tbl_reloc__",
    "__isr_vector",
];

/// Tool paths plus profile-selected base flags, decoded from a
/// compiler package manifest
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub cc: String,
    pub cxx: String,
    pub asm: String,
    pub ar: String,
    pub objcopy: String,
    pub objdump: String,
    pub nm: String,
    pub addr2line: String,
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub aflags: Vec<String>,
    pub lflags: Vec<String>,
}

impl Toolchain {
    /// Read tool paths and flags for `profile`, falling back to the
    /// `default` flag set when the profile declares none
    pub fn load(
        project: &Project,
        compiler: &Package,
        profile: &str,
        features: &FeatureSet,
    ) -> Result<Self, Error> {
        let manifest = &compiler.manifest;

        let tool = |key: &str, fallback: &str| -> Result<String, Error> {
            let value = manifest.get_string(key, features).map_err(Error::Manifest)?;
            if value.is_empty() {
                Ok(fallback.to_owned())
            } else {
                Ok(project.expand_designators(&value))
            }
        };

        let flags = |prefix: &str| -> Result<Vec<String>, Error> {
            let profile_key = format!("{prefix}.{profile}");
            let default_key = format!("{prefix}.default");
            let keyed = manifest
                .first_string_list(&[profile_key.as_str(), default_key.as_str()], features)
                .map_err(Error::Manifest)?;
            Ok(keyed.iter().map(|f| project.expand_designators(f)).collect())
        };

        Ok(Self {
            cc: tool("compiler.path.cc", "cc")?,
            cxx: tool("compiler.path.cxx", "c++")?,
            asm: tool("compiler.path.as", "cc")?,
            ar: tool("compiler.path.archive", "ar")?,
            objcopy: tool("compiler.path.objcopy", "objcopy")?,
            objdump: tool("compiler.path.objdump", "objdump")?,
            nm: tool("compiler.path.nm", "nm")?,
            addr2line: tool("compiler.path.addr2line", "addr2line")?,
            cflags: flags("compiler.flags")?,
            cxxflags: flags("compiler.cxx.flags")?,
            aflags: flags("compiler.as.flags")?,
            lflags: flags("compiler.ld.flags")?,
        })
    }

    /// Execute a previously materialized compile command
    pub fn run_compile(&self, argv: &[String]) -> Result<(), Error> {
        run(argv)?;
        Ok(())
    }

    /// Create `archive` from `objects`, replacing any previous archive
    pub fn archive(&self, archive: &Path, objects: &[PathBuf]) -> Result<(), Error> {
        if archive.exists() {
            fs::remove_file(archive).map_err(|source| Error::Io {
                path: archive.to_owned(),
                source,
            })?;
        }

        let mut argv = vec![self.ar.clone(), "rcs".to_owned(), archive.display().to_string()];
        argv.extend(objects.iter().map(|o| o.display().to_string()));
        run(&argv)?;
        Ok(())
    }

    /// Link `archives` into `elf`
    pub fn link(&self, elf: &Path, spec: &LinkSpec) -> Result<(), Error> {
        let mut argv = vec![self.cc.clone(), "-o".to_owned(), elf.display().to_string()];

        argv.extend(self.lflags.iter().cloned());
        argv.extend(spec.lflags.iter().cloned());

        for script in &spec.scripts {
            argv.push(format!("-T{script}"));
        }
        for symbol in &spec.keep_symbols {
            argv.push(format!("-Wl,--undefined={symbol}"));
        }
        if let Some(rom_elf) = &spec.just_symbols {
            argv.push(format!("-Wl,--just-symbols={}", rom_elf.display()));
        }

        // circular dependencies between firmware archives are routine
        argv.push("-Wl,--start-group".to_owned());
        argv.extend(spec.archives.iter().map(|a| a.display().to_string()));
        argv.push("-Wl,--end-group".to_owned());

        argv.push(format!("-Wl,-Map={}.map", elf.display()));

        debug!(elf = %elf.display(), num_archives = spec.archives.len(), "linking");
        run(&argv)?;
        Ok(())
    }

    /// Raw binary image of `elf`
    pub fn objcopy_bin(&self, elf: &Path, bin: &Path) -> Result<(), Error> {
        run(&[
            self.objcopy.clone(),
            "-R".to_owned(),
            ".bss_core".to_owned(),
            "-O".to_owned(),
            "binary".to_owned(),
            elf.display().to_string(),
            bin.display().to_string(),
        ])?;
        Ok(())
    }

    /// Derive a symbol-donor ELF: keep `symbols`, rename the linker's
    /// built-ins out of the way
    pub fn rom_elf(&self, elf: &Path, out: &Path, symbols: &[String]) -> Result<(), Error> {
        let mut argv = vec![self.objcopy.clone()];

        for symbol in symbols {
            argv.push("-K".to_owned());
            argv.push(symbol.clone());
        }
        for builtin in ROM_ELF_RENAMED_SYMBOLS {
            argv.push("--redefine-sym".to_owned());
            argv.push(format!("{builtin}={builtin}_loader"));
        }

        argv.push(elf.display().to_string());
        argv.push(out.display().to_string());
        run(&argv)?;
        Ok(())
    }

    /// `objdump -t` symbol table text
    pub fn symbol_table(&self, path: &Path) -> Result<String, Error> {
        run_capture(&[self.objdump.clone(), "-t".to_owned(), path.display().to_string()])
    }

    /// `objdump -hw` section header text
    pub fn section_headers(&self, path: &Path) -> Result<String, Error> {
        run_capture(&[self.objdump.clone(), "-hw".to_owned(), path.display().to_string()])
    }

    /// `nm -S -l` sizes-and-sources text
    pub fn symbol_sources(&self, path: &Path) -> Result<String, Error> {
        run_capture(&[
            self.nm.clone(),
            "-S".to_owned(),
            "-l".to_owned(),
            path.display().to_string(),
        ])
    }

    /// Resolve one address to `file:line` via addr2line
    pub fn addr_to_line(&self, elf: &Path, addr: u64) -> Result<String, Error> {
        run_capture(&[
            self.addr2line.clone(),
            "-e".to_owned(),
            elf.display().to_string(),
            format!("0x{addr:x}"),
        ])
    }
}

/// One link invocation's inputs
#[derive(Debug, Clone, Default)]
pub struct LinkSpec {
    pub archives: Vec<PathBuf>,
    pub scripts: Vec<String>,
    pub lflags: Vec<String>,
    pub keep_symbols: Vec<String>,
    pub just_symbols: Option<PathBuf>,
}

fn run(argv: &[String]) -> Result<std::process::Output, Error> {
    let (program, args) = argv.split_first().ok_or(Error::EmptyCommand)?;

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(Error::Failed {
            program: program.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(output)
}

fn run_capture(argv: &[String]) -> Result<String, Error> {
    let output = run(argv)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty toolchain command")]
    EmptyCommand,

    #[error("spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("i/o on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("compiler manifest")]
    Manifest(#[source] pkg_manifest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{PackageType, PkgName};

    #[test]
    fn profile_flag_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("compiler/arm")).unwrap();
        fs::write(
            dir.path().join("compiler/arm/pkg.yml"),
            "pkg.type: compiler\ncompiler.path.cc: arm-none-eabi-gcc\ncompiler.flags.default: [-Os]\ncompiler.flags.debug: [-O0, -g]",
        )
        .unwrap();

        let project = Project::open(dir.path()).unwrap();
        let compiler = project
            .catalog()
            .get(&PkgName::new(project.local_repo(), "compiler/arm"))
            .unwrap();
        assert_eq!(compiler.kind, PackageType::Compiler);

        let features = FeatureSet::new();

        let debug = Toolchain::load(&project, compiler, "debug", &features).unwrap();
        assert_eq!(debug.cc, "arm-none-eabi-gcc");
        assert_eq!(debug.cflags, vec!["-O0", "-g"]);

        // unknown profile falls back to the default flag set
        let optimized = Toolchain::load(&project, compiler, "optimized", &features).unwrap();
        assert_eq!(optimized.cflags, vec!["-Os"]);

        // missing tools fall back to host names
        assert_eq!(debug.ar, "ar");
    }
}
