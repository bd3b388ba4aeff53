// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Split-image relinking.
//!
//! A split target ships a small loader image plus an app image sharing
//! code. Both are linked tentatively, their symbol sets compared, and
//! the packages whose symbols are bit-identical on both sides move
//! into the loader. The loader is re-linked preserving every symbol
//! the app references, a ROM ELF is derived from it, and the app links
//! against that with the shared packages dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::builder::Builder;
use crate::package::PkgName;

/// Symbols allowed to differ between the images
const RESERVED_SYMBOLS: &[&str] = &["Reset_Handler"];

/// One symbol's identity: everything that must agree for the images
/// to share its code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub section: String,
    pub size: u64,
    pub local: bool,
    pub object_name: String,
    /// Content fingerprint over the symbol's table entry
    pub fingerprint: String,
}

impl Symbol {
    fn matches(&self, other: &Symbol) -> bool {
        self.name == other.name
            && self.section == other.section
            && self.size == other.size
            && self.fingerprint == other.fingerprint
    }
}

/// Symbols keyed by name
#[derive(Debug, Clone, Default)]
pub struct SymbolSet {
    syms: BTreeMap<String, Symbol>,
}

impl SymbolSet {
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.syms.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.syms.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'_ str> {
        self.syms.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'_ Symbol> {
        self.syms.values()
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }
}

/// Parse `objdump -t` output into a symbol set.
///
/// Archive listings interleave member headers (`foo.o: file format`)
/// with symbol tables; the current member attributes its symbols.
/// Debug/section-bookkeeping rows are skipped.
pub fn parse_symbols(text: &str) -> SymbolSet {
    let mut syms = BTreeMap::new();
    let mut object_name = String::new();

    for line in text.lines() {
        let line = line.trim_end();

        if let Some((member, rest)) = line.split_once(':')
            && rest.trim_start().starts_with("file format")
        {
            object_name = member.trim().to_owned();
            continue;
        }

        let Some(symbol) = parse_symbol_line(line, &object_name) else {
            continue;
        };
        syms.insert(symbol.name.clone(), symbol);
    }

    SymbolSet { syms }
}

fn parse_symbol_line(line: &str, object_name: &str) -> Option<Symbol> {
    // <addr> <flags> <section>\t<size> <name>
    let addr_end = line.find(' ')?;
    let addr = u64::from_str_radix(&line[..addr_end], 16).ok()?;

    let (head, tail) = line.split_once('\t')?;
    let flags_and_section = &head[addr_end..];

    let mut fields = tail.split_whitespace();
    let size = u64::from_str_radix(fields.next()?, 16).ok()?;
    let name = fields.next_back()?.to_owned();

    let section = flags_and_section.split_whitespace().next_back()?.to_owned();
    let flags = flags_and_section
        .strip_suffix(&section)
        .unwrap_or(flags_and_section)
        .trim();

    // section bookkeeping rows carry the debug flag
    if flags.contains('d') || name == section {
        return None;
    }

    let local = flags.starts_with('l');

    // a common symbol's recorded address is its size
    let (section, size) = if section == "*COM*" {
        (section, addr)
    } else {
        (section, size)
    };

    let mut hasher = Sha256::new();
    hasher.update(flags.as_bytes());
    hasher.update(section.as_bytes());
    hasher.update(size.to_le_bytes());
    let fingerprint = format!("{:x}", hasher.finalize());

    Some(Symbol {
        name,
        section,
        size,
        local,
        object_name: object_name.to_owned(),
        fingerprint,
    })
}

/// (matching, non-matching) partition of two symbol sets.
///
/// Matching holds names present in both sides with identical identity;
/// non-matching holds names present in both but differing, plus names
/// only one side has.
pub fn partition(a: &SymbolSet, b: &SymbolSet) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut matching = BTreeSet::new();
    let mut non_matching = BTreeSet::new();

    for symbol in a.iter() {
        match b.get(&symbol.name) {
            Some(other) if symbol.matches(other) => {
                matching.insert(symbol.name.clone());
            }
            _ => {
                non_matching.insert(symbol.name.clone());
            }
        }
    }
    for name in b.names() {
        if !a.contains(name) {
            non_matching.insert(name.to_owned());
        }
    }

    (matching, non_matching)
}

/// The computed sharing decision for one split target
#[derive(Debug, Default)]
pub struct SplitPlan {
    pub common_pkgs: Vec<PkgName>,
    /// App-referenced symbols the loader re-link must keep
    pub preserve: Vec<String>,
}

/// A package that cannot be shared and the symbols that stopped it
#[derive(Debug)]
pub struct Mismatch {
    pub package: PkgName,
    pub symbols: Vec<String>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.package, self.symbols.join(", "))
    }
}

/// Decide which packages both images may share.
///
/// `lib_syms` maps every package built by both images to its
/// (app-side, loader-side) archive symbols. A package is common when
/// every symbol matches; a differing global, non-reserved symbol is a
/// hard error.
pub fn common_packages(
    lib_syms: &BTreeMap<PkgName, (SymbolSet, SymbolSet)>,
    app_pkg: &PkgName,
    loader_pkg: &PkgName,
) -> Result<Vec<PkgName>, Error> {
    let mut common = vec![];
    let mut mismatches = vec![];

    for (name, (app_side, loader_side)) in lib_syms {
        if name == app_pkg || name == loader_pkg {
            continue;
        }

        let (matching, non_matching) = partition(app_side, loader_side);

        if non_matching.is_empty() && !matching.is_empty() {
            common.push(name.clone());
            continue;
        }

        let offending: Vec<String> = non_matching
            .iter()
            .filter(|sym| !RESERVED_SYMBOLS.contains(&sym.as_str()))
            .filter(|sym| {
                let local = |set: &SymbolSet| set.get(sym).is_some_and(|s| s.local);
                !(local(app_side) || local(loader_side))
            })
            .cloned()
            .collect();

        if !offending.is_empty() {
            mismatches.push(Mismatch {
                package: name.clone(),
                symbols: offending,
            });
        }
    }

    if !mismatches.is_empty() {
        return Err(Error::SharedSymbolMismatch(MismatchSet(mismatches)));
    }

    Ok(common)
}

/// Symbols present in the app ELF whose backing library symbol lives
/// in a common package and which the loader ELF does not already have
pub fn preserve_set(
    app_elf: &SymbolSet,
    loader_elf: &SymbolSet,
    lib_syms: &BTreeMap<PkgName, (SymbolSet, SymbolSet)>,
    common_pkgs: &[PkgName],
) -> Vec<String> {
    let mut common_lib_names = BTreeSet::new();
    for name in common_pkgs {
        if let Some((app_side, _)) = lib_syms.get(name) {
            common_lib_names.extend(app_side.names().map(str::to_owned));
        }
    }

    app_elf
        .names()
        .filter(|name| common_lib_names.contains(*name))
        .filter(|name| !loader_elf.contains(name))
        .map(str::to_owned)
        .collect()
}

/// Build both images of a split target and produce the final pair.
///
/// Returns the app ELF path.
pub fn run(app: &mut Builder<'_>, loader: &mut Builder<'_>) -> Result<PathBuf, Error> {
    // tentative builds and links of both images
    loader.build().map_err(Error::Build)?;
    app.build().map_err(Error::Build)?;

    let loader_pkg = loader.image_pkg().clone();
    let app_pkg = app.image_pkg().clone();

    let loader_tmp = loader.paths().tmp_elf(loader.build_name(), &loader_pkg);
    loader
        .link(&loader_tmp, &loader.linker_scripts(false), vec![], None)
        .map_err(Error::Build)?;

    let app_tmp = app.paths().tmp_elf(app.build_name(), &app_pkg);
    app.link(&app_tmp, &app.linker_scripts(true), vec![], None)
        .map_err(Error::Build)?;

    // per-package archive symbols from both sides
    let mut lib_syms = BTreeMap::new();
    let loader_set: BTreeSet<_> = loader.build_packages().into_iter().collect();

    for name in app.build_packages() {
        if !loader_set.contains(&name) {
            continue;
        }

        let app_archive = app.paths().archive(app.build_name(), &name);
        let loader_archive = loader.paths().archive(loader.build_name(), &name);
        if !app_archive.exists() || !loader_archive.exists() {
            continue;
        }

        let app_side = parse_symbols(&app.toolchain().symbol_table(&app_archive).map_err(Error::Toolchain)?);
        let loader_side = parse_symbols(
            &loader
                .toolchain()
                .symbol_table(&loader_archive)
                .map_err(Error::Toolchain)?,
        );
        lib_syms.insert(name, (app_side, loader_side));
    }

    let common = common_packages(&lib_syms, &app_pkg, &loader_pkg)?;
    debug!(num_common = common.len(), "computed shared packages");

    // symbols the app expects the loader to carry
    let app_elf = parse_symbols(&app.toolchain().symbol_table(&app_tmp).map_err(Error::Toolchain)?);
    let loader_elf = parse_symbols(&loader.toolchain().symbol_table(&loader_tmp).map_err(Error::Toolchain)?);
    let preserve = preserve_set(&app_elf, &loader_elf, &lib_syms, &common);

    // final loader with the preserved set pinned
    let loader_elf_path = loader.paths().elf(loader.build_name(), &loader_pkg);
    loader
        .link(&loader_elf_path, &loader.linker_scripts(false), preserve.clone(), None)
        .map_err(Error::Build)?;

    // ROM ELF donates the loader's symbols to the app link
    let rom_elf = loader.paths().rom_elf(&loader_pkg);
    loader
        .toolchain()
        .rom_elf(&loader_elf_path, &rom_elf, &preserve)
        .map_err(Error::Toolchain)?;

    // the shared packages now live in the loader image only
    app.exclude(&common);

    let app_elf_path = app.paths().elf(app.build_name(), &app_pkg);
    app.link(&app_elf_path, &app.linker_scripts(true), vec![], Some(rom_elf))
        .map_err(Error::Build)?;

    info!(
        num_common = common.len(),
        num_preserved = preserve.len(),
        "split images linked"
    );

    Ok(app_elf_path)
}

/// Every package that failed the sharing check, reported together
#[derive(Debug)]
pub struct MismatchSet(pub Vec<Mismatch>);

impl fmt::Display for MismatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, mismatch) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            mismatch.fmt(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("shared packages with differing symbols: {0}")]
    SharedSymbolMismatch(MismatchSet),

    #[error(transparent)]
    Build(crate::builder::Error),

    #[error(transparent)]
    Toolchain(crate::toolchain::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOADER_OBJDUMP: &str = "\
boot.a(boot.o):     file format elf32-littlearm

SYMBOL TABLE:
00000000 l    d  .text\t00000000 .text
00000000 l     F .text\t00000034 boot_go_internal
00000034 g     F .text\t00000060 boot_go
00000000 g     O .bss\t00000010 boot_state
00000008       O *COM*\t00000004 boot_scratch
";

    fn app_objdump(boot_go_size: &str) -> String {
        format!(
            "\
boot.a(boot.o):     file format elf32-littlearm

SYMBOL TABLE:
00000000 l    d  .text\t00000000 .text
00000000 l     F .text\t00000034 boot_go_internal
00000034 g     F .text\t{boot_go_size} boot_go
00000000 g     O .bss\t00000010 boot_state
00000008       O *COM*\t00000004 boot_scratch
"
        )
    }

    #[test]
    fn objdump_parsing() {
        let set = parse_symbols(LOADER_OBJDUMP);

        assert_eq!(set.len(), 4);

        let boot_go = set.get("boot_go").unwrap();
        assert_eq!(boot_go.section, ".text");
        assert_eq!(boot_go.size, 0x60);
        assert!(!boot_go.local);
        assert_eq!(boot_go.object_name, "boot.a(boot.o)");

        // a *COM* symbol's size comes from the address column
        let scratch = set.get("boot_scratch").unwrap();
        assert_eq!(scratch.size, 0x8);

        assert!(set.get("boot_go_internal").unwrap().local);
        // section bookkeeping rows are dropped
        assert!(!set.contains(".text"));
    }

    #[test]
    fn partition_matching_and_not() {
        let a = parse_symbols(&app_objdump("00000060"));
        let b = parse_symbols(LOADER_OBJDUMP);

        let (matching, non_matching) = partition(&a, &b);
        assert_eq!(matching.len(), 4);
        assert!(non_matching.is_empty());

        let differing = parse_symbols(&app_objdump("00000064"));
        let (matching, non_matching) = partition(&differing, &b);
        assert_eq!(matching.len(), 3);
        assert_eq!(non_matching.iter().collect::<Vec<_>>(), vec!["boot_go"]);
    }

    #[test]
    fn differing_global_symbol_fails_sharing() {
        let mut lib_syms = BTreeMap::new();
        lib_syms.insert(
            PkgName::new("core", "libs/l1"),
            (parse_symbols(&app_objdump("00000060")), parse_symbols(LOADER_OBJDUMP)),
        );
        lib_syms.insert(
            PkgName::new("core", "libs/l2"),
            (parse_symbols(&app_objdump("00000064")), parse_symbols(LOADER_OBJDUMP)),
        );

        let app_pkg = PkgName::new("local", "apps/main");
        let loader_pkg = PkgName::new("local", "apps/boot");

        let err = common_packages(&lib_syms, &app_pkg, &loader_pkg).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("libs/l2"), "{message}");
        assert!(message.contains("boot_go"), "{message}");
    }

    #[test]
    fn matching_packages_are_common() {
        let mut lib_syms = BTreeMap::new();
        for lib in ["libs/l1", "libs/l2"] {
            lib_syms.insert(
                PkgName::new("core", lib),
                (parse_symbols(&app_objdump("00000060")), parse_symbols(LOADER_OBJDUMP)),
            );
        }
        // image packages never count as common
        lib_syms.insert(
            PkgName::new("local", "apps/main"),
            (parse_symbols(&app_objdump("00000060")), parse_symbols(LOADER_OBJDUMP)),
        );

        let common = common_packages(
            &lib_syms,
            &PkgName::new("local", "apps/main"),
            &PkgName::new("local", "apps/boot"),
        )
        .unwrap();

        assert_eq!(
            common,
            vec![PkgName::new("core", "libs/l1"), PkgName::new("core", "libs/l2")]
        );
    }

    #[test]
    fn preserve_only_app_referenced_missing_from_loader() {
        let lib = parse_symbols(LOADER_OBJDUMP);
        let mut lib_syms = BTreeMap::new();
        let l1 = PkgName::new("core", "libs/l1");
        lib_syms.insert(l1.clone(), (lib.clone(), lib.clone()));

        // app ELF references boot_go and boot_state; loader already
        // carries boot_state
        let app_elf = parse_symbols(
            "\
00000034 g     F .text\t00000060 boot_go
00000000 g     O .bss\t00000010 boot_state
00001000 g     F .text\t00000020 main
",
        );
        let loader_elf = parse_symbols("00000000 g     O .bss\t00000010 boot_state\n");

        let preserve = preserve_set(&app_elf, &loader_elf, &lib_syms, &[l1]);
        assert_eq!(preserve, vec!["boot_go"]);
    }
}
