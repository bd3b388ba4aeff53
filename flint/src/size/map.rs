// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! GNU ld map file parsing.
//!
//! A small state machine walks the map: memory configuration first,
//! then the allocation listing. Garbage lines are skipped - a corrupt
//! map yields an incomplete report - but the skip count is surfaced so
//! the driver can warn once.

use std::collections::BTreeMap;

/// One `[offset, end_offset)` range named in the linker script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: String,
    pub offset: u64,
    /// Exclusive
    pub end_offset: u64,
    /// Output sections observed inside the region
    pub section_names: Vec<String>,
    /// Per-library accumulated bytes
    pub name_sizes: BTreeMap<String, u64>,
    pub total_size: u64,
}

impl MemoryRegion {
    pub fn part_of(&self, addr: u64) -> bool {
        addr >= self.offset && addr < self.end_offset
    }
}

/// One attributed symbol inside a package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolData {
    pub name: String,
    pub object_name: String,
    /// Region name → bytes
    pub sizes: BTreeMap<String, u64>,
}

/// One library archive's contribution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageSize {
    pub name: String,
    /// Region name → bytes
    pub sizes: BTreeMap<String, u64>,
    pub symbols: BTreeMap<String, SymbolData>,
}

/// Everything extracted from one map file
#[derive(Debug, Clone, Default)]
pub struct MapParse {
    pub regions: Vec<MemoryRegion>,
    pub packages: BTreeMap<String, PackageSize>,
    /// Allocation-shaped lines whose numbers would not parse
    pub skipped_lines: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scan for `Memory Configuration`
    SeekMemory,
    /// Scan for the `Origin` header
    SeekOrigin,
    /// Read region triples until `*default*`
    Regions,
    /// Scan for `Linker script and memory map`
    SeekAllocations,
    /// Parse allocation lines until `/DISCARD/` or `OUTPUT(`
    Allocations,
    Done,
}

/// Marker ending the region table
const DEFAULT_REGION: &str = "*default*";
/// Padding marker inside the allocation listing
const FILL: &str = "*fill*";

pub fn parse(text: &str) -> MapParse {
    let mut out = MapParse::default();
    let mut state = State::SeekMemory;

    // section name carried over from a name-only line, and the library
    // that padding gets attributed to
    let mut pending_section: Option<String> = None;
    let mut last_library: Option<String> = None;

    for line in text.lines() {
        match state {
            State::SeekMemory => {
                if line.contains("Memory Configuration") {
                    state = State::SeekOrigin;
                }
            }
            State::SeekOrigin => {
                if line.contains("Origin") {
                    state = State::Regions;
                }
            }
            State::Regions => {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.first() == Some(&DEFAULT_REGION) {
                    state = State::SeekAllocations;
                    continue;
                }
                if fields.len() < 3 {
                    continue;
                }
                let (Some(origin), Some(length)) = (parse_hex(fields[1]), parse_hex(fields[2])) else {
                    out.skipped_lines += 1;
                    continue;
                };
                out.regions.push(MemoryRegion {
                    name: fields[0].to_owned(),
                    offset: origin,
                    end_offset: origin + length,
                    section_names: vec![],
                    name_sizes: BTreeMap::new(),
                    total_size: 0,
                });
            }
            State::SeekAllocations => {
                if line.contains("Linker script and memory map") {
                    state = State::Allocations;
                }
            }
            State::Allocations => {
                if line.contains("/DISCARD/") || line.trim_start().starts_with("OUTPUT(") {
                    state = State::Done;
                    continue;
                }
                parse_allocation(line, &mut out, &mut pending_section, &mut last_library);
            }
            State::Done => break,
        }
    }

    out
}

fn parse_allocation(
    line: &str,
    out: &mut MapParse,
    pending_section: &mut Option<String>,
    last_library: &mut Option<String>,
) {
    let fields: Vec<&str> = line.split_whitespace().collect();

    match fields.as_slice() {
        // a long section name pushes the rest to the next line
        [name] => {
            if looks_like_section(name) {
                *pending_section = Some((*name).to_owned());
            }
        }
        [first, addr, size] if *first == FILL => {
            let (Some(addr), Some(size)) = (parse_hex(addr), parse_hex(size)) else {
                out.skipped_lines += 1;
                return;
            };
            if size == 0 {
                return;
            }
            // anonymous padding, charged to the previous library
            let library = last_library.clone().unwrap_or_else(|| "*fill*".to_owned());
            record(out, FILL, addr, size, &library, FILL);
        }
        [addr, size, file] if parse_hex(addr).is_some() => {
            let Some(size) = parse_hex(size) else {
                out.skipped_lines += 1;
                return;
            };
            let Some(section) = pending_section.take() else {
                return;
            };
            let addr = parse_hex(addr).unwrap_or_default();
            if size == 0 {
                return;
            }
            let (library, object) = split_file(file);
            *last_library = Some(library.clone());
            record(out, &section, addr, size, &library, &object);
        }
        [section, addr, size, file] if looks_like_section(section) => {
            let (Some(addr), Some(size)) = (parse_hex(addr), parse_hex(size)) else {
                out.skipped_lines += 1;
                return;
            };
            if size == 0 {
                return;
            }
            let (library, object) = split_file(file);
            *last_library = Some(library.clone());
            record(out, section, addr, size, &library, &object);
        }
        // (address, name) and (size, padding) pairs carry nothing we need
        _ => {}
    }
}

fn record(out: &mut MapParse, section: &str, addr: u64, size: u64, library: &str, object: &str) {
    let section = normalize_section(section);
    let symbol = symbol_name(&section);

    let Some(region) = out.regions.iter_mut().find(|r| r.part_of(addr)) else {
        return;
    };

    region.total_size += size;
    *region.name_sizes.entry(library.to_owned()).or_default() += size;
    if !region.section_names.contains(&section) {
        region.section_names.push(section.clone());
    }
    let region_name = region.name.clone();

    let package = out.packages.entry(library.to_owned()).or_insert_with(|| PackageSize {
        name: library.to_owned(),
        ..PackageSize::default()
    });
    *package.sizes.entry(region_name.clone()).or_default() += size;

    let data = package.symbols.entry(symbol.clone()).or_insert_with(|| SymbolData {
        name: symbol,
        object_name: object.to_owned(),
        sizes: BTreeMap::new(),
    });
    *data.sizes.entry(region_name).or_default() += size;
}

fn looks_like_section(token: &str) -> bool {
    token.starts_with('.') || token == "COMMON" || token == FILL
}

/// `.rodata.str1.4` and friends all act as `.rodata.str1`
fn normalize_section(section: &str) -> String {
    if let Some(rest) = section.strip_prefix(".rodata.str1") {
        if rest.is_empty() || rest.starts_with('.') {
            return ".rodata.str1".to_owned();
        }
    }
    section.to_owned()
}

/// The most specific trailing identifier of an output section name
fn symbol_name(section: &str) -> String {
    section.rsplit('.').next().filter(|s| !s.is_empty()).unwrap_or(section).to_owned()
}

/// `path/libX.a(obj.o)` → (`libX.a`, `obj.o`)
fn split_file(file: &str) -> (String, String) {
    let base = file.rsplit('/').next().unwrap_or(file);

    match base.split_once('(') {
        Some((lib, obj)) => (lib.to_owned(), obj.trim_end_matches(')').to_owned()),
        None => (base.to_owned(), base.to_owned()),
    }
}

fn parse_hex(token: &str) -> Option<u64> {
    let digits = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = "\
Memory Configuration

Name             Origin             Length             Attributes
FLASH            0x0000000008000000 0x0000000000010000 xr
RAM              0x0000000020000000 0x0000000000008000 xrw
*default*        0x0000000000000000 0xffffffffffffffff

Linker script and memory map

LOAD /tools/gcc/lib/crt0.o
 .text           0x0000000008000000      0x4d4
 .text.main     0x0000000008000000       0x64 /proj/bin/libfoo.a(obj.o)
 .text.os_init
                0x0000000008000064      0x100 /proj/bin/libos.a(os.o)
 *fill*         0x0000000008000164        0x4
 .rodata.str1.4
                0x0000000008000168       0x10 /proj/bin/libfoo.a(obj.o)
 .bss.g_task    0x0000000020000000       0x40 /proj/bin/libos.a(os.o)
 COMMON         0x0000000020000040       0x10 /proj/bin/libos.a(os.o)
 .debug_info    0x0000000000000000      0x123 /proj/bin/libfoo.a(obj.o)
/DISCARD/
 .note          0x0000000000000000        0x0 ignored.o
";

    #[test]
    fn regions_parsed_and_disjoint() {
        let parsed = parse(MAP);

        assert_eq!(parsed.regions.len(), 2);
        let flash = &parsed.regions[0];
        assert_eq!(flash.name, "FLASH");
        assert_eq!(flash.offset, 0x0800_0000);
        assert_eq!(flash.end_offset, 0x0801_0000);

        // pairwise disjoint
        for (i, a) in parsed.regions.iter().enumerate() {
            for b in parsed.regions.iter().skip(i + 1) {
                assert!(a.end_offset <= b.offset || b.end_offset <= a.offset);
            }
        }
    }

    #[test]
    fn minimal_attribution() {
        let parsed = parse("\
Memory Configuration

Name             Origin             Length             Attributes
FLASH            0x0000000008000000 0x0000000000010000 xr
*default*        0x0000000000000000 0xffffffffffffffff

Linker script and memory map

 .text          0x0000000008000000      0x100 libfoo.a(obj.o)
OUTPUT(app.elf elf32-littlearm)
");

        assert_eq!(parsed.regions.len(), 1);
        let foo = parsed.packages.get("libfoo.a").unwrap();
        assert_eq!(foo.sizes.get("FLASH"), Some(&0x100));
    }

    #[test]
    fn allocation_attribution() {
        let parsed = parse(MAP);

        let foo = parsed.packages.get("libfoo.a").unwrap();
        // 0x64 .text.main + 0x10 .rodata.str1.4
        assert_eq!(foo.sizes.get("FLASH"), Some(&0x74));
        assert!(foo.sizes.get("RAM").is_none());

        let os = parsed.packages.get("libos.a").unwrap();
        // 0x100 .text.os_init + 0x4 trailing fill
        assert_eq!(os.sizes.get("FLASH"), Some(&0x104));
        // 0x40 .bss + 0x10 COMMON
        assert_eq!(os.sizes.get("RAM"), Some(&0x50));

        // continuation lines resolve their section from the previous line
        assert!(os.symbols.contains_key("os_init"));
        // fill charged to the previous library as anonymous padding
        assert!(os.symbols.contains_key("*fill*"));
    }

    #[test]
    fn size_conservation_per_region() {
        let parsed = parse(MAP);

        for region in &parsed.regions {
            let from_packages: u64 = parsed
                .packages
                .values()
                .filter_map(|p| p.sizes.get(&region.name))
                .sum();
            assert_eq!(from_packages, region.total_size, "region {}", region.name);
        }
    }

    #[test]
    fn normalization_and_symbol_names() {
        assert_eq!(normalize_section(".rodata.str1.4"), ".rodata.str1");
        assert_eq!(normalize_section(".rodata.str1"), ".rodata.str1");
        assert_eq!(normalize_section(".text.main"), ".text.main");

        assert_eq!(symbol_name(".text.main"), "main");
        assert_eq!(symbol_name("COMMON"), "COMMON");
    }

    #[test]
    fn garbage_is_skipped_but_counted() {
        let parsed = parse("\
Memory Configuration

Name             Origin             Length             Attributes
FLASH            0xZZZZ 0x100
RAM              0x0000000020000000 0x0000000000008000 xrw
*default*        0x0000000000000000 0xffffffffffffffff

Linker script and memory map

 .bss.x         0x0000000020000000      0xnope libfoo.a(obj.o)
 .bss.y         0x0000000020000000       0x10 libfoo.a(obj.o)
");

        assert_eq!(parsed.skipped_lines, 2);
        assert_eq!(parsed.regions.len(), 1);
        assert_eq!(parsed.packages.get("libfoo.a").unwrap().sizes.get("RAM"), Some(&0x10));
    }

    #[test]
    fn debug_sections_outside_regions_are_dropped() {
        let parsed = parse(MAP);
        assert!(
            parsed
                .packages
                .values()
                .all(|p| p.symbols.values().all(|s| !s.name.contains("debug")))
        );
    }
}
