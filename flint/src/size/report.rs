// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Section-scoped size trees.
//!
//! Sections come from `objdump -hw`, symbols and their source files
//! from `nm -S -l` with an addr2line fallback, and everything is
//! arranged as a path → file → symbol tree summed bottom-up.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::map::MemoryRegion;

/// One output section of the linked ELF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub size: u64,
    pub vma: u64,
}

/// Parse `objdump -hw` section headers. Sizes and addresses carry no
/// `0x` prefix there.
pub fn parse_sections(text: &str) -> Vec<Section> {
    let mut out = vec![];

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0].parse::<usize>().is_err() {
            continue;
        }

        let (Ok(size), Ok(vma)) = (u64::from_str_radix(fields[2], 16), u64::from_str_radix(fields[3], 16)) else {
            continue;
        };

        out.push(Section {
            name: fields[1].to_owned(),
            size,
            vma,
        });
    }

    out
}

/// One symbol with its size and (maybe) its defining source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSource {
    pub addr: u64,
    pub size: u64,
    pub name: String,
    pub file: Option<String>,
}

/// Parse `nm -S -l` output: `addr size type name\tfile:line`.
/// Entries without a size column are skipped - nothing to attribute.
pub fn parse_symbol_sources(text: &str) -> Vec<SymbolSource> {
    let mut out = vec![];

    for line in text.lines() {
        let (head, location) = match line.split_once('\t') {
            Some((head, location)) => (head, Some(location)),
            None => (line, None),
        };

        let fields: Vec<&str> = head.split_whitespace().collect();
        let [addr, size, _kind, name] = fields.as_slice() else {
            continue;
        };

        let (Ok(addr), Ok(size)) = (u64::from_str_radix(addr, 16), u64::from_str_radix(size, 16)) else {
            continue;
        };

        let file = location
            .map(|l| l.rsplit_once(':').map(|(f, _line)| f).unwrap_or(l))
            .map(str::to_owned);

        out.push(SymbolSource {
            addr,
            size,
            name: (*name).to_owned(),
            file,
        });
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Three columns: path, size, percent of the region
    Default,
    /// No percents, container lines without sizes
    Diffable,
}

#[derive(Debug, Default)]
struct Node {
    size: u64,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn insert(&mut self, components: &[&str], size: u64) {
        self.size += size;

        if let Some((first, rest)) = components.split_first() {
            self.children.entry((*first).to_owned()).or_default().insert(rest, size);
        }
    }
}

/// The path → file → symbol size tree for one memory region
#[derive(Debug, Default)]
pub struct SizeTree {
    root: Node,
}

impl SizeTree {
    /// Arrange `symbols` under `region`, stripping `prefix` from
    /// source paths. `resolve` supplies a file for symbols nm could
    /// not locate (addr2line fallback).
    pub fn build(
        region: &MemoryRegion,
        symbols: &[SymbolSource],
        prefix: &str,
        mut resolve: impl FnMut(u64) -> Option<String>,
    ) -> Self {
        let mut tree = Self::default();

        for symbol in symbols {
            if !region.part_of(symbol.addr) || symbol.size == 0 {
                continue;
            }

            let file = symbol
                .file
                .clone()
                .or_else(|| resolve(symbol.addr))
                .unwrap_or_else(|| "(unknown)".to_owned());
            let file = file.strip_prefix(prefix).unwrap_or(&file).trim_start_matches('/');

            let mut components: Vec<&str> = file.split('/').filter(|c| !c.is_empty()).collect();
            components.push(&symbol.name);

            tree.root.insert(&components, symbol.size);
        }

        tree
    }

    pub fn total(&self) -> u64 {
        self.root.size
    }

    /// Render the tree, the root total pinned to the region's size
    pub fn render(&self, region: &MemoryRegion, mode: RenderMode) -> String {
        let mut out = String::new();
        let total = region.total_size.max(1);

        match mode {
            RenderMode::Default => {
                let _ = writeln!(out, "{} {} 100.00%", region.name, region.total_size);
            }
            RenderMode::Diffable => {
                let _ = writeln!(out, "{}", region.name);
            }
        }

        render_children(&self.root, &mut out, 1, total, mode);
        out
    }
}

fn render_children(node: &Node, out: &mut String, depth: usize, total: u64, mode: RenderMode) {
    for (name, child) in &node.children {
        let indent = "  ".repeat(depth);
        let is_container = !child.children.is_empty();

        match mode {
            RenderMode::Default => {
                let percent = child.size as f64 * 100.0 / total as f64;
                let _ = writeln!(out, "{indent}{name} {} {percent:.2}%", child.size);
            }
            RenderMode::Diffable => {
                if is_container {
                    let _ = writeln!(out, "{indent}{name}");
                } else {
                    let _ = writeln!(out, "{indent}{name} {}", child.size);
                }
            }
        }

        render_children(child, out, depth + 1, total, mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> MemoryRegion {
        MemoryRegion {
            name: "FLASH".to_owned(),
            offset: 0x0800_0000,
            end_offset: 0x0801_0000,
            section_names: vec![],
            name_sizes: BTreeMap::new(),
            total_size: 0x80,
        }
    }

    const OBJDUMP_HW: &str = "\
app.elf:     file format elf32-littlearm

Sections:
Idx Name          Size      VMA       LMA       File off  Algn  Flags
  0 .text         000004d4  08000000  08000000  00010000  2**2  CONTENTS, ALLOC, LOAD, READONLY, CODE
  1 .bss          00000050  20000000  20000000  00020000  2**2  ALLOC
";

    const NM_SL: &str = "\
08000100 00000020 T main\t/proj/apps/blinky/src/main.c:12
08000120 00000060 T os_start\t/proj/sys/os/src/start.c:90
20000000 00000040 B g_task\t/proj/sys/os/src/task.c:44
08000300 00000010 t helper
0800dead U external_ref
";

    #[test]
    fn sections_parsed() {
        let sections = parse_sections(OBJDUMP_HW);

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, ".text");
        assert_eq!(sections[0].size, 0x4d4);
        assert_eq!(sections[1].vma, 0x2000_0000);
    }

    #[test]
    fn symbol_sources_parsed() {
        let symbols = parse_symbol_sources(NM_SL);

        // the U line has no size column and is skipped
        assert_eq!(symbols.len(), 4);
        assert_eq!(symbols[0].name, "main");
        assert_eq!(symbols[0].file.as_deref(), Some("/proj/apps/blinky/src/main.c"));
        assert_eq!(symbols[3].file, None);
    }

    #[test]
    fn tree_sums_bottom_up() {
        let symbols = parse_symbol_sources(NM_SL);
        let tree = SizeTree::build(&region(), &symbols, "/proj", |_| Some("/proj/sys/os/src/fallback.c".to_owned()));

        // g_task is outside FLASH; main 0x20 + os_start 0x60 + helper 0x10
        assert_eq!(tree.total(), 0x90);

        let rendered = tree.render(&region(), RenderMode::Default);
        assert!(rendered.contains("apps"), "{rendered}");
        assert!(rendered.contains("main.c"), "{rendered}");
        // addr2line fallback located helper
        assert!(rendered.contains("fallback.c"), "{rendered}");
        assert!(rendered.contains('%'), "{rendered}");
    }

    #[test]
    fn diffable_render_hides_container_sizes() {
        let symbols = parse_symbol_sources(NM_SL);
        let tree = SizeTree::build(&region(), &symbols, "/proj", |_| None);

        let rendered = tree.render(&region(), RenderMode::Diffable);
        assert!(!rendered.contains('%'), "{rendered}");

        for line in rendered.lines() {
            let trimmed = line.trim_start();
            // container rows (dirs and files) carry no numbers
            if trimmed.starts_with("apps") || trimmed.starts_with("src") {
                assert_eq!(trimmed.split_whitespace().count(), 1, "{line}");
            }
        }
    }
}
