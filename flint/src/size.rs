// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Size reporting from the linker map and the binutils inspectors.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;
use tracing::warn;

use crate::toolchain::Toolchain;

pub use self::map::{MapParse, MemoryRegion, PackageSize, SymbolData};
pub use self::report::{RenderMode, SizeTree};

pub mod map;
pub mod report;

/// Parse the `.map` file the linker wrote beside `elf`
pub fn load_map(elf: &Path) -> Result<MapParse, Error> {
    let path = PathBuf::from(format!("{}.map", elf.display()));
    let text = fs::read_to_string(&path).map_err(|source| Error::Io { path, source })?;

    let parsed = map::parse(&text);
    if parsed.skipped_lines > 0 {
        // deliberate skip-and-continue, but never silently
        warn!(
            num_lines = parsed.skipped_lines,
            "map file contained unparsable lines, report may be incomplete"
        );
    }

    Ok(parsed)
}

/// Per-region, per-package size table
pub fn package_summary(parsed: &MapParse) -> String {
    let mut out = String::new();

    for region in &parsed.regions {
        if region.total_size == 0 {
            continue;
        }

        let _ = writeln!(out, "{} ({} bytes):", region.name, region.total_size);
        for (library, size) in &region.name_sizes {
            let _ = writeln!(out, "  {size:>8} {library}");
        }
    }

    out
}

/// Render the path → file → symbol tree for one memory region of the
/// linked image
pub fn section_report(
    toolchain: &Toolchain,
    elf: &Path,
    project_root: &Path,
    section: &str,
    mode: RenderMode,
) -> Result<String, Error> {
    let parsed = load_map(elf)?;

    let region = parsed
        .regions
        .iter()
        .find(|r| r.name == section)
        .ok_or_else(|| Error::NoSuchRegion {
            section: section.to_owned(),
        })?;

    let headers = toolchain.section_headers(elf).map_err(Error::Toolchain)?;
    let in_region: Vec<_> = report::parse_sections(&headers)
        .into_iter()
        .filter(|s| region.part_of(s.vma))
        .collect();

    let listing = toolchain.symbol_sources(elf).map_err(Error::Toolchain)?;
    let symbols = report::parse_symbol_sources(&listing);

    let prefix = project_root.display().to_string();
    let tree = SizeTree::build(region, &symbols, &prefix, |addr| {
        let located = toolchain.addr_to_line(elf, addr).ok()?;
        let located = located.trim();
        if located.is_empty() || located.starts_with('?') {
            return None;
        }
        Some(located.rsplit_once(':').map(|(f, _)| f.to_owned()).unwrap_or_else(|| located.to_owned()))
    });

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} sections: {}",
        region.name,
        in_region.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(" ")
    );
    out.push_str(&tree.render(region, mode));

    Ok(out)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no memory region named {section}")]
    NoSuchRegion { section: String },

    #[error(transparent)]
    Toolchain(crate::toolchain::Error),

    #[error("i/o on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
