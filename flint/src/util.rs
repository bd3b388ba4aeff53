// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    thread,
};

use fs_err as fs;

pub fn ensure_dir_exists(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn recreate_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// Recursively enumerate files below `dir` matching `matcher`, sorted
pub fn enumerate_files<'a>(dir: &'a Path, matcher: impl Fn(&Path) -> bool + Copy + 'a) -> io::Result<Vec<PathBuf>> {
    let read_dir = fs::read_dir(dir)?;

    let mut paths = vec![];

    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            paths.extend(enumerate_files(&path, matcher)?);
        } else if meta.is_file() && matcher(&path) {
            paths.push(path);
        }
    }

    paths.sort();

    Ok(paths)
}

pub fn list_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let read_dir = fs::read_dir(dir)?;

    let mut paths = vec![];

    for entry in read_dir.flatten() {
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            paths.push(path);
        }
    }

    paths.sort();

    Ok(paths)
}

/// Compare two directory trees by file names and contents
pub fn dirs_differ(a: &Path, b: &Path) -> io::Result<bool> {
    let all = |dir: &Path| -> io::Result<Vec<PathBuf>> {
        if dir.exists() {
            enumerate_files(dir, |_| true)
        } else {
            Ok(vec![])
        }
    };

    let files_a = all(a)?;
    let files_b = all(b)?;

    let rel = |files: &[PathBuf], root: &Path| -> Vec<PathBuf> {
        files
            .iter()
            .filter_map(|f| f.strip_prefix(root).ok().map(Path::to_path_buf))
            .collect()
    };

    if rel(&files_a, a) != rel(&files_b, b) {
        return Ok(true);
    }

    for file_a in &files_a {
        let relative = file_a.strip_prefix(a).unwrap_or(file_a);
        if fs::read(file_a)? != fs::read(b.join(relative))? {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Replace every non-alphanumeric character with `_`, the form used
/// for identity defines and environment keys
pub fn sanitize_ident(s: &str) -> String {
    s.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect()
}

pub fn num_cpus() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or_else(|_| NonZeroUsize::new(1).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_identifiers() {
        assert_eq!(sanitize_ident("hw/bsp/nrf52dk"), "hw_bsp_nrf52dk");
        assert_eq!(sanitize_ident("blinky"), "blinky");
    }

    #[test]
    fn dir_diffing() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        fs::write(a.path().join("gen.c"), b"int x;").unwrap();
        fs::write(b.path().join("gen.c"), b"int x;").unwrap();
        assert!(!dirs_differ(a.path(), b.path()).unwrap());

        fs::write(b.path().join("gen.c"), b"int y;").unwrap();
        assert!(dirs_differ(a.path(), b.path()).unwrap());

        fs::write(a.path().join("extra.h"), b"").unwrap();
        assert!(dirs_differ(a.path(), b.path()).unwrap());
    }
}
