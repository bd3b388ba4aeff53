// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Declarative package manifests.
//!
//! A manifest is a flat mapping of dotted keys to YAML values. Any key
//! may carry gated variants: `pkg.deps.BLE_HOST` contributes to
//! `pkg.deps` only while the `BLE_HOST` feature is enabled. Evaluation
//! is a pure function of (tree, feature set) and is order-independent -
//! gated entries merge after the base value, in sorted key order.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use thiserror::Error;

pub use self::target::TargetSpec;

pub mod target;

/// Ordered set of enabled configuration identifiers.
///
/// Identifiers are only ever added, never removed, while a resolution
/// is in progress.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeatureSet(BTreeSet<String>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert. Returns true if the identifier was new.
    pub fn add(&mut self, identity: impl Into<String>) -> bool {
        self.0.insert(identity.into())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.0.contains(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'_ str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union of this set with additional package-local identifiers
    pub fn with(&self, extra: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut out = self.clone();
        for identity in extra {
            out.add(identity);
        }
        out
    }
}

impl<S: Into<String>> FromIterator<S> for FeatureSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A gate over one manifest entry: a feature identifier, optionally negated
#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    Feature(String),
    Not(String),
}

impl Predicate {
    fn parse(suffix: &str) -> Self {
        match suffix.strip_prefix('!') {
            Some(ident) => Predicate::Not(ident.to_owned()),
            None => Predicate::Feature(suffix.to_owned()),
        }
    }

    fn eval(&self, features: &FeatureSet) -> bool {
        match self {
            Predicate::Feature(ident) => features.contains(ident),
            Predicate::Not(ident) => !features.contains(ident),
        }
    }
}

/// One package's decoded manifest
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: BTreeMap<String, Value>,
}

pub fn from_str(s: &str) -> Result<Manifest, Error> {
    let mapping: Mapping = serde_yaml::from_str(s)?;
    Manifest::from_mapping(mapping)
}

pub fn from_slice(bytes: &[u8]) -> Result<Manifest, Error> {
    let mapping: Mapping = serde_yaml::from_slice(bytes)?;
    Manifest::from_mapping(mapping)
}

pub fn load(path: &Path) -> Result<Manifest, Error> {
    let bytes = fs_err::read(path).map_err(|source| Error::Read {
        path: path.to_owned(),
        source,
    })?;
    from_slice(&bytes)
}

impl Manifest {
    fn from_mapping(mapping: Mapping) -> Result<Self, Error> {
        let mut entries = BTreeMap::new();

        for (key, value) in mapping {
            let Value::String(key) = key else {
                return Err(Error::NonStringKey(format!("{key:?}")));
            };
            entries.insert(key, value);
        }

        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Overlay `other` on this manifest, its entries winning on clash.
    /// Target packages carry their `target.*` keys in a sibling file.
    pub fn merge(mut self, other: Manifest) -> Self {
        self.entries.extend(other.entries);
        self
    }

    /// The base entry plus every gated variant whose predicate holds,
    /// in sorted key order
    fn active_entries<'a>(&'a self, key: &str, features: &FeatureSet) -> Vec<&'a Value> {
        let mut out = vec![];

        if let Some(base) = self.entries.get(key) {
            out.push(base);
        }

        let prefix = format!("{key}.");
        for (entry_key, value) in self.entries.range(prefix.clone()..) {
            let Some(suffix) = entry_key.strip_prefix(&prefix) else {
                break;
            };
            // a dotted suffix is a deeper key, not a gate
            if suffix.contains('.') {
                continue;
            }
            if Predicate::parse(suffix).eval(features) {
                out.push(value);
            }
        }

        out
    }

    /// Query `key` as a single string.
    ///
    /// Unknown keys yield the empty string. When gated variants apply,
    /// the last active entry wins.
    pub fn get_string(&self, key: &str, features: &FeatureSet) -> Result<String, Error> {
        let mut out = String::new();

        for value in self.active_entries(key, features) {
            match scalar_to_string(value) {
                Some(s) => out = s,
                None => {
                    return Err(Error::WrongType {
                        key: key.to_owned(),
                        expected: "string",
                    });
                }
            }
        }

        Ok(out)
    }

    /// Query `key` as a list of strings.
    ///
    /// Unknown keys yield the empty list. A bare scalar reads as a
    /// one-element list. Active gated entries append after the base.
    pub fn get_string_list(&self, key: &str, features: &FeatureSet) -> Result<Vec<String>, Error> {
        let mut out = vec![];

        for value in self.active_entries(key, features) {
            match value {
                Value::Sequence(seq) => {
                    for item in seq {
                        match scalar_to_string(item) {
                            Some(s) => out.push(s),
                            None => {
                                return Err(Error::WrongType {
                                    key: key.to_owned(),
                                    expected: "list of strings",
                                });
                            }
                        }
                    }
                }
                Value::Null => {}
                other => match scalar_to_string(other) {
                    Some(s) => out.push(s),
                    None => {
                        return Err(Error::WrongType {
                            key: key.to_owned(),
                            expected: "list of strings",
                        });
                    }
                },
            }
        }

        Ok(out)
    }

    /// First key in `keys` holding any entries wins. Used for legacy
    /// alias fallback (`pkg.req_caps` / `pkg.req_apis`).
    pub fn first_string_list(&self, keys: &[&str], features: &FeatureSet) -> Result<Vec<String>, Error> {
        for key in keys {
            let list = self.get_string_list(key, features)?;
            if !list.is_empty() {
                return Ok(list);
            }
        }
        Ok(vec![])
    }

    /// Query `key` as a string → string map.
    ///
    /// Unknown keys yield the empty map. Active gated entries merge
    /// over the base, later entries overriding earlier ones.
    pub fn get_string_map(&self, key: &str, features: &FeatureSet) -> Result<BTreeMap<String, String>, Error> {
        let mut out = BTreeMap::new();

        for value in self.active_entries(key, features) {
            match value {
                Value::Mapping(mapping) => {
                    for (k, v) in mapping {
                        let (Some(k), Some(v)) = (scalar_to_string(k), scalar_to_string(v)) else {
                            return Err(Error::WrongType {
                                key: key.to_owned(),
                                expected: "map of strings",
                            });
                        };
                        out.insert(k, v);
                    }
                }
                Value::Null => {}
                _ => {
                    return Err(Error::WrongType {
                        key: key.to_owned(),
                        expected: "map of strings",
                    });
                }
            }
        }

        Ok(out)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Accepted spellings of a true setting value
pub fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "yes" | "true")
}

/// Parse a numeric manifest value, accepting `0x`-hex or decimal
pub fn parse_number(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("non-string manifest key: {0}")]
    NonStringKey(String),

    #[error("key {key} holds the wrong type, expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("decode manifest")]
    Yaml(#[from] serde_yaml::Error),

    #[error("read manifest {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
pkg.name: sys/log
pkg.type: lib
pkg.deps:
    - kernel/os
    - util/cbmem
pkg.deps.LOG_FCB:
    - fs/fcb
"pkg.deps.!LOG_FCB":
    - fs/null
pkg.cflags: -DLOG_VERSION=3
compiler.path:
    cc: "@arm/bin/gcc"
    ar: "@arm/bin/ar"
compiler.path.WINDOWS:
    cc: "@arm/bin/gcc.exe"
"#;

    #[test]
    fn unknown_key_is_empty() {
        let manifest = from_str(MANIFEST).unwrap();
        let features = FeatureSet::new();

        assert_eq!(manifest.get_string("pkg.homepage", &features).unwrap(), "");
        assert!(manifest.get_string_list("pkg.caps", &features).unwrap().is_empty());
        assert!(manifest.get_string_map("pkg.env", &features).unwrap().is_empty());
    }

    #[test]
    fn gated_list_entries() {
        let manifest = from_str(MANIFEST).unwrap();

        let off = FeatureSet::new();
        assert_eq!(
            manifest.get_string_list("pkg.deps", &off).unwrap(),
            vec!["kernel/os", "util/cbmem", "fs/null"]
        );

        let on: FeatureSet = ["LOG_FCB"].into_iter().collect();
        assert_eq!(
            manifest.get_string_list("pkg.deps", &on).unwrap(),
            vec!["kernel/os", "util/cbmem", "fs/fcb"]
        );
    }

    #[test]
    fn scalar_reads_as_single_item_list() {
        let manifest = from_str(MANIFEST).unwrap();
        let features = FeatureSet::new();

        assert_eq!(
            manifest.get_string_list("pkg.cflags", &features).unwrap(),
            vec!["-DLOG_VERSION=3"]
        );
    }

    #[test]
    fn gated_map_merge() {
        let manifest = from_str(MANIFEST).unwrap();

        let windows: FeatureSet = ["WINDOWS"].into_iter().collect();
        let map = manifest.get_string_map("compiler.path", &windows).unwrap();
        assert_eq!(map.get("cc").unwrap(), "@arm/bin/gcc.exe");
        assert_eq!(map.get("ar").unwrap(), "@arm/bin/ar");
    }

    #[test]
    fn wrong_shape_is_an_error() {
        let manifest = from_str(MANIFEST).unwrap();
        let features = FeatureSet::new();

        assert!(manifest.get_string("pkg.deps", &features).is_err());
        assert!(manifest.get_string_list("compiler.path", &features).is_err());
    }

    #[test]
    fn alias_fallback() {
        let manifest = from_str("pkg.req_apis: [console]").unwrap();
        let features = FeatureSet::new();

        assert_eq!(
            manifest
                .first_string_list(&["pkg.req_caps", "pkg.req_apis"], &features)
                .unwrap(),
            vec!["console"]
        );
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy("1"));
        assert!(is_truthy("Yes"));
        assert!(is_truthy("TRUE"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("on"));
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("0x20"), Some(0x20));
        assert_eq!(parse_number("32"), Some(32));
        assert_eq!(parse_number("zero"), None);
    }
}
