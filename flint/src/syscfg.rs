// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Target-scoped system configuration.
//!
//! Settings are a flat key → value map seeded from the target manifest.
//! A *feature* is a setting holding a truthy value, or an identifier a
//! package declared during resolution. The resolver is the only writer;
//! once resolution completes the map is frozen by shared reference.

use std::collections::BTreeMap;

use pkg_manifest::{FeatureSet, is_truthy};

use crate::package::{Package, PackageType};

/// Identifiers granted to unit-test packages on top of the global set
const UNITTEST_FEATURES: &[&str] = &["TEST", "SELFTEST"];

#[derive(Debug, Clone, Default)]
pub struct Syscfg {
    settings: BTreeMap<String, String>,
    identities: FeatureSet,
}

impl Syscfg {
    pub fn new(seed: BTreeMap<String, String>) -> Self {
        Self {
            settings: seed,
            identities: FeatureSet::new(),
        }
    }

    /// Idempotent insert of a configuration identifier. Returns true
    /// when the identifier was new.
    pub fn add_identity(&mut self, identity: impl Into<String>) -> bool {
        self.identities.add(identity)
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn is_true(&self, key: &str) -> bool {
        self.setting(key).is_some_and(is_truthy)
    }

    /// The global feature view: declared identities plus every truthy
    /// setting
    pub fn features(&self) -> FeatureSet {
        self.identities
            .with(self.settings.iter().filter(|(_, v)| is_truthy(v)).map(|(k, _)| k.clone()))
    }

    /// The feature view one package's manifest is evaluated under
    pub fn features_for(&self, package: &Package) -> FeatureSet {
        let features = self.features();

        match package.kind {
            PackageType::Unittest => features.with(UNITTEST_FEATURES.iter().copied()),
            _ => features,
        }
    }

    /// Snapshot used to materialize script environments
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.settings.clone()
    }

    /// Encode one injected setting as a compiler define
    pub fn define(key: &str, value: &str) -> String {
        if value.is_empty() {
            format!("-D{key}")
        } else {
            format!("-D{key}={value}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PkgName;
    use pkg_manifest::Manifest;
    use std::path::PathBuf;

    fn unittest_pkg() -> Package {
        Package {
            name: PkgName::new("core", "sys/log/test"),
            kind: PackageType::Unittest,
            base: PathBuf::from("/p"),
            manifest: Manifest::default(),
            linked_name: None,
        }
    }

    #[test]
    fn truthy_settings_are_features() {
        let syscfg = Syscfg::new(
            [
                ("BLE_HOST".to_owned(), "1".to_owned()),
                ("LOG_LEVEL".to_owned(), "2".to_owned()),
            ]
            .into(),
        );

        let features = syscfg.features();
        assert!(features.contains("BLE_HOST"));
        assert!(!features.contains("LOG_LEVEL"));
    }

    #[test]
    fn identities_accumulate_idempotently() {
        let mut syscfg = Syscfg::default();
        assert!(syscfg.add_identity("SPLIT_APPLICATION"));
        assert!(!syscfg.add_identity("SPLIT_APPLICATION"));
        assert!(syscfg.features().contains("SPLIT_APPLICATION"));
    }

    #[test]
    fn unittest_packages_see_test_features() {
        let syscfg = Syscfg::default();
        let features = syscfg.features_for(&unittest_pkg());

        assert!(features.contains("TEST"));
        assert!(features.contains("SELFTEST"));
        assert!(syscfg.features().is_empty());
    }

    #[test]
    fn define_encoding() {
        assert_eq!(Syscfg::define("APP_blinky", ""), "-DAPP_blinky");
        assert_eq!(Syscfg::define("LOG_LEVEL", "2"), "-DLOG_LEVEL=2");
    }
}
