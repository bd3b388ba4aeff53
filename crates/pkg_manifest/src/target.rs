// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The target manifest - the one mandatory file anchoring a build.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{FeatureSet, Manifest, parse_number};

/// Default image header reservation, bytes
pub const DEFAULT_HEADER_SIZE: u32 = 0x20;

/// Decoded `target.*` keys plus the seed configuration values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub bsp: String,
    pub app: Option<String>,
    pub loader: Option<String>,
    pub compiler: Option<String>,
    pub build_profile: String,
    pub header_size: u32,
    pub key_file: Option<String>,
    pub package_profiles: BTreeMap<String, String>,
    /// Seed syscfg settings (`syscfg.vals`)
    pub vals: BTreeMap<String, String>,
}

impl TargetSpec {
    pub fn from_manifest(manifest: &Manifest, features: &FeatureSet) -> Result<Self, Error> {
        let bsp = manifest.get_string("target.bsp", features)?;
        if bsp.is_empty() {
            return Err(Error::MissingKey { key: "target.bsp" });
        }

        let header_size = match manifest.get_string("target.header_size", features)? {
            s if s.is_empty() => DEFAULT_HEADER_SIZE,
            s => parse_number(&s).ok_or(Error::BadNumber {
                key: "target.header_size",
                value: s.clone(),
            })? as u32,
        };

        let build_profile = match manifest.get_string("target.build_profile", features)? {
            s if s.is_empty() => "default".to_owned(),
            s => s,
        };

        Ok(Self {
            bsp,
            app: non_empty(manifest.get_string("target.app", features)?),
            loader: non_empty(manifest.get_string("target.loader", features)?),
            compiler: non_empty(manifest.get_string("target.compiler", features)?),
            build_profile,
            header_size,
            key_file: non_empty(manifest.get_string("target.key_file", features)?),
            package_profiles: manifest.get_string_map("target.package_profiles", features)?,
            vals: manifest.get_string_map("syscfg.vals", features)?,
        })
    }

    /// The app package, required outside unit-test runs
    pub fn require_app(&self) -> Result<&str, Error> {
        self.app.as_deref().ok_or(Error::MissingKey { key: "target.app" })
    }

    /// Split-image mode is selected by the presence of a loader
    pub fn is_split(&self) -> bool {
        self.loader.is_some()
    }

    /// Per-package profile override, falling back to the target profile
    pub fn profile_for(&self, package: &str) -> &str {
        self.package_profiles
            .get(package)
            .map(String::as_str)
            .unwrap_or(&self.build_profile)
    }

    /// Re-emit the declared variables as a target manifest. Reparsing
    /// the output yields an equal spec.
    pub fn to_yaml(&self) -> Result<String, Error> {
        use serde_yaml::{Mapping, Value};

        fn string_map(map: &BTreeMap<String, String>) -> Value {
            Value::Mapping(
                map.iter()
                    .map(|(k, v)| (Value::String(k.clone()), Value::String(v.clone())))
                    .collect(),
            )
        }

        let mut root = Mapping::new();
        let mut put = |key: &str, value: Value| {
            root.insert(Value::String(key.to_owned()), value);
        };

        put("target.bsp", Value::String(self.bsp.clone()));
        if let Some(app) = &self.app {
            put("target.app", Value::String(app.clone()));
        }
        if let Some(loader) = &self.loader {
            put("target.loader", Value::String(loader.clone()));
        }
        if let Some(compiler) = &self.compiler {
            put("target.compiler", Value::String(compiler.clone()));
        }
        put("target.build_profile", Value::String(self.build_profile.clone()));
        put("target.header_size", Value::String(format!("0x{:x}", self.header_size)));
        if let Some(key_file) = &self.key_file {
            put("target.key_file", Value::String(key_file.clone()));
        }
        if !self.package_profiles.is_empty() {
            put("target.package_profiles", string_map(&self.package_profiles));
        }
        if !self.vals.is_empty() {
            put("syscfg.vals", string_map(&self.vals));
        }

        Ok(serde_yaml::to_string(&root).map_err(crate::Error::Yaml)?)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("required key {key} is missing")]
    MissingKey { key: &'static str },

    #[error("key {key} holds unparsable number {value:?}")]
    BadNumber { key: &'static str, value: String },

    #[error(transparent)]
    Manifest(#[from] crate::Error),
}
