// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Dependency and capability resolution.
//!
//! Resolution is a monotonic fixpoint: the identifier set, the package
//! set and the edge set only ever grow, and requirement satisfaction
//! only flips unsatisfied → satisfied, so the loop terminates. Each
//! iteration runs four passes - identities, declared dependencies,
//! capability exports, capability requirements - and repeats while any
//! pass observed a change.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use depgraph::Graph;
use thiserror::Error;
use tracing::{debug, warn};

use crate::package::{Package, PackageType, PkgName};
use crate::project::Project;
use crate::syscfg::Syscfg;

/// Demotes duplicate capability providers from an error to a warning
const ALLOW_DUPLICATE_CAPS: &str = "ALLOW_DUPLICATE_CAPS";

/// An interface a package can provide (`pkg.caps`) or require
/// (`pkg.req_caps`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Capability(String);

impl Capability {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The seed roles a resolution is anchored on
#[derive(Debug, Clone)]
pub struct Roles {
    pub target: PkgName,
    pub app: Option<PkgName>,
    pub bsp: PkgName,
    pub compiler: PkgName,
}

impl Roles {
    fn seed(&self) -> Vec<PkgName> {
        let mut out = vec![self.target.clone()];
        out.extend(self.app.clone());
        out.push(self.bsp.clone());
        out.push(self.compiler.clone());
        out
    }
}

/// A closed resolution: packages, edges, the API map, and the frozen
/// configuration
#[derive(Debug, Clone)]
pub struct Resolution {
    roles: Roles,
    graph: Graph<PkgName, Option<Capability>>,
    api_map: BTreeMap<Capability, PkgName>,
    syscfg: Syscfg,
    warnings: Vec<String>,
}

impl Resolution {
    pub fn roles(&self) -> &Roles {
        &self.roles
    }

    pub fn graph(&self) -> &Graph<PkgName, Option<Capability>> {
        &self.graph
    }

    /// Resolved package names in stable alphabetical order
    pub fn package_names(&self) -> Vec<PkgName> {
        let mut names: Vec<_> = self.graph.iter_nodes().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &PkgName) -> bool {
        self.graph.node_exists(name)
    }

    pub fn api_provider(&self, capability: &Capability) -> Option<&PkgName> {
        self.api_map.get(capability)
    }

    pub fn api_map(&self) -> &BTreeMap<Capability, PkgName> {
        &self.api_map
    }

    /// Settings and features, frozen at completion
    pub fn syscfg(&self) -> &Syscfg {
        &self.syscfg
    }

    /// Every package reachable from `name` along dependency edges,
    /// `name` included
    pub fn reachable_from(&self, name: &PkgName) -> Vec<PkgName> {
        let Some(start) = self.graph.get_index(name) else {
            return vec![];
        };

        self.graph
            .reachable_from(start)
            .into_iter()
            .map(|i| self.graph.node(i).clone())
            .collect()
    }

    /// Decode-hiccup warnings accumulated during resolution, printed
    /// once by the driver
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

pub fn resolve(project: &Project, roles: Roles, syscfg: Syscfg) -> Result<Resolution, Error> {
    Resolver {
        project,
        syscfg,
        graph: Graph::new(),
        api_map: BTreeMap::new(),
        satisfied: BTreeSet::new(),
        warnings: vec![],
    }
    .run(roles)
}

struct Resolver<'a> {
    project: &'a Project,
    syscfg: Syscfg,
    graph: Graph<PkgName, Option<Capability>>,
    api_map: BTreeMap<Capability, PkgName>,
    satisfied: BTreeSet<(PkgName, Capability)>,
    warnings: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn run(mut self, roles: Roles) -> Result<Resolution, Error> {
        for name in roles.seed() {
            self.graph.add_node_or_get_index(&name);
        }

        let mut passes = 0usize;
        loop {
            passes += 1;

            let mut dirty = false;
            dirty |= self.pass_identities()?;
            dirty |= self.pass_dependencies()?;
            dirty |= self.pass_capabilities()?;
            dirty |= self.pass_requirements()?;

            if !dirty {
                break;
            }
        }

        debug!(
            passes,
            num_packages = self.graph.node_count(),
            num_apis = self.api_map.len(),
            "resolution reached fixpoint"
        );

        self.validate()?;

        Ok(Resolution {
            roles,
            graph: self.graph,
            api_map: self.api_map,
            syscfg: self.syscfg,
            warnings: self.warnings,
        })
    }

    fn known_packages(&self) -> Vec<PkgName> {
        self.graph.iter_nodes().cloned().collect()
    }

    fn package(&self, name: &PkgName) -> Result<&'a Package, Error> {
        self.project.catalog().get(name).ok_or_else(|| Error::MissingFromCatalog {
            package: name.clone(),
        })
    }

    /// Pass 1: fold newly declared configuration identifiers into the
    /// global set
    fn pass_identities(&mut self) -> Result<bool, Error> {
        let mut dirty = false;

        for name in self.known_packages() {
            let package = self.package(&name)?;
            let features = self.syscfg.features_for(package);

            let identities = package
                .manifest
                .get_string_list("pkg.identities", &features)
                .map_err(|source| Error::Manifest {
                    package: name.clone(),
                    source,
                })?;

            for identity in identities {
                dirty |= self.syscfg.add_identity(identity);
            }
        }

        Ok(dirty)
    }

    /// Pass 2: materialize declared dependency edges, pulling unknown
    /// packages into the resolution
    fn pass_dependencies(&mut self) -> Result<bool, Error> {
        let mut dirty = false;

        for name in self.known_packages() {
            let package = self.package(&name)?;
            let features = self.syscfg.features_for(package);

            let deps = package
                .manifest
                .get_string_list("pkg.deps", &features)
                .map_err(|source| Error::Manifest {
                    package: name.clone(),
                    source,
                })?;

            for dep in deps {
                let dep = dep.trim();
                if dep.is_empty() {
                    continue;
                }

                let resolved = self
                    .project
                    .catalog()
                    .resolve(dep, name.repo())
                    .map_err(|source| Error::Dependency {
                        package: name.clone(),
                        source,
                    })?;

                dirty |= !self.graph.node_exists(&resolved.name);
                let from = self.graph.add_node_or_get_index(&name);
                let to = self.graph.add_node_or_get_index(&resolved.name);
                dirty |= self.graph.add_edge(from, to, None);
            }
        }

        Ok(dirty)
    }

    /// Pass 3: install capability exports of every resolved package
    fn pass_capabilities(&mut self) -> Result<bool, Error> {
        let mut dirty = false;

        for name in self.known_packages() {
            let package = self.package(&name)?;
            let features = self.syscfg.features_for(package);

            let caps = package
                .manifest
                .get_string_list("pkg.caps", &features)
                .map_err(|source| Error::Manifest {
                    package: name.clone(),
                    source,
                })?;

            for cap in caps {
                dirty |= self.install_capability(cap.into(), &name)?;
            }
        }

        Ok(dirty)
    }

    fn install_capability(&mut self, capability: Capability, provider: &PkgName) -> Result<bool, Error> {
        match self.api_map.get(&capability) {
            None => {
                self.api_map.insert(capability, provider.clone());
                Ok(true)
            }
            Some(existing) if existing == provider => Ok(false),
            Some(existing) => {
                if self.syscfg.is_true(ALLOW_DUPLICATE_CAPS) {
                    let message = format!(
                        "capability {capability} provided by both {existing} and {provider}, keeping {existing}"
                    );
                    warn!("{message}");
                    if !self.warnings.contains(&message) {
                        self.warnings.push(message);
                    }
                    Ok(false)
                } else {
                    Err(Error::CapabilityConflict {
                        capability,
                        first: existing.clone(),
                        second: provider.clone(),
                    })
                }
            }
        }
    }

    /// Pass 4: satisfy capability requirements with edges to their
    /// providers. A provider not yet in the resolution is searched for
    /// across the whole catalog and pulled in.
    fn pass_requirements(&mut self) -> Result<bool, Error> {
        let mut dirty = false;

        for name in self.known_packages() {
            for cap in self.requirements_of(&name)? {
                if self.satisfied.contains(&(name.clone(), cap.clone())) {
                    continue;
                }

                let provider = match self.api_map.get(&cap) {
                    Some(provider) => Some(provider.clone()),
                    None => self.find_catalog_provider(&cap)?,
                };

                let Some(provider) = provider else {
                    continue;
                };

                dirty |= !self.graph.node_exists(&provider);
                let from = self.graph.add_node_or_get_index(&name);
                let to = self.graph.add_node_or_get_index(&provider);
                dirty |= self.graph.add_edge(from, to, Some(cap.clone()));

                self.api_map.entry(cap.clone()).or_insert_with(|| provider.clone());
                self.satisfied.insert((name.clone(), cap));
                dirty = true;
            }
        }

        Ok(dirty)
    }

    fn requirements_of(&self, name: &PkgName) -> Result<Vec<Capability>, Error> {
        let package = self.package(name)?;
        let features = self.syscfg.features_for(package);

        Ok(package
            .manifest
            .first_string_list(&["pkg.req_caps", "pkg.req_apis"], &features)
            .map_err(|source| Error::Manifest {
                package: name.clone(),
                source,
            })?
            .into_iter()
            .map(Capability::from)
            .collect())
    }

    /// Search every catalog package for a provider of `capability`
    fn find_catalog_provider(&mut self, capability: &Capability) -> Result<Option<PkgName>, Error> {
        let mut providers = vec![];

        for package in self.project.catalog().iter() {
            let features = self.syscfg.features_for(package);
            let caps = package
                .manifest
                .get_string_list("pkg.caps", &features)
                .map_err(|source| Error::Manifest {
                    package: package.name.clone(),
                    source,
                })?;

            if caps.iter().any(|c| c == capability.as_str()) {
                providers.push(package.name.clone());
            }
        }

        match providers.len() {
            0 => Ok(None),
            1 => Ok(providers.pop()),
            _ => {
                if self.syscfg.is_true(ALLOW_DUPLICATE_CAPS) {
                    providers.sort();
                    let winner = providers.remove(0);
                    let message = format!(
                        "capability {capability} provided by multiple packages, keeping {winner}"
                    );
                    warn!("{message}");
                    if !self.warnings.contains(&message) {
                        self.warnings.push(message);
                    }
                    Ok(Some(winner))
                } else {
                    providers.sort();
                    Err(Error::CapabilityConflict {
                        capability: capability.clone(),
                        first: providers[0].clone(),
                        second: providers[1].clone(),
                    })
                }
            }
        }
    }

    fn validate(&self) -> Result<(), Error> {
        // every requirement must have been satisfied; report all
        // missing APIs together
        let mut unsatisfied: Vec<(PkgName, Vec<Capability>)> = vec![];

        for name in self.known_packages() {
            let missing: Vec<_> = self
                .requirements_of(&name)?
                .into_iter()
                .filter(|cap| !self.satisfied.contains(&(name.clone(), cap.clone())))
                .collect();

            if !missing.is_empty() {
                unsatisfied.push((name, missing));
            }
        }

        if !unsatisfied.is_empty() {
            unsatisfied.sort();
            return Err(Error::Unsatisfied(UnsatisfiedSet(unsatisfied)));
        }

        // at most one package per singleton type
        let mut singletons: BTreeMap<PackageType, PkgName> = BTreeMap::new();
        for name in self.known_packages() {
            let package = self.package(&name)?;
            if !package.kind.is_singleton() {
                continue;
            }
            if let Some(first) = singletons.get(&package.kind) {
                let (first, second) = if *first < name {
                    (first.clone(), name)
                } else {
                    (name, first.clone())
                };
                return Err(Error::DuplicateSingleton {
                    kind: package.kind,
                    first,
                    second,
                });
            }
            singletons.insert(package.kind, name);
        }

        Ok(())
    }
}

/// All unsatisfied `(package, missing capabilities)` pairs, reported
/// together
#[derive(Debug)]
pub struct UnsatisfiedSet(pub Vec<(PkgName, Vec<Capability>)>);

impl fmt::Display for UnsatisfiedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (package, caps)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            let caps = caps.iter().map(Capability::as_str).collect::<Vec<_>>().join(", ");
            write!(f, "{package} requires [{caps}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsatisfied capability requirements: {0}")]
    Unsatisfied(UnsatisfiedSet),

    #[error("capability {capability} provided by both {first} and {second}")]
    CapabilityConflict {
        capability: Capability,
        first: PkgName,
        second: PkgName,
    },

    #[error("more than one {kind} package resolved: {first} and {second}")]
    DuplicateSingleton {
        kind: PackageType,
        first: PkgName,
        second: PkgName,
    },

    #[error("package {package} resolved but missing from catalog")]
    MissingFromCatalog { package: PkgName },

    #[error("resolving dependency of {package}")]
    Dependency {
        package: PkgName,
        #[source]
        source: crate::package::Error,
    },

    #[error("manifest of {package}")]
    Manifest {
        package: PkgName,
        #[source]
        source: pkg_manifest::Error,
    },
}
