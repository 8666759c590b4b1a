//! Registry of tests and fixtures declared by bundles.
//!
//! The registry is an explicitly constructed value threaded through the
//! controller. It is populated from bundle listings, answers pattern
//! queries, evaluates dependency predicates against the DUT's feature set,
//! and orders fixtures so parents come before children.
//!
//! Two dependency outcomes are kept apart on purpose. An unmet dependency
//! on a known feature is deterministic and produces a skip. A dependency
//! naming a feature the DUT has never heard of is an authoring mistake; the
//! test still runs and fails with a diagnostic so the typo gets noticed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};

/// Whether an entity is a test or a setup scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Test,
    Fixture,
}

/// Where a bundle's entities execute.
///
/// Local bundles live on the DUT (one hop from the controller); remote
/// bundles live on the controller itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleHost {
    Controller,
    Dut,
}

impl BundleHost {
    /// Number of machine boundaries between the controller and the host
    /// that executes entities of this bundle.
    pub fn hops(self) -> u8 {
        match self {
            BundleHost::Controller => 0,
            BundleHost::Dut => 1,
        }
    }
}

/// Conjunction of software features an entity depends on.
///
/// The dependency language itself is opaque to the controller; a predicate
/// is a list of feature names that must all be available on the DUT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepPredicate {
    pub features: Vec<String>,
}

impl DepPredicate {
    pub fn new<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            features: features.into_iter().map(Into::into).collect(),
        }
    }
}

/// The DUT's feature universe, split into features known to be present and
/// features known to be absent. A feature in neither set is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub available: HashSet<String>,
    pub unavailable: HashSet<String>,
}

impl FeatureSet {
    pub fn new<A, U>(available: A, unavailable: U) -> Self
    where
        A: IntoIterator<Item = String>,
        U: IntoIterator<Item = String>,
    {
        Self {
            available: available.into_iter().collect(),
            unavailable: unavailable.into_iter().collect(),
        }
    }
}

/// An atomic unit of execution declared by a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique name across the registry.
    pub name: String,

    pub kind: EntityKind,

    /// Name of the bundle that declared this entity.
    pub bundle: String,

    /// Parent fixture name, if the entity runs inside a setup scope.
    #[serde(default)]
    pub fixture: Option<String>,

    /// Per-entity execution timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,

    /// Dependency predicate evaluated against the DUT feature set.
    #[serde(default)]
    pub deps: Option<DepPredicate>,

    /// Directory the entity writes artifacts into, relative to the bundle's
    /// output root.
    #[serde(default)]
    pub out_dir: Option<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, kind: EntityKind, bundle: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            bundle: bundle.into(),
            fixture: None,
            timeout: None,
            deps: None,
            out_dir: None,
        }
    }

    /// Sets the parent fixture.
    pub fn with_fixture(mut self, fixture: impl Into<String>) -> Self {
        self.fixture = Some(fixture.into());
        self
    }

    /// Sets the execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the dependency predicate.
    pub fn with_deps(mut self, deps: DepPredicate) -> Self {
        self.deps = Some(deps);
        self
    }

    /// Sets the artifact out-directory.
    pub fn with_out_dir(mut self, dir: impl Into<String>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }
}

/// An entity augmented with placement and dependency outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub entity: Entity,

    /// Machine boundaries crossed to execute this entity (0 = controller,
    /// 1 = DUT).
    pub hops: u8,

    /// Deterministic non-execution reason from dependency resolution.
    pub skip_reason: Option<String>,

    /// Diagnostics for dependencies naming unknown features. The test is
    /// still executed and these are attached to its result as failures.
    pub check_errors: Vec<String>,

    /// Earliest ancestor fixture whose execution crosses into a different
    /// bundle, empty when the whole chain stays in-bundle.
    pub start_fixture_name: String,
}

impl ResolvedEntity {
    /// Whether the entity should actually be sent to a runner.
    pub fn runnable(&self) -> bool {
        self.skip_reason.is_none()
    }
}

/// Errors detected while registering or resolving entities.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("test {0:?} registered twice")]
    DuplicateTest(String),

    #[error("fixture {name:?} redeclared by bundle {bundle:?} with a different definition")]
    ConflictingFixture { name: String, bundle: String },

    #[error("entity {entity:?} references unknown fixture {fixture:?}")]
    UnknownFixture { entity: String, fixture: String },

    #[error("fixture parent chain starting at {0:?} contains a cycle")]
    FixtureCycle(String),

    #[error("invalid test pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        source: globset::Error,
    },
}

/// Holds declared tests and fixtures per bundle.
///
/// Entities are keyed by name; iteration order is name order, which is also
/// the order pattern matches are returned in.
#[derive(Debug, Default)]
pub struct Registry {
    entities: BTreeMap<String, Entity>,
    bundle_hosts: HashMap<String, BundleHost>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every entity a bundle declared.
    ///
    /// Duplicate test names are always an error. A fixture may be declared
    /// by more than one bundle only when the declarations are identical.
    pub fn register_bundle(
        &mut self,
        host: BundleHost,
        entities: Vec<Entity>,
    ) -> Result<(), RegistryError> {
        for entity in entities {
            self.bundle_hosts.insert(entity.bundle.clone(), host);
            match self.entities.get(&entity.name) {
                None => {
                    self.entities.insert(entity.name.clone(), entity);
                }
                Some(existing) => match entity.kind {
                    EntityKind::Test => {
                        return Err(RegistryError::DuplicateTest(entity.name));
                    }
                    EntityKind::Fixture => {
                        // Same fixture delivered in two bundle images is fine
                        // as long as the definitions agree field for field.
                        let mut relocated = entity.clone();
                        relocated.bundle = existing.bundle.clone();
                        if relocated != *existing {
                            return Err(RegistryError::ConflictingFixture {
                                name: entity.name,
                                bundle: entity.bundle,
                            });
                        }
                    }
                },
            }
        }
        Ok(())
    }

    /// Looks up a single entity by name.
    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    /// Returns the tests matching any of the glob patterns, ordered by
    /// name. An empty pattern list matches every test.
    pub fn match_patterns(&self, patterns: &[String]) -> Result<Vec<&Entity>, RegistryError> {
        let tests = self
            .entities
            .values()
            .filter(|e| e.kind == EntityKind::Test);
        if patterns.is_empty() {
            return Ok(tests.collect());
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|source| RegistryError::BadPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|source| RegistryError::BadPattern {
            pattern: patterns.join(","),
            source,
        })?;
        Ok(tests.filter(|e| set.is_match(&e.name)).collect())
    }

    /// Resolves matched entities against the DUT feature set.
    ///
    /// With `check_deps` false, dependency predicates are ignored entirely
    /// and every matched test is runnable.
    pub fn resolve(
        &self,
        matched: &[&Entity],
        features: &FeatureSet,
        check_deps: bool,
    ) -> Result<Vec<ResolvedEntity>, RegistryError> {
        matched
            .iter()
            .map(|entity| {
                let hops = self
                    .bundle_hosts
                    .get(&entity.bundle)
                    .copied()
                    .unwrap_or(BundleHost::Dut)
                    .hops();
                let start_fixture_name = self.start_fixture_name(entity)?;
                let (skip_reason, check_errors) = if check_deps {
                    self.evaluate_deps(entity, features)
                } else {
                    (None, Vec::new())
                };
                Ok(ResolvedEntity {
                    entity: (*entity).clone(),
                    hops,
                    skip_reason,
                    check_errors,
                    start_fixture_name,
                })
            })
            .collect()
    }

    /// Returns all fixtures ordered so every parent precedes its children.
    pub fn fixtures_topological(&self) -> Result<Vec<&Entity>, RegistryError> {
        let fixtures: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| e.kind == EntityKind::Fixture)
            .collect();
        let mut ordered = Vec::with_capacity(fixtures.len());
        let mut placed: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&Entity> = fixtures;
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|fixture| {
                let ready = match &fixture.fixture {
                    None => true,
                    Some(parent) => placed.contains(parent.as_str()),
                };
                if ready {
                    placed.insert(fixture.name.as_str());
                    ordered.push(*fixture);
                }
                !ready
            });
            if remaining.len() == before {
                // Nothing became placeable: a cycle or a dangling parent.
                let stuck = remaining[0];
                if let Some(parent) = &stuck.fixture {
                    if !self.entities.contains_key(parent) {
                        return Err(RegistryError::UnknownFixture {
                            entity: stuck.name.clone(),
                            fixture: parent.clone(),
                        });
                    }
                }
                return Err(RegistryError::FixtureCycle(stuck.name.clone()));
            }
        }
        Ok(ordered)
    }

    fn evaluate_deps(
        &self,
        entity: &Entity,
        features: &FeatureSet,
    ) -> (Option<String>, Vec<String>) {
        let Some(deps) = &entity.deps else {
            return (None, Vec::new());
        };
        let mut missing = Vec::new();
        let mut unknown = Vec::new();
        for feature in &deps.features {
            if features.available.contains(feature) {
                continue;
            }
            if features.unavailable.contains(feature) {
                missing.push(feature.clone());
            } else {
                unknown.push(format!("dependency references unknown feature {feature:?}"));
            }
        }
        let skip = if missing.is_empty() {
            None
        } else {
            Some(format!(
                "missing software features: {}",
                missing.join(", ")
            ))
        };
        (skip, unknown)
    }

    /// Walks the parent chain and returns the earliest ancestor fixture
    /// owned by a bundle other than the entity's own.
    fn start_fixture_name(&self, entity: &Entity) -> Result<String, RegistryError> {
        let mut crossing: Option<&str> = None;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = entity.fixture.as_deref();
        while let Some(name) = current {
            if !seen.insert(name) {
                return Err(RegistryError::FixtureCycle(name.to_string()));
            }
            let Some(fixture) = self.entities.get(name) else {
                return Err(RegistryError::UnknownFixture {
                    entity: entity.name.clone(),
                    fixture: name.to_string(),
                });
            };
            if fixture.bundle != entity.bundle {
                crossing = Some(name);
            }
            current = fixture.fixture.as_deref();
        }
        Ok(crossing.unwrap_or("").to_string())
    }
}
