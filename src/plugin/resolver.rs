//! Dependency Resolution
//!
//! Turns the declared metadata of a set of plugins into a load order in which
//! every plugin comes after the plugins it requires. Ordering uses Kahn's
//! algorithm with lexical tie-breaking, so the same input always produces the
//! same order.
//!
//! Version constraints use caret semantics: `^1.2.0` accepts `1.x.y >= 1.2.0`,
//! `^0.2.0` accepts `0.2.y >= 0.2.0` and `^0.0.3` accepts `0.0.y >= 0.0.3`.
//! Pre-release tags on the available version are not considered. A bare
//! version is read as a caret constraint and an empty constraint or `*`
//! accepts anything.

use crate::plugin::error::ResolutionError;
use crate::plugin::types::{PluginDependency, PluginMetadata};
use semver::{Comparator, Op, Version, VersionReq};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// A non-fatal observation about an optional dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub plugin: String,
    pub dependency: String,
    pub reason: String,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plugin '{}': optional dependency '{}' {}",
            self.plugin, self.dependency, self.reason
        )
    }
}

/// Load order plus the information needed to act on it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionPlan {
    /// Every plugin, dependencies first
    pub order: Vec<String>,
    /// `order` split into waves with no edges inside a wave
    pub levels: Vec<Vec<String>>,
    pub advisories: Vec<Advisory>,
}

/// Outcome of resolving while excluding the plugins that cannot be resolved
#[derive(Debug, Clone, Default)]
pub struct PartialResolution {
    pub plan: ResolutionPlan,
    /// Excluded plugins with the reason they were excluded
    pub failures: BTreeMap<String, ResolutionError>,
}

// plugin -> (dependency -> optional)
type Edges = BTreeMap<String, BTreeMap<String, bool>>;

struct Graph {
    nodes: BTreeSet<String>,
    edges: Edges,
}

struct Sorted {
    order: Vec<String>,
    levels: Vec<Vec<String>>,
    leftover: BTreeSet<String>,
}

/// Computes load orders for a set of plugin metadata
pub struct DependencyResolver<'a> {
    metadata: &'a HashMap<String, PluginMetadata>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(metadata: &'a HashMap<String, PluginMetadata>) -> Self {
        Self { metadata }
    }

    /// Load order for every plugin, or the first error found
    pub fn resolve(&self) -> Result<Vec<String>, ResolutionError> {
        self.plan().map(|plan| plan.order)
    }

    /// Like `resolve`, also returning the start waves and advisories
    pub fn plan(&self) -> Result<ResolutionPlan, ResolutionError> {
        let (graph, errors, advisories) = self.build_graph();

        if let Some((_, error)) = errors.into_iter().next() {
            return Err(error);
        }

        let sorted = topological_sort(&graph, &graph.nodes);
        if !sorted.leftover.is_empty() {
            return Err(ResolutionError::CyclicDependency {
                members: find_cycle(&graph.edges, &sorted.leftover),
            });
        }

        Ok(ResolutionPlan {
            order: sorted.order,
            levels: sorted.levels,
            advisories,
        })
    }

    /// Resolve what can be resolved
    ///
    /// Plugins with a missing dependency, a version mismatch or a part in a
    /// cycle are excluded, together with everything that requires them.
    /// Every other plugin is ordered as usual.
    pub fn resolve_partial(&self) -> PartialResolution {
        let (mut graph, mut failures, mut advisories) = self.build_graph();
        let mut active: BTreeSet<String> = graph
            .nodes
            .iter()
            .filter(|name| !failures.contains_key(*name))
            .cloned()
            .collect();

        loop {
            propagate_failures(&mut graph, &mut active, &mut failures, &mut advisories);

            let sorted = topological_sort(&graph, &active);
            if sorted.leftover.is_empty() {
                return PartialResolution {
                    plan: ResolutionPlan {
                        order: sorted.order,
                        levels: sorted.levels,
                        advisories,
                    },
                    failures,
                };
            }

            let members = find_cycle(&graph.edges, &sorted.leftover);
            log::debug!("Excluding dependency cycle: {:?}", members);
            for member in &members {
                active.remove(member);
                failures.insert(
                    member.clone(),
                    ResolutionError::CyclicDependency {
                        members: members.clone(),
                    },
                );
            }
        }
    }

    fn build_graph(&self) -> (Graph, BTreeMap<String, ResolutionError>, Vec<Advisory>) {
        let nodes: BTreeSet<String> = self.metadata.keys().cloned().collect();
        let mut edges = Edges::new();
        let mut errors = BTreeMap::new();
        let mut advisories = Vec::new();

        for name in &nodes {
            let plugin_edges = edges.entry(name.clone()).or_default();
            let Some(metadata) = self.metadata.get(name) else {
                continue;
            };

            for dependency in &metadata.dependencies {
                let outcome = match self.metadata.get(&dependency.name) {
                    Some(available) => check_dependency(name, dependency, available),
                    None => Err(ResolutionError::MissingDependency {
                        plugin: name.clone(),
                        dependency: dependency.name.clone(),
                    }),
                };

                match outcome {
                    Ok(()) => {
                        plugin_edges.insert(dependency.name.clone(), dependency.optional);
                    }
                    Err(error) if dependency.optional => {
                        advisories.push(Advisory {
                            plugin: name.clone(),
                            dependency: dependency.name.clone(),
                            reason: advisory_reason(&error),
                        });
                    }
                    Err(error) => {
                        errors.entry(name.clone()).or_insert(error);
                    }
                }
            }
        }

        for advisory in &advisories {
            log::debug!("{}", advisory);
        }

        (Graph { nodes, edges }, errors, advisories)
    }
}

/// Load order for `metadata`, dependencies first
pub fn resolve(metadata: &HashMap<String, PluginMetadata>) -> Result<Vec<String>, ResolutionError> {
    DependencyResolver::new(metadata).resolve()
}

enum Requirement {
    Any,
    Caret(Comparator),
    Other(VersionReq),
}

impl Requirement {
    // Caret matching ignores pre-release tags on the candidate
    fn accepts(&self, version: &Version) -> bool {
        match self {
            Requirement::Any => true,
            Requirement::Caret(floor) => {
                if version.major != floor.major {
                    return false;
                }
                let Some(minor) = floor.minor else {
                    return true;
                };
                if floor.major == 0 && version.minor != minor {
                    return false;
                }
                (version.minor, version.patch) >= (minor, floor.patch.unwrap_or(0))
            }
            Requirement::Other(requirement) => requirement.matches(version),
        }
    }
}

fn parse_requirement(plugin: &str, constraint: &str) -> Result<Requirement, ResolutionError> {
    let trimmed = constraint.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Ok(Requirement::Any);
    }
    let requirement = VersionReq::parse(trimmed).map_err(|e| ResolutionError::InvalidVersion {
        plugin: plugin.to_string(),
        value: constraint.to_string(),
        reason: e.to_string(),
    })?;
    match requirement.comparators.as_slice() {
        [only] if only.op == Op::Caret => Ok(Requirement::Caret(only.clone())),
        _ => Ok(Requirement::Other(requirement)),
    }
}

fn check_dependency(
    plugin: &str,
    dependency: &PluginDependency,
    available: &PluginMetadata,
) -> Result<(), ResolutionError> {
    let requirement = parse_requirement(plugin, &dependency.version_constraint)?;
    let version =
        Version::parse(available.version.trim()).map_err(|e| ResolutionError::InvalidVersion {
            plugin: dependency.name.clone(),
            value: available.version.clone(),
            reason: e.to_string(),
        })?;

    if requirement.accepts(&version) {
        Ok(())
    } else {
        Err(ResolutionError::VersionMismatch {
            plugin: plugin.to_string(),
            dependency: dependency.name.clone(),
            required: dependency.version_constraint.clone(),
            available: available.version.clone(),
        })
    }
}

fn advisory_reason(error: &ResolutionError) -> String {
    match error {
        ResolutionError::MissingDependency { .. } => "is not installed".to_string(),
        ResolutionError::VersionMismatch {
            required,
            available,
            ..
        } => format!("requires {} but {} is available", required, available),
        ResolutionError::InvalidVersion { value, reason, .. } => {
            format!("has an unusable version '{}': {}", value, reason)
        }
        other => other.to_string(),
    }
}

// Exclude every active plugin that requires an excluded one; optional
// edges to excluded plugins are dropped instead.
fn propagate_failures(
    graph: &mut Graph,
    active: &mut BTreeSet<String>,
    failures: &mut BTreeMap<String, ResolutionError>,
    advisories: &mut Vec<Advisory>,
) {
    loop {
        let mut changed = false;
        let names: Vec<String> = active.iter().cloned().collect();

        for name in names {
            let Some(plugin_edges) = graph.edges.get_mut(&name) else {
                continue;
            };
            let failed: Vec<(String, bool)> = plugin_edges
                .iter()
                .filter(|(dependency, _)| !active.contains(*dependency))
                .map(|(dependency, optional)| (dependency.clone(), *optional))
                .collect();

            for (dependency, optional) in failed {
                if optional {
                    plugin_edges.remove(&dependency);
                    advisories.push(Advisory {
                        plugin: name.clone(),
                        dependency,
                        reason: "could not be resolved".to_string(),
                    });
                } else if active.remove(&name) {
                    failures.insert(
                        name.clone(),
                        ResolutionError::DependencyFailed {
                            plugin: name.clone(),
                            dependency,
                        },
                    );
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }
}

fn topological_sort(graph: &Graph, active: &BTreeSet<String>) -> Sorted {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for name in active {
        let dependencies = graph
            .edges
            .get(name)
            .map(|edges| edges.keys().filter(|d| active.contains(*d)).collect::<Vec<_>>())
            .unwrap_or_default();
        in_degree.insert(name.as_str(), dependencies.len());
        for dependency in dependencies {
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut level: HashMap<&str, usize> = HashMap::new();
    let mut order = Vec::with_capacity(active.len());
    let mut levels: Vec<Vec<String>> = Vec::new();

    while let Some(node) = ready.pop_first() {
        let node_level = level.get(node).copied().unwrap_or(0);
        if levels.len() <= node_level {
            levels.resize_with(node_level + 1, Vec::new);
        }
        levels[node_level].push(node.to_string());
        order.push(node.to_string());

        for dependent in dependents.get(node).into_iter().flatten() {
            let entry = level.entry(*dependent).or_insert(0);
            *entry = (*entry).max(node_level + 1);
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    let leftover = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(name, _)| name.to_string())
        .collect();

    Sorted {
        order,
        levels,
        leftover,
    }
}

// Every leftover node still has a leftover dependency, so following
// dependencies from any of them must revisit a node.
fn find_cycle(edges: &Edges, leftover: &BTreeSet<String>) -> Vec<String> {
    let Some(start) = leftover.first() else {
        return Vec::new();
    };

    let mut path: Vec<String> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut current = start.clone();

    loop {
        if let Some(&position) = seen.get(&current) {
            let mut cycle = path.split_off(position);
            if let Some(smallest) = cycle
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.cmp(b.1))
                .map(|(index, _)| index)
            {
                cycle.rotate_left(smallest);
            }
            return cycle;
        }

        seen.insert(current.clone(), path.len());
        path.push(current.clone());

        let next = edges
            .get(&current)
            .and_then(|deps| deps.keys().find(|d| leftover.contains(*d)))
            .cloned();
        match next {
            Some(next) => current = next,
            None => return path,
        }
    }
}
