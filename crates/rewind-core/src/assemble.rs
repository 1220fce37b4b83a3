//! Per-date dependency graph assembly.
//!
//! Merges the partition indices of one target date into a single acyclic graph, propagates
//! exclusions to every dependent, back-fills vanished dependencies from history and attaches the
//! resolved overrides to every surviving package.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{Dfs, NodeIndexable};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::history::HistorySource;
use crate::index::PackageIndex;
use crate::overrides::{OverrideRegistry, PackageOverrides, ResolvedOverrides};
use crate::release::Release;
use crate::{EpochId, PackageRecord, Partition, RewindError, SnapshotDate};

pub struct AssemblyInput<'a> {
    /// Date the secondary release state and the overrides are resolved at.
    pub archive_date: SnapshotDate,
    /// Primary snapshot the partitions were read from; upper bound for back-filling.
    pub snapshot_date: SnapshotDate,
    pub release: &'a Release,
    pub partitions: BTreeMap<Partition, PackageIndex>,
    pub history: &'a dyn HistorySource,
    pub overrides: &'a OverrideRegistry,
}

impl<'a> AssemblyInput<'a> {
    /// Primary index as given, secondary partitions as the release stood on `archive_date`.
    #[must_use]
    pub fn for_release(
        archive_date: SnapshotDate,
        snapshot_date: SnapshotDate,
        release: &'a Release,
        primary: PackageIndex,
        history: &'a dyn HistorySource,
        overrides: &'a OverrideRegistry,
    ) -> Self {
        let mut partitions = BTreeMap::from([(Partition::Cran, primary)]);
        for partition in Partition::SECONDARY {
            partitions.insert(partition, release.state_as_of(partition, archive_date));
        }
        Self { archive_date, snapshot_date, release, partitions, history, overrides }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    pub partition: Partition,
    pub depends: BTreeSet<String>,
    pub suggests: BTreeSet<String>,
    pub needs_compilation: bool,
    pub os_type: Option<String>,
    pub sha256: Option<String>,
    pub url: Option<String>,
    pub overrides: PackageOverrides,
    /// Snapshot date the record was taken from when it was back-filled.
    pub backfilled_from: Option<SnapshotDate>,
}

/// The consistent package set of one target date.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconciledSet {
    pub archive_date: SnapshotDate,
    pub snapshot_date: SnapshotDate,
    pub epoch: EpochId,
    pub packages: BTreeMap<String, ResolvedPackage>,
    pub batches: Vec<Vec<String>>,
    pub notes: Vec<String>,
    /// Excluded name to reason.
    pub excluded: BTreeMap<String, String>,
}

impl ReconciledSet {
    /// Graph edges as `(dependency, dependent)` pairs.
    #[must_use]
    pub fn edges(&self) -> Vec<(String, String)> {
        self.packages
            .values()
            .flat_map(|package| {
                package.depends.iter().map(move |dependency| (dependency.clone(), package.name.clone()))
            })
            .collect()
    }

    #[must_use]
    pub fn partition_packages(&self, partition: Partition) -> Vec<&ResolvedPackage> {
        self.packages.values().filter(|package| package.partition == partition).collect()
    }
}

#[derive(Debug, Clone)]
struct Member {
    record: PackageRecord,
    partition: Partition,
    backfilled_from: Option<SnapshotDate>,
}

/// Name-keyed graph; edges run from dependency to dependent.
#[derive(Debug, Default)]
struct DependencyGraph {
    graph: StableDiGraph<String, ()>,
    nodes: BTreeMap<String, NodeIndex>,
    members: BTreeMap<String, Member>,
}

impl DependencyGraph {
    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(index) = self.nodes.get(name) {
            return *index;
        }
        let index = self.graph.add_node(name.to_string());
        self.nodes.insert(name.to_string(), index);
        index
    }

    fn attach(&mut self, member: Member) {
        let dependent = self.node(&member.record.name);
        for dependency in &member.record.depends {
            let source = self.node(dependency);
            self.graph.update_edge(source, dependent, ());
        }
        self.members.insert(member.record.name.clone(), member);
    }

    /// Every node reachable from `root` along dependent edges, `root` included.
    fn dependents_closure(&self, root: NodeIndex) -> BTreeSet<String> {
        let mut closure = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, root);
        while let Some(index) = dfs.next(&self.graph) {
            if let Some(name) = self.graph.node_weight(index) {
                closure.insert(name.clone());
            }
        }
        closure
    }

    fn remove(&mut self, name: &str) {
        if let Some(index) = self.nodes.remove(name) {
            self.graph.remove_node(index);
        }
        self.members.remove(name);
    }

    fn unresolved(&self) -> Vec<String> {
        self.nodes.keys().filter(|name| !self.members.contains_key(*name)).cloned().collect()
    }

    /// Drop unresolved nodes that nothing depends on anymore.
    fn prune_orphans(&mut self) {
        let orphans: Vec<String> = self
            .unresolved()
            .into_iter()
            .filter(|name| {
                self.nodes.get(name).map_or(true, |index| {
                    self.graph.neighbors_directed(*index, Direction::Outgoing).next().is_none()
                })
            })
            .collect();
        for name in orphans {
            tracing::debug!(name = %name, "dropping dependency with no remaining dependents");
            self.remove(&name);
        }
    }

    fn dependents_of(&self, name: &str) -> Vec<String> {
        let Some(index) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut dependents: Vec<String> = self
            .graph
            .neighbors_directed(*index, Direction::Outgoing)
            .filter_map(|dependent| self.graph.node_weight(dependent).cloned())
            .collect();
        dependents.sort();
        dependents
    }
}

struct Assembly<'a> {
    graph: DependencyGraph,
    notes: Vec<String>,
    excluded: BTreeMap<String, String>,
    overrides: ResolvedOverrides,
    history: &'a dyn HistorySource,
    snapshot_date: SnapshotDate,
}

/// Assemble the reconciled package set of one target date.
///
/// # Errors
/// Returns [`RewindError::Registry`] for a package present in two partitions, a dependency that
/// no index or history can resolve, or a dependency cycle. Returns
/// [`RewindError::Configuration`] for an exclusion naming a package absent from the graph, or an
/// override entry outside the release validity range.
pub fn assemble(input: AssemblyInput<'_>) -> Result<ReconciledSet, RewindError> {
    let AssemblyInput { archive_date, snapshot_date, release, partitions, history, overrides } = input;
    let overrides = overrides.resolve(&release.epoch, &release.validity, archive_date)?;

    let mut assembly = Assembly {
        graph: DependencyGraph::default(),
        notes: Vec::new(),
        excluded: BTreeMap::new(),
        overrides,
        history,
        snapshot_date,
    };

    assembly.merge_partitions(partitions)?;
    assembly.apply_exclusions()?;
    assembly.graph.prune_orphans();
    assembly.gap_fill()?;
    assembly.check_acyclic()?;

    let batches = assembly.batches();
    let Assembly { graph, notes, excluded, overrides, .. } = assembly;
    let packages: BTreeMap<String, ResolvedPackage> = graph
        .members
        .into_values()
        .map(|member| {
            let name = member.record.name.clone();
            let package_overrides = overrides.package_overrides(&name);
            (name, resolved_package(member, package_overrides))
        })
        .collect();

    tracing::info!(
        %archive_date,
        %snapshot_date,
        epoch = %release.epoch,
        packages = packages.len(),
        batches = batches.len(),
        excluded = excluded.len(),
        "reconciled package set"
    );

    Ok(ReconciledSet {
        archive_date,
        snapshot_date,
        epoch: release.epoch.clone(),
        packages,
        batches,
        notes,
        excluded,
    })
}

fn resolved_package(member: Member, overrides: PackageOverrides) -> ResolvedPackage {
    let Member { record, partition, backfilled_from } = member;
    ResolvedPackage {
        name: record.name,
        version: record.version,
        partition,
        depends: record.depends,
        suggests: record.suggests,
        needs_compilation: record.needs_compilation,
        os_type: record.os_type,
        sha256: None,
        url: None,
        overrides,
        backfilled_from,
    }
}

impl Assembly<'_> {
    fn merge_partitions(&mut self, partitions: BTreeMap<Partition, PackageIndex>) -> Result<(), RewindError> {
        let mut origin: BTreeMap<String, Partition> = BTreeMap::new();

        for (partition, index) in partitions {
            for record in index.records() {
                if let Some(reason) = self.overrides.partition_exclusion(partition, &record.name) {
                    self.notes.push(format!("excluded {partition}--{} ({reason})", record.name));
                    continue;
                }
                if let Some(previous) = origin.insert(record.name.clone(), partition) {
                    return Err(RewindError::Registry(format!(
                        "package {} is present in both {previous} and {partition}",
                        record.name
                    )));
                }

                let mut record = record.clone();
                record.depends.extend(self.overrides.extra_dependencies(partition, &record.name));
                record.depends.remove(&record.name);
                self.graph.attach(Member { record, partition, backfilled_from: None });
            }
        }
        Ok(())
    }

    fn apply_exclusions(&mut self) -> Result<(), RewindError> {
        let roots: Vec<(String, String)> = self
            .overrides
            .global_exclusions()
            .into_iter()
            .map(|(name, reason)| (name.to_string(), reason.to_string()))
            .collect();

        if let Some((stale, _)) = roots.iter().find(|(name, _)| !self.graph.nodes.contains_key(name)) {
            return Err(RewindError::Configuration(format!(
                "stale exclusion: {stale} is not part of the dependency graph of {}",
                self.snapshot_date
            )));
        }

        for (root, reason) in roots {
            self.notes.push(format!("excluded {root} ({reason})"));
            self.excluded.insert(root.clone(), reason);
            self.exclude_closure(&root, &root);
        }
        Ok(())
    }

    /// Remove `start` and every package depending on it; `cause` names the excluded package.
    fn exclude_closure(&mut self, start: &str, cause: &str) {
        let Some(index) = self.graph.nodes.get(start).copied() else {
            return;
        };
        for name in self.graph.dependents_closure(index) {
            if name != cause && !self.excluded.contains_key(&name) {
                self.notes.push(format!("Excluding {name} because of (indirect) dependency on {cause}"));
                self.excluded.insert(name.clone(), format!("depends on {cause}"));
            }
            self.graph.remove(&name);
        }
    }

    fn gap_fill(&mut self) -> Result<(), RewindError> {
        loop {
            let missing = self.graph.unresolved();
            if missing.is_empty() {
                return Ok(());
            }

            let mut unresolved = Vec::new();
            for name in missing {
                // an earlier exclusion in this round may have dropped the node
                if !self.graph.nodes.contains_key(&name) {
                    continue;
                }
                let Some(hit) = self.history.latest_at_or_before(&name, self.snapshot_date) else {
                    unresolved.push(name);
                    continue;
                };

                let mut record = hit.record;
                record.depends.extend(self.overrides.extra_dependencies(Partition::Cran, &name));
                record.depends.remove(&name);
                self.notes.push(format!(
                    "Backfilled {name} {} last seen {}",
                    record.version, hit.observed_on
                ));

                if let Some(cause) = record.depends.iter().find(|dependency| self.excluded.contains_key(*dependency)) {
                    let cause = cause.clone();
                    self.notes.push(format!("Excluding {name} because of (indirect) dependency on {cause}"));
                    self.excluded.insert(name.clone(), format!("depends on {cause}"));
                    self.exclude_closure(&name, &name);
                    continue;
                }

                self.graph.attach(Member {
                    record,
                    partition: Partition::Cran,
                    backfilled_from: Some(hit.observed_on),
                });
            }

            if !unresolved.is_empty() {
                let details: Vec<String> = unresolved
                    .iter()
                    .map(|name| format!("{name} (required by {})", self.graph.dependents_of(name).join(", ")))
                    .collect();
                return Err(RewindError::Registry(format!(
                    "unresolved dependencies at {}: {}",
                    self.snapshot_date,
                    details.join("; ")
                )));
            }
            self.graph.prune_orphans();
        }
    }

    fn check_acyclic(&self) -> Result<(), RewindError> {
        toposort(&self.graph.graph, None).map(|_| ()).map_err(|cycle| {
            let name = self.graph.graph.node_weight(cycle.node_id()).cloned().unwrap_or_default();
            RewindError::Registry(format!("dependency cycle through {name}"))
        })
    }

    /// Connected components of the undirected graph, smallest first, ties by first name.
    fn batches(&self) -> Vec<Vec<String>> {
        let graph = &self.graph.graph;
        let mut components = UnionFind::<usize>::new(graph.node_bound());
        for edge in graph.edge_indices() {
            if let Some((source, target)) = graph.edge_endpoints(edge) {
                components.union(source.index(), target.index());
            }
        }

        let mut grouped: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (name, index) in &self.graph.nodes {
            grouped.entry(components.find(index.index())).or_default().push(name.clone());
        }

        let mut batches: Vec<Vec<String>> = grouped.into_values().collect();
        batches.sort_by(|lhs, rhs| lhs.len().cmp(&rhs.len()).then_with(|| lhs.first().cmp(&rhs.first())));
        batches
    }
}
