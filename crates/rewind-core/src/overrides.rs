use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ledger::{
    BaseMode, FlatTable, Ledger, LedgerKey, LedgerShape, ListTable, NestedKey, NestedTable,
};
use crate::{EpochId, Partition, RewindError, SnapshotDate, ValidityRange};

/// Second-level key of a dependency addition that applies to every partition.
pub const ALL_PARTITIONS: &str = "all";
/// Separator of partition-scoped exclusion keys (`software--pkg`).
pub const PARTITION_SEPARATOR: &str = "--";

pub type ExclusionTable = FlatTable<String>;
pub type InputTable = FlatTable<Vec<String>>;
pub type DependencyTable = NestedTable<Vec<String>>;
pub type AttributeTable = NestedTable<String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    /// Append this value to every inherited row.
    pub append_to_every: String,
}

/// One inherit event as written in `overrides.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, bound(deserialize = "S: LedgerShape"))]
pub struct EventConfig<S: LedgerShape> {
    pub key: LedgerKey,
    #[serde(default)]
    pub additions: S,
    #[serde(default = "Vec::new")]
    pub removals: Vec<S::Removal>,
    #[serde(default)]
    pub base: BaseMode,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
}

impl<S: LedgerShape> EventConfig<S> {
    #[must_use]
    pub fn new(key: LedgerKey, additions: S) -> Self {
        Self { key, additions, removals: Vec::new(), base: BaseMode::default(), transform: None }
    }

    #[must_use]
    pub fn with_removals(mut self, removals: Vec<S::Removal>) -> Self {
        self.removals = removals;
        self
    }

    #[must_use]
    pub fn with_base(mut self, base: BaseMode) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub fn with_transform(mut self, append_to_every: impl Into<String>) -> Self {
        self.transform = Some(TransformConfig { append_to_every: append_to_every.into() });
        self
    }
}

/// Deserialized form of `overrides.yaml`: one event list per category, in source order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OverrideConfig {
    pub exclusions: Vec<EventConfig<ExclusionTable>>,
    pub broken: Vec<EventConfig<ExclusionTable>>,
    pub dependency_additions: Vec<EventConfig<DependencyTable>>,
    pub native_build_inputs: Vec<EventConfig<InputTable>>,
    pub runtime_inputs: Vec<EventConfig<InputTable>>,
    pub patches: Vec<EventConfig<InputTable>>,
    pub build_attributes: Vec<EventConfig<AttributeTable>>,
    pub skip_check: Vec<EventConfig<ListTable>>,
    pub needs_x: Vec<EventConfig<ListTable>>,
    pub needs_rust: Vec<EventConfig<ListTable>>,
}

impl OverrideConfig {
    /// # Errors
    /// Returns [`RewindError::Configuration`] when the YAML does not match the category shapes.
    pub fn from_yaml_str(raw: &str) -> Result<Self, RewindError> {
        serde_yaml::from_str(raw)
            .map_err(|err| RewindError::Configuration(format!("invalid overrides file: {err}")))
    }
}

/// Collects inherit events per category, then replays them into a frozen [`OverrideRegistry`].
#[derive(Debug, Clone, Default)]
pub struct OverrideRegistryBuilder {
    config: OverrideConfig,
}

impl OverrideRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(config: OverrideConfig) -> Self {
        Self { config }
    }

    /// # Errors
    /// Returns [`RewindError::Configuration`] when the YAML cannot be deserialized.
    pub fn from_yaml_str(raw: &str) -> Result<Self, RewindError> {
        OverrideConfig::from_yaml_str(raw).map(Self::from_config)
    }

    #[must_use]
    pub fn exclusion(mut self, event: EventConfig<ExclusionTable>) -> Self {
        self.config.exclusions.push(event);
        self
    }

    #[must_use]
    pub fn broken(mut self, event: EventConfig<ExclusionTable>) -> Self {
        self.config.broken.push(event);
        self
    }

    #[must_use]
    pub fn dependency_addition(mut self, event: EventConfig<DependencyTable>) -> Self {
        self.config.dependency_additions.push(event);
        self
    }

    #[must_use]
    pub fn native_build_inputs(mut self, event: EventConfig<InputTable>) -> Self {
        self.config.native_build_inputs.push(event);
        self
    }

    #[must_use]
    pub fn runtime_inputs(mut self, event: EventConfig<InputTable>) -> Self {
        self.config.runtime_inputs.push(event);
        self
    }

    #[must_use]
    pub fn patches(mut self, event: EventConfig<InputTable>) -> Self {
        self.config.patches.push(event);
        self
    }

    #[must_use]
    pub fn build_attributes(mut self, event: EventConfig<AttributeTable>) -> Self {
        self.config.build_attributes.push(event);
        self
    }

    #[must_use]
    pub fn skip_check(mut self, event: EventConfig<ListTable>) -> Self {
        self.config.skip_check.push(event);
        self
    }

    #[must_use]
    pub fn needs_x(mut self, event: EventConfig<ListTable>) -> Self {
        self.config.needs_x.push(event);
        self
    }

    #[must_use]
    pub fn needs_rust(mut self, event: EventConfig<ListTable>) -> Self {
        self.config.needs_rust.push(event);
        self
    }

    /// Validate every event, then replay each category in source order.
    ///
    /// # Errors
    /// Returns [`RewindError::Configuration`] for an unknown partition key, a transform on a
    /// table that is not a list-valued flat map, or any ledger ordering and removal error.
    pub fn build(self) -> Result<OverrideRegistry, RewindError> {
        let config = self.config;
        validate_exclusion_keys("exclusions", &config.exclusions)?;
        validate_dependency_additions(&config.dependency_additions)?;

        let registry = OverrideRegistry {
            exclusions: replay("exclusions", config.exclusions, no_transform)?,
            broken: replay("broken", config.broken, no_transform)?,
            dependency_additions: replay(
                "dependency_additions",
                config.dependency_additions,
                no_transform,
            )?,
            native_build_inputs: replay(
                "native_build_inputs",
                config.native_build_inputs,
                append_transform,
            )?,
            runtime_inputs: replay("runtime_inputs", config.runtime_inputs, append_transform)?,
            patches: replay("patches", config.patches, append_transform)?,
            build_attributes: replay("build_attributes", config.build_attributes, no_transform)?,
            skip_check: replay("skip_check", config.skip_check, no_transform)?,
            needs_x: replay("needs_x", config.needs_x, no_transform)?,
            needs_rust: replay("needs_rust", config.needs_rust, no_transform)?,
        };

        tracing::info!(entries = registry.entry_count(), "override registry built");
        Ok(registry)
    }
}

type Transform<S> = Box<dyn Fn(&mut S)>;

fn no_transform<S>(_: &TransformConfig) -> Option<Transform<S>> {
    None
}

fn append_transform(config: &TransformConfig) -> Option<Transform<InputTable>> {
    let value = config.append_to_every.clone();
    Some(Box::new(move |table: &mut InputTable| table.append_to_every(&value)))
}

fn replay<S, F>(table: &str, events: Vec<EventConfig<S>>, transform_for: F) -> Result<Ledger<S>, RewindError>
where
    S: LedgerShape,
    F: Fn(&TransformConfig) -> Option<Transform<S>>,
{
    let mut ledger = Ledger::new(table);
    for event in events {
        let transform = match &event.transform {
            Some(config) => Some(transform_for(config).ok_or_else(|| {
                RewindError::Configuration(format!(
                    "{table}: entry {} uses a transform, which is only supported on list-valued flat maps",
                    event.key
                ))
            })?),
            None => None,
        };
        ledger.inherit(event.key, event.additions, &event.removals, event.base, transform.as_deref())?;
    }
    Ok(ledger)
}

fn validate_exclusion_keys(
    table: &str,
    events: &[EventConfig<ExclusionTable>],
) -> Result<(), RewindError> {
    for event in events {
        let keys = event.additions.0.keys().chain(event.removals.iter());
        for key in keys {
            if let Some((partition, _)) = key.split_once(PARTITION_SEPARATOR) {
                if Partition::parse(partition).is_none() {
                    return Err(RewindError::Configuration(format!(
                        "{table}: entry {} scopes `{key}` to unknown partition `{partition}`",
                        event.key
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_dependency_additions(events: &[EventConfig<DependencyTable>]) -> Result<(), RewindError> {
    let check = |event: &EventConfig<DependencyTable>, scope: &str| {
        if scope == ALL_PARTITIONS || Partition::parse(scope).is_some() {
            Ok(())
        } else {
            Err(RewindError::Configuration(format!(
                "dependency_additions: entry {} uses `{scope}`; expected one of cran, software, annotation, experiment, all",
                event.key
            )))
        }
    };

    for event in events {
        for row in event.additions.0.values() {
            for scope in row.keys() {
                check(event, scope)?;
            }
        }
        for removal in &event.removals {
            if let NestedKey::Cell(_, scope) = removal {
                check(event, scope)?;
            }
        }
    }
    Ok(())
}

/// Frozen override ledgers for every category.
#[derive(Debug, Clone)]
pub struct OverrideRegistry {
    exclusions: Ledger<ExclusionTable>,
    broken: Ledger<ExclusionTable>,
    dependency_additions: Ledger<DependencyTable>,
    native_build_inputs: Ledger<InputTable>,
    runtime_inputs: Ledger<InputTable>,
    patches: Ledger<InputTable>,
    build_attributes: Ledger<AttributeTable>,
    skip_check: Ledger<ListTable>,
    needs_x: Ledger<ListTable>,
    needs_rust: Ledger<ListTable>,
}

impl Default for OverrideRegistry {
    fn default() -> Self {
        Self {
            exclusions: Ledger::new("exclusions"),
            broken: Ledger::new("broken"),
            dependency_additions: Ledger::new("dependency_additions"),
            native_build_inputs: Ledger::new("native_build_inputs"),
            runtime_inputs: Ledger::new("runtime_inputs"),
            patches: Ledger::new("patches"),
            build_attributes: Ledger::new("build_attributes"),
            skip_check: Ledger::new("skip_check"),
            needs_x: Ledger::new("needs_x"),
            needs_rust: Ledger::new("needs_rust"),
        }
    }
}

impl OverrideRegistry {
    /// Number of ledger entries per category.
    #[must_use]
    pub fn summary(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("exclusions", self.exclusions.entries().len()),
            ("broken", self.broken.entries().len()),
            ("dependency_additions", self.dependency_additions.entries().len()),
            ("native_build_inputs", self.native_build_inputs.entries().len()),
            ("runtime_inputs", self.runtime_inputs.entries().len()),
            ("patches", self.patches.entries().len()),
            ("build_attributes", self.build_attributes.entries().len()),
            ("skip_check", self.skip_check.entries().len()),
            ("needs_x", self.needs_x.entries().len()),
            ("needs_rust", self.needs_rust.entries().len()),
        ])
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.summary().values().sum()
    }

    /// Resolve every category for `epoch` at `date`; categories without an entry are empty.
    ///
    /// # Errors
    /// Returns [`RewindError::Configuration`] when a dated entry of `epoch` lies outside
    /// `validity`.
    pub fn resolve(
        &self,
        epoch: &EpochId,
        validity: &ValidityRange,
        date: SnapshotDate,
    ) -> Result<ResolvedOverrides, RewindError> {
        Ok(ResolvedOverrides {
            exclusions: self.exclusions.resolve_or_default(epoch, date, validity)?,
            broken: self.broken.resolve_or_default(epoch, date, validity)?,
            dependency_additions: self.dependency_additions.resolve_or_default(epoch, date, validity)?,
            native_build_inputs: self.native_build_inputs.resolve_or_default(epoch, date, validity)?,
            runtime_inputs: self.runtime_inputs.resolve_or_default(epoch, date, validity)?,
            patches: self.patches.resolve_or_default(epoch, date, validity)?,
            build_attributes: self.build_attributes.resolve_or_default(epoch, date, validity)?,
            skip_check: self.skip_check.resolve_or_default(epoch, date, validity)?,
            needs_x: self.needs_x.resolve_or_default(epoch, date, validity)?,
            needs_rust: self.needs_rust.resolve_or_default(epoch, date, validity)?,
        })
    }
}

/// Overrides that apply to one package.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PackageOverrides {
    pub native_build_inputs: Vec<String>,
    pub runtime_inputs: Vec<String>,
    pub patches: Vec<String>,
    pub build_attributes: BTreeMap<String, String>,
    pub skip_check: bool,
    pub needs_x: bool,
    pub needs_rust: bool,
    pub broken: Option<String>,
}

/// Every category resolved for one (epoch, date).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedOverrides {
    exclusions: ExclusionTable,
    broken: ExclusionTable,
    dependency_additions: DependencyTable,
    native_build_inputs: InputTable,
    runtime_inputs: InputTable,
    patches: InputTable,
    build_attributes: AttributeTable,
    skip_check: ListTable,
    needs_x: ListTable,
    needs_rust: ListTable,
}

impl ResolvedOverrides {
    /// Exclusions that are not scoped to a partition, with their reasons.
    #[must_use]
    pub fn global_exclusions(&self) -> BTreeMap<&str, &str> {
        self.exclusions
            .iter()
            .filter(|(name, _)| !name.contains(PARTITION_SEPARATOR))
            .map(|(name, reason)| (name.as_str(), reason.as_str()))
            .collect()
    }

    #[must_use]
    pub fn partition_exclusion(&self, partition: Partition, name: &str) -> Option<&str> {
        let key = format!("{partition}{PARTITION_SEPARATOR}{name}");
        self.exclusions.get(&key).map(String::as_str)
    }

    /// Extra dependencies for `name` in `partition`, including the `all` row.
    #[must_use]
    pub fn extra_dependencies(&self, partition: Partition, name: &str) -> BTreeSet<String> {
        let Some(row) = self.dependency_additions.row(name) else {
            return BTreeSet::new();
        };
        [partition.as_str(), ALL_PARTITIONS]
            .iter()
            .filter_map(|scope| row.get(*scope))
            .flatten()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn package_overrides(&self, name: &str) -> PackageOverrides {
        PackageOverrides {
            native_build_inputs: self.native_build_inputs.get(name).cloned().unwrap_or_default(),
            runtime_inputs: self.runtime_inputs.get(name).cloned().unwrap_or_default(),
            patches: self.patches.get(name).cloned().unwrap_or_default(),
            build_attributes: self.build_attributes.row(name).cloned().unwrap_or_default(),
            skip_check: self.skip_check.contains(name),
            needs_x: self.needs_x.contains(name),
            needs_rust: self.needs_rust.contains(name),
            broken: self.broken.get(name).cloned(),
        }
    }
}
