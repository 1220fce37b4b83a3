use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rewind_core::{EpochId, OverrideRegistry, OverrideRegistryBuilder, Partition, SnapshotDate, ValidityRange};
use serde::{Deserialize, Serialize};

/// URL templates of the primary registry. Placeholders: `{date}`, `{name}`, `{version}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PrimaryConfig {
    pub index_url: String,
    pub listing_url: String,
    pub tarball_url: String,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            index_url: "https://packagemanager.posit.co/cran/{date}/src/contrib/PACKAGES.gz".to_string(),
            listing_url: "https://packagemanager.posit.co/cran/{date}/src/contrib/".to_string(),
            tarball_url: "https://packagemanager.posit.co/cran/{date}/src/contrib/{name}_{version}.tar.gz"
                .to_string(),
        }
    }
}

/// URL templates of the secondary registry. Placeholders: `{epoch}`, `{partition}`, `{name}`,
/// `{version}`; `{partition}` expands through `partition_paths`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecondaryConfig {
    pub index_url: String,
    pub tarball_url: String,
    #[serde(default = "default_partition_paths")]
    pub partition_paths: BTreeMap<Partition, String>,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            index_url: "https://bioconductor.org/packages/{epoch}/{partition}/src/contrib/PACKAGES".to_string(),
            tarball_url: "https://bioconductor.org/packages/{epoch}/{partition}/src/contrib/{name}_{version}.tar.gz"
                .to_string(),
            partition_paths: default_partition_paths(),
        }
    }
}

fn default_partition_paths() -> BTreeMap<Partition, String> {
    BTreeMap::from([
        (Partition::Software, "bioc".to_string()),
        (Partition::Annotation, "data/annotation".to_string()),
        (Partition::Experiment, "data/experiment".to_string()),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReleaseConfig {
    pub epoch: EpochId,
    pub start: SnapshotDate,
    #[serde(default)]
    pub end: Option<SnapshotDate>,
    #[serde(default)]
    pub archived: bool,
}

impl ReleaseConfig {
    #[must_use]
    pub fn validity(&self) -> ValidityRange {
        ValidityRange { start: self.start, end: self.end }
    }
}

/// Contents of `rewind.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RewindConfig {
    #[serde(default)]
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub secondary: SecondaryConfig,
    #[serde(default)]
    pub releases: Vec<ReleaseConfig>,
    /// Overrides file, relative to the config file.
    #[serde(default)]
    pub overrides: Option<PathBuf>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl RewindConfig {
    /// Parse a config document.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed or names unknown fields.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse rewind config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `rewind.yaml` from `path`; relative paths inside resolve against its directory.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for partition in Partition::SECONDARY {
            if !self.secondary.partition_paths.contains_key(&partition) {
                return Err(anyhow!("secondary.partition_paths is missing `{partition}`"));
            }
        }
        for release in &self.releases {
            if release.end.is_some_and(|end| end <= release.start) {
                return Err(anyhow!("release {} ends before it starts", release.epoch));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn overrides_path(&self) -> Option<PathBuf> {
        let path = self.overrides.as_ref()?;
        Some(match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.clone(),
        })
    }

    /// Build the override registry from the configured file; no file means no overrides.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or fails validation.
    pub fn load_overrides(&self) -> Result<OverrideRegistry> {
        let Some(path) = self.overrides_path() else {
            return Ok(OverrideRegistry::default());
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read overrides file {}", path.display()))?;
        let registry = OverrideRegistryBuilder::from_yaml_str(&raw)
            .and_then(OverrideRegistryBuilder::build)
            .with_context(|| format!("invalid overrides file {}", path.display()))?;
        Ok(registry)
    }

    #[must_use]
    pub fn release(&self, epoch: &EpochId) -> Option<&ReleaseConfig> {
        self.releases.iter().find(|release| &release.epoch == epoch)
    }

    /// # Errors
    /// Returns an error when the template leaves a placeholder unfilled.
    pub fn primary_index_url(&self, date: SnapshotDate) -> Result<String> {
        expand_template(&self.primary.index_url, &[("date", &date.to_string())])
    }

    /// # Errors
    /// Returns an error when the template leaves a placeholder unfilled.
    pub fn primary_listing_url(&self, date: SnapshotDate) -> Result<String> {
        expand_template(&self.primary.listing_url, &[("date", &date.to_string())])
    }

    /// # Errors
    /// Returns an error when the partition has no path or a placeholder is left unfilled.
    pub fn secondary_index_url(&self, epoch: &EpochId, partition: Partition) -> Result<String> {
        let path = self.partition_path(partition)?;
        expand_template(&self.secondary.index_url, &[("epoch", epoch.as_str()), ("partition", path)])
    }

    /// Origin URL of one package archive.
    ///
    /// # Errors
    /// Returns an error when the partition has no path or a placeholder is left unfilled.
    pub fn tarball_url(
        &self,
        partition: Partition,
        epoch: &EpochId,
        date: SnapshotDate,
        name: &str,
        version: &str,
    ) -> Result<String> {
        if partition.is_secondary() {
            let path = self.partition_path(partition)?;
            expand_template(
                &self.secondary.tarball_url,
                &[("epoch", epoch.as_str()), ("partition", path), ("name", name), ("version", version)],
            )
        } else {
            expand_template(
                &self.primary.tarball_url,
                &[("date", &date.to_string()), ("name", name), ("version", version)],
            )
        }
    }

    fn partition_path(&self, partition: Partition) -> Result<&str> {
        self.secondary
            .partition_paths
            .get(&partition)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no path configured for partition {partition}"))
    }
}

/// Replace `{key}` placeholders; any placeholder left over is an error.
///
/// # Errors
/// Returns an error naming the template when a `{...}` placeholder remains.
pub fn expand_template(template: &str, values: &[(&str, &str)]) -> Result<String> {
    let mut expanded = template.to_string();
    for (key, value) in values {
        expanded = expanded.replace(&format!("{{{key}}}"), value);
    }
    if let Some(start) = expanded.find('{') {
        let placeholder = expanded[start..].split_inclusive('}').next().unwrap_or_default();
        return Err(anyhow!("template `{template}` has unfilled placeholder {placeholder}"));
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
primary:
  index_url: "https://cran.example/{date}/src/contrib/PACKAGES.gz"
  listing_url: "https://cran.example/{date}/src/contrib/"
  tarball_url: "https://cran.example/{date}/src/contrib/{name}_{version}.tar.gz"
releases:
  - epoch: "3.12"
    start: "2020-10-28"
    end: "2021-05-20"
  - epoch: "3.13"
    start: "2021-05-20"
    archived: true
overrides: overrides.yaml
"#;

    fn date(raw: &str) -> Result<SnapshotDate> {
        Ok(SnapshotDate::parse(raw)?)
    }

    #[test]
    fn sample_config_parses_with_secondary_defaults() -> Result<()> {
        let config = RewindConfig::from_yaml_str(SAMPLE)?;
        assert_eq!(config.releases.len(), 2);
        assert_eq!(config.release(&EpochId::new("3.13")).map(|release| release.archived), Some(true));
        assert_eq!(config.secondary, SecondaryConfig::default());
        assert_eq!(config.overrides_path(), Some(PathBuf::from("overrides.yaml")));
        Ok(())
    }

    #[test]
    fn urls_expand_from_templates() -> Result<()> {
        let config = RewindConfig::from_yaml_str(SAMPLE)?;
        let day = date("2021-06-01")?;
        let epoch = EpochId::new("3.13");

        assert_eq!(config.primary_index_url(day)?, "https://cran.example/2021-06-01/src/contrib/PACKAGES.gz");
        assert_eq!(
            config.tarball_url(Partition::Cran, &epoch, day, "zoo", "1.8-9")?,
            "https://cran.example/2021-06-01/src/contrib/zoo_1.8-9.tar.gz"
        );
        assert_eq!(
            config.tarball_url(Partition::Annotation, &epoch, day, "org.Hs.eg.db", "3.13.0")?,
            "https://bioconductor.org/packages/3.13/data/annotation/src/contrib/org.Hs.eg.db_3.13.0.tar.gz"
        );
        assert_eq!(
            config.secondary_index_url(&epoch, Partition::Software)?,
            "https://bioconductor.org/packages/3.13/bioc/src/contrib/PACKAGES"
        );
        Ok(())
    }

    #[test]
    fn unfilled_placeholder_is_reported() {
        let result = expand_template("https://x/{date}/{mirror}", &[("date", "2021-06-01")]);
        let Err(err) = result else {
            panic!("unfilled placeholder must fail");
        };
        assert!(err.to_string().contains("{mirror}"));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(RewindConfig::from_yaml_str("mirrors: []\n").is_err());
        let inverted = r#"
releases:
  - epoch: "3.13"
    start: "2021-10-27"
    end: "2021-05-20"
"#;
        assert!(RewindConfig::from_yaml_str(inverted).is_err());
    }

    #[test]
    fn missing_overrides_file_means_empty_registry() -> Result<()> {
        let registry = RewindConfig::default().load_overrides()?;
        assert_eq!(registry.entry_count(), 0);
        Ok(())
    }
}
