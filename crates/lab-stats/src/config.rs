use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StatsError, StatsResult};
use crate::profile::Variant;

/// Per-deployment knobs layered over the built-in profile, read from YAML.
///
/// ```yaml
/// variant: replica
/// cut_start_percent: 30
/// cut_end_percent: 20
/// load_start:
///   enabled: true
///   column: nrReceived
///   canary_count: 1
///   idle_count: 0
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsConfig {
    #[serde(default)]
    pub variant: Variant,
    #[serde(default)]
    pub cut_start_percent: Option<u32>,
    #[serde(default)]
    pub cut_end_percent: Option<u32>,
    #[serde(default)]
    pub load_start: Option<LoadStartConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadStartConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub canary_count: Option<i64>,
    #[serde(default)]
    pub idle_count: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

impl StatsConfig {
    pub fn load(path: &Path) -> StatsResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw).map_err(|e| match e {
            StatsError::Config(msg) => StatsError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str) -> StatsResult<Self> {
        let config: StatsConfig =
            serde_yaml::from_str(raw).map_err(|e| StatsError::Config(e.to_string()))?;
        for pct in [config.cut_start_percent, config.cut_end_percent]
            .into_iter()
            .flatten()
        {
            if pct > 100 {
                return Err(StatsError::Config(format!(
                    "cut percentage {} exceeds 100",
                    pct
                )));
            }
        }
        Ok(config)
    }
}
