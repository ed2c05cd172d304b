//! Engine configuration
//!
//! Provides the options the engine consumes at startup, loadable from a
//! file with `SIM_`-prefixed environment overrides.

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::time::TimeUnit;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Unit adopted by bare time literals
    pub base_time_unit: TimeUnit,
    /// Maximum stream index usable by the model
    pub streams_per_run: u32,
    /// Maximum run index
    pub max_replications: u32,
    /// Element-id globs whose data emission is skipped entirely
    pub disable_elements: Vec<String>,
    /// Per-dataset emission filters
    pub disable_datasets: Vec<DatasetFilter>,
    /// Engine event-trace knobs
    pub trace: TraceConfig,
}

/// One `(element glob, dataset glob)` disable rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetFilter {
    /// Glob matched against the owning element id
    pub element: String,
    /// Glob matched against the dataset name
    pub dataset: String,
}

/// Event-trace configuration; trace formatting itself lives outside the
/// engine, these knobs only gate the engine's structured emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    /// Stop emitting after this many events
    pub max_events: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_events: 100_000,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            base_time_unit: TimeUnit::None,
            streams_per_run: 2000,
            max_replications: 100,
            disable_elements: Vec::new(),
            disable_datasets: Vec::new(),
            trace: TraceConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load from a configuration file, then apply `SIM_`-prefixed
    /// environment overrides (`SIM_STREAMS_PER_RUN=500`, ...).
    pub fn load(path: &str) -> SimResult<Self> {
        let cfg: SimConfig = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SIM"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment-only variant for embedded use
    pub fn from_env() -> SimResult<Self> {
        let cfg: SimConfig = config::Config::builder()
            .add_source(config::Environment::with_prefix("SIM"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> SimResult<()> {
        if self.streams_per_run == 0 {
            return Err(SimError::Config(
                "streams_per_run must be positive".to_string(),
            ));
        }
        if self.max_replications == 0 {
            return Err(SimError::Config(
                "max_replications must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
