//! Serializable orchestrator settings.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::blend::{BestModelSelector, Blender, MeanBlender};
use crate::metric::Metric;
use crate::timer::PipelineTimer;

/// Which blender closes the last level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlenderConfig {
    /// [`BestModelSelector`] ranking by `metric`.
    BestModel {
        /// Ranking metric.
        #[serde(default)]
        metric: Metric,
    },
    /// [`MeanBlender`], optionally with fixed weights.
    Mean {
        /// Per-pipeline weights; equal when absent.
        #[serde(default)]
        weights: Option<Vec<f64>>,
    },
}

impl Default for BlenderConfig {
    fn default() -> Self {
        Self::BestModel {
            metric: Metric::default(),
        }
    }
}

impl BlenderConfig {
    /// Instantiates the configured blender.
    #[must_use]
    pub fn build(&self) -> Box<dyn Blender> {
        match self {
            Self::BestModel { metric } => Box::new(BestModelSelector::new(*metric)),
            Self::Mean { weights: Some(weights) } => Box::new(MeanBlender::with_weights(weights.clone())),
            Self::Mean { weights: None } => Box::new(MeanBlender::new()),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoMlConfig {
    /// Append the original features to every inner level's input.
    pub skip_conn: bool,
    /// Global training budget in seconds; unlimited when absent.
    pub timeout_secs: Option<f64>,
    /// `0` none, `1` warnings, `2` info, `3` debug.
    pub verbose: u8,
    /// Final blender.
    pub blender: BlenderConfig,
    /// JSON-lines log file; no file logging when absent.
    pub log_path: Option<PathBuf>,
}

impl Default for AutoMlConfig {
    fn default() -> Self {
        Self {
            skip_conn: false,
            timeout_secs: None,
            verbose: 2,
            blender: BlenderConfig::default(),
            log_path: None,
        }
    }
}

impl AutoMlConfig {
    /// Loads settings from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading stacking config {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that cannot be turned into a timer or blender.
    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.timeout_secs {
            if !secs.is_finite() || secs < 0.0 {
                bail!("timeout_secs must be a non-negative number, got {secs}");
            }
        }
        if let BlenderConfig::Mean {
            weights: Some(weights),
        } = &self.blender
        {
            if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
                bail!("blender weights must be non-negative numbers");
            }
        }
        Ok(())
    }

    /// Timer honouring `timeout_secs`.
    #[must_use]
    pub fn timer(&self) -> PipelineTimer {
        let timeout = self
            .timeout_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);
        PipelineTimer::new(timeout)
    }
}
