use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, ensure};
use onebit_lamb::LambConfig;
use serde::{Deserialize, Serialize};

/// The description of a simulated data-parallel run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// The amount of ranks, each one trains on its own shard of the data.
    pub workers: usize,
    pub steps: usize,
    pub seed: u64,
    /// The amount of input features of the linear model.
    pub features: usize,
    pub samples_per_worker: usize,
    /// The amplitude of the uniform noise added to the targets.
    pub noise: f32,
    pub log_every: usize,
    pub optimizer: LambConfig,
    /// Where every rank writes its snapshot once training ends.
    pub checkpoint_dir: Option<PathBuf>,
    /// Whether to resume every rank from its snapshot in `checkpoint_dir`.
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            steps: 200,
            seed: 42,
            features: 16,
            samples_per_worker: 64,
            noise: 0.01,
            log_every: 20,
            optimizer: LambConfig {
                lr: 0.02,
                freeze_step: 50,
                weight_decay: 0.01,
                coeff_beta: 0.9,
                ..Default::default()
            },
            checkpoint_dir: None,
            resume: false,
        }
    }
}

impl RunConfig {
    /// Reads a run configuration from a json file, missing fields take their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read '{}'", path.display()))?;

        serde_json::from_str(&content).with_context(|| format!("invalid run config '{}'", path.display()))
    }

    /// Checks the run configuration and the optimizer's hyperparameters.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.workers > 0, "workers must be greater than 0");
        ensure!(self.steps > 0, "steps must be greater than 0");
        ensure!(self.features > 0, "features must be greater than 0");
        ensure!(self.samples_per_worker > 0, "samples_per_worker must be greater than 0");
        ensure!(self.log_every > 0, "log_every must be greater than 0");
        ensure!(self.noise >= 0., "noise must not be negative");
        ensure!(
            !self.resume || self.checkpoint_dir.is_some(),
            "resume requires a checkpoint_dir"
        );

        self.optimizer.validate()?;
        Ok(())
    }
}
