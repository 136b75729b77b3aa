//! TOML config loading for the trainer CLI.
//!
//! Deserializes `configs/train.toml` which has `[data]`, `[model]`, `[loss]`,
//! `[optim]` and `[trainer]` sections, then merges with CLI overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use gnnet::model::pyramid::GnNetConfig;
use gnnet::training::gn_loss::GnLossConfig;
use gnnet::training::supervisor::TrainerConfig;
use gnnet::training::synthetic::SyntheticPairsConfig;
use serde::{Deserialize, Serialize};

/// Top-level structure matching `configs/train.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainToml {
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub loss: LossSection,
    #[serde(default)]
    pub optim: OptimSection,
    #[serde(default)]
    pub trainer: TrainerSection,
}

/// Synthetic pair generation and the train/validation split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSection {
    #[serde(default = "default_num_pairs")]
    pub num_pairs: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_image_size")]
    pub height: usize,
    #[serde(default = "default_image_size")]
    pub width: usize,
    /// Correspondences generated per pair.
    #[serde(default = "default_matches_per_pair")]
    pub matches_per_pair: usize,
    #[serde(default = "default_max_shift")]
    pub max_shift: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fraction of pairs held out for validation.
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f64,
    /// Seed of the split.
    #[serde(default)]
    pub split_seed: u64,
    /// Seed of the pair generator.
    #[serde(default)]
    pub seed: u64,
    /// Per-epoch shuffle seed of the training loader.
    #[serde(default)]
    pub shuffle_seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
}

/// Weights and margins of the triplet + GN loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossSection {
    #[serde(default = "default_margin_pos")]
    pub margin_pos: f64,
    #[serde(default = "default_one")]
    pub margin_neg: f64,
    #[serde(default = "default_one")]
    pub margin: f64,
    #[serde(default = "default_one")]
    pub contrastive_lamda: f64,
    #[serde(default = "default_gn_lamda")]
    pub gn_lamda: f64,
    #[serde(default = "default_one")]
    pub e1_lamda: f64,
    #[serde(default = "default_one")]
    pub e2_lamda: f64,
    /// Ratio between stored coordinates and level-0 pixels.
    #[serde(default = "default_img_scale")]
    pub img_scale: f64,
    /// Upper bound on matches used per batch.
    #[serde(default = "default_num_matches")]
    pub num_matches: usize,
}

/// AdamW and the step learning-rate schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimSection {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Epochs between decays; 0 keeps the rate constant.
    #[serde(default = "default_step_size")]
    pub scheduler_step_size: usize,
    #[serde(default = "default_gamma")]
    pub scheduler_gamma: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSection {
    #[serde(default = "default_total_epochs")]
    pub total_epochs: usize,
    /// Run validation at all.
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default = "default_validation_frequency")]
    pub validation_frequency: usize,
    #[serde(default = "default_best_min_epochs")]
    pub best_checkpoint_min_epochs: usize,
    /// Re-draw convolution weights before the first epoch.
    #[serde(default)]
    pub init_weights: bool,
    #[serde(default = "default_true")]
    pub save_initial_weights: bool,
    #[serde(default = "default_true")]
    pub show_progress: bool,
    #[serde(default = "default_save_root")]
    pub save_root: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_num_pairs() -> usize {
    200
}
fn default_channels() -> usize {
    3
}
fn default_image_size() -> usize {
    64
}
fn default_matches_per_pair() -> usize {
    128
}
fn default_max_shift() -> usize {
    4
}
fn default_batch_size() -> usize {
    4
}
fn default_val_fraction() -> f64 {
    0.1
}
fn default_feature_dim() -> usize {
    16
}
fn default_margin_pos() -> f64 {
    0.2
}
fn default_one() -> f64 {
    1.0
}
fn default_gn_lamda() -> f64 {
    0.003
}
fn default_img_scale() -> f64 {
    2.0
}
fn default_num_matches() -> usize {
    1024
}
fn default_lr() -> f64 {
    1e-6
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_step_size() -> usize {
    1
}
fn default_gamma() -> f64 {
    0.85
}
fn default_total_epochs() -> usize {
    50
}
fn default_true() -> bool {
    true
}
fn default_validation_frequency() -> usize {
    1
}
fn default_best_min_epochs() -> usize {
    20
}
fn default_save_root() -> PathBuf {
    PathBuf::from("checkpoints/gnnet")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("runs/gnnet")
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            num_pairs: default_num_pairs(),
            channels: default_channels(),
            height: default_image_size(),
            width: default_image_size(),
            matches_per_pair: default_matches_per_pair(),
            max_shift: default_max_shift(),
            batch_size: default_batch_size(),
            val_fraction: default_val_fraction(),
            split_seed: 0,
            seed: 0,
            shuffle_seed: 0,
        }
    }
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            feature_dim: default_feature_dim(),
        }
    }
}

impl Default for LossSection {
    fn default() -> Self {
        Self {
            margin_pos: default_margin_pos(),
            margin_neg: default_one(),
            margin: default_one(),
            contrastive_lamda: default_one(),
            gn_lamda: default_gn_lamda(),
            e1_lamda: default_one(),
            e2_lamda: default_one(),
            img_scale: default_img_scale(),
            num_matches: default_num_matches(),
        }
    }
}

impl Default for OptimSection {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            scheduler_step_size: default_step_size(),
            scheduler_gamma: default_gamma(),
        }
    }
}

impl Default for TrainerSection {
    fn default() -> Self {
        Self {
            total_epochs: default_total_epochs(),
            validate: true,
            validation_frequency: default_validation_frequency(),
            best_checkpoint_min_epochs: default_best_min_epochs(),
            init_weights: false,
            save_initial_weights: true,
            show_progress: true,
            save_root: default_save_root(),
            log_dir: default_log_dir(),
        }
    }
}

/// CLI flags that take priority over the TOML file.
#[derive(Debug, Default, Clone)]
pub struct TrainOverrides {
    pub save_root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub epochs: Option<usize>,
    pub lr: Option<f64>,
    pub batch_size: Option<usize>,
    pub no_validation: bool,
    pub no_progress: bool,
}

impl TrainToml {
    /// Load `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded train config");
        Ok(config)
    }

    /// Priority chain: defaults < TOML values < CLI flags.
    pub fn apply(&mut self, overrides: &TrainOverrides) {
        if let Some(dir) = &overrides.save_root {
            self.trainer.save_root = dir.clone();
        }
        if let Some(dir) = &overrides.log_dir {
            self.trainer.log_dir = dir.clone();
        }
        if let Some(n) = overrides.epochs {
            self.trainer.total_epochs = n;
        }
        if let Some(lr) = overrides.lr {
            self.optim.lr = lr;
        }
        if let Some(n) = overrides.batch_size {
            self.data.batch_size = n;
        }
        if overrides.no_validation {
            self.trainer.validate = false;
        }
        if overrides.no_progress {
            self.trainer.show_progress = false;
        }
    }

    /// Write the resolved config next to the run's scalars.
    pub fn dump(&self, path: &Path) -> anyhow::Result<()> {
        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn synthetic_config(&self) -> SyntheticPairsConfig {
        let d = &self.data;
        SyntheticPairsConfig::new()
            .with_num_pairs(d.num_pairs)
            .with_channels(d.channels)
            .with_height(d.height)
            .with_width(d.width)
            .with_num_matches(d.matches_per_pair)
            .with_max_shift(d.max_shift)
            .with_coord_scale(self.loss.img_scale)
            .with_seed(d.seed)
    }

    pub fn model_config(&self) -> GnNetConfig {
        GnNetConfig::new()
            .with_channels_in(self.data.channels)
            .with_feature_dim(self.model.feature_dim)
    }

    pub fn loss_config(&self) -> GnLossConfig {
        let l = &self.loss;
        GnLossConfig::new()
            .with_margin_pos(l.margin_pos)
            .with_margin_neg(l.margin_neg)
            .with_margin(l.margin)
            .with_contrastive_lamda(l.contrastive_lamda)
            .with_gn_lamda(l.gn_lamda)
            .with_e1_lamda(l.e1_lamda)
            .with_e2_lamda(l.e2_lamda)
            .with_img_scale(l.img_scale)
            .with_num_matches(l.num_matches)
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        let t = &self.trainer;
        TrainerConfig::new()
            .with_total_epochs(t.total_epochs)
            .with_validation_frequency(t.validation_frequency)
            .with_best_checkpoint_min_epochs(t.best_checkpoint_min_epochs)
            .with_init_weights(t.init_weights)
            .with_save_initial_weights(t.save_initial_weights)
            .with_show_progress(t.show_progress)
            .with_save_root(t.save_root.to_string_lossy().into_owned())
            .with_log_dir(t.log_dir.to_string_lossy().into_owned())
    }
}
