//! Configuration for training and evaluation runs.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace `facebmi.toml` -> explicit file -> environment (`FACEBMI_*`).

use crate::error::{MlError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the workspace-level config file.
pub const WORKSPACE_CONFIG_FILE: &str = "facebmi.toml";

/// Static paths and constants consumed by the trainer and the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacebmiConfig {
    /// Directory holding the cropped face images referenced by both manifests.
    #[serde(default = "default_cropped_imgs_dir")]
    pub cropped_imgs_dir: PathBuf,
    /// Comma-separated info file; its tail is the held-out set.
    #[serde(default = "default_cropped_imgs_info_file")]
    pub cropped_imgs_info_file: PathBuf,
    /// Directory holding `training_samples_<cutoff>_cutoff.csv` manifests.
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    /// Number of trailing info-file lines used for validation and testing.
    #[serde(default = "default_validation_size")]
    pub validation_size: usize,
    /// Square edge used by the evaluator when resizing images.
    #[serde(default = "default_img_width")]
    pub default_img_width: usize,
    #[serde(default = "default_weights_dir")]
    pub weights_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Sub-directory of `log_dir` that groups scalar logs for related runs.
    #[serde(default = "default_log_group")]
    pub log_group: String,
    /// Fail a training phase when the training manifest shares images with
    /// the held-out slice, instead of only warning.
    #[serde(default)]
    pub strict_split: bool,
}

impl Default for FacebmiConfig {
    fn default() -> Self {
        Self {
            cropped_imgs_dir: default_cropped_imgs_dir(),
            cropped_imgs_info_file: default_cropped_imgs_info_file(),
            manifest_dir: default_manifest_dir(),
            train_batch_size: default_train_batch_size(),
            validation_size: default_validation_size(),
            default_img_width: default_img_width(),
            weights_dir: default_weights_dir(),
            log_dir: default_log_dir(),
            log_group: default_log_group(),
            strict_split: false,
        }
    }
}

fn default_cropped_imgs_dir() -> PathBuf {
    PathBuf::from("data/cropped")
}

fn default_cropped_imgs_info_file() -> PathBuf {
    PathBuf::from("data/cropped_info.csv")
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_train_batch_size() -> usize {
    16
}

fn default_validation_size() -> usize {
    1000
}

fn default_img_width() -> usize {
    224
}

fn default_weights_dir() -> PathBuf {
    PathBuf::from("weights")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_group() -> String {
    "quartiles2".to_string()
}

impl FacebmiConfig {
    /// Reject values that would make batching or evaluation meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.train_batch_size == 0 {
            return Err(MlError::config("train_batch_size must be at least 1"));
        }
        if self.validation_size == 0 {
            return Err(MlError::config("validation_size must be at least 1"));
        }
        if self.default_img_width == 0 {
            return Err(MlError::config("default_img_width must be at least 1"));
        }
        if self.log_group.trim().is_empty() {
            return Err(MlError::config("log_group must not be empty"));
        }
        Ok(())
    }

    /// Path of the training manifest for a cutoff selector.
    pub fn training_manifest(&self, cutoff: &str) -> PathBuf {
        self.manifest_dir
            .join(format!("training_samples_{cutoff}_cutoff.csv"))
    }
}

/// Load configuration from all layers and validate it.
pub fn load_config(workspace: Option<&Path>, extra_file: Option<&Path>) -> Result<FacebmiConfig> {
    let mut figment = Figment::from(Serialized::defaults(FacebmiConfig::default()));

    // User-level config
    if let Some(dirs) = directories::ProjectDirs::from("dev", "facebmi", "facebmi") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // An explicitly requested file must exist.
    if let Some(path) = extra_file {
        if !path.exists() {
            return Err(MlError::not_found(format!(
                "config file {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // Environment variables (FACEBMI_TRAIN_BATCH_SIZE, FACEBMI_WEIGHTS_DIR, etc.)
    figment = figment.merge(Env::prefixed("FACEBMI_").split("__"));

    let config: FacebmiConfig = figment
        .extract()
        .map_err(|e| MlError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
