use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::ml::model::ModelKind;

pub const DEFAULT_CONFIG_PATH: &str = "configs/train_config.yaml";
pub const DEFAULT_EXPERIMENT_NAME: &str = "mlops-boston";
pub const DEFAULT_OUTPUT_DIR: &str = "artifacts";
/// Environment overrides look like `MLPIPE__SPLIT__TEST_SIZE=0.3`
pub const ENV_PREFIX: &str = "MLPIPE";

/// Full training configuration, read once at the start of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub seed: u64,
    pub experiment_name: String,
    pub split: SplitSettings,
    pub model: ModelSettings,
    pub dataset: DatasetSettings,
    pub outputs: OutputSettings,
    pub preprocess: PreprocessSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            experiment_name: DEFAULT_EXPERIMENT_NAME.to_string(),
            split: SplitSettings::default(),
            model: ModelSettings::default(),
            dataset: DatasetSettings::default(),
            outputs: OutputSettings::default(),
            preprocess: PreprocessSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a YAML/TOML/JSON document (format picked from the extension) with
    /// `MLPIPE__*` environment overrides layered on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: PipelineConfig = settings.try_deserialize()?;
        config.validate().map_err(|errors| PipelineError::Config(errors.join(", ")))?;

        info!("Loaded configuration from {}", path.display());
        debug!("Resolved configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(self.split.test_size > 0.0 && self.split.test_size < 1.0) {
            errors.push(format!(
                "split.test_size must be in (0, 1), got {}",
                self.split.test_size
            ));
        }
        if !(0.0..0.5).contains(&self.preprocess.contamination) {
            errors.push(format!(
                "preprocess.contamination must be in [0, 0.5), got {}",
                self.preprocess.contamination
            ));
        }
        if self.outputs.dir.as_os_str().is_empty() {
            errors.push("outputs.dir must not be empty".to_string());
        }
        if self.experiment_name.trim().is_empty() {
            errors.push("experiment_name must not be empty".to_string());
        }
        if self.dataset.name.trim().is_empty() && self.dataset.path.is_none() {
            errors.push("dataset.name or dataset.path is required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn model_kind(&self) -> Result<ModelKind> {
        self.model.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitSettings {
    pub test_size: f64,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self { test_size: 0.2 }
    }
}

/// `model.type` is the short tag; `model.name` is accepted when the tag is absent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub params: BTreeMap<String, Value>,
}

impl ModelSettings {
    pub fn kind(&self) -> Result<ModelKind> {
        match (&self.kind, &self.name) {
            (Some(tag), _) => tag.parse(),
            (None, Some(name)) => name.parse(),
            (None, None) => Ok(ModelKind::RandomForest),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    pub name: String,
    pub version: u32,
    /// Local CSV file; takes precedence over the remote source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            name: "boston".to_string(),
            version: 1,
            path: None,
            target: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub dir: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    pub normalize: bool,
    pub remove_outliers: bool,
    pub contamination: f64,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            normalize: true,
            remove_outliers: true,
            contamination: 0.05,
        }
    }
}
