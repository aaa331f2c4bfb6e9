use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Dataset source unreachable or refused the request
    #[error("Failed to retrieve dataset '{dataset}': {reason}")]
    DataAcquisition { dataset: String, reason: String },

    #[error("Malformed dataset: {0}")]
    MalformedData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported model type: '{0}' (expected one of: rf, logreg)")]
    UnsupportedModel(String),

    #[error("Invalid hyperparameters for {model} [{}]: {reason}", keys.join(", "))]
    InvalidHyperparameters {
        model: String,
        keys: Vec<String>,
        reason: String,
    },

    #[error("Model training failed: {0}")]
    Fit(String),

    #[error("Feature '{0}' required by the model is missing from the input")]
    MissingFeature(String),

    #[error("Model file not found at {}. Run `mlpipe train` first.", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Artifact store error: {0}")]
    Artifact(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    /// Failures caused by the run configuration rather than the data
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_)
                | PipelineError::UnsupportedModel(_)
                | PipelineError::InvalidHyperparameters { .. }
        )
    }

    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            PipelineError::DataAcquisition { .. } | PipelineError::MalformedData(_)
        )
    }
}

impl From<::config::ConfigError> for PipelineError {
    fn from(e: ::config::ConfigError) -> Self {
        PipelineError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyperparameter_error_names_keys() {
        let err = PipelineError::InvalidHyperparameters {
            model: "logreg".to_string(),
            keys: vec!["invalid_param".to_string(), "other".to_string()],
            reason: "unknown keys".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("invalid_param, other"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_model_not_found_mentions_remedy() {
        let err = PipelineError::ModelNotFound(PathBuf::from("artifacts/latest/model.json"));
        assert!(err.to_string().contains("mlpipe train"));
        assert!(!err.is_config_error());
        assert!(!err.is_data_error());
    }

    #[test]
    fn test_error_categories() {
        let unreachable = PipelineError::DataAcquisition {
            dataset: "boston".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(unreachable.is_data_error());
        assert!(!unreachable.is_config_error());
        assert!(PipelineError::UnsupportedModel("svm".to_string()).is_config_error());
        assert!(PipelineError::MalformedData("bad cell".to_string()).is_data_error());
    }
}
