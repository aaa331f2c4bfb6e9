//! Experiment tracking sinks.
//!
//! The orchestrator talks to a [`TrackingSink`] handle it is given; nothing
//! here holds global "active run" state. Two backends exist: an MLflow-style
//! directory tree on local disk and the MLflow REST API.

pub mod file_store;
pub mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{PipelineError, Result};

pub use file_store::FileTracker;
pub use rest::RestTracker;

pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";
pub const DEFAULT_TRACKING_URI: &str = "file:./mlruns";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records experiments, runs, parameters, metrics and artifacts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackingSink: Send + Sync {
    fn describe(&self) -> String;

    /// Look up an experiment by name, creating it when absent; returns its id
    async fn set_experiment(&self, name: &str) -> Result<String>;

    /// Open a run in the experiment; returns the run id
    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<String>;

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()>;

    async fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<()>;

    /// Copy a local file under `artifact_path` in the run's artifact area
    async fn log_artifact(&self, run_id: &str, local_path: &Path, artifact_path: &str) -> Result<()>;

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()>;
}

/// Where a tracking URI points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingTarget {
    Directory(PathBuf),
    Http(String),
}

impl TrackingTarget {
    /// `file:` URIs and plain paths are local stores; `http(s)://` is REST
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(PipelineError::Config("tracking URI is empty".to_string()));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(TrackingTarget::Http(uri.trim_end_matches('/').to_string()));
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            return Ok(TrackingTarget::Directory(PathBuf::from(rest)));
        }
        if let Some(rest) = uri.strip_prefix("file:") {
            return Ok(TrackingTarget::Directory(PathBuf::from(rest)));
        }
        if uri.contains("://") {
            return Err(PipelineError::Config(format!(
                "unsupported tracking URI scheme: {}",
                uri
            )));
        }
        Ok(TrackingTarget::Directory(PathBuf::from(uri)))
    }
}

/// Tracking URI from the environment, or the local default
pub fn tracking_uri_from_env() -> String {
    std::env::var(TRACKING_URI_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TRACKING_URI.to_string())
}

pub fn sink_from_uri(uri: &str) -> Result<Box<dyn TrackingSink>> {
    let sink: Box<dyn TrackingSink> = match TrackingTarget::parse(uri)? {
        TrackingTarget::Directory(root) => Box::new(FileTracker::new(root)),
        TrackingTarget::Http(base) => Box::new(RestTracker::new(&base)),
    };
    info!("Tracking to {}", sink.describe());
    Ok(sink)
}
