use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::{RunStatus, TrackingSink};
use crate::error::{PipelineError, Result};

const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExperimentMeta {
    experiment_id: String,
    name: String,
    creation_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub run_name: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
}

/// MLflow-style directory tree:
/// `<root>/<experiment_id>/<run_id>/{meta.json, params/, metrics/, artifacts/}`.
/// Each metric file holds `<timestamp_ms> <value> <step>` lines.
#[derive(Debug, Clone)]
pub struct FileTracker {
    root: PathBuf,
}

impl FileTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn experiments(&self) -> Result<Vec<(PathBuf, ExperimentMeta)>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let meta_path = path.join(META_FILE);
            if meta_path.is_file() {
                let meta: ExperimentMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
                found.push((path, meta));
            }
        }
        Ok(found)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        for (exp_dir, _) in self.experiments()? {
            let candidate = exp_dir.join(run_id);
            if candidate.join(META_FILE).is_file() {
                return Ok(candidate);
            }
        }
        Err(PipelineError::Tracking(format!("unknown run id {}", run_id)))
    }

    pub fn run_meta(&self, run_id: &str) -> Result<RunMeta> {
        let path = self.run_dir(run_id)?.join(META_FILE);
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Directory holding the run's artifacts
    pub fn artifact_dir(&self, run_id: &str) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join("artifacts"))
    }

    fn write_run_meta(&self, run_dir: &Path, meta: &RunMeta) -> Result<()> {
        fs::write(run_dir.join(META_FILE), serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }
}

/// Keys become file names, so they must stay inside their directory
fn checked_key(key: &str) -> Result<&str> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".." {
        return Err(PipelineError::Tracking(format!("invalid key '{}'", key)));
    }
    Ok(key)
}

#[async_trait]
impl TrackingSink for FileTracker {
    fn describe(&self) -> String {
        format!("file:{}", self.root.display())
    }

    async fn set_experiment(&self, name: &str) -> Result<String> {
        let experiments = self.experiments()?;
        if let Some((_, meta)) = experiments.iter().find(|(_, m)| m.name == name) {
            debug!("Using experiment '{}' ({})", name, meta.experiment_id);
            return Ok(meta.experiment_id.clone());
        }

        let next_id = experiments
            .iter()
            .filter_map(|(_, m)| m.experiment_id.parse::<u64>().ok())
            .max()
            .map_or(1, |id| id + 1)
            .to_string();
        let exp_dir = self.root.join(&next_id);
        fs::create_dir_all(&exp_dir)?;
        let meta = ExperimentMeta {
            experiment_id: next_id.clone(),
            name: name.to_string(),
            creation_time: Utc::now().timestamp_millis(),
        };
        fs::write(exp_dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?)?;
        debug!("Created experiment '{}' ({})", name, next_id);
        Ok(next_id)
    }

    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<String> {
        let exp_dir = self.root.join(checked_key(experiment_id)?);
        if !exp_dir.join(META_FILE).is_file() {
            return Err(PipelineError::Tracking(format!(
                "unknown experiment id {}",
                experiment_id
            )));
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = exp_dir.join(&run_id);
        for sub in ["params", "metrics", "artifacts"] {
            fs::create_dir_all(run_dir.join(sub))?;
        }
        let meta = RunMeta {
            run_id: run_id.clone(),
            run_name: run_name.to_string(),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            start_time: Utc::now().timestamp_millis(),
            end_time: None,
        };
        self.write_run_meta(&run_dir, &meta)?;
        Ok(run_id)
    }

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let dir = self.run_dir(run_id)?.join("params");
        for (key, value) in params {
            fs::write(dir.join(checked_key(key)?), value)?;
        }
        debug!("Logged {} params to run {}", params.len(), run_id);
        Ok(())
    }

    async fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let dir = self.run_dir(run_id)?.join("metrics");
        let timestamp = Utc::now().timestamp_millis();
        for (key, value) in metrics {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(checked_key(key)?))?;
            writeln!(file, "{} {} 0", timestamp, value)?;
        }
        debug!("Logged {} metrics to run {}", metrics.len(), run_id);
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, local_path: &Path, artifact_path: &str) -> Result<()> {
        let file_name = local_path.file_name().ok_or_else(|| {
            PipelineError::Tracking(format!("artifact {} has no file name", local_path.display()))
        })?;
        let mut dest = self.artifact_dir(run_id)?;
        for part in artifact_path.split('/').filter(|p| !p.is_empty()) {
            dest.push(checked_key(part)?);
        }
        fs::create_dir_all(&dest)?;
        fs::copy(local_path, dest.join(file_name))?;
        debug!("Logged artifact {} to run {}", local_path.display(), run_id);
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let run_dir = self.run_dir(run_id)?;
        let mut meta = self.run_meta(run_id)?;
        meta.status = status;
        meta.end_time = Some(Utc::now().timestamp_millis());
        self.write_run_meta(&run_dir, &meta)?;
        debug!("Run {} ended with status {}", run_id, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_experiment_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path().join("mlruns"));

        let a = tracker.set_experiment("mlops-boston").await.unwrap();
        let b = tracker.set_experiment("mlops-boston").await.unwrap();
        let c = tracker.set_experiment("other").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "1");
        assert_eq!(c, "2");
    }

    #[tokio::test]
    async fn test_run_lifecycle_writes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        let exp = tracker.set_experiment("exp").await.unwrap();
        let run = tracker.start_run(&exp, "logreg-classification").await.unwrap();
        assert_eq!(tracker.run_meta(&run).unwrap().status, RunStatus::Running);

        let params = BTreeMap::from([("seed".to_string(), "42".to_string())]);
        tracker.log_params(&run, &params).await.unwrap();
        let metrics = BTreeMap::from([("accuracy".to_string(), 0.875)]);
        tracker.log_metrics(&run, &metrics).await.unwrap();

        let model = dir.path().join("model.json");
        fs::write(&model, "{}").unwrap();
        tracker.log_artifact(&run, &model, "model").await.unwrap();
        tracker.end_run(&run, RunStatus::Finished).await.unwrap();

        let run_dir = dir.path().join(&exp).join(&run);
        assert_eq!(fs::read_to_string(run_dir.join("params/seed")).unwrap(), "42");
        let line = fs::read_to_string(run_dir.join("metrics/accuracy")).unwrap();
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields[1], "0.875");
        assert_eq!(fields[2], "0");
        assert!(run_dir.join("artifacts/model/model.json").is_file());

        let meta = tracker.run_meta(&run).unwrap();
        assert_eq!(meta.status, RunStatus::Finished);
        assert!(meta.end_time.is_some());
        assert_eq!(meta.run_name, "logreg-classification");
    }

    #[tokio::test]
    async fn test_unknown_run_and_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        let err = tracker.end_run("nope", RunStatus::Failed).await.unwrap_err();
        assert!(matches!(err, PipelineError::Tracking(_)));

        let exp = tracker.set_experiment("exp").await.unwrap();
        let run = tracker.start_run(&exp, "r").await.unwrap();
        let params = BTreeMap::from([("../escape".to_string(), "x".to_string())]);
        assert!(tracker.log_params(&run, &params).await.is_err());
        assert!(tracker.start_run("99", "r").await.is_err());
    }
}
