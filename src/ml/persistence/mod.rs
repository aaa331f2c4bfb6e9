//! Run artifacts on the local filesystem.
//!
//! Each training run owns a directory `<base>/<YYYYMMDD_HHMMSS>` holding the
//! serialized model (`model.json`) and its manifest (`run.json`). The alias
//! `<base>/latest` always points at the lexicographically greatest run
//! directory, which is also the most recent one.

use chrono::{DateTime, Local, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::metrics::MetricsRecord;
use super::model::{ModelKind, TrainedModel};
use crate::data::Task;
use crate::error::{PipelineError, Result};

pub const MODEL_FILE: &str = "model.json";
pub const MANIFEST_FILE: &str = "run.json";
pub const PREDICTIONS_FILE: &str = "predictions.csv";
pub const LATEST_ALIAS: &str = "latest";
pub const RUN_DIR_FORMAT: &str = "%Y%m%d_%H%M%S";
/// Same-second runs get `_01`..`_99`
const MAX_COLLISION_SUFFIX: u32 = 99;

/// Summary of one run, written next to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub run_name: String,
    pub created_at: DateTime<Utc>,
    pub model_type: ModelKind,
    pub task: Task,
    pub seed: u64,
    pub train_rows: usize,
    pub test_rows: usize,
    /// Non-finite scores are written as `null`
    pub metrics: MetricsRecord,
    pub model_file: String,
    pub model_sha256: String,
    pub config: serde_json::Value,
}

/// Timestamped run directories under one base directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create `<base>/<YYYYMMDD_HHMMSS>` for the current local time
    pub fn create_run_directory(&self) -> Result<PathBuf> {
        let stamp = Local::now().format(RUN_DIR_FORMAT).to_string();
        self.create_run_directory_named(&stamp)
    }

    fn create_run_directory_named(&self, stamp: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.base_dir)?;

        let candidates = std::iter::once(stamp.to_string())
            .chain((1..=MAX_COLLISION_SUFFIX).map(|n| format!("{}_{:02}", stamp, n)));
        for name in candidates {
            let path = self.base_dir.join(&name);
            match fs::create_dir(&path) {
                Ok(()) => {
                    info!("Created run directory {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Run directory {} exists, trying next suffix", name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::Artifact(format!(
            "more than {} runs started at {} in {}",
            MAX_COLLISION_SUFFIX + 1,
            stamp,
            self.base_dir.display()
        )))
    }

    /// Point `alias` at `target`, or at the greatest run directory when no
    /// target is given. Returns the directory the alias now points to, or
    /// `None` when there was nothing to point at.
    pub fn update_latest_alias(&self, alias: &str, target: Option<&Path>) -> Result<Option<PathBuf>> {
        let dir_name = match target {
            Some(target) => {
                let name = target
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        PipelineError::Artifact(format!("invalid alias target {}", target.display()))
                    })?
                    .to_string();
                if !self.base_dir.join(&name).is_dir() {
                    return Err(PipelineError::Artifact(format!(
                        "alias target {} is not a directory in {}",
                        name,
                        self.base_dir.display()
                    )));
                }
                name
            }
            None => match self.newest_run_dir(alias)? {
                Some(name) => name,
                None => {
                    debug!("No run directories in {}, alias untouched", self.base_dir.display());
                    return Ok(None);
                }
            },
        };

        self.point_alias(alias, &dir_name)?;
        let resolved = self.base_dir.join(&dir_name);
        info!("Alias {} -> {}", alias, dir_name);
        Ok(Some(resolved))
    }

    /// Where `alias` currently points, if it exists
    pub fn resolve_alias(&self, alias: &str) -> Result<Option<PathBuf>> {
        match self.read_alias(alias) {
            Ok(name) => Ok(Some(self.base_dir.join(name))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Immediate subdirectories, excluding the alias, symlinks and dot entries
    fn run_directories(&self, alias: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == alias || name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    fn newest_run_dir(&self, alias: &str) -> Result<Option<String>> {
        if !self.base_dir.is_dir() {
            return Ok(None);
        }
        Ok(self.run_directories(alias)?.into_iter().max())
    }

    #[cfg(unix)]
    fn alias_path(&self, alias: &str) -> PathBuf {
        self.base_dir.join(alias)
    }

    #[cfg(not(unix))]
    fn alias_path(&self, alias: &str) -> PathBuf {
        self.base_dir.join(format!("{}.txt", alias))
    }

    /// Relative symlink created beside the alias, then renamed over it
    #[cfg(unix)]
    fn point_alias(&self, alias: &str, dir_name: &str) -> Result<()> {
        let tmp = self
            .base_dir
            .join(format!(".{}.{}.tmp", alias, Uuid::new_v4().simple()));
        std::os::unix::fs::symlink(dir_name, &tmp)?;
        if let Err(e) = fs::rename(&tmp, self.alias_path(alias)) {
            let _ = fs::remove_file(&tmp);
            return Err(PipelineError::Artifact(format!(
                "failed to replace alias {}: {}",
                alias, e
            )));
        }
        Ok(())
    }

    /// Pointer file holding the directory name, replaced via temp file + rename
    #[cfg(not(unix))]
    fn point_alias(&self, alias: &str, dir_name: &str) -> Result<()> {
        let tmp = self
            .base_dir
            .join(format!(".{}.{}.tmp", alias, Uuid::new_v4().simple()));
        fs::write(&tmp, dir_name)?;
        if let Err(e) = fs::rename(&tmp, self.alias_path(alias)) {
            let _ = fs::remove_file(&tmp);
            return Err(PipelineError::Artifact(format!(
                "failed to replace alias {}: {}",
                alias, e
            )));
        }
        Ok(())
    }

    #[cfg(unix)]
    fn read_alias(&self, alias: &str) -> std::io::Result<PathBuf> {
        fs::read_link(self.alias_path(alias))
    }

    #[cfg(not(unix))]
    fn read_alias(&self, alias: &str) -> std::io::Result<PathBuf> {
        Ok(PathBuf::from(fs::read_to_string(self.alias_path(alias))?.trim()))
    }
}

/// Serialize the model to JSON at `path`; returns the SHA-256 of the bytes written
pub fn persist_model(model: &TrainedModel, path: &Path) -> Result<String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(model)?;
    fs::write(path, &bytes)?;
    let digest = hex::encode(Sha256::digest(&bytes));
    info!(
        "Saved {} model to {} (sha256 {})",
        model.kind.long_name(),
        path.display(),
        &digest[..12]
    );
    Ok(digest)
}

pub fn load_model(path: &Path) -> Result<TrainedModel> {
    if !path.exists() {
        return Err(PipelineError::ModelNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let model: TrainedModel = serde_json::from_slice(&bytes)?;
    info!(
        "Loaded {} model from {} ({} features, trained {})",
        model.kind.long_name(),
        path.display(),
        model.feature_names.len(),
        model.trained_at.to_rfc3339()
    );
    Ok(model)
}

/// Single `prediction` column, no index
pub fn save_predictions(predictions: &Array1<f64>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["prediction"])?;
    for p in predictions {
        writer.write_record([p.to_string()])?;
    }
    writer.flush()?;
    info!("Wrote {} predictions to {}", predictions.len(), path.display());
    Ok(())
}

pub fn write_manifest(run_dir: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let path = run_dir.join(MANIFEST_FILE);
    fs::write(&path, serde_json::to_vec_pretty(manifest)?)?;
    debug!("Wrote run manifest {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, FeatureTable};
    use crate::ml::model::build_model;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    fn trained(kind: ModelKind) -> (TrainedModel, FeatureTable) {
        let x = Array2::from_shape_fn((40, 3), |(i, j)| ((i * 7 + j * 3) % 11) as f64 + i as f64 * 0.1);
        let y = Array1::from_iter((0..40).map(|i| match kind {
            ModelKind::RandomForest => i as f64 * 0.5,
            ModelKind::LogisticRegression => (i >= 20) as u8 as f64,
        }));
        let names = vec!["x0".to_string(), "x1".to_string(), "x2".to_string()];
        let table = FeatureTable::new(names, x).unwrap();
        let ds = Dataset::new(table.clone(), y).unwrap();
        let (normalized, scaler) = crate::data::normalize(&ds).unwrap();
        let params: BTreeMap<String, serde_json::Value> = if kind == ModelKind::RandomForest {
            BTreeMap::from([("n_estimators".to_string(), serde_json::json!(8))])
        } else {
            BTreeMap::new()
        };
        let model = build_model(kind, 42, &params)
            .unwrap()
            .fit(&normalized, Some(scaler))
            .unwrap();
        (model, table)
    }

    #[test]
    fn test_persist_and_reload_predict_identically() {
        let dir = tempfile::tempdir().unwrap();
        for kind in [ModelKind::RandomForest, ModelKind::LogisticRegression] {
            let (model, table) = trained(kind);
            let path = dir.path().join(kind.as_str()).join(MODEL_FILE);
            let digest = persist_model(&model, &path).unwrap();
            assert_eq!(digest.len(), 64);

            let reloaded = load_model(&path).unwrap();
            assert_eq!(reloaded, model);
            assert_eq!(reloaded.predict(&table).unwrap(), model.predict(&table).unwrap());
        }
    }

    #[test]
    fn test_load_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_model(&dir.path().join("latest").join(MODEL_FILE)).unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotFound(_)));
    }

    #[test]
    fn test_run_directory_name_and_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"));

        let first = store.create_run_directory().unwrap();
        let name = first.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name.len(), 15);
        assert!(chrono::NaiveDateTime::parse_from_str(&name, RUN_DIR_FORMAT).is_ok());

        let a = store.create_run_directory_named("20240101_120000").unwrap();
        let b = store.create_run_directory_named("20240101_120000").unwrap();
        let c = store.create_run_directory_named("20240101_120000").unwrap();
        assert!(a.ends_with("20240101_120000"));
        assert!(b.ends_with("20240101_120000_01"));
        assert!(c.ends_with("20240101_120000_02"));
        // suffixes sort before the next second
        assert!("20240101_120000_02" < "20240101_120001");
    }

    #[test]
    fn test_collision_suffixes_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        for _ in 0..=MAX_COLLISION_SUFFIX {
            store.create_run_directory_named("20240101_000000").unwrap();
        }
        let err = store.create_run_directory_named("20240101_000000").unwrap_err();
        assert!(matches!(err, PipelineError::Artifact(_)));
    }

    #[test]
    fn test_alias_points_to_greatest_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        for name in ["20240101_000000", "20240301_000000", "20240201_000000"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "not a run").unwrap();

        let first = store.update_latest_alias(LATEST_ALIAS, None).unwrap();
        let second = store.update_latest_alias(LATEST_ALIAS, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Some(dir.path().join("20240301_000000")));
        assert_eq!(
            store.resolve_alias(LATEST_ALIAS).unwrap(),
            Some(dir.path().join("20240301_000000"))
        );
    }

    #[test]
    fn test_alias_noop_without_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("missing"));
        assert_eq!(store.update_latest_alias(LATEST_ALIAS, None).unwrap(), None);
        assert_eq!(store.resolve_alias(LATEST_ALIAS).unwrap(), None);
    }

    #[test]
    fn test_alias_explicit_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let old = dir.path().join("20240101_000000");
        fs::create_dir(&old).unwrap();
        fs::create_dir(dir.path().join("20250101_000000")).unwrap();

        assert_eq!(store.update_latest_alias("stable", Some(old.as_path())).unwrap(), Some(old.clone()));
        assert_eq!(store.resolve_alias("stable").unwrap(), Some(old));
        assert!(store
            .update_latest_alias("stable", Some(dir.path().join("nope").as_path()))
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_alias_is_relative_symlink_and_ignores_other_links() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        fs::create_dir(dir.path().join("20240101_000000")).unwrap();
        // a symlink sorting above every run must not be picked
        std::os::unix::fs::symlink("20240101_000000", dir.path().join("zzz_link")).unwrap();

        store.update_latest_alias(LATEST_ALIAS, None).unwrap();
        let link = fs::read_link(dir.path().join(LATEST_ALIAS)).unwrap();
        assert_eq!(link, PathBuf::from("20240101_000000"));

        fs::create_dir(dir.path().join("20240102_000000")).unwrap();
        store.update_latest_alias(LATEST_ALIAS, None).unwrap();
        let link = fs::read_link(dir.path().join(LATEST_ALIAS)).unwrap();
        assert_eq!(link, PathBuf::from("20240102_000000"));

        // model path through the alias resolves
        fs::write(dir.path().join("20240102_000000").join(MODEL_FILE), "{}").unwrap();
        assert!(dir.path().join(LATEST_ALIAS).join(MODEL_FILE).exists());

        // no temp links left behind
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(
            store.resolve_alias(LATEST_ALIAS).unwrap(),
            Some(dir.path().join("20240102_000000"))
        );
    }

    #[test]
    fn test_save_predictions_single_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join(PREDICTIONS_FILE);
        save_predictions(&Array1::from(vec![1.5, 0.0, 22.25]), &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "prediction\n1.5\n0\n22.25\n");
    }

    #[test]
    fn test_manifest_written() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = RunManifest {
            run_id: "abc".to_string(),
            run_name: "logreg-classification".to_string(),
            created_at: Utc::now(),
            model_type: ModelKind::LogisticRegression,
            task: Task::Classification,
            seed: 42,
            train_rows: 80,
            test_rows: 20,
            metrics: BTreeMap::from([("accuracy".to_string(), 0.9)]),
            model_file: MODEL_FILE.to_string(),
            model_sha256: "00".repeat(32),
            config: serde_json::json!({"seed": 42}),
        };
        let path = write_manifest(dir.path(), &manifest).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(value["model_type"], "logreg");
        assert_eq!(value["task"], "classification");
        assert_eq!(value["metrics"]["accuracy"], 0.9);
    }
}
