use ndarray::Array1;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::data::FeatureTable;
use crate::error::Result;
use crate::ml::persistence::{LATEST_ALIAS, MODEL_FILE, PREDICTIONS_FILE};
use crate::ml::{load_model, save_predictions, ArtifactStore};

pub fn default_model_path() -> PathBuf {
    PathBuf::from("artifacts").join(LATEST_ALIAS).join(MODEL_FILE)
}

pub fn default_output_path() -> PathBuf {
    PathBuf::from("artifacts").join(LATEST_ALIAS).join(PREDICTIONS_FILE)
}

#[derive(Debug, Clone)]
pub struct PredictionReport {
    pub predictions: Array1<f64>,
    pub output_csv: PathBuf,
    /// True when the built-in sample table was scored
    pub used_builtin_samples: bool,
    /// Run directory behind the `latest` alias, when the model was reached through it
    pub run_dir: Option<PathBuf>,
}

/// `<base>/latest/model.json` resolves to the run directory the alias points at
fn aliased_run_dir(model_path: &Path) -> Option<PathBuf> {
    let alias_dir = model_path.parent()?;
    if alias_dir.file_name()? != LATEST_ALIAS {
        return None;
    }
    let base = alias_dir.parent()?;
    match ArtifactStore::new(base).resolve_alias(LATEST_ALIAS) {
        Ok(target) => target,
        Err(e) => {
            warn!("Could not read alias {}: {}", alias_dir.display(), e);
            None
        }
    }
}

/// Load a persisted model, score the sample table and write one prediction per row
pub fn run_prediction(model_path: &Path, samples_file: Option<&Path>, output_csv: &Path) -> Result<PredictionReport> {
    let model = load_model(model_path)?;
    let run_dir = aliased_run_dir(model_path);
    if let Some(dir) = &run_dir {
        info!("{} resolves to run {}", LATEST_ALIAS, dir.display());
    }

    let (samples, used_builtin_samples) = match samples_file {
        Some(path) if path.exists() => {
            info!("Scoring samples from {}", path.display());
            (FeatureTable::read_csv(path)?, false)
        }
        Some(path) => {
            warn!(
                "Samples file {} not found, scoring the built-in example rows",
                path.display()
            );
            (FeatureTable::boston_example(), true)
        }
        None => {
            info!("No samples file given, scoring the built-in example rows");
            (FeatureTable::boston_example(), true)
        }
    };

    let predictions = model.predict(&samples)?;
    save_predictions(&predictions, output_csv)?;
    info!(
        "{} predictions from {} model ({})",
        predictions.len(),
        model.kind,
        model.task
    );

    Ok(PredictionReport {
        predictions,
        output_csv: output_csv.to_path_buf(),
        used_builtin_samples,
        run_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::data::table::BOSTON_FEATURES;
    use crate::data::loader::CsvFileSource;
    use crate::engine::pipeline::run_training;
    use crate::error::PipelineError;
    use crate::tracking::FileTracker;
    use std::fs;
    use std::io::Write;

    /// Boston-schema CSV with MEDV increasing in RM and falling in LSTAT
    fn write_housing_csv(path: &Path, n: usize) {
        let mut file = fs::File::create(path).unwrap();
        writeln!(file, "{},MEDV", BOSTON_FEATURES.join(",")).unwrap();
        for i in 0..n {
            let row: Vec<f64> = (0..BOSTON_FEATURES.len())
                .map(|j| ((i * (j + 3) + j * 7) % 17) as f64 + j as f64 * 0.5)
                .collect();
            let medv = 20.0 + 2.0 * row[5] - 0.8 * row[12] + (i % 5) as f64 * 0.3;
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(file, "{},{}", cells.join(","), medv).unwrap();
        }
    }

    #[tokio::test]
    async fn test_train_then_predict_builtin_samples() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("housing.csv");
        write_housing_csv(&csv, 150);

        let mut config = PipelineConfig::default();
        config.model.kind = Some("logreg".to_string());
        config.dataset.path = Some(csv.clone());
        config.outputs.dir = dir.path().join("artifacts");

        let source = CsvFileSource::new(&csv);
        let tracker = FileTracker::new(dir.path().join("mlruns"));
        let outcome = run_training(&config, &source, &tracker).await.unwrap();

        let model_path = dir.path().join("artifacts").join(LATEST_ALIAS).join(MODEL_FILE);
        let output = dir.path().join("predictions.csv");
        let report = run_prediction(&model_path, None, &output).unwrap();

        assert!(report.used_builtin_samples);
        assert_eq!(report.run_dir, Some(outcome.run_dir));
        assert_eq!(report.predictions.len(), 2);
        assert!(report.predictions.iter().all(|&p| p == 0.0 || p == 1.0));
        let lines: Vec<String> = fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "prediction");
    }

    #[tokio::test]
    async fn test_predict_from_samples_file() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("housing.csv");
        write_housing_csv(&csv, 120);

        let mut config = PipelineConfig::default();
        config.model.params.insert("n_estimators".to_string(), serde_json::json!(10));
        config.dataset.path = Some(csv.clone());
        config.outputs.dir = dir.path().join("artifacts");

        let source = CsvFileSource::new(&csv);
        let tracker = FileTracker::new(dir.path().join("mlruns"));
        let outcome = run_training(&config, &source, &tracker).await.unwrap();

        // samples carry an extra column and a different column order
        let samples = dir.path().join("samples.csv");
        let mut reversed: Vec<&str> = BOSTON_FEATURES.to_vec();
        reversed.reverse();
        let mut file = fs::File::create(&samples).unwrap();
        writeln!(file, "{},EXTRA", reversed.join(",")).unwrap();
        for i in 0..5 {
            let cells: Vec<String> = (0..=BOSTON_FEATURES.len()).map(|j| (i + j).to_string()).collect();
            writeln!(file, "{}", cells.join(",")).unwrap();
        }
        drop(file);

        let output = dir.path().join("out").join(PREDICTIONS_FILE);
        let report = run_prediction(&outcome.model_path, Some(samples.as_path()), &output).unwrap();
        assert!(!report.used_builtin_samples);
        // the run directory was given directly, not through the alias
        assert_eq!(report.run_dir, None);
        assert_eq!(report.predictions.len(), 5);
        assert!(report.predictions.iter().all(|p| p.is_finite()));
        assert!(output.is_file());
    }

    #[test]
    fn test_missing_model_is_reported_before_samples() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_prediction(
            &dir.path().join("missing").join(MODEL_FILE),
            Some(dir.path().join("nope.csv").as_path()),
            &dir.path().join("p.csv"),
        )
        .unwrap_err();
        // the model is checked first
        assert!(matches!(err, PipelineError::ModelNotFound(_)));
        assert!(err.to_string().contains("mlpipe train"));
    }

    #[test]
    fn test_default_paths() {
        assert_eq!(default_model_path(), PathBuf::from("artifacts/latest/model.json"));
        assert_eq!(default_output_path(), PathBuf::from("artifacts/latest/predictions.csv"));
    }
}
