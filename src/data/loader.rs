use async_trait::async_trait;
use ndarray::{Array1, Axis};
use std::path::PathBuf;
use tracing::{debug, info};

use super::openml::OpenMlSource;
use super::table::{read_numeric_csv, Dataset, FeatureTable};
use super::Task;
use crate::config::DatasetSettings;
use crate::error::{PipelineError, Result};

/// Target column used when neither the config nor the source names one
pub const FALLBACK_TARGET: &str = "MEDV";

/// Everything a source returns: all columns, target included
#[derive(Debug, Clone)]
pub struct RawDataset {
    pub name: String,
    pub table: FeatureTable,
    /// Target attribute advertised by the source, if any
    pub default_target: Option<String>,
}

#[async_trait]
pub trait DatasetSource: Send + Sync {
    fn describe(&self) -> String;
    async fn fetch(&self) -> Result<RawDataset>;
}

/// Headered CSV on local disk
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DatasetSource for CsvFileSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    async fn fetch(&self) -> Result<RawDataset> {
        let name = self.path.display().to_string();
        let file = std::fs::File::open(&self.path).map_err(|e| PipelineError::DataAcquisition {
            dataset: name.clone(),
            reason: e.to_string(),
        })?;
        let (names, values) = read_numeric_csv(file, &name)?;
        Ok(RawDataset {
            name,
            table: FeatureTable::new(names, values)?,
            default_target: None,
        })
    }
}

/// Local file when `dataset.path` is set, OpenML otherwise
pub fn source_for(settings: &DatasetSettings) -> Box<dyn DatasetSource> {
    match &settings.path {
        Some(path) => Box::new(CsvFileSource::new(path.clone())),
        None => Box::new(OpenMlSource::new(&settings.name, settings.version)),
    }
}

/// Fetch a dataset and split off the target. Classification binarizes the
/// raw target at its median.
pub async fn load_dataset(
    source: &dyn DatasetSource,
    target: Option<&str>,
    task: Task,
) -> Result<Dataset> {
    info!("Fetching dataset from {}", source.describe());
    let raw = source.fetch().await?;

    let target_name = target
        .map(str::to_string)
        .or(raw.default_target.clone())
        .unwrap_or_else(|| FALLBACK_TARGET.to_string());

    let target_idx = raw.table.column_index(&target_name).ok_or_else(|| {
        PipelineError::MalformedData(format!(
            "target column '{}' not found in dataset '{}'",
            target_name, raw.name
        ))
    })?;

    let values = raw.table.values();
    let feature_cols: Vec<usize> = (0..raw.table.n_cols()).filter(|&c| c != target_idx).collect();
    if feature_cols.is_empty() {
        return Err(PipelineError::MalformedData(format!(
            "dataset '{}' has no feature columns",
            raw.name
        )));
    }
    let feature_names = feature_cols
        .iter()
        .map(|&c| raw.table.names()[c].clone())
        .collect();
    let features = FeatureTable::new(feature_names, values.select(Axis(1), &feature_cols))?;
    let raw_target = values.column(target_idx).to_owned();

    let target = match task {
        Task::Regression => raw_target,
        Task::Classification => binarize_at_median(&raw_target),
    };

    let dataset = Dataset::new(features, target)?;
    info!(
        "Loaded '{}': {} rows, {} features, target '{}' ({})",
        raw.name,
        dataset.n_rows(),
        dataset.features().n_cols(),
        target_name,
        task
    );
    if task == Task::Classification {
        let positives = dataset.target().iter().filter(|&&v| v == 1.0).count();
        debug!("Binarized target: {} positive / {} total", positives, dataset.n_rows());
    }
    Ok(dataset)
}

/// 1.0 where the value is strictly above the sample median, else 0.0
pub fn binarize_at_median(values: &Array1<f64>) -> Array1<f64> {
    let median = median(values);
    values.mapv(|v| if v > median { 1.0 } else { 0.0 })
}

fn median(values: &Array1<f64>) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
