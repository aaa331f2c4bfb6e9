use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::covariance::MinCovDet;
use super::table::Dataset;
use crate::error::{PipelineError, Result};

/// Columns whose spread is below this are treated as constant
const MIN_SCALE: f64 = 10.0 * f64::EPSILON;

/// Per-column z-score parameters (population standard deviation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl Standardizer {
    pub fn fit(x: &Array2<f64>) -> Self {
        let means = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let stds = x.std_axis(Axis(0), 0.0);
        Self {
            means: means.to_vec(),
            scales: stds
                .iter()
                .map(|&s| if s > MIN_SCALE { s } else { 1.0 })
                .collect(),
        }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.means.len() {
            return Err(PipelineError::MalformedData(format!(
                "standardizer fitted on {} columns, got {}",
                self.means.len(),
                x.ncols()
            )));
        }
        let means = Array1::from(self.means.clone());
        let scales = Array1::from(self.scales.clone());
        Ok((x - &means) / &scales)
    }
}

/// Rescale every feature column to zero mean and unit variance using the
/// statistics of `dataset` itself.
pub fn normalize(dataset: &Dataset) -> Result<(Dataset, Standardizer)> {
    let x = dataset.features().values();
    let scaler = Standardizer::fit(x);
    let constant = x
        .std_axis(Axis(0), 0.0)
        .iter()
        .filter(|&&s| s <= MIN_SCALE)
        .count();
    if constant > 0 {
        warn!("{} constant feature column(s) centered but not scaled", constant);
    }
    let normalized = dataset.with_features(scaler.transform(x)?)?;
    Ok((normalized, scaler))
}

/// Elliptic-envelope filter: drop the `ceil(contamination * n)` rows with the
/// largest robust Mahalanobis distance from features and target.
pub fn remove_outliers(dataset: &Dataset, contamination: f64, seed: u64) -> Result<Dataset> {
    if !(0.0..0.5).contains(&contamination) {
        return Err(PipelineError::Config(format!(
            "contamination must be in [0, 0.5), got {}",
            contamination
        )));
    }
    if contamination == 0.0 {
        return Ok(dataset.clone());
    }

    let x = dataset.features().values();
    let robust = MinCovDet::new(seed).fit(x.view())?;
    debug!(
        "Robust covariance: rank {}, support {}/{} rows",
        robust.rank(),
        robust.support.len(),
        dataset.n_rows()
    );
    let distances = robust.mahalanobis(x.view());
    let keep = inlier_mask(&distances, contamination);

    let cleaned = dataset.retain(&keep);
    info!(
        "Outlier removal: dropped {} of {} rows (contamination {:.2})",
        dataset.n_rows() - cleaned.n_rows(),
        dataset.n_rows(),
        contamination
    );
    Ok(cleaned)
}

/// Flags the `ceil(contamination * n)` farthest rows as outliers. Equal
/// distances are broken by row position, later rows going first.
fn inlier_mask(distances: &Array1<f64>, contamination: f64) -> Vec<bool> {
    let n = distances.len();
    let n_drop = ((contamination * n as f64).ceil() as usize).min(n.saturating_sub(1));
    let mut ranked: Vec<usize> = (0..n).collect();
    ranked.sort_by(|&a, &b| distances[b].total_cmp(&distances[a]).then(b.cmp(&a)));

    let mut keep = vec![true; n];
    for &row in &ranked[..n_drop] {
        keep[row] = false;
    }
    keep
}

#[derive(Debug, Clone)]
pub struct TrainTestSplit {
    pub train: Dataset,
    pub test: Dataset,
}

/// Seeded shuffle split: `ceil(test_size * n)` rows go to the test set
pub fn train_test_split(dataset: &Dataset, test_size: f64, seed: u64) -> Result<TrainTestSplit> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(PipelineError::Config(format!(
            "test_size must be in (0, 1), got {}",
            test_size
        )));
    }
    let n = dataset.n_rows();
    let n_test = (test_size * n as f64).ceil() as usize;
    if n_test == 0 || n_test >= n {
        return Err(PipelineError::MalformedData(format!(
            "test_size {} on {} rows leaves an empty train or test set",
            test_size, n
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);
    let (test_rows, train_rows) = order.split_at(n_test);

    Ok(TrainTestSplit {
        train: dataset.select_rows(train_rows),
        test: dataset.select_rows(test_rows),
    })
}
