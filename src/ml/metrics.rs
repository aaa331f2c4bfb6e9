use ndarray::Array1;
use std::collections::BTreeMap;
use tracing::warn;

use crate::data::Task;
use crate::error::{PipelineError, Result};

/// Metric name to score; the key set is fixed per task
pub type MetricsRecord = BTreeMap<String, f64>;

pub const CLASSIFICATION_METRICS: [&str; 4] = ["accuracy", "precision", "recall", "f1"];
pub const REGRESSION_METRICS: [&str; 4] = ["rmse", "r2", "mae", "mape"];

pub fn compute_metrics(task: Task, y_true: &Array1<f64>, y_pred: &Array1<f64>) -> Result<MetricsRecord> {
    match task {
        Task::Classification => classification_metrics(y_true, y_pred),
        Task::Regression => regression_metrics(y_true, y_pred),
    }
}

fn check_lengths(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> Result<()> {
    if y_true.len() != y_pred.len() {
        return Err(PipelineError::Metrics(format!(
            "length mismatch: {} true values vs {} predictions",
            y_true.len(),
            y_pred.len()
        )));
    }
    if y_true.is_empty() {
        return Err(PipelineError::Metrics("no values to score".to_string()));
    }
    Ok(())
}

/// Binary scores with class 1 as the positive class
pub fn classification_metrics(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> Result<MetricsRecord> {
    check_lengths(y_true, y_pred)?;

    let (mut tp, mut fp, mut fn_, mut correct) = (0usize, 0usize, 0usize, 0usize);
    for (&t, &p) in y_true.iter().zip(y_pred.iter()) {
        let actual = t > 0.5;
        let predicted = p > 0.5;
        if actual == predicted {
            correct += 1;
        }
        match (actual, predicted) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
            (false, false) => {}
        }
    }

    let accuracy = correct as f64 / y_true.len() as f64;
    let precision = safe_ratio(tp, tp + fp, "precision", "no predicted positives");
    let recall = safe_ratio(tp, tp + fn_, "recall", "no actual positives");
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    Ok(record(&CLASSIFICATION_METRICS, [accuracy, precision, recall, f1]))
}

fn record(names: &[&str; 4], values: [f64; 4]) -> MetricsRecord {
    names
        .iter()
        .zip(values)
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn safe_ratio(num: usize, den: usize, metric: &str, why: &str) -> f64 {
    if den == 0 {
        warn!("{} is ill-defined ({}), reporting 0.0", metric, why);
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// `rmse`, `r2`, `mae` and `mape` (percent)
pub fn regression_metrics(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> Result<MetricsRecord> {
    check_lengths(y_true, y_pred)?;
    let n = y_true.len() as f64;

    let residuals = y_true - y_pred;
    let sse: f64 = residuals.iter().map(|r| r * r).sum();
    let rmse = (sse / n).sqrt();
    let mae = residuals.iter().map(|r| r.abs()).sum::<f64>() / n;

    let mean = y_true.sum() / n;
    let sst: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let r2 = if sst > 0.0 {
        1.0 - sse / sst
    } else if sse == 0.0 {
        1.0
    } else {
        0.0
    };

    let mape = if y_true.iter().any(|&t| t == 0.0) {
        warn!("mape is infinite: true values contain zero");
        f64::INFINITY
    } else {
        y_true
            .iter()
            .zip(residuals.iter())
            .map(|(t, r)| (r / t).abs())
            .sum::<f64>()
            / n
            * 100.0
    };

    Ok(record(&REGRESSION_METRICS, [rmse, r2, mae, mape]))
}
