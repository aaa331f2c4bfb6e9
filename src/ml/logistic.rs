use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Validated `logreg` hyperparameters (sklearn-style names)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogisticOptions {
    pub max_iter: u64,
    /// Inverse regularization strength
    #[serde(alias = "C")]
    pub c: f64,
    pub tol: f64,
    pub fit_intercept: bool,
    pub penalty: Penalty,
    pub solver: Solver,
    /// Accepted for parity with `rf`; lbfgs is deterministic
    pub random_state: Option<u64>,
}

impl Default for LogisticOptions {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            c: 1.0,
            tol: 1e-4,
            fit_intercept: true,
            penalty: Penalty::L2,
            solver: Solver::Lbfgs,
            random_state: None,
        }
    }
}

impl LogisticOptions {
    pub const KEYS: [&'static str; 8] = [
        "max_iter",
        "c",
        "C",
        "tol",
        "fit_intercept",
        "penalty",
        "solver",
        "random_state",
    ];

    pub fn validate(&self) -> std::result::Result<(), Vec<(String, String)>> {
        let mut errors = Vec::new();
        if self.max_iter == 0 {
            errors.push(("max_iter".to_string(), "must be > 0".to_string()));
        }
        if !(self.c > 0.0 && self.c.is_finite()) {
            errors.push(("C".to_string(), "must be a positive finite number".to_string()));
        }
        if !(self.tol > 0.0 && self.tol.is_finite()) {
            errors.push(("tol".to_string(), "must be > 0".to_string()));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// L2 weight in linfa's objective (`alpha = 1 / C`, zero without penalty)
    fn alpha(&self) -> f64 {
        match self.penalty {
            Penalty::L2 => 1.0 / self.c,
            Penalty::None => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Penalty {
    L2,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Solver {
    Lbfgs,
}

/// Fitted binary logistic regression; class 1 is the positive class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LogisticModel {
    pub fn fit(options: &LogisticOptions, x: &Array2<f64>, y: &Array1<f64>) -> Result<Self> {
        let labels: Array1<usize> = y.mapv(|v| if v > 0.5 { 1 } else { 0 });
        let positives = labels.iter().filter(|&&l| l == 1).count();
        if positives == 0 || positives == labels.len() {
            return Err(PipelineError::Fit(
                "logistic regression needs both classes in the training data".to_string(),
            ));
        }

        let dataset = Dataset::new(x.clone(), labels);
        let fitted = LogisticRegression::default()
            .max_iterations(options.max_iter)
            .gradient_tolerance(options.tol)
            .alpha(options.alpha())
            .with_intercept(options.fit_intercept)
            .fit(&dataset)
            .map_err(|e| PipelineError::Fit(e.to_string()))?;

        let mut coefficients = fitted.params().to_vec();
        let mut intercept = fitted.intercept();
        // linfa orients the decision function toward its own positive label
        if fitted.labels().pos.class != 1 {
            coefficients.iter_mut().for_each(|w| *w = -*w);
            intercept = -intercept;
        }
        debug!("Logistic coefficients: {:?}, intercept {:.4}", coefficients, intercept);
        info!(
            "Logistic regression fitted on {} samples ({} positive)",
            x.nrows(),
            positives
        );

        Ok(Self {
            coefficients,
            intercept,
        })
    }

    pub fn decision_function(&self, x: &Array2<f64>) -> Array1<f64> {
        let w = Array1::from(self.coefficients.clone());
        x.dot(&w) + self.intercept
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> Array1<f64> {
        self.decision_function(x).mapv(sigmoid)
    }

    /// Class 1 where its probability exceeds 0.5
    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        self.predict_proba(x)
            .mapv(|p| if p > 0.5 { 1.0 } else { 0.0 })
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn separable() -> (Array2<f64>, Array1<f64>) {
        let x = array![
            [-2.0, -1.0],
            [-1.5, -0.5],
            [-1.0, -1.5],
            [-0.5, -0.2],
            [0.5, 0.4],
            [1.0, 1.5],
            [1.5, 0.5],
            [2.0, 1.0]
        ];
        let y = array![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        (x, y)
    }

    #[test]
    fn test_fit_separable_data() {
        let (x, y) = separable();
        let model = LogisticModel::fit(&LogisticOptions::default(), &x, &y).unwrap();
        assert_eq!(model.predict(&x), y);
        assert!(model.coefficients.iter().all(|&w| w > 0.0));
    }

    #[test]
    fn test_positive_class_orientation_with_imbalance() {
        // more negatives than positives; class 1 must still map to the high side
        let x = array![[-3.0], [-2.0], [-1.5], [-1.0], [-0.5], [1.0], [2.0]];
        let y = array![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let model = LogisticModel::fit(&LogisticOptions::default(), &x, &y).unwrap();
        let proba = model.predict_proba(&array![[3.0], [-3.0]]);
        assert!(proba[0] > 0.5);
        assert!(proba[1] < 0.5);
    }

    #[test]
    fn test_single_class_fails() {
        let x = array![[1.0], [2.0]];
        let y = array![1.0, 1.0];
        let err = LogisticModel::fit(&LogisticOptions::default(), &x, &y).unwrap_err();
        assert!(matches!(err, PipelineError::Fit(_)));
    }

    #[test]
    fn test_options_validation() {
        let bad = LogisticOptions {
            c: 0.0,
            max_iter: 0,
            ..Default::default()
        };
        let errors = bad.validate().unwrap_err();
        let keys: Vec<&str> = errors.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["max_iter", "C"]);
    }
}
