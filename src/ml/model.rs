use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use super::forest::{ForestOptions, RandomForest};
use super::logistic::{LogisticModel, LogisticOptions};
use crate::data::{Dataset, FeatureTable, Standardizer, Task};
use crate::error::{PipelineError, Result};

/// Closed set of supported estimators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "rf")]
    RandomForest,
    #[serde(rename = "logreg")]
    LogisticRegression,
}

impl ModelKind {
    pub fn as_str(&self) -> &str {
        match self {
            ModelKind::RandomForest => "rf",
            ModelKind::LogisticRegression => "logreg",
        }
    }

    pub fn long_name(&self) -> &str {
        match self {
            ModelKind::RandomForest => "RandomForestRegressor",
            ModelKind::LogisticRegression => "LogisticRegression",
        }
    }

    pub fn task(&self) -> Task {
        match self {
            ModelKind::RandomForest => Task::Regression,
            ModelKind::LogisticRegression => Task::Classification,
        }
    }
}

impl FromStr for ModelKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "rf" | "RandomForestRegressor" => Ok(ModelKind::RandomForest),
            "logreg" | "LogisticRegression" => Ok(ModelKind::LogisticRegression),
            other => Err(PipelineError::UnsupportedModel(other.to_string())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed hyperparameters for one model kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "options", rename_all = "snake_case")]
pub enum ModelOptions {
    Forest(ForestOptions),
    Logistic(LogisticOptions),
}

impl ModelOptions {
    pub fn parse(kind: ModelKind, params: &BTreeMap<String, Value>) -> Result<Self> {
        match kind {
            ModelKind::RandomForest => {
                let options: ForestOptions = parse_options(kind, params, &ForestOptions::KEYS)?;
                options.validate().map_err(|errors| invalid(kind, errors))?;
                Ok(ModelOptions::Forest(options))
            }
            ModelKind::LogisticRegression => {
                let options: LogisticOptions = parse_options(kind, params, &LogisticOptions::KEYS)?;
                options.validate().map_err(|errors| invalid(kind, errors))?;
                Ok(ModelOptions::Logistic(options))
            }
        }
    }

    /// Every option, defaults included, rendered as strings for tracking
    pub fn hyperparameters(&self) -> BTreeMap<String, String> {
        let value = match self {
            ModelOptions::Forest(o) => serde_json::to_value(o),
            ModelOptions::Logistic(o) => serde_json::to_value(o),
        };
        match value {
            Ok(Value::Object(map)) => map.into_iter().map(|(k, v)| (k, render_param(&v))).collect(),
            _ => BTreeMap::new(),
        }
    }
}

/// Strings unquoted, `null` as `None`, anything else as JSON text
pub fn render_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

fn parse_options<T: serde::de::DeserializeOwned>(
    kind: ModelKind,
    params: &BTreeMap<String, Value>,
    known: &[&str],
) -> Result<T> {
    let unknown: Vec<String> = params
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(PipelineError::InvalidHyperparameters {
            model: kind.to_string(),
            keys: unknown,
            reason: format!("unknown parameter(s); accepted: {}", known.join(", ")),
        });
    }

    let object: serde_json::Map<String, Value> = params.clone().into_iter().collect();
    serde_json::from_value(Value::Object(object)).map_err(|e| {
        // isolate which keys fail on their own so the error can name them
        let bad: Vec<String> = params
            .iter()
            .filter(|(k, v)| {
                let mut single = serde_json::Map::new();
                single.insert((*k).clone(), (*v).clone());
                serde_json::from_value::<T>(Value::Object(single)).is_err()
            })
            .map(|(k, _)| k.clone())
            .collect();
        PipelineError::InvalidHyperparameters {
            model: kind.to_string(),
            keys: if bad.is_empty() { params.keys().cloned().collect() } else { bad },
            reason: e.to_string(),
        }
    })
}

fn invalid(kind: ModelKind, errors: Vec<(String, String)>) -> PipelineError {
    let reason = errors
        .iter()
        .map(|(k, why)| format!("{} {}", k, why))
        .collect::<Vec<_>>()
        .join("; ");
    PipelineError::InvalidHyperparameters {
        model: kind.to_string(),
        keys: errors.into_iter().map(|(k, _)| k).collect(),
        reason,
    }
}

/// Untrained estimator: kind, validated options and the run seed
#[derive(Debug, Clone)]
pub struct Estimator {
    kind: ModelKind,
    seed: u64,
    options: ModelOptions,
}

/// Build an untrained estimator from a type tag and raw hyperparameters
pub fn build_model(kind: ModelKind, seed: u64, params: &BTreeMap<String, Value>) -> Result<Estimator> {
    let options = ModelOptions::parse(kind, params)?;
    debug!("Built {} estimator with {:?}", kind.long_name(), options);
    Ok(Estimator { kind, seed, options })
}

impl Estimator {
    /// Fit on preprocessed training rows. `standardizer` is the transform
    /// those rows went through and is replayed on raw input at prediction time.
    pub fn fit(&self, train: &Dataset, standardizer: Option<Standardizer>) -> Result<TrainedModel> {
        let x = train.features().values();
        let y = train.target();
        if train.n_rows() == 0 {
            return Err(PipelineError::Fit("empty training set".to_string()));
        }

        let params = match &self.options {
            ModelOptions::Forest(opts) => FittedParams::Forest(RandomForest::fit(opts, self.seed, x, y)?),
            ModelOptions::Logistic(opts) => FittedParams::Logistic(LogisticModel::fit(opts, x, y)?),
        };

        info!(
            "{} trained on {} rows x {} features",
            self.kind.long_name(),
            train.n_rows(),
            x.ncols()
        );
        Ok(TrainedModel {
            kind: self.kind,
            task: self.kind.task(),
            seed: self.seed,
            options: self.options.clone(),
            feature_names: train.feature_names().to_vec(),
            standardizer,
            trained_at: Utc::now(),
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum FittedParams {
    Forest(RandomForest),
    Logistic(LogisticModel),
}

/// Learned parameters together with everything needed to reproduce the
/// input transform: feature schema, standardization stats and settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub kind: ModelKind,
    pub task: Task,
    pub seed: u64,
    pub options: ModelOptions,
    pub feature_names: Vec<String>,
    pub standardizer: Option<Standardizer>,
    pub trained_at: DateTime<Utc>,
    pub params: FittedParams,
}

impl TrainedModel {
    /// Score raw feature rows: columns are matched by name, then standardized
    pub fn predict(&self, table: &FeatureTable) -> Result<Array1<f64>> {
        let x = table.align_to(&self.feature_names)?;
        let x = match &self.standardizer {
            Some(scaler) => scaler.transform(&x)?,
            None => x,
        };
        self.predict_prepared(&x)
    }

    /// Score rows that already went through the training-time preprocessing
    pub fn predict_prepared(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if x.ncols() != self.feature_names.len() {
            return Err(PipelineError::MalformedData(format!(
                "model expects {} features, got {}",
                self.feature_names.len(),
                x.ncols()
            )));
        }
        Ok(match &self.params {
            FittedParams::Forest(forest) => forest.predict(x),
            FittedParams::Logistic(logistic) => logistic.predict(x),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::normalize;
    use ndarray::Array2;
    use serde_json::json;

    fn params(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn toy_dataset() -> Dataset {
        let x = Array2::from_shape_fn((30, 2), |(i, j)| i as f64 * (j + 1) as f64 + 10.0);
        let y = Array1::from_iter((0..30).map(|i| if i >= 15 { 1.0 } else { 0.0 }));
        let table = FeatureTable::new(vec!["a".to_string(), "b".to_string()], x).unwrap();
        Dataset::new(table, y).unwrap()
    }

    #[test]
    fn test_model_kind_aliases() {
        assert_eq!("rf".parse::<ModelKind>().unwrap(), ModelKind::RandomForest);
        assert_eq!(
            "RandomForestRegressor".parse::<ModelKind>().unwrap(),
            ModelKind::RandomForest
        );
        assert_eq!("logreg".parse::<ModelKind>().unwrap(), ModelKind::LogisticRegression);
        assert_eq!(ModelKind::LogisticRegression.task(), Task::Classification);
        let err = "xgboost".parse::<ModelKind>().unwrap_err();
        assert!(err.to_string().contains("xgboost"));
    }

    #[test]
    fn test_build_with_valid_params() {
        let raw = params(json!({"max_iter": 200, "C": 0.5}));
        assert!(build_model(ModelKind::LogisticRegression, 42, &raw).is_ok());
        match ModelOptions::parse(ModelKind::LogisticRegression, &raw).unwrap() {
            ModelOptions::Logistic(o) => {
                assert_eq!(o.max_iter, 200);
                assert_eq!(o.c, 0.5);
            }
            other => panic!("unexpected options {:?}", other),
        }
    }

    #[test]
    fn test_unknown_param_is_named() {
        let err = build_model(
            ModelKind::LogisticRegression,
            42,
            &params(json!({"invalid_param": 1, "max_iter": 10})),
        )
        .unwrap_err();
        match err {
            PipelineError::InvalidHyperparameters { keys, .. } => assert_eq!(keys, vec!["invalid_param"]),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_ill_typed_param_is_named() {
        let err = build_model(
            ModelKind::RandomForest,
            42,
            &params(json!({"n_estimators": "many", "max_depth": 3})),
        )
        .unwrap_err();
        match err {
            PipelineError::InvalidHyperparameters { keys, .. } => assert_eq!(keys, vec!["n_estimators"]),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_param() {
        let err = build_model(ModelKind::RandomForest, 42, &params(json!({"n_estimators": 0}))).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("n_estimators"));
    }

    #[test]
    fn test_trained_model_replays_standardization() {
        let ds = toy_dataset();
        let (normalized, scaler) = normalize(&ds).unwrap();
        let est = build_model(ModelKind::LogisticRegression, 42, &BTreeMap::new()).unwrap();
        let model = est.fit(&normalized, Some(scaler)).unwrap();

        let from_raw = model.predict(ds.features()).unwrap();
        let from_prepared = model.predict_prepared(normalized.features().values()).unwrap();
        assert_eq!(from_raw, from_prepared);
    }

    #[test]
    fn test_predict_reorders_columns_and_reports_missing() {
        let ds = toy_dataset();
        let est = build_model(
            ModelKind::RandomForest,
            42,
            &params(json!({"n_estimators": 5})),
        )
        .unwrap();
        let model = est.fit(&ds, None).unwrap();

        let x = ds.features().values();
        let swapped = FeatureTable::new(
            vec!["b".to_string(), "a".to_string()],
            ndarray::stack![ndarray::Axis(1), x.column(1), x.column(0)],
        )
        .unwrap();
        assert_eq!(model.predict(&swapped).unwrap(), model.predict(ds.features()).unwrap());

        let partial = FeatureTable::new(vec!["a".to_string()], x.slice(ndarray::s![.., 0..1]).to_owned()).unwrap();
        assert!(matches!(
            model.predict(&partial),
            Err(PipelineError::MissingFeature(name)) if name == "b"
        ));
    }

    #[test]
    fn test_hyperparameters_flattened() {
        let est = build_model(ModelKind::RandomForest, 42, &params(json!({"max_depth": 4}))).unwrap();
        let model = est.fit(&toy_dataset(), None).unwrap();
        let hp = model.options.hyperparameters();
        assert_eq!(hp["max_depth"], "4");
        assert_eq!(hp["n_estimators"], "100");
        assert_eq!(hp["random_state"], "None");
    }
}
