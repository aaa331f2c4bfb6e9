pub mod covariance;
pub mod loader;
pub mod openml;
pub mod preprocess;
pub mod table;

pub use loader::{load_dataset, source_for, DatasetSource};
pub use preprocess::{normalize, remove_outliers, train_test_split, Standardizer};
pub use table::{Dataset, FeatureTable};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Learning task; decides target encoding and the metric vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Regression,
    Classification,
}

impl Task {
    pub fn as_str(&self) -> &str {
        match self {
            Task::Regression => "regression",
            Task::Classification => "classification",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
