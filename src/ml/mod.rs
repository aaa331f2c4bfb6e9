pub mod forest;
pub mod logistic;
pub mod metrics;
pub mod model;
pub mod persistence;

pub use metrics::{compute_metrics, MetricsRecord};
pub use model::{build_model, ModelKind};
pub use persistence::{load_model, persist_model, save_predictions, ArtifactStore, RunManifest};
