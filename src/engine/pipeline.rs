use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::data::{load_dataset, normalize, remove_outliers, train_test_split, DatasetSource, Task};
use crate::error::{PipelineError, Result};
use crate::ml::persistence::{write_manifest, LATEST_ALIAS, MODEL_FILE};
use crate::ml::model::{render_param, ModelOptions};
use crate::ml::{build_model, compute_metrics, persist_model, ArtifactStore, MetricsRecord, ModelKind, RunManifest};
use crate::tracking::{RunStatus, TrackingSink};

/// Artifact path the model is published under in the tracking sink
pub const MODEL_ARTIFACT_PATH: &str = "model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    LoadConfig,
    SetupTracking,
    LoadData,
    Preprocess,
    Split,
    BuildModel,
    Fit,
    Predict,
    ComputeMetrics,
    PersistArtifact,
    UpdateAlias,
    PublishToTracking,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 13] = [
        Stage::LoadConfig,
        Stage::SetupTracking,
        Stage::LoadData,
        Stage::Preprocess,
        Stage::Split,
        Stage::BuildModel,
        Stage::Fit,
        Stage::Predict,
        Stage::ComputeMetrics,
        Stage::PersistArtifact,
        Stage::UpdateAlias,
        Stage::PublishToTracking,
        Stage::Done,
    ];

    fn position(&self) -> usize {
        Stage::ALL.iter().position(|s| s == self).unwrap_or(0)
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.position() + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a finished run leaves behind
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_name: String,
    pub model_kind: ModelKind,
    pub task: Task,
    pub run_dir: PathBuf,
    pub model_path: PathBuf,
    pub metrics: MetricsRecord,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Drives one training run through [`Stage::ALL`] in order. Any failure after
/// the tracking run opened closes it as FAILED before the error propagates.
pub struct RunOrchestrator<'a> {
    config: &'a PipelineConfig,
    source: &'a dyn DatasetSource,
    tracker: &'a dyn TrackingSink,
    stage: Stage,
}

impl<'a> RunOrchestrator<'a> {
    pub fn new(config: &'a PipelineConfig, source: &'a dyn DatasetSource, tracker: &'a dyn TrackingSink) -> Self {
        Self {
            config,
            source,
            tracker,
            stage: Stage::LoadConfig,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, expected: Stage) {
        match self.stage.next() {
            Some(next) if next == expected => self.stage = next,
            _ => {
                // stages only move forward one at a time
                warn!("Unexpected stage transition {} -> {}", self.stage, expected);
                self.stage = expected;
            }
        }
        if expected != Stage::Done {
            info!("[{}/{}] {}", self.stage.position(), Stage::ALL.len() - 2, self.stage);
        }
    }

    pub async fn run(&mut self) -> Result<RunOutcome> {
        info!("[0/{}] {}", Stage::ALL.len() - 2, Stage::LoadConfig);
        self.config
            .validate()
            .map_err(|errors| PipelineError::Config(errors.join(", ")))?;
        let kind = self.config.model_kind()?;
        let task = kind.task();

        self.advance(Stage::SetupTracking);
        let experiment_id = self.tracker.set_experiment(&self.config.experiment_name).await?;
        let run_name = format!("{}-{}", kind, task);
        let run_id = self.tracker.start_run(&experiment_id, &run_name).await?;
        info!(
            "Run {} ({}) started in experiment '{}'",
            run_id, run_name, self.config.experiment_name
        );

        match self.execute(kind, &run_id, &run_name).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("Run {} failed during {}: {}", run_id, self.stage, e);
                if let Err(end_err) = self.tracker.end_run(&run_id, RunStatus::Failed).await {
                    warn!("Could not mark run {} as failed: {}", run_id, end_err);
                }
                Err(e)
            }
        }
    }

    async fn execute(&mut self, kind: ModelKind, run_id: &str, run_name: &str) -> Result<RunOutcome> {
        let config = self.config;
        let task = kind.task();
        self.tracker.log_params(run_id, &self.run_params(kind)).await?;

        self.advance(Stage::LoadData);
        let dataset = load_dataset(self.source, config.dataset.target.as_deref(), task).await?;

        self.advance(Stage::Preprocess);
        let (dataset, standardizer) = if config.preprocess.normalize {
            let (normalized, scaler) = normalize(&dataset)?;
            (normalized, Some(scaler))
        } else {
            (dataset, None)
        };
        let dataset = if config.preprocess.remove_outliers && config.preprocess.contamination > 0.0 {
            remove_outliers(&dataset, config.preprocess.contamination, config.seed)?
        } else {
            dataset
        };

        self.advance(Stage::Split);
        let split = train_test_split(&dataset, config.split.test_size, config.seed)?;
        info!(
            "Split: {} train / {} test rows (test_size {})",
            split.train.n_rows(),
            split.test.n_rows(),
            config.split.test_size
        );

        self.advance(Stage::BuildModel);
        let estimator = build_model(kind, config.seed, &config.model.params)?;

        self.advance(Stage::Fit);
        let model = estimator.fit(&split.train, standardizer)?;

        self.advance(Stage::Predict);
        let predictions = model.predict_prepared(split.test.features().values())?;

        self.advance(Stage::ComputeMetrics);
        let metrics = compute_metrics(task, split.test.target(), &predictions)?;
        for (name, value) in &metrics {
            info!("  {}: {:.4}", name, value);
        }

        self.advance(Stage::PersistArtifact);
        let store = ArtifactStore::new(&config.outputs.dir);
        let run_dir = store.create_run_directory()?;
        let model_path = run_dir.join(MODEL_FILE);
        let digest = persist_model(&model, &model_path)?;
        let manifest = RunManifest {
            run_id: run_id.to_string(),
            run_name: run_name.to_string(),
            created_at: Utc::now(),
            model_type: kind,
            task,
            seed: config.seed,
            train_rows: split.train.n_rows(),
            test_rows: split.test.n_rows(),
            metrics: metrics.clone(),
            model_file: MODEL_FILE.to_string(),
            model_sha256: digest,
            config: serde_json::to_value(config)?,
        };
        write_manifest(&run_dir, &manifest)?;

        self.advance(Stage::UpdateAlias);
        store.update_latest_alias(LATEST_ALIAS, None)?;

        self.advance(Stage::PublishToTracking);
        self.tracker.log_metrics(run_id, &metrics).await?;
        self.tracker
            .log_artifact(run_id, &model_path, MODEL_ARTIFACT_PATH)
            .await?;
        self.tracker.end_run(run_id, RunStatus::Finished).await?;

        self.advance(Stage::Done);
        info!("Run {} complete, artifacts in {}", run_id, run_dir.display());
        Ok(RunOutcome {
            run_id: run_id.to_string(),
            run_name: run_name.to_string(),
            model_kind: kind,
            task,
            run_dir,
            model_path,
            metrics,
            train_rows: split.train.n_rows(),
            test_rows: split.test.n_rows(),
        })
    }

    /// Parameters published before training
    fn run_params(&self, kind: ModelKind) -> BTreeMap<String, String> {
        let config = self.config;
        let dataset = match &config.dataset.path {
            Some(path) => path.display().to_string(),
            None => config.dataset.name.clone(),
        };
        let mut params = BTreeMap::from([
            ("model_type".to_string(), kind.to_string()),
            ("task".to_string(), kind.task().to_string()),
            ("test_size".to_string(), config.split.test_size.to_string()),
            ("seed".to_string(), config.seed.to_string()),
            ("dataset".to_string(), dataset),
        ]);
        match ModelOptions::parse(kind, &config.model.params) {
            // resolved options, so defaults are recorded too
            Ok(options) => {
                for (name, value) in options.hyperparameters() {
                    params.insert(format!("param_{}", name), value);
                }
            }
            // the BuildModel stage reports the error
            Err(_) => {
                for (name, value) in &config.model.params {
                    params.insert(format!("param_{}", name), render_param(value));
                }
            }
        }
        params
    }
}

/// Run one training pass with the given collaborators
pub async fn run_training(
    config: &PipelineConfig,
    source: &dyn DatasetSource,
    tracker: &dyn TrackingSink,
) -> Result<RunOutcome> {
    let mut orchestrator = RunOrchestrator::new(config, source, tracker);
    let outcome = orchestrator.run().await;
    debug!("Orchestrator stopped at {}", orchestrator.stage());
    outcome
}
