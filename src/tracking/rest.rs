use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use super::{RunStatus, TrackingSink};
use crate::error::{PipelineError, Result};

const API_PREFIX: &str = "api/2.0/mlflow";
const ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";

/// MLflow tracking server over its REST API. Artifacts are uploaded through
/// the server's artifact proxy, so runs must use `mlflow-artifacts:` URIs.
pub struct RestTracker {
    client: Client,
    base_url: String,
    /// run id -> artifact root reported at run creation
    artifact_uris: Mutex<HashMap<String, String>>,
}

impl RestTracker {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            artifact_uris: Mutex::new(HashMap::new()),
        }
    }

    fn remember_artifact_root(&self, run_id: &str, artifact_uri: String) -> Result<()> {
        let mut uris = self
            .artifact_uris
            .lock()
            .map_err(|_| PipelineError::Tracking("artifact root table is poisoned".to_string()))?;
        uris.insert(run_id.to_string(), artifact_uri);
        Ok(())
    }

    fn artifact_root(&self, run_id: &str) -> Result<String> {
        let uris = self
            .artifact_uris
            .lock()
            .map_err(|_| PipelineError::Tracking("artifact root table is poisoned".to_string()))?;
        uris.get(run_id)
            .cloned()
            .ok_or_else(|| PipelineError::Tracking(format!("no artifact root known for run {}", run_id)))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_PREFIX, path)
    }

    /// Upload URL for a file under the run's `mlflow-artifacts:/` root
    fn artifact_url(&self, artifact_uri: &str, artifact_path: &str, file_name: &str) -> Result<String> {
        let relative = artifact_uri.strip_prefix(ARTIFACT_SCHEME).ok_or_else(|| {
            PipelineError::Tracking(format!(
                "artifact root {} is not served by the tracking server",
                artifact_uri
            ))
        })?;
        let mut url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}",
            self.base_url,
            relative.trim_matches('/')
        );
        let artifact_path = artifact_path.trim_matches('/');
        if !artifact_path.is_empty() {
            url.push('/');
            url.push_str(artifact_path);
        }
        url.push('/');
        url.push_str(file_name);
        Ok(url)
    }

    async fn decode<T: DeserializeOwned>(url: &str, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Tracking(format!("{} returned {}: {}", url, status, body)));
        }
        resp.json::<T>()
            .await
            .map_err(|e| PipelineError::Tracking(format!("unexpected response from {}: {}", url, e)))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.endpoint(path);
        debug!("POST {}", url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::Tracking(e.to_string()))?;
        Self::decode(&url, resp).await
    }
}

#[async_trait]
impl TrackingSink for RestTracker {
    fn describe(&self) -> String {
        format!("mlflow:{}", self.base_url)
    }

    async fn set_experiment(&self, name: &str) -> Result<String> {
        let url = self.endpoint("experiments/get-by-name");
        debug!("GET {}", url);
        let resp = self
            .client
            .get(&url)
            .query(&[("experiment_name", name)])
            .send()
            .await
            .map_err(|e| PipelineError::Tracking(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            let created: CreateExperimentResponse = self
                .post("experiments/create", &CreateExperimentRequest { name })
                .await?;
            debug!("Created experiment '{}' ({})", name, created.experiment_id);
            return Ok(created.experiment_id);
        }
        let found: GetExperimentResponse = Self::decode(&url, resp).await?;
        Ok(found.experiment.experiment_id)
    }

    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<String> {
        let request = CreateRunRequest {
            experiment_id,
            run_name,
            start_time: Utc::now().timestamp_millis(),
            tags: vec![Tag {
                key: "mlflow.runName",
                value: run_name,
            }],
        };
        let created: CreateRunResponse = self.post("runs/create", &request).await?;
        let info = created.run.info;
        self.remember_artifact_root(&info.run_id, info.artifact_uri)?;
        Ok(info.run_id)
    }

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let request = LogBatchRequest {
            run_id,
            params: params
                .iter()
                .map(|(k, v)| Param { key: k, value: v })
                .collect(),
            metrics: Vec::new(),
        };
        let _: serde_json::Value = self.post("runs/log-batch", &request).await?;
        Ok(())
    }

    async fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let timestamp = Utc::now().timestamp_millis();
        let mut batch = Vec::with_capacity(metrics.len());
        for (key, &value) in metrics {
            if !value.is_finite() {
                warn!("Metric {} is {}, not sent to the tracking server", key, value);
                continue;
            }
            batch.push(Metric {
                key,
                value,
                timestamp,
                step: 0,
            });
        }
        let request = LogBatchRequest {
            run_id,
            params: Vec::new(),
            metrics: batch,
        };
        let _: serde_json::Value = self.post("runs/log-batch", &request).await?;
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, local_path: &Path, artifact_path: &str) -> Result<()> {
        let artifact_uri = self.artifact_root(run_id)?;
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::Tracking(format!("invalid artifact {}", local_path.display())))?;
        let url = self.artifact_url(&artifact_uri, artifact_path, file_name)?;

        let bytes = tokio::fs::read(local_path).await?;
        debug!("PUT {} ({} bytes)", url, bytes.len());
        let resp = self
            .client
            .put(&url)
            .body(bytes)
            .send()
            .await
            .map_err(|e| PipelineError::Tracking(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PipelineError::Tracking(format!("{} returned {}", url, resp.status())));
        }
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let request = UpdateRunRequest {
            run_id,
            status,
            end_time: Utc::now().timestamp_millis(),
        };
        let _: serde_json::Value = self.post("runs/update", &request).await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct CreateExperimentRequest<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentInfo,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Serialize)]
struct Tag<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    experiment_id: &'a str,
    run_name: &'a str,
    start_time: i64,
    tags: Vec<Tag<'a>>,
}

#[derive(Deserialize)]
struct CreateRunResponse {
    run: RunPayload,
}

#[derive(Deserialize)]
struct RunPayload {
    info: RunInfo,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
    #[serde(default)]
    artifact_uri: String,
}

#[derive(Serialize)]
struct Param<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct Metric<'a> {
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

#[derive(Serialize)]
struct LogBatchRequest<'a> {
    run_id: &'a str,
    params: Vec<Param<'a>>,
    metrics: Vec<Metric<'a>>,
}

#[derive(Serialize)]
struct UpdateRunRequest<'a> {
    run_id: &'a str,
    status: RunStatus,
    end_time: i64,
}
