use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::loader::{DatasetSource, RawDataset};
use super::table::{read_numeric_csv, FeatureTable};
use crate::error::{PipelineError, Result};

const OPENML_API: &str = "https://api.openml.org";

/// Dataset fetched from the OpenML JSON API and its CSV export
#[derive(Debug, Clone)]
pub struct OpenMlSource {
    client: Client,
    base_url: String,
    name: String,
    version: u32,
}

impl OpenMlSource {
    pub fn new(name: &str, version: u32) -> Self {
        Self::with_base_url(OPENML_API, name, version)
    }

    pub fn with_base_url(base_url: &str, name: &str, version: u32) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            version,
        }
    }

    fn list_url(&self) -> String {
        format!(
            "{}/api/v1/json/data/list/data_name/{}/data_version/{}/limit/1",
            self.base_url, self.name, self.version
        )
    }

    fn description_url(&self, dataset_id: u64) -> String {
        format!("{}/api/v1/json/data/{}", self.base_url, dataset_id)
    }

    fn csv_url(&self, file_id: &str) -> String {
        format!("{}/data/v1/get_csv/{}", self.base_url, file_id)
    }

    fn acquisition_error(&self, reason: impl ToString) -> PipelineError {
        PipelineError::DataAcquisition {
            dataset: format!("{} (v{})", self.name, self.version),
            reason: reason.to_string(),
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        debug!("GET {}", url);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.acquisition_error(e))?;
        if !resp.status().is_success() {
            return Err(self.acquisition_error(format!("{} returned {}", url, resp.status())));
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.get(url)
            .await?
            .json::<T>()
            .await
            .map_err(|e| self.acquisition_error(format!("unexpected response from {}: {}", url, e)))
    }

    async fn resolve_dataset_id(&self) -> Result<u64> {
        let listing: ListResponse = self.get_json(&self.list_url()).await?;
        listing
            .data
            .dataset
            .first()
            .map(|d| d.did)
            .ok_or_else(|| self.acquisition_error("no dataset with that name and version"))
    }
}

#[async_trait]
impl DatasetSource for OpenMlSource {
    fn describe(&self) -> String {
        format!("openml:{} (v{})", self.name, self.version)
    }

    async fn fetch(&self) -> Result<RawDataset> {
        let dataset_id = self.resolve_dataset_id().await?;
        let desc: DescriptionResponse = self.get_json(&self.description_url(dataset_id)).await?;
        let desc = desc.data_set_description;
        info!(
            "OpenML dataset {} resolved: id={}, file_id={}",
            self.name, dataset_id, desc.file_id
        );

        let body = self
            .get(&self.csv_url(&desc.file_id))
            .await?
            .bytes()
            .await
            .map_err(|e| self.acquisition_error(e))?;

        let (names, values) = read_numeric_csv(body.as_ref(), &self.describe())?;
        Ok(RawDataset {
            name: self.name.clone(),
            table: FeatureTable::new(names, values)?,
            default_target: desc
                .default_target_attribute
                .filter(|t| !t.is_empty() && !t.contains(',')),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Debug, Deserialize)]
struct ListData {
    dataset: Vec<ListedDataset>,
}

#[derive(Debug, Deserialize)]
struct ListedDataset {
    did: u64,
}

#[derive(Debug, Deserialize)]
struct DescriptionResponse {
    data_set_description: DatasetDescription,
}

#[derive(Debug, Deserialize)]
struct DatasetDescription {
    file_id: String,
    #[serde(default)]
    default_target_attribute: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let source = OpenMlSource::with_base_url("https://example.org/", "boston", 1);
        assert_eq!(
            source.list_url(),
            "https://example.org/api/v1/json/data/list/data_name/boston/data_version/1/limit/1"
        );
        assert_eq!(source.description_url(531), "https://example.org/api/v1/json/data/531");
        assert_eq!(source.csv_url("52643"), "https://example.org/data/v1/get_csv/52643");
    }

    #[test]
    fn test_parse_api_payloads() {
        let listing: ListResponse = serde_json::from_str(
            r#"{"data":{"dataset":[{"did":531,"name":"boston","version":1,"status":"active"}]}}"#,
        )
        .unwrap();
        assert_eq!(listing.data.dataset[0].did, 531);

        let desc: DescriptionResponse = serde_json::from_str(
            r#"{"data_set_description":{"id":"531","name":"boston","file_id":"52643","default_target_attribute":"MEDV"}}"#,
        )
        .unwrap();
        assert_eq!(desc.data_set_description.file_id, "52643");
        assert_eq!(desc.data_set_description.default_target_attribute.as_deref(), Some("MEDV"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_acquisition_error() {
        let source = OpenMlSource::with_base_url("http://127.0.0.1:9", "boston", 1);
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, PipelineError::DataAcquisition { .. }));
    }
}
