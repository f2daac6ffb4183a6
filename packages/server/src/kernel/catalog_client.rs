//! Catalog API client using direct HTTP calls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::tags::TagRef;

/// A repository tag as the catalog stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogTag {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Repository metadata returned by `GET /apps/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryMetadata {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "repoUrl", default)]
    pub repo_url: Option<String>,
    /// Legacy field name still emitted by older catalog versions.
    #[serde(rename = "repositoryUrl", default)]
    pub repository_url: Option<String>,
    #[serde(rename = "defaultBranch", default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub readme: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<CatalogTag>,
}

impl RepositoryMetadata {
    /// The clone URL, accepting either field name.
    pub fn clone_url(&self) -> Option<&str> {
        self.repo_url
            .as_deref()
            .or(self.repository_url.as_deref())
    }
}

/// One entry of the paged repository listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositorySummary {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "ingestStatus", default)]
    pub ingest_status: Option<String>,
}

/// A tag write, stamped with this service as its source.
#[derive(Debug, Clone, Serialize)]
pub struct TagWrite {
    pub key: String,
    pub value: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Body of `POST /apps/{id}/tags`.
#[derive(Debug, Clone, Serialize)]
pub struct TagWriteRequest {
    pub tags: Vec<TagWrite>,
    pub remove: Vec<TagRef>,
}

/// Trait for catalog operations, mockable in tests.
#[async_trait]
pub trait BaseCatalog: Send + Sync {
    async fn get_repository(&self, repository_id: &str) -> Result<RepositoryMetadata>;

    /// One page of repository summaries; pages are 1-based.
    async fn list_repositories(
        &self,
        page: i64,
        per_page: i64,
    ) -> Result<Vec<RepositorySummary>>;

    async fn apply_tags(&self, repository_id: &str, request: &TagWriteRequest) -> Result<()>;
}

/// Catalog client using direct API calls.
pub struct CatalogClient {
    client: Client,
    base_url: String,
    token: String,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl BaseCatalog for CatalogClient {
    async fn get_repository(&self, repository_id: &str) -> Result<RepositoryMetadata> {
        let url = format!("{}/apps/{}", self.base_url, repository_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .context("Failed to send request to catalog")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Catalog API error: {} - {}", status, text);
        }

        response
            .json()
            .await
            .context("Failed to parse catalog repository response")
    }

    async fn list_repositories(
        &self,
        page: i64,
        per_page: i64,
    ) -> Result<Vec<RepositorySummary>> {
        let url = format!(
            "{}/apps?page={}&perPage={}",
            self.base_url, page, per_page
        );
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .context("Failed to send request to catalog")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Catalog API error: {} - {}", status, text);
        }

        response
            .json()
            .await
            .context("Failed to parse catalog listing response")
    }

    async fn apply_tags(&self, repository_id: &str, request: &TagWriteRequest) -> Result<()> {
        let url = format!("{}/apps/{}/tags", self.base_url, repository_id);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(request)
            .send()
            .await
            .context("Failed to send tag batch to catalog")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Catalog API error: {} - {}", status, text);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_url_accepts_legacy_field() {
        let metadata: RepositoryMetadata = serde_json::from_str(
            r#"{"id":"r1","repositoryUrl":"https://example.com/r1.git"}"#,
        )
        .unwrap();
        assert_eq!(metadata.clone_url(), Some("https://example.com/r1.git"));

        let metadata: RepositoryMetadata =
            serde_json::from_str(r#"{"id":"r1","repoUrl":"https://example.com/new.git"}"#).unwrap();
        assert_eq!(metadata.clone_url(), Some("https://example.com/new.git"));

        let metadata: RepositoryMetadata = serde_json::from_str(r#"{"id":"r1"}"#).unwrap();
        assert_eq!(metadata.clone_url(), None);
    }

    #[test]
    fn tag_write_request_serializes_to_catalog_shape() {
        let request = TagWriteRequest {
            tags: vec![TagWrite {
                key: "language".to_string(),
                value: "rust".to_string(),
                source: "tagging-service".to_string(),
                confidence: Some(0.9),
            }],
            remove: vec![TagRef {
                key: "language".to_string(),
                value: "go".to_string(),
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tags"][0]["source"], "tagging-service");
        assert_eq!(json["tags"][0]["confidence"], 0.9);
        assert_eq!(json["remove"][0]["value"], "go");
    }
}
