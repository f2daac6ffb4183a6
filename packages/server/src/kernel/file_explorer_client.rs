//! File-explorer API client using direct HTTP calls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::tags::TagPayload;

/// A candidate file returned by the explorer search.
#[derive(Debug, Clone, Deserialize)]
pub struct FileSearchHit {
    pub path: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub preview: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileTagRequest<'a> {
    #[serde(rename = "repositoryId")]
    repository_id: &'a str,
    path: &'a str,
    tags: &'a [TagPayload],
}

/// Trait for file-explorer operations, mockable in tests.
#[async_trait]
pub trait BaseFileExplorer: Send + Sync {
    /// Up to `limit` candidate files for a repository.
    async fn search_files(&self, repository_id: &str, limit: usize)
        -> Result<Vec<FileSearchHit>>;

    async fn apply_file_tags(
        &self,
        repository_id: &str,
        path: &str,
        tags: &[TagPayload],
    ) -> Result<()>;

    async fn remove_file_tags(
        &self,
        repository_id: &str,
        path: &str,
        tags: &[TagPayload],
    ) -> Result<()>;

    async fn health(&self) -> Result<()>;
}

/// File-explorer client using direct API calls.
pub struct FileExplorerClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl FileExplorerClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("File explorer {} error: {} - {}", what, status, text);
        }
        Ok(response)
    }
}

#[async_trait]
impl BaseFileExplorer for FileExplorerClient {
    async fn search_files(
        &self,
        repository_id: &str,
        limit: usize,
    ) -> Result<Vec<FileSearchHit>> {
        let url = format!(
            "{}/api/search?repositoryId={}&limit={}",
            self.base_url, repository_id, limit
        );
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .context("Failed to send search request to file explorer")?;

        Self::check(response, "search")
            .await?
            .json()
            .await
            .context("Failed to parse file explorer search response")
    }

    async fn apply_file_tags(
        &self,
        repository_id: &str,
        path: &str,
        tags: &[TagPayload],
    ) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let body = FileTagRequest {
            repository_id,
            path,
            tags,
        };
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .context("Failed to send file tags to file explorer")?;

        Self::check(response, "tag").await?;
        Ok(())
    }

    async fn remove_file_tags(
        &self,
        repository_id: &str,
        path: &str,
        tags: &[TagPayload],
    ) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let body = FileTagRequest {
            repository_id,
            path,
            tags,
        };
        let response = self
            .authorize(self.client.delete(&url))
            .json(&body)
            .send()
            .await
            .context("Failed to send file tag removals to file explorer")?;

        Self::check(response, "untag").await?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .context("Failed to reach file explorer")?;

        Self::check(response, "health").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_hits_tolerate_missing_optionals() {
        let hits: Vec<FileSearchHit> = serde_json::from_str(
            r#"[{"path":"src/main.rs","score":0.8,"preview":"fn main() {}"},{"path":"README.md"}]"#,
        )
        .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].preview.as_deref(), Some("fn main() {}"));
        assert_eq!(hits[1].score, None);
        assert_eq!(hits[1].preview, None);
    }

    #[test]
    fn tag_request_uses_wire_field_names() {
        let tags = vec![TagPayload {
            key: "role".to_string(),
            value: "entrypoint".to_string(),
            confidence: None,
        }];
        let body = FileTagRequest {
            repository_id: "r1",
            path: "src/main.rs",
            tags: &tags,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["repositoryId"], "r1");
        assert_eq!(json["path"], "src/main.rs");
        assert_eq!(json["tags"][0]["key"], "role");
    }
}
