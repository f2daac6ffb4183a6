//! The tagging pipeline: one job in, one sealed audit run out.
//!
//! Stage order per run: metadata fetch, checkout, file sampling, prompt
//! assembly, model call, normalization, diff, apply, audit, notify. Every
//! failure is classified transient (queue retries) or permanent (queue
//! discards); either way exactly one terminal run record is written, and
//! notifications go out only after the run is sealed.

mod checkout;
pub mod prompt;
pub mod sampling;

pub use checkout::{BaseCheckout, GitCheckout};
pub use sampling::{sample_repository_files, SampledFile};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, error, info};

use super::audit::{JobRunRecord, NewAssignment, RunDetails, RunStatus, TagScope};
use super::catalog_client::{CatalogTag, RepositoryMetadata, TagWrite, TagWriteRequest};
use super::deps::TaggingDeps;
use super::error::{TaggingError, TaggingResult};
use super::jobs::{JobProcessor, TagJobPayload};
use super::model_client::{ModelTagOutput, Usage};
use super::notifier::{TaggingCompleted, TaggingFailed};
use super::tags::{
    diff_repository_tags, normalize_file_tags, normalize_tags, FileTagPayload, TagPayload,
    TagRef, TAG_SOURCE,
};

const README_CLIP: usize = 4_000;

/// What a successful run applied.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: i64,
    pub repository_tag_count: usize,
    pub file_tag_count: usize,
}

/// Partial results carried across stages so failed runs still record the
/// prompt and raw response when they were produced.
#[derive(Default)]
struct RunScratch {
    prompt: Option<String>,
    raw_response: Option<String>,
    usage: Option<Usage>,
}

struct AppliedTags {
    repository_tags: Vec<TagPayload>,
    file_tags: Vec<FileTagPayload>,
}

/// Executes tagging jobs end to end.
pub struct TagJobProcessor {
    deps: Arc<TaggingDeps>,
}

impl TagJobProcessor {
    pub fn new(deps: Arc<TaggingDeps>) -> Self {
        Self { deps }
    }

    /// Run one job: bookkeeping, the staged pipeline, sealing, notify.
    pub async fn run_job(&self, payload: &TagJobPayload) -> TaggingResult<RunOutcome> {
        let repository_id = payload.repository_id.as_str();

        let job = self
            .deps
            .store
            .upsert_job(repository_id)
            .await
            .map_err(TaggingError::transient)?;
        let run = self
            .deps
            .store
            .start_run(job.id)
            .await
            .map_err(TaggingError::transient)?;
        let started = Instant::now();

        debug!(
            repository_id = %repository_id,
            run_id = run.id,
            trigger = %payload.trigger,
            "tagging run started"
        );

        let mut scratch = RunScratch::default();
        let applied = self.execute_stages(repository_id, &mut scratch).await;
        let latency_ms = (started.elapsed().as_secs_f64() * 1000.0).round() as i64;

        match applied {
            Ok(applied) => {
                self.seal_success(payload, &run, applied, scratch, latency_ms)
                    .await
            }
            Err(err) => {
                self.seal_failure(payload, &run, err, scratch, latency_ms)
                    .await
            }
        }
    }

    async fn seal_success(
        &self,
        payload: &TagJobPayload,
        run: &JobRunRecord,
        applied: AppliedTags,
        scratch: RunScratch,
        latency_ms: i64,
    ) -> TaggingResult<RunOutcome> {
        let repository_id = payload.repository_id.as_str();

        let assignments = build_assignments(repository_id, &applied);
        self.deps
            .store
            .record_assignments(run.id, &assignments)
            .await
            .map_err(TaggingError::transient)?;

        let usage = scratch.usage.unwrap_or_default();
        self.deps
            .store
            .complete_run(
                run.id,
                RunStatus::Succeeded,
                RunDetails {
                    prompt: scratch.prompt,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    latency_ms: Some(latency_ms),
                    raw_response: scratch.raw_response,
                    ..Default::default()
                },
            )
            .await
            .map_err(TaggingError::transient)?;

        let outcome = RunOutcome {
            run_id: run.id,
            repository_tag_count: applied.repository_tags.len(),
            file_tag_count: applied
                .file_tags
                .iter()
                .map(|file| file.tags.len())
                .sum(),
        };

        info!(
            repository_id = %repository_id,
            run_id = run.id,
            repository_tags = outcome.repository_tag_count,
            file_tags = outcome.file_tag_count,
            latency_ms,
            "tagging run succeeded"
        );

        self.deps
            .notifier
            .tagging_completed(TaggingCompleted {
                repository_id: repository_id.to_string(),
                job_run_id: run.id,
                repository_tag_count: outcome.repository_tag_count,
                file_tag_count: outcome.file_tag_count,
                trigger: payload.trigger,
            })
            .await;

        Ok(outcome)
    }

    async fn seal_failure(
        &self,
        payload: &TagJobPayload,
        run: &JobRunRecord,
        err: TaggingError,
        scratch: RunScratch,
        latency_ms: i64,
    ) -> TaggingResult<RunOutcome> {
        let repository_id = payload.repository_id.as_str();

        let sealed = self
            .deps
            .store
            .complete_run(
                run.id,
                RunStatus::Failed,
                RunDetails {
                    error_message: Some(err.message()),
                    prompt: scratch.prompt,
                    latency_ms: Some(latency_ms),
                    raw_response: scratch.raw_response,
                    ..Default::default()
                },
            )
            .await;

        if let Err(store_err) = sealed {
            // The run cannot be sealed; surface the store failure so the
            // queue redelivers the job.
            error!(
                repository_id = %repository_id,
                run_id = run.id,
                error = %store_err,
                "audit store failure, run not sealed"
            );
            return Err(TaggingError::transient(store_err));
        }

        self.deps
            .notifier
            .tagging_failed(TaggingFailed {
                repository_id: repository_id.to_string(),
                job_run_id: run.id,
                error: err.message(),
                transient: err.is_transient(),
                trigger: payload.trigger,
            })
            .await;

        Err(err)
    }

    /// Stages 2-9: everything between run bookkeeping and the audit seal.
    async fn execute_stages(
        &self,
        repository_id: &str,
        scratch: &mut RunScratch,
    ) -> TaggingResult<AppliedTags> {
        // Metadata fetch.
        let metadata = self
            .deps
            .catalog
            .get_repository(repository_id)
            .await
            .map_err(TaggingError::transient)?;
        let repo_url = metadata
            .clone_url()
            .ok_or_else(|| {
                TaggingError::permanent(anyhow!("repository metadata missing repoUrl"))
            })?
            .to_string();

        // Checkout.
        let checkout_dir = self
            .deps
            .checkout
            .ensure_checkout(repository_id, &repo_url, metadata.default_branch.as_deref())
            .await
            .map_err(TaggingError::transient)?;

        // File sampling (explorer first, local fallback inside).
        let files =
            sample_repository_files(self.deps.file_explorer.as_ref(), repository_id, &checkout_dir)
                .await;

        // Prompt assembly.
        let template = prompt::load_template(&self.deps.prompt_template_path)
            .map_err(TaggingError::transient)?;
        let rendered = prompt::render(
            &template,
            &prompt_context(&metadata, &repo_url, &files),
        );
        scratch.prompt = Some(rendered.clone());

        // Model call.
        let completion = self
            .deps
            .model
            .suggest_tags(&rendered)
            .await
            .map_err(TaggingError::transient)?;
        scratch.usage = completion.usage;
        let content = completion
            .content()
            .ok_or_else(|| TaggingError::permanent(anyhow!("model response missing content")))?
            .to_string();
        scratch.raw_response = Some(content.clone());

        let output: ModelTagOutput = serde_json::from_str(&content).map_err(|err| {
            TaggingError::permanent(anyhow!("model response was not usable tag JSON: {err}"))
        })?;

        // Normalization.
        let repository_tags = normalize_tags(output.repository_tags);
        let file_tags = normalize_file_tags(output.file_tags);

        // Diff against the service-owned slice of existing tags.
        let existing = service_owned_tags(&metadata.tags);
        let diff = diff_repository_tags(repository_tags, &existing);

        // Apply: repository batch first, then per-file tags.
        let request = TagWriteRequest {
            tags: diff
                .apply
                .iter()
                .map(|tag| TagWrite {
                    key: tag.key.clone(),
                    value: tag.value.clone(),
                    source: TAG_SOURCE.to_string(),
                    confidence: tag.confidence,
                })
                .collect(),
            remove: diff.remove,
        };
        self.deps
            .catalog
            .apply_tags(repository_id, &request)
            .await
            .map_err(TaggingError::transient)?;

        for file in &file_tags {
            self.deps
                .file_explorer
                .apply_file_tags(repository_id, &file.path, &file.tags)
                .await
                .map_err(TaggingError::transient)?;
        }

        Ok(AppliedTags {
            repository_tags: diff.apply,
            file_tags,
        })
    }
}

#[async_trait]
impl JobProcessor for TagJobProcessor {
    async fn process(&self, payload: &TagJobPayload) -> Result<(), TaggingError> {
        self.run_job(payload).await.map(|_| ())
    }
}

/// Existing repository tags owned by this service (source absent or ours).
fn service_owned_tags(tags: &[CatalogTag]) -> Vec<TagRef> {
    tags.iter()
        .filter(|tag| {
            tag.source
                .as_deref()
                .map(|source| source == TAG_SOURCE)
                .unwrap_or(true)
        })
        .map(|tag| TagRef {
            key: tag.key.clone(),
            value: tag.value.clone(),
        })
        .collect()
}

fn build_assignments(repository_id: &str, applied: &AppliedTags) -> Vec<NewAssignment> {
    let mut assignments = Vec::new();
    for tag in &applied.repository_tags {
        assignments.push(NewAssignment {
            scope: TagScope::Repository,
            target: repository_id.to_string(),
            key: tag.key.clone(),
            value: tag.value.clone(),
            confidence: tag.confidence,
        });
    }
    for file in &applied.file_tags {
        for tag in &file.tags {
            assignments.push(NewAssignment {
                scope: TagScope::File,
                target: file.path.clone(),
                key: tag.key.clone(),
                value: tag.value.clone(),
                confidence: tag.confidence,
            });
        }
    }
    assignments
}

fn prompt_context<'a>(
    metadata: &RepositoryMetadata,
    repo_url: &str,
    files: &[SampledFile],
) -> HashMap<&'a str, String> {
    let name = metadata
        .name
        .clone()
        .unwrap_or_else(|| metadata.id.clone());

    let mut summary = format!("Name: {name}");
    if let Some(description) = &metadata.description {
        summary.push_str(&format!("\nDescription: {description}"));
    }
    if let Some(branch) = &metadata.default_branch {
        summary.push_str(&format!("\nDefault branch: {branch}"));
    }
    summary.push_str(&format!("\nRepository URL: {repo_url}"));

    let existing_tags = if metadata.tags.is_empty() {
        "No existing tags.".to_string()
    } else {
        metadata
            .tags
            .iter()
            .map(|tag| format!("- {}: {}", tag.key, tag.value))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let readme = match &metadata.readme {
        Some(readme) => readme.chars().take(README_CLIP).collect(),
        None => "README not available.".to_string(),
    };

    let file_summaries = files
        .iter()
        .map(|file| format!("## {}\n{}\n", file.path, file.snippet))
        .collect::<Vec<_>>()
        .join("\n");

    let mut context = HashMap::new();
    context.insert("name", name);
    context.insert("summary", summary);
    context.insert("existing_tags", existing_tags);
    context.insert("readme", readme);
    context.insert("file_summaries", file_summaries);
    context
}
