//! File sampling for prompt assembly.
//!
//! The file explorer is asked first; if it fails the checkout is walked
//! locally. Either way the result is at most 20 files, each with a short
//! UTF-8 snippet.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::kernel::file_explorer_client::BaseFileExplorer;

/// Maximum files included in a prompt.
pub const MAX_SAMPLED_FILES: usize = 20;
/// Snippet size limit in bytes; longer snippets are truncated with a marker.
const SNIPPET_LIMIT: usize = 800;
/// Files above this size only have their head read.
const LARGE_FILE_THRESHOLD: u64 = 200_000;
const LARGE_FILE_HEAD: usize = 2_000;
const TRUNCATION_MARKER: &str = "\n...";

/// Directories never worth sampling.
const SKIPPED_DIRS: [&str; 6] = [".git", "node_modules", "dist", "build", "out", "venv"];

/// A file selected for the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledFile {
    pub path: String,
    pub snippet: String,
}

/// Sample up to 20 files for a repository. Explorer failures fall back to
/// local discovery; they never fail the run.
pub async fn sample_repository_files(
    explorer: &dyn BaseFileExplorer,
    repository_id: &str,
    checkout: &Path,
) -> Vec<SampledFile> {
    match explorer.search_files(repository_id, MAX_SAMPLED_FILES).await {
        Ok(hits) => {
            let mut files = Vec::with_capacity(hits.len().min(MAX_SAMPLED_FILES));
            for hit in hits.into_iter().take(MAX_SAMPLED_FILES) {
                let snippet = match hit.preview {
                    Some(preview) => clip_snippet(preview),
                    None => read_snippet(&checkout.join(&hit.path)).await,
                };
                files.push(SampledFile {
                    path: hit.path,
                    snippet,
                });
            }
            files
        }
        Err(err) => {
            warn!(
                repository_id = %repository_id,
                error = %err,
                "file explorer search failed, falling back to local discovery"
            );
            let mut files = Vec::new();
            for path in discover_local_files(checkout) {
                let snippet = read_snippet(&checkout.join(&path)).await;
                files.push(SampledFile {
                    path: path.to_string_lossy().replace('\\', "/"),
                    snippet,
                });
            }
            files
        }
    }
}

/// Walk the checkout collecting up to 20 file paths (relative to the
/// root) in depth-first, stack-pop order, skipping vendored and derived
/// directories.
pub fn discover_local_files(root: &Path) -> Vec<PathBuf> {
    let mut stack = vec![root.to_path_buf()];
    let mut files = Vec::new();

    while let Some(dir) = stack.pop() {
        if files.len() >= MAX_SAMPLED_FILES {
            break;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let skip = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| SKIPPED_DIRS.contains(&name))
                    .unwrap_or(false);
                if !skip {
                    stack.push(path);
                }
            } else if files.len() < MAX_SAMPLED_FILES {
                if let Ok(relative) = path.strip_prefix(root) {
                    files.push(relative.to_path_buf());
                }
            }
        }
    }

    files
}

/// Read a snippet from a local file. Unreadable files yield an empty
/// snippet.
pub async fn read_snippet(path: &Path) -> String {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(_) => return String::new(),
    };

    let read_limit = if metadata.len() > LARGE_FILE_THRESHOLD {
        LARGE_FILE_HEAD
    } else {
        SNIPPET_LIMIT
    };

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(_) => return String::new(),
    };

    let mut buf = Vec::with_capacity(read_limit);
    if file
        .take(read_limit as u64)
        .read_to_end(&mut buf)
        .await
        .is_err()
    {
        return String::new();
    }

    let text = String::from_utf8_lossy(&buf).into_owned();
    if metadata.len() as usize > SNIPPET_LIMIT {
        format!(
            "{}{}",
            clip_to_boundary(&text, SNIPPET_LIMIT),
            TRUNCATION_MARKER
        )
    } else {
        text
    }
}

/// Enforce the snippet limit, appending the truncation marker when the
/// text was cut.
fn clip_snippet(text: String) -> String {
    if text.len() <= SNIPPET_LIMIT {
        return text;
    }
    format!(
        "{}{}",
        clip_to_boundary(&text, SNIPPET_LIMIT),
        TRUNCATION_MARKER
    )
}

/// Longest prefix of `text` at most `limit` bytes that ends on a char
/// boundary.
fn clip_to_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
