//! In-flight tag values and the normalize/diff steps of the pipeline.
//!
//! Tags flow through the pipeline as [`TagPayload`] (repository scope) and
//! [`FileTagPayload`] (file scope). Normalization makes the model output
//! canonical; the diff reconciles it against what the catalog already
//! holds for this service.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Source marker stamped on every repository tag this service writes.
pub const TAG_SOURCE: &str = "tagging-service";

/// A single `(key, value)` tag with an optional confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPayload {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Tags scoped to a single file path within the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTagPayload {
    pub path: String,
    pub tags: Vec<TagPayload>,
}

/// A bare `(key, value)` reference, used for removals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagRef {
    pub key: String,
    pub value: String,
}

/// Result of reconciling new tags against existing ones.
#[derive(Debug, Clone, PartialEq)]
pub struct TagDiff {
    pub apply: Vec<TagPayload>,
    pub remove: Vec<TagRef>,
}

/// Canonicalize a tag key: lowercase, runs of non-alphanumerics collapse
/// to a single `_`, leading/trailing `_` stripped.
pub fn normalize_key(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_separator = false;
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            out.push(ch);
            pending_separator = false;
        } else {
            pending_separator = true;
        }
    }
    out
}

/// Canonicalize a tag value: trimmed and lowercased.
pub fn normalize_value(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Clamp a confidence into `[0, 1]`; NaN becomes absent.
pub fn clamp_confidence(raw: Option<f64>) -> Option<f64> {
    match raw {
        None => None,
        Some(c) if c.is_nan() => None,
        Some(c) => Some(c.clamp(0.0, 1.0)),
    }
}

/// Normalize a tag list: canonical keys and values, empties dropped,
/// `(key, value)` deduplicated (first occurrence wins), confidences
/// clamped. Idempotent.
pub fn normalize_tags(tags: Vec<TagPayload>) -> Vec<TagPayload> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let key = normalize_key(&tag.key);
        let value = normalize_value(&tag.value);
        if key.is_empty() || value.is_empty() {
            continue;
        }
        if !seen.insert((key.clone(), value.clone())) {
            continue;
        }
        out.push(TagPayload {
            key,
            value,
            confidence: clamp_confidence(tag.confidence),
        });
    }
    out
}

/// Normalize per-file tag lists, dropping files whose list becomes empty.
pub fn normalize_file_tags(files: Vec<FileTagPayload>) -> Vec<FileTagPayload> {
    files
        .into_iter()
        .filter_map(|file| {
            let tags = normalize_tags(file.tags);
            if tags.is_empty() {
                None
            } else {
                Some(FileTagPayload {
                    path: file.path,
                    tags,
                })
            }
        })
        .collect()
}

/// Reconcile new repository tags against the existing service-owned set:
/// everything new is applied, and existing pairs the model no longer
/// produces are removed. Identity is `(key, value)`.
pub fn diff_repository_tags(new: Vec<TagPayload>, existing: &[TagRef]) -> TagDiff {
    let keep: HashSet<(&str, &str)> = new
        .iter()
        .map(|tag| (tag.key.as_str(), tag.value.as_str()))
        .collect();

    let mut seen: HashSet<&TagRef> = HashSet::new();
    let remove = existing
        .iter()
        .filter(|tag| !keep.contains(&(tag.key.as_str(), tag.value.as_str())))
        .filter(|tag| seen.insert(*tag))
        .cloned()
        .collect();

    TagDiff { apply: new, remove }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(key: &str, value: &str, confidence: Option<f64>) -> TagPayload {
        TagPayload {
            key: key.to_string(),
            value: value.to_string(),
            confidence,
        }
    }

    #[test]
    fn key_normalization_collapses_separator_runs() {
        assert_eq!(normalize_key(" Framework "), "framework");
        assert_eq!(normalize_key("build--tool"), "build_tool");
        assert_eq!(normalize_key("__Runtime__"), "runtime");
        assert_eq!(normalize_key("c++ / templates"), "c_templates");
        assert_eq!(normalize_key("!!!"), "");
    }

    #[test]
    fn value_normalization_trims_and_lowercases() {
        assert_eq!(normalize_value(" Fastify "), "fastify");
        assert_eq!(normalize_value("TypeScript"), "typescript");
    }

    #[test]
    fn confidence_is_clamped_into_unit_interval() {
        assert_eq!(clamp_confidence(Some(2.0)), Some(1.0));
        assert_eq!(clamp_confidence(Some(-0.5)), Some(0.0));
        assert_eq!(clamp_confidence(Some(0.7)), Some(0.7));
        assert_eq!(clamp_confidence(Some(f64::NAN)), None);
        assert_eq!(clamp_confidence(None), None);
    }

    #[test]
    fn duplicate_pairs_collapse_to_one_tag() {
        let normalized = normalize_tags(vec![
            tag("Language", "TypeScript", Some(2.0)),
            tag("language", "typescript", None),
        ]);
        assert_eq!(
            normalized,
            vec![tag("language", "typescript", Some(1.0))]
        );
    }

    #[test]
    fn empty_keys_and_values_are_dropped() {
        let normalized = normalize_tags(vec![
            tag("", "rust", None),
            tag("language", "  ", None),
            tag("language", "rust", None),
        ]);
        assert_eq!(normalized, vec![tag("language", "rust", None)]);
    }

    #[test]
    fn normalization_is_idempotent() {
        let input = vec![
            tag(" Framework ", " Fastify ", Some(1.4)),
            tag("Language", "TypeScript", Some(-1.0)),
            tag("language", "typescript", Some(0.5)),
        ];
        let once = normalize_tags(input);
        let twice = normalize_tags(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn file_lists_that_normalize_empty_are_dropped() {
        let files = vec![
            FileTagPayload {
                path: "src/main.rs".to_string(),
                tags: vec![tag("Role", "Entrypoint", None)],
            },
            FileTagPayload {
                path: "empty.txt".to_string(),
                tags: vec![tag("", "", None)],
            },
        ];
        let normalized = normalize_file_tags(files);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].path, "src/main.rs");
        assert_eq!(normalized[0].tags, vec![tag("role", "entrypoint", None)]);
    }

    #[test]
    fn diff_applies_all_new_and_removes_stale() {
        let new = vec![tag("language", "rust", None), tag("framework", "axum", None)];
        let existing = vec![
            TagRef {
                key: "language".to_string(),
                value: "rust".to_string(),
            },
            TagRef {
                key: "framework".to_string(),
                value: "actix".to_string(),
            },
        ];

        let diff = diff_repository_tags(new.clone(), &existing);
        assert_eq!(diff.apply, new);
        assert_eq!(
            diff.remove,
            vec![TagRef {
                key: "framework".to_string(),
                value: "actix".to_string(),
            }]
        );
    }

    #[test]
    fn diff_removals_are_a_subset_of_existing() {
        let new = vec![tag("language", "go", None)];
        let existing = vec![
            TagRef {
                key: "language".to_string(),
                value: "go".to_string(),
            },
            TagRef {
                key: "language".to_string(),
                value: "rust".to_string(),
            },
        ];

        let diff = diff_repository_tags(new, &existing);
        for removal in &diff.remove {
            assert!(existing.contains(removal));
        }
        assert_eq!(diff.remove.len(), 1);
    }
}
