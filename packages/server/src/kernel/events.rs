//! Inbound repository event envelopes.
//!
//! Two envelope shapes arrive on the events channel:
//!
//! ```text
//! Legacy:   {"event": "repository.updated", "payload": {"repository": {...}}}
//! Envelope: {"event": {"type": "repository.updated", "data": {...}}}
//! ```
//!
//! All shape tolerance lives here: [`InboundEnvelope::normalize`] collapses
//! both into a [`NormalizedRepositoryEvent`]. For the envelope shape the
//! repository id and ingest status are resolved in order of preference:
//! `data.repository.{id, ingestStatus}`, then `data.{repositoryId,
//! ingestStatus}`, then `data.event.{repositoryId, status}`.

use serde::Deserialize;

/// A repository reference as it appears in event bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "ingestStatus", default)]
    pub ingest_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyPayload {
    #[serde(default)]
    pub repository: Option<RepositoryRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NestedEventRef {
    #[serde(rename = "repositoryId", default)]
    pub repository_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeData {
    #[serde(default)]
    pub repository: Option<RepositoryRef>,
    #[serde(rename = "repositoryId", default)]
    pub repository_id: Option<String>,
    #[serde(rename = "ingestStatus", default)]
    pub ingest_status: Option<String>,
    #[serde(default)]
    pub event: Option<NestedEventRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<EnvelopeData>,
}

/// The two accepted inbound message shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundEnvelope {
    Envelope { event: EnvelopeEvent },
    Legacy {
        event: String,
        #[serde(default)]
        payload: Option<LegacyPayload>,
    },
}

/// The shape-independent view the admission policy operates on.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRepositoryEvent {
    pub name: String,
    pub repository_id: Option<String>,
    pub ingest_status: Option<String>,
}

impl InboundEnvelope {
    /// Parse a raw channel message. Errors indicate JSON that fits neither
    /// envelope shape.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Collapse either shape into the normalized view.
    pub fn normalize(self) -> NormalizedRepositoryEvent {
        match self {
            InboundEnvelope::Legacy { event, payload } => {
                let repository = payload.and_then(|p| p.repository);
                let (repository_id, ingest_status) = match repository {
                    Some(repo) => (repo.id, repo.ingest_status),
                    None => (None, None),
                };
                NormalizedRepositoryEvent {
                    name: event,
                    repository_id,
                    ingest_status,
                }
            }
            InboundEnvelope::Envelope { event } => {
                let data = event.data;
                let repository = data.as_ref().and_then(|d| d.repository.clone());
                let nested = data.as_ref().and_then(|d| d.event.clone());

                let repository_id = repository
                    .as_ref()
                    .and_then(|r| r.id.clone())
                    .or_else(|| data.as_ref().and_then(|d| d.repository_id.clone()))
                    .or_else(|| nested.as_ref().and_then(|n| n.repository_id.clone()));
                let ingest_status = repository
                    .as_ref()
                    .and_then(|r| r.ingest_status.clone())
                    .or_else(|| data.as_ref().and_then(|d| d.ingest_status.clone()))
                    .or_else(|| nested.as_ref().and_then(|n| n.status.clone()));

                NormalizedRepositoryEvent {
                    name: event.kind,
                    repository_id,
                    ingest_status,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(raw: &str) -> NormalizedRepositoryEvent {
        InboundEnvelope::parse(raw).unwrap().normalize()
    }

    #[test]
    fn legacy_shape_normalizes() {
        let event = normalize(
            r#"{"event":"repository.updated","payload":{"repository":{"id":"r1","ingestStatus":"ready"}}}"#,
        );
        assert_eq!(event.name, "repository.updated");
        assert_eq!(event.repository_id.as_deref(), Some("r1"));
        assert_eq!(event.ingest_status.as_deref(), Some("ready"));
    }

    #[test]
    fn legacy_shape_without_payload() {
        let event = normalize(r#"{"event":"repository.deleted"}"#);
        assert_eq!(event.name, "repository.deleted");
        assert_eq!(event.repository_id, None);
        assert_eq!(event.ingest_status, None);
    }

    #[test]
    fn envelope_shape_prefers_nested_repository() {
        let event = normalize(
            r#"{"event":{"type":"repository.ingestion-event","data":{"repository":{"id":"r2","ingestStatus":"ready"},"repositoryId":"shadowed"}}}"#,
        );
        assert_eq!(event.name, "repository.ingestion-event");
        assert_eq!(event.repository_id.as_deref(), Some("r2"));
        assert_eq!(event.ingest_status.as_deref(), Some("ready"));
    }

    #[test]
    fn envelope_shape_falls_back_to_top_level_fields() {
        let event = normalize(
            r#"{"event":{"type":"repository.updated","data":{"repositoryId":"r3","ingestStatus":"pending"}}}"#,
        );
        assert_eq!(event.repository_id.as_deref(), Some("r3"));
        assert_eq!(event.ingest_status.as_deref(), Some("pending"));
    }

    #[test]
    fn envelope_shape_falls_back_to_nested_event() {
        let event = normalize(
            r#"{"event":{"type":"repository.ingestion-event","data":{"event":{"repositoryId":"r4","status":"ready"}}}}"#,
        );
        assert_eq!(event.repository_id.as_deref(), Some("r4"));
        assert_eq!(event.ingest_status.as_deref(), Some("ready"));
    }

    #[test]
    fn fallbacks_resolve_independently() {
        // id comes from the nested repository, status from the top level
        let event = normalize(
            r#"{"event":{"type":"repository.updated","data":{"repository":{"id":"r5"},"ingestStatus":"ready"}}}"#,
        );
        assert_eq!(event.repository_id.as_deref(), Some("r5"));
        assert_eq!(event.ingest_status.as_deref(), Some("ready"));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(InboundEnvelope::parse("not json").is_err());
        assert!(InboundEnvelope::parse(r#"{"event":42}"#).is_err());
        assert!(InboundEnvelope::parse(r#"{"event":{"data":{}}}"#).is_err());
    }
}
