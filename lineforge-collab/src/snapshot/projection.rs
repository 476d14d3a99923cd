//! Reduced view of the snapshot sent to newly connected sync clients.
//!
//! Point-file records (`project:point-file:<projectId>:<id>`) carry full
//! version histories and dominate the snapshot size. The projection drops
//! them from `snapshot` and lists a short summary per project instead, merged
//! with the entries of `project:point-file-index:<projectId>` records.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{value_to_string, Snapshot, SnapshotState};

static POINT_FILE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^project:point-file:([^:]+):([^:]+)$").expect("valid point-file key pattern")
});
static POINT_FILE_INDEX_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^project:point-file-index:([^:]+)$").expect("valid point-file index pattern")
});

const DEFAULT_EXPORT_FORMAT: &str = "csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointFileSummary {
    pub point_file_id: String,
    pub point_file_name: String,
    pub export_format: String,
    pub created_at: Option<Value>,
    pub updated_at: Option<Value>,
    pub latest_version_id: Option<String>,
    pub version_count: u64,
    pub source: Option<Value>,
    pub source_label: Option<Value>,
}

impl PointFileSummary {
    /// Summarize a full point-file record.
    fn from_record(record: &Map<String, Value>, fallback_id: &str) -> Self {
        let versions = record
            .get("versions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let point_file_id = text_or(record.get("pointFileId"), "");
        Self {
            point_file_id: if point_file_id.is_empty() {
                fallback_id.to_string()
            } else {
                point_file_id
            },
            point_file_name: text_or(record.get("pointFileName"), ""),
            export_format: text_or(record.get("exportFormat"), DEFAULT_EXPORT_FORMAT),
            created_at: truthy(record.get("createdAt")),
            updated_at: truthy(record.get("updatedAt")),
            latest_version_id: versions
                .last()
                .map(|v| text_or(v.get("versionId"), "")),
            version_count: versions.len() as u64,
            source: truthy(record.get("source")),
            source_label: truthy(record.get("sourceLabel")),
        }
    }

    /// Read an entry of a point-file index record.
    fn from_index_entry(entry: &Map<String, Value>) -> Self {
        let version_count = entry
            .get("versionCount")
            .and_then(Value::as_f64)
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as u64)
            .unwrap_or(0);
        Self {
            point_file_id: text_or(entry.get("pointFileId"), ""),
            point_file_name: text_or(entry.get("pointFileName"), ""),
            export_format: text_or(entry.get("exportFormat"), DEFAULT_EXPORT_FORMAT),
            created_at: truthy(entry.get("createdAt")),
            updated_at: truthy(entry.get("updatedAt")),
            latest_version_id: truthy(entry.get("latestVersionId")).map(|v| value_to_string(&v)),
            version_count,
            source: truthy(entry.get("source")),
            source_label: truthy(entry.get("sourceLabel")),
        }
    }
}

/// What a `sync-welcome` carries as `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotProjection {
    pub version: u64,
    pub snapshot: Snapshot,
    pub checksum: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub point_file_summary: BTreeMap<String, Vec<PointFileSummary>>,
}

/// Build the welcome projection of `state`.
pub fn build_projection(state: &SnapshotState) -> SnapshotProjection {
    let mut summary = summaries_from_index(&state.snapshot);
    let mut snapshot = Snapshot::new();

    for (key, value) in &state.snapshot {
        let Some(caps) = POINT_FILE_KEY.captures(key) else {
            snapshot.insert(key.clone(), value.clone());
            continue;
        };
        let project_id = caps[1].trim();
        let Some(record) = parse_object(value) else { continue };
        if project_id.is_empty() {
            continue;
        }
        let entry = PointFileSummary::from_record(&record, caps[2].trim());
        let entries = summary.entry(project_id.to_string()).or_default();
        if !entries.iter().any(|e| e.point_file_id == entry.point_file_id) {
            entries.push(entry);
        }
    }

    SnapshotProjection {
        version: state.version,
        snapshot,
        checksum: state.checksum.clone(),
        updated_at: state.updated_at,
        point_file_summary: summary,
    }
}

fn summaries_from_index(snapshot: &Snapshot) -> BTreeMap<String, Vec<PointFileSummary>> {
    let mut grouped = BTreeMap::new();
    for (key, value) in snapshot {
        let Some(caps) = POINT_FILE_INDEX_KEY.captures(key) else { continue };
        let project_id = caps[1].trim();
        if project_id.is_empty() {
            continue;
        }
        let Some(index) = parse_object(value) else { continue };
        let entries: Vec<PointFileSummary> = index
            .values()
            .filter_map(Value::as_object)
            .map(PointFileSummary::from_index_entry)
            .filter(|e| !e.point_file_id.is_empty())
            .collect();
        grouped.insert(project_id.to_string(), entries);
    }
    grouped
}

fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str(raw).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// `Some` for values a client would treat as present.
fn truthy(value: Option<&Value>) -> Option<Value> {
    match value? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Number(n) if n.as_f64().is_some_and(|f| f == 0.0 || f.is_nan()) => None,
        other => Some(other.clone()),
    }
}

fn text_or(value: Option<&Value>, default: &str) -> String {
    truthy(value)
        .map(|v| value_to_string(&v))
        .unwrap_or_else(|| default.to_string())
}
