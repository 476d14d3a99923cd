//! Shared key/value snapshot with checksum-guarded mutation.
//!
//! ```text
//!            reconcile(version, snapshot)          apply(baseChecksum, ops)
//!                      │                                     │
//!                      ▼                                     ▼
//!   newer ─► adopt     equal+same ─► in-sync      checksum ≠ current ─► mismatch
//!   older ─► stale     equal+diff ─► conflict     no net change ─► no-op
//!                                                 otherwise ─► version+1, applied
//! ```
//!
//! Versions live in the integer range a JavaScript client can represent
//! exactly. Incoming versions are clamped to [`MAX_VERSION`], and a store at
//! that version refuses further changes instead of wrapping.
//!
//! [`SnapshotStore`] is the synchronous state machine. Concurrent access goes
//! through the actor in [`store`], which serializes every call so the checksum
//! comparison and the write are one indivisible step.

pub mod projection;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use projection::{build_projection, PointFileSummary, SnapshotProjection};
pub use store::{SnapshotHandle, SnapshotPersistence, StateStore, StoreError};

/// Keys that only the server may write.
pub const DEFAULT_EXCLUDED_PATTERNS: &[&str] = &[r"^project:ros:project-[^:]+:unlisted-\d+$"];

/// Largest snapshot version (2^53 - 1).
pub const MAX_VERSION: u64 = (1 << 53) - 1;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Snapshot contents keyed in code point order.
pub type Snapshot = BTreeMap<String, String>;

// ───────────────────────────────────────────────────────────────────
// Checksum
// ───────────────────────────────────────────────────────────────────

/// `fnv1a-xxxxxxxx` over the UTF-16 code units of the canonical JSON.
///
/// The canonical form is the compact JSON object with keys sorted, so the
/// result depends only on the contents.
pub fn compute_checksum(snapshot: &Snapshot) -> String {
    // A map of strings always serializes.
    let canonical = serde_json::to_string(snapshot).unwrap_or_default();
    let hash = canonical
        .encode_utf16()
        .fold(FNV_OFFSET_BASIS, |hash, unit| {
            (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
        });
    format!("fnv1a-{hash:08x}")
}

// ───────────────────────────────────────────────────────────────────
// Key filter
// ───────────────────────────────────────────────────────────────────

/// Decides which keys may be stored. Empty keys never are.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    excluded: RegexSet,
}

impl Default for KeyFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_PATTERNS).expect("valid default exclusion patterns")
    }
}

impl KeyFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            excluded: RegexSet::new(patterns)?,
        })
    }

    /// Filter that only rejects empty keys.
    pub fn allow_all() -> Self {
        Self {
            excluded: RegexSet::empty(),
        }
    }

    pub fn allows(&self, key: &str) -> bool {
        !key.is_empty() && !self.excluded.is_match(key)
    }

    /// Drop disallowed keys from a snapshot.
    pub fn retain(&self, snapshot: Snapshot) -> Snapshot {
        snapshot.into_iter().filter(|(k, _)| self.allows(k)).collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// One mutation of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiffOperation {
    Set { key: String, value: String },
    Remove { key: String },
    Clear,
}

impl DiffOperation {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove { key: key.into() }
    }

    /// Lenient decode of a client-supplied operation. Unknown types and
    /// non-object inputs yield `None`; keys and values are coerced to strings.
    pub fn from_value(value: &Value) -> Option<Self> {
        let key = || value.get("key").map(value_to_string).unwrap_or_default();
        match value.get("type")?.as_str()? {
            "set" => Some(Self::Set {
                key: key(),
                value: value.get("value").map(value_to_string).unwrap_or_default(),
            }),
            "remove" => Some(Self::Remove { key: key() }),
            "clear" => Some(Self::Clear),
            _ => None,
        }
    }

    /// Decode a list, skipping entries that are not operations.
    pub fn list_from_value(value: &Value) -> Vec<Self> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(Self::from_value).collect())
            .unwrap_or_default()
    }

    fn key(&self) -> Option<&str> {
        match self {
            Self::Set { key, .. } | Self::Remove { key } => Some(key),
            Self::Clear => None,
        }
    }

    fn apply_to(&self, snapshot: &mut Snapshot) {
        match self {
            Self::Set { key, value } => {
                snapshot.insert(key.clone(), value.clone());
            }
            Self::Remove { key } => {
                snapshot.remove(key);
            }
            Self::Clear => snapshot.clear(),
        }
    }
}

/// String form of a JSON value as stored in the snapshot.
///
/// Strings are kept as-is, `null` becomes empty, anything else is stored as
/// its JSON text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Coerce an arbitrary JSON object into snapshot contents.
pub fn snapshot_from_value(value: &Value) -> Snapshot {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect()
        })
        .unwrap_or_default()
}

/// Coerce a client version: negative, fractional or missing values are
/// truncated or treated as 0, and anything above [`MAX_VERSION`] is clamped.
pub fn version_from_value(value: Option<&Value>) -> u64 {
    let Some(value) = value else { return 0 };
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if n.is_finite() && n >= 0.0 => n.trunc().min(MAX_VERSION as f64) as u64,
        _ => 0,
    }
}

// ───────────────────────────────────────────────────────────────────
// State and outcomes
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotState {
    pub version: u64,
    pub snapshot: Snapshot,
    /// Always derived from `snapshot`
    pub checksum: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for SnapshotState {
    fn default() -> Self {
        Self::new(0, Snapshot::new(), None)
    }
}

impl SnapshotState {
    pub fn new(version: u64, snapshot: Snapshot, updated_at: Option<DateTime<Utc>>) -> Self {
        let checksum = compute_checksum(&snapshot);
        Self {
            version,
            snapshot,
            checksum,
            updated_at,
        }
    }

    /// `{version, checksum}` pair broadcast after a change.
    pub fn summary(&self) -> StateSummary {
        StateSummary {
            version: self.version,
            checksum: self.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub version: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStatus {
    ServerUpdated,
    ClientStale,
    ChecksumConflict,
    InSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStatus {
    Applied,
    NoOp,
    ChecksumMismatch,
    /// The store is at [`MAX_VERSION`] and cannot take another change
    VersionExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub status: ReconcileStatus,
    pub state: SnapshotState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub status: ApplyStatus,
    pub state: SnapshotState,
    /// Operations that took effect; empty unless `Applied`
    pub operations: Vec<DiffOperation>,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        self.status == ReconcileStatus::ServerUpdated
    }
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        self.status == ApplyStatus::Applied
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Single-owner snapshot state machine.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    state: SnapshotState,
    filter: KeyFilter,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(KeyFilter::default())
    }
}

impl SnapshotStore {
    pub fn new(filter: KeyFilter) -> Self {
        Self {
            state: SnapshotState::default(),
            filter,
        }
    }

    /// Restore previously saved contents. Excluded keys are dropped and the
    /// checksum recomputed.
    pub fn with_state(
        filter: KeyFilter,
        version: u64,
        snapshot: Snapshot,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        let snapshot = filter.retain(snapshot);
        Self {
            state: SnapshotState::new(version.min(MAX_VERSION), snapshot, updated_at),
            filter,
        }
    }

    pub fn state(&self) -> &SnapshotState {
        &self.state
    }

    pub fn filter(&self) -> &KeyFilter {
        &self.filter
    }

    /// Put back a state captured earlier, e.g. after a failed persist.
    pub fn restore(&mut self, state: SnapshotState) {
        self.state = state;
    }

    /// Compare a client's full copy against ours by version, then checksum.
    pub fn reconcile(&mut self, version: u64, snapshot: Snapshot) -> ReconcileOutcome {
        let incoming = self.filter.retain(snapshot);
        let version = version.min(MAX_VERSION);

        let status = if version > self.state.version {
            self.state = SnapshotState::new(version, incoming, Some(Utc::now()));
            ReconcileStatus::ServerUpdated
        } else if version < self.state.version {
            ReconcileStatus::ClientStale
        } else if compute_checksum(&incoming) != self.state.checksum {
            ReconcileStatus::ChecksumConflict
        } else {
            ReconcileStatus::InSync
        };

        ReconcileOutcome {
            status,
            state: self.state.clone(),
        }
    }

    /// Compare-and-swap a list of operations against `base_checksum`.
    pub fn apply_operations(
        &mut self,
        base_checksum: &str,
        operations: &[DiffOperation],
    ) -> ApplyOutcome {
        self.apply_guarded(Some(base_checksum), operations.iter())
    }

    /// Merge several operation groups and commit them as one change.
    ///
    /// With a base checksum the batch is compare-and-swap guarded exactly
    /// like [`apply_operations`](Self::apply_operations).
    pub fn apply_operations_batch(
        &mut self,
        base_checksum: Option<&str>,
        diffs: &[Vec<DiffOperation>],
    ) -> ApplyOutcome {
        self.apply_guarded(base_checksum, diffs.iter().flatten())
    }

    fn apply_guarded<'a>(
        &mut self,
        base_checksum: Option<&str>,
        operations: impl Iterator<Item = &'a DiffOperation>,
    ) -> ApplyOutcome {
        if let Some(base) = base_checksum {
            if base != self.state.checksum {
                return self.outcome(ApplyStatus::ChecksumMismatch, Vec::new());
            }
        }

        let operations: Vec<DiffOperation> = operations
            .filter(|op| op.key().map_or(true, |key| self.filter.allows(key)))
            .cloned()
            .collect();

        let mut next = self.state.snapshot.clone();
        for op in &operations {
            op.apply_to(&mut next);
        }
        if operations.is_empty() || next == self.state.snapshot {
            return self.outcome(ApplyStatus::NoOp, Vec::new());
        }

        let Some(version) = self.state.version.checked_add(1).filter(|v| *v <= MAX_VERSION) else {
            log::warn!("Snapshot version exhausted at {}; change refused", self.state.version);
            return self.outcome(ApplyStatus::VersionExhausted, Vec::new());
        };
        self.state = SnapshotState::new(version, next, Some(Utc::now()));
        self.outcome(ApplyStatus::Applied, operations)
    }

    fn outcome(&self, status: ApplyStatus, operations: Vec<DiffOperation>) -> ApplyOutcome {
        ApplyOutcome {
            status,
            state: self.state.clone(),
            operations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(pairs: &[(&str, &str)]) -> Snapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn store_at(version: u64, pairs: &[(&str, &str)]) -> SnapshotStore {
        SnapshotStore::with_state(KeyFilter::default(), version, snapshot(pairs), None)
    }

    #[test]
    fn test_checksum_format_and_order_independence() {
        let empty = compute_checksum(&Snapshot::new());
        assert!(empty.starts_with("fnv1a-"));
        assert_eq!(empty.len(), "fnv1a-".len() + 8);

        let mut forward = Snapshot::new();
        forward.insert("alpha".into(), "1".into());
        forward.insert("beta".into(), "2".into());
        let mut reverse = Snapshot::new();
        reverse.insert("beta".into(), "2".into());
        reverse.insert("alpha".into(), "1".into());
        assert_eq!(compute_checksum(&forward), compute_checksum(&reverse));
        assert_ne!(compute_checksum(&forward), empty);
    }

    #[test]
    fn test_checksum_known_value() {
        // FNV-1a of the two characters `{}`.
        let expected = ['{' as u32, '}' as u32]
            .iter()
            .fold(2_166_136_261u32, |h, c| (h ^ c).wrapping_mul(16_777_619));
        assert_eq!(compute_checksum(&Snapshot::new()), format!("fnv1a-{expected:08x}"));
    }

    #[test]
    fn test_checksum_hashes_utf16_units() {
        let a = compute_checksum(&snapshot(&[("k", "é")]));
        let b = compute_checksum(&snapshot(&[("k", "e")]));
        assert_ne!(a, b);
        let astral = compute_checksum(&snapshot(&[("k", "𝔘")]));
        assert_ne!(astral, a);
    }

    #[test]
    fn test_cas_success() {
        let mut store = store_at(1, &[("alpha", "1")]);
        let h0 = store.state().checksum.clone();

        let outcome = store.apply_operations(&h0, &[DiffOperation::set("beta", "2")]);
        assert_eq!(outcome.status, ApplyStatus::Applied);
        assert_eq!(outcome.state.version, 2);
        assert_eq!(outcome.state.snapshot, snapshot(&[("alpha", "1"), ("beta", "2")]));
        assert_ne!(outcome.state.checksum, h0);
        assert_eq!(outcome.operations, vec![DiffOperation::set("beta", "2")]);
        assert!(outcome.state.updated_at.is_some());
    }

    #[test]
    fn test_cas_failure_leaves_state() {
        let mut store = store_at(1, &[("alpha", "1")]);
        let before = store.state().clone();

        let outcome = store.apply_operations("wrong", &[DiffOperation::set("beta", "2")]);
        assert_eq!(outcome.status, ApplyStatus::ChecksumMismatch);
        assert_eq!(outcome.state, before);
        assert_eq!(store.state(), &before);
    }

    #[test]
    fn test_no_op_when_nothing_changes() {
        let mut store = store_at(3, &[("alpha", "1")]);
        let h = store.state().checksum.clone();

        let outcome = store.apply_operations(
            &h,
            &[DiffOperation::set("alpha", "1"), DiffOperation::remove("missing")],
        );
        assert_eq!(outcome.status, ApplyStatus::NoOp);
        assert!(outcome.operations.is_empty());
        assert_eq!(store.state().version, 3);

        let empty = store.apply_operations(&h, &[]);
        assert_eq!(empty.status, ApplyStatus::NoOp);
    }

    #[test]
    fn test_clear_operation() {
        let mut store = store_at(1, &[("a", "1"), ("b", "2")]);
        let h = store.state().checksum.clone();
        let outcome = store.apply_operations(&h, &[DiffOperation::Clear]);
        assert_eq!(outcome.status, ApplyStatus::Applied);
        assert!(outcome.state.snapshot.is_empty());

        let h = store.state().checksum.clone();
        assert_eq!(store.apply_operations(&h, &[DiffOperation::Clear]).status, ApplyStatus::NoOp);
    }

    #[test]
    fn test_excluded_keys_are_filtered() {
        let mut store = store_at(1, &[]);
        let h = store.state().checksum.clone();
        let outcome = store.apply_operations(
            &h,
            &[
                DiffOperation::set("project:ros:project-9:unlisted-12", "secret"),
                DiffOperation::set("", "empty"),
                DiffOperation::set("project:ros:project-9:listed-12", "ok"),
            ],
        );
        assert_eq!(outcome.status, ApplyStatus::Applied);
        assert_eq!(
            outcome.operations,
            vec![DiffOperation::set("project:ros:project-9:listed-12", "ok")]
        );

        let h = store.state().checksum.clone();
        let only_excluded = store.apply_operations(
            &h,
            &[DiffOperation::set("project:ros:project-1:unlisted-3", "x")],
        );
        assert_eq!(only_excluded.status, ApplyStatus::NoOp);

        let reconciled = store.reconcile(
            10,
            snapshot(&[("project:ros:project-1:unlisted-3", "x"), ("keep", "1")]),
        );
        assert_eq!(reconciled.state.snapshot, snapshot(&[("keep", "1")]));
    }

    #[test]
    fn test_reconcile_ordering() {
        let mut store = store_at(0, &[]);
        let adopted = store.reconcile(10, snapshot(&[("alpha", "1")]));
        assert_eq!(adopted.status, ReconcileStatus::ServerUpdated);
        assert_eq!(adopted.state.version, 10);
        assert_eq!(adopted.state.snapshot, snapshot(&[("alpha", "1")]));

        let mut store = store_at(20, &[("server", "yes")]);
        let before = store.state().clone();
        let stale = store.reconcile(5, snapshot(&[("client", "yes")]));
        assert_eq!(stale.status, ReconcileStatus::ClientStale);
        assert_eq!(stale.state, before);

        let mut store = store_at(4, &[("server", "yes")]);
        let before = store.state().clone();
        let conflict = store.reconcile(4, snapshot(&[("client", "yes")]));
        assert_eq!(conflict.status, ReconcileStatus::ChecksumConflict);
        assert_eq!(conflict.state, before);

        let in_sync = store.reconcile(4, snapshot(&[("server", "yes")]));
        assert_eq!(in_sync.status, ReconcileStatus::InSync);
        assert_eq!(in_sync.state, before);
    }

    #[test]
    fn test_batch_atomicity() {
        let mut store = store_at(1, &[("alpha", "1")]);
        let outcome = store.apply_operations_batch(
            None,
            &[
                vec![DiffOperation::set("beta", "2")],
                vec![DiffOperation::set("gamma", "3")],
                vec![DiffOperation::remove("alpha")],
            ],
        );
        assert_eq!(outcome.status, ApplyStatus::Applied);
        assert_eq!(outcome.state.version, 2);
        assert_eq!(outcome.state.snapshot, snapshot(&[("beta", "2"), ("gamma", "3")]));
        assert_eq!(outcome.operations.len(), 3);
    }

    #[test]
    fn test_batch_with_base_checksum() {
        let mut store = store_at(1, &[("alpha", "1")]);
        let mismatch = store.apply_operations_batch(Some("stale"), &[vec![DiffOperation::Clear]]);
        assert_eq!(mismatch.status, ApplyStatus::ChecksumMismatch);
        assert_eq!(store.state().version, 1);

        assert_eq!(store.apply_operations_batch(None, &[]).status, ApplyStatus::NoOp);
    }

    #[test]
    fn test_operation_decoding_is_lenient() {
        let ops = DiffOperation::list_from_value(&json!([
            {"type": "set", "key": "n", "value": 42},
            {"type": "set", "key": "flag", "value": true},
            {"type": "set", "key": "nothing"},
            {"type": "remove", "key": "gone"},
            {"type": "clear"},
            {"type": "explode", "key": "x"},
            "not an object"
        ]));
        assert_eq!(
            ops,
            vec![
                DiffOperation::set("n", "42"),
                DiffOperation::set("flag", "true"),
                DiffOperation::set("nothing", ""),
                DiffOperation::remove("gone"),
                DiffOperation::Clear,
            ]
        );
        assert!(DiffOperation::list_from_value(&json!({"type": "clear"})).is_empty());
    }

    #[test]
    fn test_operation_wire_shape() {
        let value = serde_json::to_value(DiffOperation::set("k", "v")).unwrap();
        assert_eq!(value, json!({"type": "set", "key": "k", "value": "v"}));
        assert_eq!(serde_json::to_value(DiffOperation::Clear).unwrap(), json!({"type": "clear"}));
    }

    #[test]
    fn test_version_coercion() {
        assert_eq!(version_from_value(Some(&json!(7))), 7);
        assert_eq!(version_from_value(Some(&json!(7.9))), 7);
        assert_eq!(version_from_value(Some(&json!(-3))), 0);
        assert_eq!(version_from_value(Some(&json!("12"))), 12);
        assert_eq!(version_from_value(Some(&json!(null))), 0);
        assert_eq!(version_from_value(None), 0);
    }

    #[test]
    fn test_version_coercion_limits() {
        assert_eq!(version_from_value(Some(&json!(1e300))), MAX_VERSION);
        assert_eq!(version_from_value(Some(&json!(2.5e3))), 2500);
        assert_eq!(version_from_value(Some(&json!("1e300"))), MAX_VERSION);
        assert_eq!(version_from_value(Some(&json!("18446744073709551616"))), MAX_VERSION);
        assert_eq!(version_from_value(Some(&json!(u64::MAX))), MAX_VERSION);
        assert_eq!(version_from_value(Some(&json!(MAX_VERSION))), MAX_VERSION);
        assert_eq!(version_from_value(Some(&json!(MAX_VERSION - 1))), MAX_VERSION - 1);
        assert_eq!(version_from_value(Some(&json!("inf"))), 0);
        assert_eq!(version_from_value(Some(&json!("NaN"))), 0);
        assert_eq!(version_from_value(Some(&json!(-1e300))), 0);
    }

    #[test]
    fn test_huge_reconcile_then_apply_is_refused() {
        let mut store = store_at(3, &[("alpha", "1")]);
        let adopted = store.reconcile(
            version_from_value(Some(&json!(1e300))),
            snapshot(&[("alpha", "2")]),
        );
        assert_eq!(adopted.status, ReconcileStatus::ServerUpdated);
        assert_eq!(adopted.state.version, MAX_VERSION);

        let before = store.state().clone();
        let outcome = store.apply_operations(&before.checksum, &[DiffOperation::set("beta", "1")]);
        assert_eq!(outcome.status, ApplyStatus::VersionExhausted);
        assert!(outcome.operations.is_empty());
        assert_eq!(store.state(), &before);

        // Unchanged contents are still a no-op rather than a refusal.
        let noop = store.apply_operations(&before.checksum, &[DiffOperation::set("alpha", "2")]);
        assert_eq!(noop.status, ApplyStatus::NoOp);
    }

    #[test]
    fn test_reconcile_clamps_direct_versions() {
        let mut store = store_at(0, &[]);
        let outcome = store.reconcile(u64::MAX, snapshot(&[("a", "1")]));
        assert_eq!(outcome.state.version, MAX_VERSION);

        // At the ceiling an equal copy is in sync, not newer.
        let again = store.reconcile(u64::MAX, snapshot(&[("a", "1")]));
        assert_eq!(again.status, ReconcileStatus::InSync);

        let restored = store_at(u64::MAX, &[]);
        assert_eq!(restored.state().version, MAX_VERSION);
    }

    #[test]
    fn test_default_filter_excludes_unlisted_keys() {
        let filter = KeyFilter::default();
        assert!(!filter.allows("project:ros:project-1:unlisted-2"));
        assert!(filter.allows("project:ros:project-1:listed-2"));
        assert!(!filter.allows(""));
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = SnapshotState::new(1, snapshot(&[("a", "1")]), None);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["snapshot"]["a"], "1");
        assert!(value["checksum"].as_str().unwrap().starts_with("fnv1a-"));
        assert!(value["updatedAt"].is_null());
    }
}
