//! Ledger entry and task-state types shared across the board.
//!
//! The wire format of an entry is stable: `id, type, contributor_agent,
//! task, commit_hash?, pr_url?, verification?, timestamp, prev_hash,
//! entry_hash`. Timestamps are RFC 3339 UTC with microsecond precision and
//! a `Z` suffix; anything finer is truncated before an entry is hashed so
//! that a reloaded chain re-hashes to the same values.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical_json::{self, canonical_hash_hex};
use crate::error::{BoardError, Result};

/// 24-hour claim TTL, in seconds. Comparisons use ledger-recorded
/// timestamps, not wall time at verification.
pub const CLAIM_TTL_SECS: i64 = 24 * 60 * 60;

/// Completion slots counted toward genesis-contributor status.
pub const GENESIS_SLOTS: u64 = 50;

/// prev_hash of the genesis entry.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub const GENESIS_TASK: &str = "GENESIS";
pub const GENESIS_AGENT: &str = "quasi-board";

pub fn claim_ttl() -> Duration {
    Duration::seconds(CLAIM_TTL_SECS)
}

/// Drop sub-microsecond precision so an entry hashes identically before
/// and after a round-trip through its serialized form.
pub fn truncate_to_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Genesis,
    Claim,
    Completion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub contributor_agent: String,
    #[serde(rename = "task")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(with = "ts_micros")]
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl LedgerEntry {
    /// Hash of the canonical serialization of every field except
    /// `entry_hash` itself.
    pub fn compute_hash(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("entry_hash");
        }
        canonical_hash_hex(&value).map_err(|e| BoardError::Serialization(e.to_string()))
    }

    /// The canonical one-line form persisted to `ledger.jsonl`.
    pub fn canonical_line(&self) -> Result<String> {
        canonical_json::to_canonical_json(self).map_err(|e| BoardError::Serialization(e.to_string()))
    }

    pub fn claim_expires_at(&self) -> DateTime<Utc> {
        self.timestamp + claim_ttl()
    }
}

/// Effective task status, derived from the ledger at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Claimed {
        by: String,
        expires_at: DateTime<Utc>,
    },
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Claimed { .. } => "claimed",
            TaskStatus::Done => "done",
        }
    }
}

/// A federated actor subscribed to the task feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follower {
    pub actor_id: String,
    pub inbox_url: String,
    pub public_key_pem: String,
    pub added_at: DateTime<Utc>,
}

/// RFC 3339 UTC timestamps with fixed microsecond precision and `Z`
/// suffix, e.g. `2026-02-23T10:00:00.000000Z`.
pub mod ts_micros {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

    pub fn serialize<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> LedgerEntry {
        let timestamp = DateTime::parse_from_rfc3339("2026-02-23T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut entry = LedgerEntry {
            id: 2,
            kind: EntryKind::Claim,
            contributor_agent: "claude-sonnet-4-6".to_string(),
            task_id: "QUASI-001".to_string(),
            commit_hash: None,
            pr_url: None,
            verification: None,
            timestamp,
            prev_hash: ZERO_HASH.to_string(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash().unwrap();
        entry
    }

    #[test]
    fn test_wire_field_names() {
        let entry = sample_entry();
        let value = serde_json::to_value(&entry).unwrap();

        assert_eq!(value["type"], "claim");
        assert_eq!(value["task"], "QUASI-001");
        assert_eq!(value["timestamp"], "2026-02-23T10:00:00.000000Z");
        // Absent optionals never appear on the wire
        assert!(value.get("commit_hash").is_none());
        assert!(value.get("pr_url").is_none());
    }

    #[test]
    fn test_hash_excludes_entry_hash_field() {
        let entry = sample_entry();
        let mut tampered = entry.clone();
        tampered.entry_hash = "f".repeat(64);

        // entry_hash itself does not feed the hash
        assert_eq!(
            entry.compute_hash().unwrap(),
            tampered.compute_hash().unwrap()
        );
    }

    #[test]
    fn test_hash_covers_content() {
        let entry = sample_entry();
        let mut tampered = entry.clone();
        tampered.contributor_agent = "gpt-4o".to_string();

        assert_ne!(
            entry.compute_hash().unwrap(),
            tampered.compute_hash().unwrap()
        );
    }

    #[test]
    fn test_roundtrip_preserves_hash() {
        let entry = sample_entry();
        let line = entry.canonical_line().unwrap();
        let parsed: LedgerEntry = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed, entry);
        assert_eq!(parsed.compute_hash().unwrap(), parsed.entry_hash);
    }

    #[test]
    fn test_truncate_to_micros() {
        let t = DateTime::parse_from_rfc3339("2026-02-23T10:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let truncated = truncate_to_micros(t);
        assert_eq!(
            truncated.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string(),
            "2026-02-23T10:00:00.123456000Z"
        );
    }

    #[test]
    fn test_claim_expiry_window() {
        let entry = sample_entry();
        let expires = entry.claim_expires_at();
        assert_eq!(expires - entry.timestamp, claim_ttl());
    }

    #[test]
    fn test_status_tags() {
        assert_eq!(TaskStatus::Open.as_str(), "open");
        assert_eq!(TaskStatus::Done.as_str(), "done");
        let claimed = TaskStatus::Claimed {
            by: "alice".to_string(),
            expires_at: Utc::now(),
        };
        assert_eq!(claimed.as_str(), "claimed");
    }
}
