use serde::{Deserialize, Serialize};

use quasi_types::{EntryKind, LedgerEntry, ZERO_HASH};

/// First defect found in a chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFault {
    HashMismatch,
    PrevHashMismatch,
    IdGap,
    GenesisMismatch,
}

/// Result of a full-chain verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub valid: bool,
    pub broken_at: Option<u64>,
    pub reason: Option<ChainFault>,
}

impl ChainReport {
    fn ok() -> Self {
        Self {
            valid: true,
            broken_at: None,
            reason: None,
        }
    }

    fn broken(at: Option<u64>, reason: ChainFault) -> Self {
        Self {
            valid: false,
            broken_at: at,
            reason: Some(reason),
        }
    }
}

/// Walk `entries` oldest-first and report the first break. Single O(n)
/// pass: id contiguity, prev-hash linkage, then content hash per entry.
pub fn verify_entries(entries: &[LedgerEntry]) -> ChainReport {
    let Some(first) = entries.first() else {
        return ChainReport::broken(None, ChainFault::GenesisMismatch);
    };

    if first.id != 1 || first.kind != EntryKind::Genesis || first.prev_hash != ZERO_HASH {
        return ChainReport::broken(Some(first.id), ChainFault::GenesisMismatch);
    }

    for (i, entry) in entries.iter().enumerate() {
        if entry.id != i as u64 + 1 {
            return ChainReport::broken(Some(entry.id), ChainFault::IdGap);
        }

        if i > 0 && entry.prev_hash != entries[i - 1].entry_hash {
            return ChainReport::broken(Some(entry.id), ChainFault::PrevHashMismatch);
        }

        match entry.compute_hash() {
            Ok(hash) if hash == entry.entry_hash => {}
            _ => return ChainReport::broken(Some(entry.id), ChainFault::HashMismatch),
        }
    }

    ChainReport::ok()
}
