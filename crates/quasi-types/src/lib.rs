pub mod canonical_json;
pub mod entry;
pub mod error;

pub use canonical_json::{canonical_hash_hex, sha256_hex, to_canonical_json};
pub use entry::{
    claim_ttl, truncate_to_micros, EntryKind, Follower, LedgerEntry, TaskStatus, CLAIM_TTL_SECS,
    GENESIS_AGENT, GENESIS_SLOTS, GENESIS_TASK, ZERO_HASH,
};
pub use error::{BoardError, Result};
