//! Append-only hash-chained ledger of task claims and completions.
//!
//! Every accepted activity becomes an immutable entry linked to all prior
//! entries through `prev_hash`. The ledger owns `ledger.jsonl` exclusively;
//! appends are serialized through one writer lock and survive restarts
//! without any companion index.

pub mod store;
pub mod verify;

pub use store::Ledger;
pub use verify::{verify_entries, ChainFault, ChainReport};
