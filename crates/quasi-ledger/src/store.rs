use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use quasi_types::{
    claim_ttl, truncate_to_micros, BoardError, EntryKind, LedgerEntry, Result, TaskStatus,
    GENESIS_AGENT, GENESIS_SLOTS, GENESIS_TASK, ZERO_HASH,
};

use crate::verify::{verify_entries, ChainReport};

const LEDGER_FILE: &str = "ledger.jsonl";

/// The append-only ledger.
///
/// Entries live in memory in append order and on disk as one canonical
/// JSON object per line. The write lock covers the whole
/// read-tail/compute/write/fsync sequence so ids and `prev_hash` links are
/// linearized; status and verification take the read lock only.
pub struct Ledger {
    path: PathBuf,
    inner: RwLock<LedgerInner>,
}

struct LedgerInner {
    entries: Vec<LedgerEntry>,
    file: File,
}

impl Ledger {
    /// Open the ledger in `data_dir`, creating it with a genesis entry on
    /// first startup.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LEDGER_FILE);

        if !path.exists() {
            let genesis = genesis_entry(truncate_to_micros(Utc::now()))?;
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{}", genesis.canonical_line()?)?;
            file.sync_data()?;
            info!(path = %path.display(), entry_hash = %genesis.entry_hash, "Ledger created with genesis entry");
        }

        let raw = std::fs::read_to_string(&path)?;
        let mut entries = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(line).map_err(|e| {
                BoardError::Storage(format!("ledger line {}: {}", lineno + 1, e))
            })?;
            entries.push(entry);
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        debug!(entries = entries.len(), "Ledger warm-loaded");

        Ok(Self {
            path,
            inner: RwLock::new(LedgerInner { entries, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a claim. Re-claiming a task the same agent already holds an
    /// active claim on returns that claim unchanged; a claim on a task
    /// actively held by someone else is a `Conflict`; a completed task is
    /// `AlreadyDone`.
    pub async fn append_claim(
        &self,
        agent: &str,
        task_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let timestamp = truncate_to_micros(timestamp);
        let mut inner = self.inner.write().await;

        match status_scan(&inner.entries, task_id, timestamp) {
            TaskStatus::Done => Err(BoardError::AlreadyDone(task_id.to_string())),
            TaskStatus::Claimed { by, .. } if by != agent => Err(BoardError::Conflict {
                task: task_id.to_string(),
                held_by: by,
            }),
            TaskStatus::Claimed { .. } => {
                // Same agent, claim still active: idempotent no-op
                if let Some(existing) = inner
                    .entries
                    .iter()
                    .rev()
                    .find(|e| {
                        e.kind == EntryKind::Claim
                            && e.task_id == task_id
                            && e.contributor_agent == agent
                    })
                    .cloned()
                {
                    debug!(task = task_id, agent, entry = existing.id, "Re-claim of active claim, returning existing entry");
                    Ok(existing)
                } else {
                    inner.append(EntryKind::Claim, agent, task_id, None, None, None, timestamp)
                }
            }
            TaskStatus::Open => {
                inner.append(EntryKind::Claim, agent, task_id, None, None, None, timestamp)
            }
        }
    }

    /// Record a completion. Idempotent on `(task_id, commit_hash)`: a
    /// repeat returns the original entry and the chain is unchanged. A
    /// completion with no prior claim is accepted; the merged PR is
    /// authoritative.
    pub async fn append_completion(
        &self,
        agent: &str,
        task_id: &str,
        commit_hash: &str,
        pr_url: &str,
        verification: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let timestamp = truncate_to_micros(timestamp);
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner
            .entries
            .iter()
            .find(|e| {
                e.kind == EntryKind::Completion
                    && e.task_id == task_id
                    && e.commit_hash.as_deref() == Some(commit_hash)
            })
            .cloned()
        {
            debug!(task = task_id, commit = commit_hash, entry = existing.id, "Duplicate completion, returning existing entry");
            return Ok(existing);
        }

        inner.append(
            EntryKind::Completion,
            agent,
            task_id,
            Some(commit_hash),
            Some(pr_url),
            verification,
            timestamp,
        )
    }

    /// Effective status of a task as of now.
    pub async fn effective_status(&self, task_id: &str) -> TaskStatus {
        let inner = self.inner.read().await;
        status_scan(&inner.entries, task_id, Utc::now())
    }

    /// Effective status of a task as of `reference`.
    pub async fn status_at(&self, task_id: &str, reference: DateTime<Utc>) -> TaskStatus {
        let inner = self.inner.read().await;
        status_scan(&inner.entries, task_id, reference)
    }

    pub async fn entries(&self, offset: usize, limit: usize) -> Vec<LedgerEntry> {
        let inner = self.inner.read().await;
        inner.entries.iter().skip(offset).take(limit).cloned().collect()
    }

    /// The full chain, oldest first.
    pub async fn chain(&self) -> Vec<LedgerEntry> {
        let inner = self.inner.read().await;
        inner.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Genesis slots not yet consumed by completions. Informational only;
    /// appends are never gated on it.
    pub async fn slots_remaining(&self) -> u64 {
        let inner = self.inner.read().await;
        let completions = inner
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::Completion)
            .count() as u64;
        GENESIS_SLOTS.saturating_sub(completions)
    }

    /// Walk the whole chain and report the first break, if any.
    pub async fn verify_chain(&self) -> ChainReport {
        let inner = self.inner.read().await;
        verify_entries(&inner.entries)
    }
}

impl LedgerInner {
    /// Append one entry: link to the tail, hash, write + fsync, then and
    /// only then publish to memory. A failed write leaves the tail
    /// untouched so the next attempt recomputes `prev_hash` cleanly.
    #[allow(clippy::too_many_arguments)]
    fn append(
        &mut self,
        kind: EntryKind,
        agent: &str,
        task_id: &str,
        commit_hash: Option<&str>,
        pr_url: Option<&str>,
        verification: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let prev_hash = self
            .entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(|| ZERO_HASH.to_string());

        let mut entry = LedgerEntry {
            id: self.entries.len() as u64 + 1,
            kind,
            contributor_agent: agent.to_string(),
            task_id: task_id.to_string(),
            commit_hash: commit_hash.map(str::to_string),
            pr_url: pr_url.map(str::to_string),
            verification: verification.map(str::to_string),
            timestamp,
            prev_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash()?;

        let line = entry.canonical_line()?;
        if let Err(e) = writeln!(self.file, "{}", line).and_then(|_| self.file.sync_data()) {
            warn!(error = %e, task = task_id, "Ledger append failed, in-memory tail unchanged");
            return Err(BoardError::Storage(e.to_string()));
        }

        debug!(
            id = entry.id,
            kind = ?entry.kind,
            task = task_id,
            agent,
            entry_hash = %entry.entry_hash,
            "Ledger entry appended"
        );
        self.entries.push(entry.clone());
        Ok(entry)
    }
}

/// Newest-to-oldest scan: the first entry mentioning the task decides.
/// Genesis entries are never counted as claims or completions.
fn status_scan(entries: &[LedgerEntry], task_id: &str, reference: DateTime<Utc>) -> TaskStatus {
    for entry in entries.iter().rev() {
        if entry.task_id != task_id {
            continue;
        }
        match entry.kind {
            EntryKind::Completion => return TaskStatus::Done,
            EntryKind::Claim => {
                if reference - entry.timestamp < claim_ttl() {
                    return TaskStatus::Claimed {
                        by: entry.contributor_agent.clone(),
                        expires_at: entry.claim_expires_at(),
                    };
                }
                return TaskStatus::Open;
            }
            EntryKind::Genesis => continue,
        }
    }
    TaskStatus::Open
}

fn genesis_entry(timestamp: DateTime<Utc>) -> Result<LedgerEntry> {
    let mut entry = LedgerEntry {
        id: 1,
        kind: EntryKind::Genesis,
        contributor_agent: GENESIS_AGENT.to_string(),
        task_id: GENESIS_TASK.to_string(),
        commit_hash: None,
        pr_url: None,
        verification: None,
        timestamp,
        prev_hash: ZERO_HASH.to_string(),
        entry_hash: String::new(),
    };
    entry.entry_hash = entry.compute_hash()?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_status_scan_open_when_unmentioned() {
        let status = status_scan(&[], "QUASI-001", Utc::now());
        assert_eq!(status, TaskStatus::Open);
    }

    #[test]
    fn test_status_scan_ttl_boundary() {
        let claimed_at = ts("2026-02-23T10:00:00Z");
        let mut entry = genesis_entry(claimed_at).unwrap();
        entry.kind = EntryKind::Claim;
        entry.task_id = "QUASI-001".to_string();
        entry.contributor_agent = "claude-sonnet-4-6".to_string();

        // One second under the TTL: still claimed
        let just_under = claimed_at + Duration::seconds(quasi_types::CLAIM_TTL_SECS - 1);
        assert!(matches!(
            status_scan(std::slice::from_ref(&entry), "QUASI-001", just_under),
            TaskStatus::Claimed { .. }
        ));

        // Exactly the TTL: expired, open again
        let at_ttl = claimed_at + Duration::seconds(quasi_types::CLAIM_TTL_SECS);
        assert_eq!(
            status_scan(std::slice::from_ref(&entry), "QUASI-001", at_ttl),
            TaskStatus::Open
        );
    }

    #[test]
    fn test_genesis_entry_shape() {
        let entry = genesis_entry(ts("2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(entry.id, 1);
        assert_eq!(entry.kind, EntryKind::Genesis);
        assert_eq!(entry.prev_hash, ZERO_HASH);
        assert_eq!(entry.compute_hash().unwrap(), entry.entry_hash);
    }
}
