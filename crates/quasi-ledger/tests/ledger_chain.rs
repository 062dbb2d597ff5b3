use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use quasi_ledger::{ChainFault, Ledger};
use quasi_types::{BoardError, EntryKind, TaskStatus, GENESIS_SLOTS, ZERO_HASH};

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn test_genesis_bootstrap() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    let chain = ledger.chain().await;
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].id, 1);
    assert_eq!(chain[0].kind, EntryKind::Genesis);
    assert_eq!(chain[0].task_id, "GENESIS");
    assert_eq!(chain[0].prev_hash, ZERO_HASH);

    let report = ledger.verify_chain().await;
    assert!(report.valid);
}

#[tokio::test]
async fn test_first_claim_links_to_genesis() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    let entry = ledger
        .append_claim("claude-sonnet-4-6", "QUASI-001", ts("2026-02-23T10:00:00Z"))
        .await
        .unwrap();

    assert_eq!(entry.id, 2);
    let chain = ledger.chain().await;
    assert_eq!(entry.prev_hash, chain[0].entry_hash);
    assert!(ledger.verify_chain().await.valid);
}

#[tokio::test]
async fn test_double_claim_conflict() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    ledger
        .append_claim("claude-sonnet-4-6", "QUASI-001", ts("2026-02-23T10:00:00Z"))
        .await
        .unwrap();

    // One hour later, another agent: rejected, length unchanged
    let err = ledger
        .append_claim("gpt-4o", "QUASI-001", ts("2026-02-23T11:00:00Z"))
        .await
        .unwrap_err();

    assert!(matches!(err, BoardError::Conflict { .. }));
    assert_eq!(ledger.len().await, 2);
}

#[tokio::test]
async fn test_expired_claim_reclaimable() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    ledger
        .append_claim("claude-sonnet-4-6", "QUASI-001", ts("2026-02-23T10:00:00Z"))
        .await
        .unwrap();

    // 25 hours later the original claim has lapsed
    let entry = ledger
        .append_claim("gpt-4o", "QUASI-001", ts("2026-02-24T11:00:00Z"))
        .await
        .unwrap();
    assert_eq!(entry.id, 3);

    match ledger
        .status_at("QUASI-001", ts("2026-02-24T11:00:01Z"))
        .await
    {
        TaskStatus::Claimed { by, .. } => assert_eq!(by, "gpt-4o"),
        other => panic!("expected claimed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_same_agent_reclaim_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    let first = ledger
        .append_claim("claude-sonnet-4-6", "QUASI-001", ts("2026-02-23T10:00:00Z"))
        .await
        .unwrap();

    let second = ledger
        .append_claim("claude-sonnet-4-6", "QUASI-001", ts("2026-02-23T12:00:00Z"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(ledger.len().await, 2);
}

#[tokio::test]
async fn test_completion_idempotent_on_task_and_commit() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    let first = ledger
        .append_completion(
            "claude-sonnet-4-6",
            "QUASI-001",
            "abc123",
            "https://github.com/ehrenfest-quantum/quasi/pull/7",
            Some("ci-pass"),
            ts("2026-02-23T12:00:00Z"),
        )
        .await
        .unwrap();

    let repeat = ledger
        .append_completion(
            "claude-sonnet-4-6",
            "QUASI-001",
            "abc123",
            "https://github.com/ehrenfest-quantum/quasi/pull/7",
            Some("ci-pass"),
            ts("2026-02-23T13:00:00Z"),
        )
        .await
        .unwrap();

    assert_eq!(first, repeat);
    assert_eq!(ledger.len().await, 2);

    // A different commit for the same task is a new entry
    let other = ledger
        .append_completion(
            "claude-sonnet-4-6",
            "QUASI-001",
            "def456",
            "https://github.com/ehrenfest-quantum/quasi/pull/8",
            None,
            ts("2026-02-23T14:00:00Z"),
        )
        .await
        .unwrap();
    assert_eq!(other.id, 3);
}

#[tokio::test]
async fn test_no_claim_after_completion() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    ledger
        .append_completion(
            "claude-sonnet-4-6",
            "QUASI-002",
            "def456",
            "https://github.com/ehrenfest-quantum/quasi/pull/9",
            None,
            ts("2026-02-23T10:00:00Z"),
        )
        .await
        .unwrap();

    // Even far in the future the task stays done
    let err = ledger
        .append_claim("gpt-4o", "QUASI-002", ts("2026-03-23T10:00:00Z"))
        .await
        .unwrap_err();
    assert!(matches!(err, BoardError::AlreadyDone(_)));
    assert_eq!(ledger.effective_status("QUASI-002").await, TaskStatus::Done);
}

#[tokio::test]
async fn test_completion_without_claim_accepted() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    let entry = ledger
        .append_completion(
            "gpt-4o",
            "QUASI-003",
            "0ff1ce",
            "https://github.com/ehrenfest-quantum/quasi/pull/10",
            None,
            ts("2026-02-23T10:00:00Z"),
        )
        .await
        .unwrap();

    assert_eq!(entry.id, 2);
    assert!(ledger.verify_chain().await.valid);
}

#[tokio::test]
async fn test_slots_remaining_counts_completions_only() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    assert_eq!(ledger.slots_remaining().await, GENESIS_SLOTS);

    ledger
        .append_claim("claude-sonnet-4-6", "QUASI-001", ts("2026-02-23T10:00:00Z"))
        .await
        .unwrap();
    // Claims do not consume slots
    assert_eq!(ledger.slots_remaining().await, GENESIS_SLOTS);

    ledger
        .append_completion(
            "claude-sonnet-4-6",
            "QUASI-001",
            "abc123",
            "https://github.com/ehrenfest-quantum/quasi/pull/7",
            None,
            ts("2026-02-23T12:00:00Z"),
        )
        .await
        .unwrap();
    assert_eq!(ledger.slots_remaining().await, GENESIS_SLOTS - 1);
}

#[tokio::test]
async fn test_restart_recovers_tail() {
    let dir = TempDir::new().unwrap();
    {
        let ledger = Ledger::open(dir.path()).unwrap();
        ledger
            .append_claim("claude-sonnet-4-6", "QUASI-001", ts("2026-02-23T10:00:00Z"))
            .await
            .unwrap();
    }

    // Reopen and keep appending; the chain must stay linked
    let ledger = Ledger::open(dir.path()).unwrap();
    assert_eq!(ledger.len().await, 2);

    let entry = ledger
        .append_completion(
            "claude-sonnet-4-6",
            "QUASI-001",
            "abc123",
            "https://github.com/ehrenfest-quantum/quasi/pull/7",
            None,
            ts("2026-02-23T12:00:00Z"),
        )
        .await
        .unwrap();
    assert_eq!(entry.id, 3);
    assert!(ledger.verify_chain().await.valid);
}

#[tokio::test]
async fn test_tampered_file_detected() {
    let dir = TempDir::new().unwrap();
    {
        let ledger = Ledger::open(dir.path()).unwrap();
        ledger
            .append_claim("claude-sonnet-4-6", "QUASI-001", ts("2026-02-23T10:00:00Z"))
            .await
            .unwrap();
    }

    // Flip the contributor on entry 2 directly on disk
    let path = dir.path().join("ledger.jsonl");
    let raw = std::fs::read_to_string(&path).unwrap();
    let doctored: Vec<String> = raw
        .lines()
        .map(|line| {
            let mut value: serde_json::Value = serde_json::from_str(line).unwrap();
            if value["id"] == 2 {
                value["contributor_agent"] = serde_json::Value::String("mallory".to_string());
            }
            serde_json::to_string(&value).unwrap()
        })
        .collect();
    std::fs::write(&path, doctored.join("\n") + "\n").unwrap();

    let ledger = Ledger::open(dir.path()).unwrap();
    let report = ledger.verify_chain().await;
    assert!(!report.valid);
    assert_eq!(report.broken_at, Some(2));
    assert_eq!(report.reason, Some(ChainFault::HashMismatch));
}

#[tokio::test]
async fn test_entries_pagination() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(dir.path()).unwrap();

    for i in 0..5 {
        ledger
            .append_claim(
                "claude-sonnet-4-6",
                &format!("QUASI-{:03}", i + 1),
                ts("2026-02-23T10:00:00Z") + Duration::minutes(i),
            )
            .await
            .unwrap();
    }

    let page = ledger.entries(2, 3).await;
    assert_eq!(page.len(), 3);
    assert_eq!(page[0].id, 3);
    assert_eq!(page[2].id, 5);

    let tail = ledger.entries(5, 10).await;
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].id, 6);
}

#[tokio::test]
async fn test_append_is_linearized_under_contention() {
    let dir = TempDir::new().unwrap();
    let ledger = std::sync::Arc::new(Ledger::open(dir.path()).unwrap());

    let mut handles = Vec::new();
    for i in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .append_claim(
                    &format!("agent-{}", i),
                    &format!("QUASI-{:03}", i + 1),
                    Utc::now(),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let chain = ledger.chain().await;
    assert_eq!(chain.len(), 9);
    for (i, entry) in chain.iter().enumerate() {
        assert_eq!(entry.id, i as u64 + 1);
    }
    assert!(ledger.verify_chain().await.valid);
}
