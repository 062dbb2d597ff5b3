//! GitHub webhook intake: merged pull requests become completion entries.
//!
//! The PR body carries the attribution footer:
//!
//! ```text
//! Contribution-Agent: claude-sonnet-4-6
//! Task: QUASI-002
//! Verification: ci-pass
//! ```
//!
//! Deliveries are authenticated with `X-Hub-Signature-256` (HMAC-SHA-256,
//! constant-time compare). Unrelated PRs are acknowledged without error so
//! the hook can stay attached to a busy repository.

use std::path::Path;

use axum::http::StatusCode;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use quasi_types::{BoardError, Result};

use crate::node::BoardNode;

type HmacSha256 = Hmac<Sha256>;

const SECRET_FILE: &str = ".webhook_secret";

/// HMAC key for inbound webhooks. Loaded at startup, never exported.
pub struct WebhookSecret {
    key: Vec<u8>,
}

impl WebhookSecret {
    /// Load the secret from `.webhook_secret` (32 bytes, hex), generating
    /// one on first run.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(SECRET_FILE);

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let trimmed = raw.trim();
            // Hex-encoded 32 bytes; tolerate legacy plain-text secrets
            let key = hex::decode(trimmed).unwrap_or_else(|_| trimmed.as_bytes().to_vec());
            if key.is_empty() {
                return Err(BoardError::Storage(format!(
                    "{} is empty",
                    path.display()
                )));
            }
            return Ok(Self { key });
        }

        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        std::fs::write(&path, hex::encode(&key))?;
        info!(path = %path.display(), "Webhook secret generated");
        Ok(Self { key })
    }

    /// Check `sha256=<hex>` against the body.
    pub fn verify(&self, body: &[u8], signature_header: &str) -> bool {
        let Some(received_hex) = signature_header.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(received) = hex::decode(received_hex) else {
            return false;
        };

        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(body);
        let expected = mac.finalize().into_bytes();

        expected.ct_eq(received.as_slice()).into()
    }

    /// Signature header value this secret would produce for `body`.
    /// Exists so operators and tests can mint valid deliveries.
    pub fn signature_for(&self, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }
}

/// The attribution footer lines from a PR body.
#[derive(Debug, Default, PartialEq)]
pub struct PrFooter {
    pub agent: Option<String>,
    pub task: Option<String>,
    pub verification: Option<String>,
}

pub fn parse_footers(text: &str) -> PrFooter {
    let mut footer = PrFooter::default();
    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Contribution-Agent:") {
            footer.agent = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Task:") {
            footer.task = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Verification:") {
            footer.verification = Some(value.trim().to_string());
        }
    }
    footer
}

/// Fallback when the `Task:` footer is missing: first `QUASI-<digits>`
/// mention in the PR title or body.
pub fn find_task_id(text: &str) -> Option<String> {
    const MARKER: &str = "QUASI-";
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find(MARKER) {
        let digits_start = search_from + pos + MARKER.len();
        let digits: String = text[digits_start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if !digits.is_empty() {
            return Some(format!("QUASI-{}", digits));
        }
        search_from = digits_start;
    }
    None
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    pull_request: Option<PullRequest>,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    merge_commit_sha: Option<String>,
    #[serde(default)]
    user: Option<PrUser>,
}

#[derive(Debug, Deserialize)]
struct PrUser {
    login: String,
}

/// Process one webhook delivery. Returns the HTTP status and JSON body.
pub async fn process(
    node: &BoardNode,
    event: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
) -> (StatusCode, Value) {
    if !node
        .webhook_secret
        .verify(body, signature.unwrap_or_default())
    {
        node.metrics.webhook_rejected.inc();
        warn!("Webhook signature mismatch");
        return (StatusCode::UNAUTHORIZED, json!({"error": "unauthorized"}));
    }

    let event = event.unwrap_or_default();
    if event != "pull_request" {
        node.metrics.webhook_ignored.inc();
        return (StatusCode::OK, json!({"status": "ignored", "event": event}));
    }

    let payload: WebhookPayload = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            node.metrics.webhook_rejected.inc();
            return (
                StatusCode::BAD_REQUEST,
                json!({"error": format!("malformed payload: {}", e)}),
            );
        }
    };

    let Some(pr) = payload.pull_request else {
        node.metrics.webhook_rejected.inc();
        return (
            StatusCode::BAD_REQUEST,
            json!({"error": "missing pull_request"}),
        );
    };
    if payload.action != "closed" || !pr.merged {
        node.metrics.webhook_ignored.inc();
        return (
            StatusCode::OK,
            json!({"status": "ignored", "reason": "not a merge"}),
        );
    }

    let pr_body = pr.body.unwrap_or_default();
    let pr_author = pr.user.map(|u| u.login).unwrap_or_else(|| "unknown".to_string());

    let footer = parse_footers(&pr_body);
    let agent = footer.agent.unwrap_or_else(|| pr_author.clone());
    let task_id = footer
        .task
        .or_else(|| find_task_id(&format!("{} {}", pr.title, pr_body)));

    let Some(task_id) = task_id else {
        // Not every merged PR is a board contribution
        node.metrics.webhook_ignored.inc();
        return (
            StatusCode::OK,
            json!({"status": "ignored", "reason": "no task footer"}),
        );
    };

    let Some(commit_sha) = pr.merge_commit_sha.filter(|s| !s.is_empty()) else {
        node.metrics.webhook_rejected.inc();
        return (
            StatusCode::BAD_REQUEST,
            json!({"error": "missing merge_commit_sha"}),
        );
    };

    match node
        .record_completion(
            &agent,
            &task_id,
            &commit_sha,
            &pr.html_url,
            footer.verification.as_deref(),
            Utc::now(),
        )
        .await
    {
        Ok(entry) => {
            node.metrics.webhook_received.inc();
            info!(
                task = %task_id,
                agent = %agent,
                commit = %commit_sha,
                entry = entry.id,
                "Completion recorded from merged PR"
            );
            (
                StatusCode::ACCEPTED,
                json!({
                    "status": "recorded",
                    "ledger_entry": entry.id,
                    "entry_hash": entry.entry_hash,
                    "task": task_id,
                    "agent": agent,
                }),
            )
        }
        Err(e) => {
            warn!(error = %e, task = %task_id, "Failed to record webhook completion");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "storage failure"}),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_secret_roundtrip_and_verify() {
        let dir = TempDir::new().unwrap();
        let secret = WebhookSecret::load_or_generate(dir.path()).unwrap();

        let body = b"{\"action\":\"closed\"}";
        let header = secret.signature_for(body);
        assert!(secret.verify(body, &header));
        assert!(!secret.verify(b"{\"action\":\"opened\"}", &header));
        assert!(!secret.verify(body, "sha256=deadbeef"));
        assert!(!secret.verify(body, ""));

        // Reload picks up the same key
        let reloaded = WebhookSecret::load_or_generate(dir.path()).unwrap();
        assert!(reloaded.verify(body, &header));
    }

    #[test]
    fn test_parse_footers() {
        let body = "Implements the schema.\n\n\
                    Contribution-Agent: claude-sonnet-4-6\n\
                    Task: QUASI-002\n\
                    Verification: ci-pass\n";
        let footer = parse_footers(body);
        assert_eq!(footer.agent.as_deref(), Some("claude-sonnet-4-6"));
        assert_eq!(footer.task.as_deref(), Some("QUASI-002"));
        assert_eq!(footer.verification.as_deref(), Some("ci-pass"));

        assert_eq!(parse_footers("no footer here"), PrFooter::default());
    }

    #[test]
    fn test_find_task_id() {
        assert_eq!(
            find_task_id("Fixes QUASI-7 properly").as_deref(),
            Some("QUASI-7")
        );
        assert_eq!(
            find_task_id("QUASI- then QUASI-012").as_deref(),
            Some("QUASI-012")
        );
        assert_eq!(find_task_id("nothing relevant"), None);
    }
}
