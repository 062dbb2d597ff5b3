//! Task projector: mirrors the upstream issue feed and renders each open
//! task as an ActivityPub `Note` overlaid with ledger-derived status.
//!
//! The upstream tracker is an opaque read-only feed. When it is
//! unreachable at startup the built-in genesis list keeps the outbox
//! non-empty; once a refresh succeeds the cache always holds the last
//! known good list.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quasi_ledger::Ledger;
use quasi_types::{BoardError, TaskStatus};

use crate::config::TaskSourceConfig;

const GITHUB_REPO_URL: &str = "https://github.com/ehrenfest-quantum/quasi";

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub number: u64,
    pub title: String,
    pub url: String,
    pub labels: Vec<String>,
    pub content: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct UpstreamIssue {
    number: u64,
    title: String,
    html_url: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<UpstreamLabel>,
}

#[derive(Debug, Deserialize)]
struct UpstreamLabel {
    name: String,
}

impl UpstreamIssue {
    fn into_record(self, fetched_at: DateTime<Utc>) -> TaskRecord {
        TaskRecord {
            task_id: format!("QUASI-{:03}", self.number),
            number: self.number,
            title: self.title,
            url: self.html_url,
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            content: self.body.unwrap_or_default(),
            fetched_at,
        }
    }
}

pub struct TaskProjector {
    config: TaskSourceConfig,
    actor_url: String,
    client: reqwest::Client,
    tasks: RwLock<Vec<TaskRecord>>,
}

impl TaskProjector {
    pub fn new(config: TaskSourceConfig, actor_url: String, client: reqwest::Client) -> Self {
        Self {
            config,
            actor_url,
            client,
            tasks: RwLock::new(Vec::new()),
        }
    }

    /// Pull the upstream list and replace the cache. On failure the prior
    /// cache stays in place and the error is reported.
    pub async fn refresh(&self) -> Result<usize, BoardError> {
        let mut request = self
            .client
            .get(&self.config.source_url)
            .query(&[("state", "open"), ("labels", self.config.label.as_str())])
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "quasi-board");
        if let Some(token) = &self.config.github_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let issues: Vec<UpstreamIssue> = request
            .send()
            .await
            .map_err(|e| BoardError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| BoardError::Upstream(e.to_string()))?
            .json()
            .await
            .map_err(|e| BoardError::Upstream(e.to_string()))?;

        let fetched_at = Utc::now();
        let records: Vec<TaskRecord> = issues
            .into_iter()
            .map(|issue| issue.into_record(fetched_at))
            .collect();
        let count = records.len();

        let mut tasks = self.tasks.write().await;
        *tasks = records;
        debug!(count, "Task list refreshed from upstream");
        Ok(count)
    }

    /// Install the built-in genesis tasks if the cache is empty. Called
    /// when the upstream source is unreachable at startup.
    pub async fn ensure_seed_tasks(&self) {
        let mut tasks = self.tasks.write().await;
        if tasks.is_empty() {
            *tasks = genesis_tasks();
            info!(count = tasks.len(), "Upstream unreachable, using genesis task list");
        }
    }

    pub fn spawn_refresh_loop(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.refresh_interval_secs.max(1));
        let projector = self;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick duplicates the startup refresh
            interval.tick().await;

            loop {
                interval.tick().await;
                if let Err(e) = projector.refresh().await {
                    warn!(error = %e, "Task refresh failed, keeping last known list");
                }
            }
        })
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.read().await.clone()
    }

    /// Replace the cache wholesale. Test seam.
    pub async fn set_tasks(&self, records: Vec<TaskRecord>) {
        *self.tasks.write().await = records;
    }

    /// Render the outbox items: one Note per cached task, with effective
    /// status resolved against the ledger at render time.
    pub async fn notes(&self, ledger: &Ledger) -> Vec<Value> {
        let tasks = self.tasks.read().await.clone();
        let mut items = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let status = ledger.effective_status(&task.task_id).await;
            items.push(self.note_for(task, &status));
        }
        items
    }

    fn note_for(&self, task: &TaskRecord, status: &TaskStatus) -> Value {
        let mut note = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/tasks/{}", self.actor_url, task.number),
            "type": "Note",
            "attributedTo": self.actor_url,
            "name": task.title,
            "url": task.url,
            "content": task.content,
            "published": task.fetched_at.to_rfc3339(),
            "quasi:taskId": task.task_id,
            "quasi:status": status.as_str(),
            "quasi:claimUrl": format!("{}/inbox", self.actor_url),
            "quasi:ledgerUrl": format!("{}/ledger", self.actor_url),
        });

        if let TaskStatus::Claimed { by, expires_at } = status {
            note["quasi:claimedBy"] = json!(by);
            note["quasi:expiresAt"] = json!(expires_at.to_rfc3339());
        }

        note
    }
}

/// The three bootstrap tasks shipped with the board, used until the
/// upstream tracker is reachable.
pub fn genesis_tasks() -> Vec<TaskRecord> {
    let fetched_at = Utc::now();
    [
        (
            1,
            "QUASI-001: Ehrenfest CBOR Schema",
            "Define CBOR/CDDL schema for Ehrenfest base types.",
        ),
        (
            2,
            "QUASI-002: HAL Contract Python Bindings",
            "Python FFI for the HAL Contract.",
        ),
        (
            3,
            "QUASI-003: quasi-board ActivityPub Prototype",
            "Federated task feed using ActivityPub.",
        ),
    ]
    .into_iter()
    .map(|(number, title, body)| TaskRecord {
        task_id: format!("QUASI-{:03}", number),
        number,
        title: title.to_string(),
        url: format!("{}/issues/{}", GITHUB_REPO_URL, number),
        labels: vec!["good-first-task".to_string()],
        content: body.to_string(),
        fetched_at,
    })
    .collect()
}
