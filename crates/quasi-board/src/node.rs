use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use quasi_ledger::Ledger;
use quasi_signatures::{ActorKeys, KeyCache, RsaBackend, SignatureEngine};
use quasi_types::{BoardError, EntryKind, Follower, LedgerEntry, GENESIS_SLOTS};

use crate::config::BoardConfig;
use crate::delivery::DeliveryQueue;
use crate::followers::FollowerRegistry;
use crate::metrics::Metrics;
use crate::projector::TaskProjector;
use crate::webhook::WebhookSecret;

const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
const GITHUB_REPO_URL: &str = "https://github.com/ehrenfest-quantum/quasi";

/// Outcome of one inbox activity.
#[derive(Debug)]
pub enum InboxOutcome {
    /// A claim or completion hit the ledger (or was answered idempotently).
    Recorded {
        status: &'static str,
        entry: LedgerEntry,
    },
    /// A `Follow` was recorded; the `Accept` is on its way.
    Following,
    /// Anything the board does not act on.
    Ignored,
}

/// The assembled board: ledger, signature engine, follower registry, task
/// projector and delivery queue behind one handle.
pub struct BoardNode {
    pub config: BoardConfig,
    pub ledger: Arc<Ledger>,
    pub signatures: Arc<SignatureEngine>,
    pub followers: Arc<FollowerRegistry>,
    pub projector: Arc<TaskProjector>,
    pub delivery: Arc<DeliveryQueue>,
    pub metrics: Metrics,
    pub webhook_secret: WebhookSecret,
    actor_keys: ActorKeys,
}

impl BoardNode {
    pub async fn new(config: BoardConfig) -> Result<Self> {
        let data_dir = &config.board.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir {:?}", data_dir))?;

        let ledger = Arc::new(
            Ledger::open(data_dir)
                .map_err(|e| anyhow::anyhow!("Failed to open ledger: {}", e))?,
        );

        let actor_keys = ActorKeys::load_or_generate(data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to load actor keys: {}", e))?;
        info!("Actor keypair ready");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.delivery.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let key_id = format!("{}#main-key", config.actor_url());
        let backend = Arc::new(RsaBackend::new(actor_keys.private_key().clone()));
        let signatures = Arc::new(SignatureEngine::new(
            backend,
            KeyCache::new(client.clone()),
            key_id,
        ));

        let followers = Arc::new(
            FollowerRegistry::load(data_dir)
                .map_err(|e| anyhow::anyhow!("Failed to load followers: {}", e))?,
        );

        let projector = Arc::new(TaskProjector::new(
            config.tasks.clone(),
            config.actor_url(),
            client.clone(),
        ));

        let webhook_secret = WebhookSecret::load_or_generate(data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to load webhook secret: {}", e))?;

        let metrics = Metrics::new();
        let delivery = DeliveryQueue::new(
            client,
            signatures.clone(),
            config.delivery.clone(),
            metrics.clone(),
        );

        metrics.followers.set(followers.len().await as i64);
        metrics.ledger_entries.set(ledger.len().await as i64);

        Ok(Self {
            config,
            ledger,
            signatures,
            followers,
            projector,
            delivery,
            metrics,
            webhook_secret,
            actor_keys,
        })
    }

    pub fn actor_url(&self) -> String {
        self.config.actor_url()
    }

    pub fn inbox_url(&self) -> String {
        format!("{}/inbox", self.actor_url())
    }

    pub fn outbox_url(&self) -> String {
        format!("{}/outbox", self.actor_url())
    }

    pub fn ledger_url(&self) -> String {
        format!("{}/ledger", self.actor_url())
    }

    pub fn domain(&self) -> String {
        self.config.domain()
    }

    /// The actor document served at `/quasi-board`.
    pub fn actor_document(&self) -> Value {
        json!({
            "@context": [AS_CONTEXT, "https://w3id.org/security/v1"],
            "type": "Service",
            "id": self.actor_url(),
            "name": "quasi-board",
            "preferredUsername": "quasi-board",
            "summary": "QUASI Quantum OS — federated task feed. Build the first Quantum OS. Ehrenfest language. Afana compiler. Urns packages.",
            "url": GITHUB_REPO_URL,
            "inbox": self.inbox_url(),
            "outbox": self.outbox_url(),
            "followers": format!("{}/followers", self.actor_url()),
            "publicKey": {
                "id": self.signatures.key_id(),
                "owner": self.actor_url(),
                "publicKeyPem": self.actor_keys.public_key_pem(),
            },
            "quasi:genesisSlots": GENESIS_SLOTS,
            "quasi:ledger": self.ledger_url(),
        })
    }

    /// Webfinger resolution; `None` for resources that are not this actor.
    pub fn webfinger_document(&self, resource: &str) -> Option<Value> {
        if !resource.contains("quasi-board") {
            return None;
        }
        Some(json!({
            "subject": format!("acct:quasi-board@{}", self.domain()),
            "links": [{
                "rel": "self",
                "type": "application/activity+json",
                "href": self.actor_url(),
            }],
        }))
    }

    /// Dispatch one inbox activity that already passed transport checks.
    pub async fn handle_activity(&self, activity: &Value) -> quasi_types::Result<InboxOutcome> {
        self.metrics.activities_received.inc();
        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match activity_type {
            "Announce" => {
                let agent = required_str(activity, "actor")?;
                let task_id = activity
                    .get("quasi:taskId")
                    .or_else(|| activity.get("object"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BoardError::Validation("Announce without quasi:taskId".to_string())
                    })?;
                let timestamp = published_or_now(activity)?;

                let entry = self.record_claim(agent, task_id, timestamp).await?;
                Ok(InboxOutcome::Recorded {
                    status: "claimed",
                    entry,
                })
            }
            "Create" if activity.get("quasi:type").and_then(Value::as_str) == Some("completion") => {
                let agent = required_str(activity, "actor")?;
                let task_id = required_str(activity, "quasi:taskId")?;
                let commit_hash = required_str(activity, "quasi:commitHash")?;
                let pr_url = required_str(activity, "quasi:prUrl")?;
                let timestamp = published_or_now(activity)?;

                let entry = self
                    .record_completion(agent, task_id, commit_hash, pr_url, None, timestamp)
                    .await?;
                Ok(InboxOutcome::Recorded {
                    status: "recorded",
                    entry,
                })
            }
            "Follow" => {
                let actor_id = required_str(activity, "actor")?;
                self.accept_follow(actor_id, activity).await?;
                Ok(InboxOutcome::Following)
            }
            "Undo" => {
                let undone_type = activity
                    .pointer("/object/type")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if undone_type == "Follow" {
                    let actor_id = required_str(activity, "actor")?;
                    if self.followers.remove(actor_id).await? {
                        self.metrics.followers.set(self.followers.len().await as i64);
                    }
                }
                Ok(InboxOutcome::Ignored)
            }
            _ => {
                debug!(activity_type, "Ignoring unrecognized activity");
                Ok(InboxOutcome::Ignored)
            }
        }
    }

    /// Append a claim and fan the announcement out to followers.
    pub async fn record_claim(
        &self,
        agent: &str,
        task_id: &str,
        timestamp: DateTime<Utc>,
    ) -> quasi_types::Result<LedgerEntry> {
        let before = self.ledger.len().await as u64;
        let entry = match self.ledger.append_claim(agent, task_id, timestamp).await {
            Ok(entry) => entry,
            Err(e) => {
                if matches!(e, BoardError::Conflict { .. }) {
                    self.metrics.claim_conflicts.inc();
                }
                return Err(e);
            }
        };

        if entry.id > before {
            self.metrics.claims_recorded.inc();
            self.metrics.ledger_entries.set(self.ledger.len().await as i64);
            info!(task = task_id, agent, entry = entry.id, "Task claimed");
            self.publish_entry(&entry).await;
        }
        Ok(entry)
    }

    /// Append a completion and fan it out to followers.
    pub async fn record_completion(
        &self,
        agent: &str,
        task_id: &str,
        commit_hash: &str,
        pr_url: &str,
        verification: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> quasi_types::Result<LedgerEntry> {
        let before = self.ledger.len().await as u64;
        let entry = self
            .ledger
            .append_completion(agent, task_id, commit_hash, pr_url, verification, timestamp)
            .await?;

        if entry.id > before {
            self.metrics.completions_recorded.inc();
            self.metrics.ledger_entries.set(self.ledger.len().await as i64);
            info!(task = task_id, agent, entry = entry.id, "Task completed");
            self.publish_entry(&entry).await;
        }
        Ok(entry)
    }

    async fn accept_follow(&self, actor_id: &str, follow: &Value) -> quasi_types::Result<()> {
        // Resolve the follower's inbox and key through its actor document
        let remote = self
            .signatures
            .key_cache()
            .fetch_actor(actor_id)
            .await
            .map_err(|e| BoardError::Upstream(format!("cannot resolve {}: {}", actor_id, e)))?;

        let follower = Follower {
            actor_id: actor_id.to_string(),
            inbox_url: remote.inbox,
            public_key_pem: remote.public_key_pem.unwrap_or_default(),
            added_at: Utc::now(),
        };
        self.followers.add(follower.clone()).await?;
        self.metrics.followers.set(self.followers.len().await as i64);

        // Accept is delivered asynchronously through the normal queue
        let accept = json!({
            "@context": AS_CONTEXT,
            "type": "Accept",
            "actor": self.actor_url(),
            "object": follow.clone(),
            "to": [actor_id],
        });
        self.delivery.enqueue(&follower, accept).await;
        Ok(())
    }

    /// Address the new entry to the public and queue one delivery per
    /// follower. Runs outside the ledger lock; delivery failures never
    /// surface to the request that appended the entry.
    async fn publish_entry(&self, entry: &LedgerEntry) {
        let activity_type = match entry.kind {
            EntryKind::Claim => "Announce",
            EntryKind::Completion => "Create",
            EntryKind::Genesis => return,
        };

        let object = match serde_json::to_value(entry) {
            Ok(object) => object,
            Err(e) => {
                warn!(error = %e, "Failed to serialize ledger entry for publication");
                return;
            }
        };

        let activity = json!({
            "@context": AS_CONTEXT,
            "id": format!("{}/{}", self.ledger_url(), entry.id),
            "type": activity_type,
            "actor": self.actor_url(),
            "to": [AS_PUBLIC],
            "object": object,
            "quasi:taskId": entry.task_id,
        });

        for follower in self.followers.all().await {
            self.delivery.enqueue(&follower, activity.clone()).await;
        }
    }
}

fn required_str<'a>(activity: &'a Value, field: &str) -> quasi_types::Result<&'a str> {
    activity
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BoardError::Validation(format!("missing {}", field)))
}

fn published_or_now(activity: &Value) -> quasi_types::Result<DateTime<Utc>> {
    match activity.get("published").and_then(Value::as_str) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| BoardError::Validation(format!("bad published timestamp: {}", e))),
        None => Ok(Utc::now()),
    }
}
