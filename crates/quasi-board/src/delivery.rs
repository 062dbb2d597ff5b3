//! Outbound activity delivery.
//!
//! One FIFO worker per follower: a slow or dead inbox delays only its own
//! queue. Each POST is signed, retried on transient failures with the
//! fixed backoff ladder, and dropped with a log line on permanent
//! rejection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use quasi_signatures::SignatureEngine;
use quasi_types::Follower;

use crate::config::DeliveryConfig;
use crate::metrics::Metrics;

/// Retry ladder for transient failures, in seconds.
const BACKOFF_SECS: [u64; 5] = [1, 5, 25, 120, 600];

const AP_CONTENT_TYPE: &str = "application/activity+json";

struct Delivery {
    inbox_url: String,
    activity: Value,
}

enum Outcome {
    Delivered,
    Permanent(u16),
    Transient(String),
}

fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Delivered,
        429 => Outcome::Transient("429 Too Many Requests".to_string()),
        400..=499 => Outcome::Permanent(status),
        _ => Outcome::Transient(format!("HTTP {}", status)),
    }
}

pub struct DeliveryQueue {
    weak: Weak<DeliveryQueue>,
    client: reqwest::Client,
    engine: Arc<SignatureEngine>,
    config: DeliveryConfig,
    metrics: Metrics,
    workers: RwLock<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
}

impl DeliveryQueue {
    pub fn new(
        client: reqwest::Client,
        engine: Arc<SignatureEngine>,
        config: DeliveryConfig,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            client,
            engine,
            config,
            metrics,
            workers: RwLock::new(HashMap::new()),
        })
    }

    /// Queue one activity for one follower. Order within a follower is the
    /// enqueue order.
    pub async fn enqueue(&self, follower: &Follower, activity: Value) {
        let delivery = Delivery {
            inbox_url: follower.inbox_url.clone(),
            activity,
        };

        let mut workers = self.workers.write().await;
        let sender = workers
            .entry(follower.actor_id.clone())
            .or_insert_with(|| self.spawn_worker(&follower.actor_id));

        if sender.send(delivery).is_err() {
            // Worker ended (process shutdown in progress); nothing to requeue to.
            warn!(actor = %follower.actor_id, "Delivery worker gone, dropping activity");
        }
    }

    fn spawn_worker(&self, actor_id: &str) -> mpsc::UnboundedSender<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(queue) = self.weak.upgrade() {
            let actor_id = actor_id.to_string();
            tokio::spawn(queue.run_worker(actor_id, rx));
        }
        tx
    }

    async fn run_worker(
        self: Arc<Self>,
        actor_id: String,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
    ) {
        debug!(actor = %actor_id, "Delivery worker started");
        while let Some(delivery) = rx.recv().await {
            self.deliver_with_retry(&actor_id, &delivery).await;
        }
        debug!(actor = %actor_id, "Delivery worker stopped");
    }

    async fn deliver_with_retry(&self, actor_id: &str, delivery: &Delivery) {
        let body = match serde_json::to_vec(&delivery.activity) {
            Ok(body) => body,
            Err(e) => {
                warn!(actor = actor_id, error = %e, "Unserializable activity, dropping");
                return;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.metrics.deliveries_attempted.inc();

            match self.post_signed(&delivery.inbox_url, &body).await {
                Outcome::Delivered => {
                    debug!(actor = actor_id, inbox = %delivery.inbox_url, attempt, "Activity delivered");
                    return;
                }
                Outcome::Permanent(status) => {
                    self.metrics.deliveries_failed.inc();
                    warn!(
                        actor = actor_id,
                        inbox = %delivery.inbox_url,
                        status,
                        "Inbox rejected activity, dropping permanently"
                    );
                    return;
                }
                Outcome::Transient(reason) => {
                    if attempt >= self.config.max_attempts {
                        self.metrics.deliveries_failed.inc();
                        warn!(
                            actor = actor_id,
                            inbox = %delivery.inbox_url,
                            attempts = attempt,
                            reason = %reason,
                            "Delivery attempts exhausted, dropping"
                        );
                        return;
                    }
                    let backoff =
                        BACKOFF_SECS[(attempt as usize - 1).min(BACKOFF_SECS.len() - 1)];
                    self.metrics.delivery_retries.inc();
                    debug!(
                        actor = actor_id,
                        attempt,
                        backoff_secs = backoff,
                        reason = %reason,
                        "Transient delivery failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
    }

    async fn post_signed(&self, inbox_url: &str, body: &[u8]) -> Outcome {
        let url = match reqwest::Url::parse(inbox_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(inbox = inbox_url, error = %e, "Unparseable inbox URL");
                return Outcome::Permanent(0);
            }
        };
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => {
                warn!(inbox = inbox_url, "Inbox URL has no host");
                return Outcome::Permanent(0);
            }
        };

        let signed = match self.engine.sign_request("post", url.path(), &host, body) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(error = %e, "Failed to sign outbound request");
                return Outcome::Permanent(0);
            }
        };

        let result = self
            .client
            .post(url)
            .header("Content-Type", AP_CONTENT_TYPE)
            .header("Date", signed.date)
            .header("Digest", signed.digest)
            .header("Signature", signed.signature)
            .body(body.to_vec())
            .send()
            .await;

        match result {
            Ok(response) => classify_status(response.status().as_u16()),
            Err(e) => Outcome::Transient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(202), Outcome::Delivered));
        assert!(matches!(classify_status(200), Outcome::Delivered));
        assert!(matches!(classify_status(429), Outcome::Transient(_)));
        assert!(matches!(classify_status(404), Outcome::Permanent(404)));
        assert!(matches!(classify_status(410), Outcome::Permanent(410)));
        assert!(matches!(classify_status(500), Outcome::Transient(_)));
        assert!(matches!(classify_status(503), Outcome::Transient(_)));
    }

    #[test]
    fn test_backoff_ladder_covers_all_retries() {
        let config = DeliveryConfig::default();
        // Five attempts means at most four waits, all within the ladder
        assert!(BACKOFF_SECS.len() >= config.max_attempts as usize - 1);
        assert_eq!(BACKOFF_SECS, [1, 5, 25, 120, 600]);
    }
}
