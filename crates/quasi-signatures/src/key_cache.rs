//! Remote actor key discovery with a TTL cache.
//!
//! Keys are fetched by dereferencing the `keyId` URL and reading
//! `publicKey.publicKeyPem` from the JSON body. Successful fetches are
//! cached for an hour; verification failures evict so rotated keys are
//! picked up on the next request. Negative results are never cached.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{Result, SignatureError};

const KEY_TTL_SECS: i64 = 60 * 60;

struct CachedKey {
    pem: String,
    fetched_at: DateTime<Utc>,
}

/// An actor document reduced to what federation needs.
#[derive(Debug, Clone)]
pub struct RemoteActor {
    pub id: String,
    pub inbox: String,
    pub public_key_pem: Option<String>,
}

pub struct KeyCache {
    client: reqwest::Client,
    entries: RwLock<HashMap<String, CachedKey>>,
    ttl: Duration,
}

impl KeyCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(KEY_TTL_SECS),
        }
    }

    /// Fetch the PEM for `key_id`, from cache when fresh.
    pub async fn fetch(&self, key_id: &str) -> Result<String> {
        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(key_id) {
                if Utc::now() - cached.fetched_at < self.ttl {
                    return Ok(cached.pem.clone());
                }
            }
        }

        let body = self.get_json(key_id).await?;
        let pem = body
            .pointer("/publicKey/publicKeyPem")
            .or_else(|| body.get("publicKeyPem"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SignatureError::KeyFetch(format!("no publicKeyPem in document at {}", key_id))
            })?
            .to_string();

        debug!(key_id, "Fetched remote public key");
        self.insert(key_id, &pem).await;
        Ok(pem)
    }

    pub async fn insert(&self, key_id: &str, pem: &str) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key_id.to_string(),
            CachedKey {
                pem: pem.to_string(),
                fetched_at: Utc::now(),
            },
        );
    }

    pub async fn evict(&self, key_id: &str) {
        let mut entries = self.entries.write().await;
        if entries.remove(key_id).is_some() {
            info!(key_id, "Evicted cached public key after verification failure");
        }
    }

    pub async fn contains(&self, key_id: &str) -> bool {
        self.entries.read().await.contains_key(key_id)
    }

    /// Dereference an actor id to its inbox and published key. Used when a
    /// `Follow` arrives and the new follower must be resolvable.
    pub async fn fetch_actor(&self, actor_id: &str) -> Result<RemoteActor> {
        let body = self.get_json(actor_id).await?;

        let inbox = body
            .get("inbox")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SignatureError::KeyFetch(format!("actor {} has no inbox", actor_id)))?
            .to_string();

        let public_key_pem = body
            .pointer("/publicKey/publicKeyPem")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(RemoteActor {
            id: actor_id.to_string(),
            inbox,
            public_key_pem,
        })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/activity+json")
            .send()
            .await
            .map_err(|e| SignatureError::KeyFetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| SignatureError::KeyFetch(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| SignatureError::KeyFetch(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_fetch_evict() {
        let cache = KeyCache::new(reqwest::Client::new());
        cache.insert("https://example.com/actor#main-key", "PEM").await;

        assert_eq!(
            cache.fetch("https://example.com/actor#main-key").await.unwrap(),
            "PEM"
        );

        cache.evict("https://example.com/actor#main-key").await;
        assert!(!cache.contains("https://example.com/actor#main-key").await);
    }

    #[tokio::test]
    async fn test_miss_hits_network_and_fails_fast() {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        let cache = KeyCache::new(client);

        let err = cache.fetch("http://127.0.0.1:1/actor#main-key").await.unwrap_err();
        assert!(matches!(err, SignatureError::KeyFetch(_)));
        // Negative results are not cached
        assert!(!cache.contains("http://127.0.0.1:1/actor#main-key").await);
    }
}
