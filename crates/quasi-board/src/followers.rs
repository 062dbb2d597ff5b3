//! Follower registry: the actors subscribed to this board's feed.
//!
//! Memory-resident, keyed by actor id, written through to
//! `followers.json` on every mutation via rename-over-temp so a crash
//! never leaves a half-written file.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use quasi_types::{BoardError, Follower, Result};

const FOLLOWERS_FILE: &str = "followers.json";

/// Stored form: the actor id is the map key, not repeated in the value.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFollower {
    inbox_url: String,
    public_key_pem: String,
    added_at: DateTime<Utc>,
}

pub struct FollowerRegistry {
    path: PathBuf,
    inner: RwLock<HashMap<String, Follower>>,
}

impl FollowerRegistry {
    pub fn load(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(FOLLOWERS_FILE);

        let mut map = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let stored: HashMap<String, StoredFollower> = serde_json::from_str(&raw)
                .map_err(|e| BoardError::Storage(format!("followers.json: {}", e)))?;
            for (actor_id, record) in stored {
                map.insert(
                    actor_id.clone(),
                    Follower {
                        actor_id,
                        inbox_url: record.inbox_url,
                        public_key_pem: record.public_key_pem,
                        added_at: record.added_at,
                    },
                );
            }
            debug!(count = map.len(), "Followers warm-loaded");
        }

        Ok(Self {
            path,
            inner: RwLock::new(map),
        })
    }

    pub async fn add(&self, follower: Follower) -> Result<()> {
        let mut inner = self.inner.write().await;
        info!(actor = %follower.actor_id, inbox = %follower.inbox_url, "Follower added");
        inner.insert(follower.actor_id.clone(), follower);
        self.persist(&inner)
    }

    /// Returns whether the actor was actually subscribed.
    pub async fn remove(&self, actor_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner.remove(actor_id).is_some();
        if removed {
            info!(actor = actor_id, "Follower removed");
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    pub async fn get(&self, actor_id: &str) -> Option<Follower> {
        self.inner.read().await.get(actor_id).cloned()
    }

    pub async fn all(&self) -> Vec<Follower> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    fn persist(&self, map: &HashMap<String, Follower>) -> Result<()> {
        let stored: HashMap<&str, StoredFollower> = map
            .iter()
            .map(|(actor_id, f)| {
                (
                    actor_id.as_str(),
                    StoredFollower {
                        inbox_url: f.inbox_url.clone(),
                        public_key_pem: f.public_key_pem.clone(),
                        added_at: f.added_at,
                    },
                )
            })
            .collect();

        let tmp_path = self.path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(&stored)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn follower(actor_id: &str) -> Follower {
        Follower {
            actor_id: actor_id.to_string(),
            inbox_url: format!("{}/inbox", actor_id),
            public_key_pem: "-----BEGIN PUBLIC KEY-----\n...\n-----END PUBLIC KEY-----\n"
                .to_string(),
            added_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_remove() {
        let dir = TempDir::new().unwrap();
        let registry = FollowerRegistry::load(dir.path()).unwrap();

        registry
            .add(follower("https://peers.example/actor"))
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove("https://peers.example/actor").await.unwrap());
        assert!(!registry.remove("https://peers.example/actor").await.unwrap());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_persists_across_reload() {
        let dir = TempDir::new().unwrap();
        {
            let registry = FollowerRegistry::load(dir.path()).unwrap();
            registry
                .add(follower("https://peers.example/actor"))
                .await
                .unwrap();
        }

        let reloaded = FollowerRegistry::load(dir.path()).unwrap();
        let restored = reloaded.get("https://peers.example/actor").await.unwrap();
        assert_eq!(restored.inbox_url, "https://peers.example/actor/inbox");
    }

    #[tokio::test]
    async fn test_stored_shape_is_keyed_map() {
        let dir = TempDir::new().unwrap();
        let registry = FollowerRegistry::load(dir.path()).unwrap();
        registry
            .add(follower("https://peers.example/actor"))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("followers.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let record = &value["https://peers.example/actor"];
        assert!(record["inbox_url"].is_string());
        assert!(record["added_at"].is_string());
        // actor id only appears as the key
        assert!(record.get("actor_id").is_none());
    }
}
