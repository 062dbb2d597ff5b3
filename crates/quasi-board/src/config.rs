use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BoardConfig {
    #[serde(default)]
    pub board: BoardSettings,
    #[serde(default)]
    pub tasks: TaskSourceConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSettings {
    /// External base URL used in every self-identifying actor link.
    pub base_url: String,
    pub data_dir: PathBuf,
    pub bind_addr: String,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8420".to_string(),
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8420".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSourceConfig {
    /// Upstream issue feed, GitHub issues API shape.
    pub source_url: String,
    pub label: String,
    pub github_token: Option<String>,
    pub refresh_interval_secs: u64,
}

impl Default for TaskSourceConfig {
    fn default() -> Self {
        Self {
            source_url: "https://api.github.com/repos/ehrenfest-quantum/quasi/issues".to_string(),
            label: "good-first-task".to_string(),
            github_token: None,
            refresh_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Total timeout for any outbound HTTP call.
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "pretty", "compact" or "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl BoardConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse config {:?}", path))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        Ok(())
    }

    /// Environment overrides sit between the config file and CLI flags.
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("QUASI_BOARD_URL") {
            self.board.base_url = url;
        }
        if let Ok(dir) = env::var("QUASI_DATA_DIR") {
            self.board.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = env::var("QUASI_BIND_ADDR") {
            self.board.bind_addr = addr;
        }
        if let Ok(url) = env::var("QUASI_TASK_SOURCE_URL") {
            self.tasks.source_url = url;
        }
        if let Ok(token) = env::var("GITHUB_TOKEN") {
            self.tasks.github_token = Some(token);
        }
    }

    /// Host part of the base URL, as it appears in webfinger subjects and
    /// the HTTP `Host` header.
    pub fn domain(&self) -> String {
        let trimmed = self
            .board
            .base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        trimmed
            .split('/')
            .next()
            .unwrap_or(trimmed)
            .to_string()
    }

    pub fn actor_url(&self) -> String {
        format!("{}/quasi-board", self.board.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BoardConfig::default();
        assert_eq!(config.board.bind_addr, "127.0.0.1:8420");
        assert_eq!(config.tasks.refresh_interval_secs, 300);
        assert_eq!(config.delivery.timeout_secs, 10);
        assert_eq!(config.delivery.max_attempts, 5);
    }

    #[test]
    fn test_domain_extraction() {
        let mut config = BoardConfig::default();
        config.board.base_url = "https://gawain.valiant-quantum.com".to_string();
        assert_eq!(config.domain(), "gawain.valiant-quantum.com");
        assert_eq!(
            config.actor_url(),
            "https://gawain.valiant-quantum.com/quasi-board"
        );

        config.board.base_url = "http://localhost:8420/".to_string();
        assert_eq!(config.domain(), "localhost:8420");
        assert_eq!(config.actor_url(), "http://localhost:8420/quasi-board");
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quasi-board.toml");

        let mut config = BoardConfig::default();
        config.board.base_url = "https://gawain.valiant-quantum.com".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = BoardConfig::from_file(&path).unwrap();
        assert_eq!(loaded.board.base_url, config.board.base_url);
        assert_eq!(loaded.tasks.label, "good-first-task");
    }
}
