//! Runtime knobs, loaded from a TOML file. Every field has a sane default
//! so an empty file (or a file that only overrides relays) is valid.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

fn default_batch_size() -> usize {
    500
}
fn default_max_concurrent_connections() -> usize {
    16
}
fn default_reconnect_delay_seconds() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_polling_timeout_seconds() -> u64 {
    30
}
fn default_polling_window_minutes() -> i64 {
    60
}
fn default_checkpoint_interval() -> u64 {
    100
}
fn default_resume_overlap_seconds() -> i64 {
    300
}
fn default_negentropy_frame_size() -> usize {
    60_000
}
fn default_negentropy_chunk_hours() -> i64 {
    24
}
fn default_polling_chunk_hours() -> i64 {
    24
}
fn default_upload_batch_size() -> usize {
    50
}
fn default_upload_delay_ms() -> u64 {
    250
}
fn default_stale_threshold_minutes() -> i64 {
    15
}
fn default_error_retry_after_minutes() -> i64 {
    10
}
fn default_backfill_since_hours() -> i64 {
    24 * 30
}

/// Direction of sync a relay participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Down,
    Up,
    Both,
}

impl Direction {
    pub fn allows_download(self) -> bool {
        matches!(self, Direction::Down | Direction::Both)
    }

    pub fn allows_upload(self) -> bool {
        matches!(self, Direction::Up | Direction::Both)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub backfill: bool,
    #[serde(default)]
    pub negentropy: bool,
    #[serde(default = "default_direction")]
    pub direction: Direction,
}

fn default_true() -> bool {
    true
}

fn default_direction() -> Direction {
    Direction::Both
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_polling_timeout_seconds")]
    pub polling_timeout_seconds: u64,
    #[serde(default = "default_polling_window_minutes")]
    pub polling_window_minutes: i64,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_resume_overlap_seconds")]
    pub resume_overlap_seconds: i64,
    #[serde(default = "default_negentropy_frame_size")]
    pub negentropy_frame_size: usize,
    #[serde(default = "default_negentropy_chunk_hours")]
    pub negentropy_chunk_hours: i64,
    #[serde(default = "default_polling_chunk_hours")]
    pub polling_chunk_hours: i64,
    #[serde(default = "default_upload_batch_size")]
    pub upload_batch_size: usize,
    #[serde(default = "default_upload_delay_ms")]
    pub upload_delay_ms: u64,
    #[serde(default = "default_stale_threshold_minutes")]
    pub stale_threshold_minutes: i64,
    #[serde(default = "default_error_retry_after_minutes")]
    pub error_retry_after_minutes: i64,
    #[serde(default = "default_backfill_since_hours")]
    pub backfill_since_hours: i64,
    /// Empty means "all kinds".
    #[serde(default)]
    pub event_kinds: Vec<u16>,
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty document satisfies every default")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn relays_by_url(&self) -> HashMap<&str, &RelayConfig> {
        self.relays.iter().map(|r| (r.url.as_str(), r)).collect()
    }

    pub fn download_capable(&self) -> impl Iterator<Item = &RelayConfig> {
        self.relays
            .iter()
            .filter(|r| r.enabled && r.direction.allows_download())
    }

    pub fn upload_capable(&self) -> impl Iterator<Item = &RelayConfig> {
        self.relays
            .iter()
            .filter(|r| r.enabled && r.direction.allows_upload())
    }

    pub fn backfill_capable(&self) -> impl Iterator<Item = &RelayConfig> {
        self.relays
            .iter()
            .filter(|r| r.enabled && r.backfill && r.direction.allows_download())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_every_default() {
        let config = Config::default();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.negentropy_frame_size, 60_000);
        assert!(config.event_kinds.is_empty());
        assert!(config.relays.is_empty());
    }

    #[test]
    fn relay_defaults_enable_both_directions() {
        let config: Config = toml::from_str(
            r#"
            [[relays]]
            url = "wss://relay.example.com"
            "#,
        )
        .unwrap();
        let relay = &config.relays[0];
        assert!(relay.enabled);
        assert!(relay.backfill);
        assert!(!relay.negentropy);
        assert_eq!(relay.direction, Direction::Both);
    }

    #[test]
    fn direction_filters_partition_relay_roles() {
        let config: Config = toml::from_str(
            r#"
            [[relays]]
            url = "wss://down.example.com"
            direction = "down"

            [[relays]]
            url = "wss://up.example.com"
            direction = "up"
            "#,
        )
        .unwrap();
        assert_eq!(config.download_capable().count(), 1);
        assert_eq!(config.upload_capable().count(), 1);
    }

    #[test]
    fn disabled_relay_is_excluded_from_every_role() {
        let config: Config = toml::from_str(
            r#"
            [[relays]]
            url = "wss://off.example.com"
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.download_capable().count(), 0);
        assert_eq!(config.upload_capable().count(), 0);
        assert_eq!(config.backfill_capable().count(), 0);
    }
}
