//! Server configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seconds a desynced client may linger before the reaper evicts it.
    #[serde(default = "default_desynced_timeout")]
    pub desynced_timeout_seconds: u64,

    /// Interval of the client-group reaper.
    #[serde(default = "default_client_poll_interval")]
    pub client_poll_interval_seconds: u64,

    /// Interval of the room inactivity reaper. A room inactive across two
    /// consecutive ticks is restarted to free its history memory.
    #[serde(default = "default_room_inactivity")]
    pub room_inactivity_seconds: u64,

    /// Debounce window for coalesced saves.
    #[serde(default = "default_save_debounce")]
    pub save_debounce_ms: u64,

    /// Attempts made when bringing up a kernel client, spaced one second apart.
    #[serde(default = "default_connection_attempts")]
    pub connection_attempts: u32,

    /// Root directory for externalized output artifacts.
    #[serde(default = "default_outputs_path")]
    pub outputs_path: PathBuf,

    /// Serialized outputs larger than this are written to the output store
    /// and replaced with a reference payload in the document.
    #[serde(default = "default_output_size_threshold")]
    pub output_size_threshold: usize,

    /// MIME types always offloaded to the output store regardless of size.
    #[serde(default = "default_offload_mime_types")]
    pub offload_mime_types: HashSet<String>,

    /// Kernel message types the bridge consumes instead of forwarding to
    /// browser clients.
    #[serde(default = "default_exclude_msg_types")]
    pub exclude_msg_types: HashSet<String>,
}

fn default_desynced_timeout() -> u64 {
    120
}

fn default_client_poll_interval() -> u64 {
    60
}

fn default_room_inactivity() -> u64 {
    10
}

fn default_save_debounce() -> u64 {
    500
}

fn default_connection_attempts() -> u32 {
    10
}

fn default_outputs_path() -> PathBuf {
    std::env::temp_dir().join("docsync").join("outputs")
}

fn default_output_size_threshold() -> usize {
    2048
}

fn default_offload_mime_types() -> HashSet<String> {
    ["image/png", "image/jpeg", "text/html"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_exclude_msg_types() -> HashSet<String> {
    [
        "status",
        "execute_input",
        "stream",
        "display_data",
        "execute_result",
        "error",
        "update_display_data",
        "clear_output",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            desynced_timeout_seconds: default_desynced_timeout(),
            client_poll_interval_seconds: default_client_poll_interval(),
            room_inactivity_seconds: default_room_inactivity(),
            save_debounce_ms: default_save_debounce(),
            connection_attempts: default_connection_attempts(),
            outputs_path: default_outputs_path(),
            output_size_threshold: default_output_size_threshold(),
            offload_mime_types: default_offload_mime_types(),
            exclude_msg_types: default_exclude_msg_types(),
        }
    }
}

impl Config {
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn desynced_timeout(&self) -> Duration {
        Duration::from_secs(self.desynced_timeout_seconds)
    }

    pub fn client_poll_interval(&self) -> Duration {
        Duration::from_secs(self.client_poll_interval_seconds)
    }

    pub fn room_inactivity_interval(&self) -> Duration {
        Duration::from_secs(self.room_inactivity_seconds)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}
