//! Configuration system.
//!
//! Loads engine configuration from JSON strings or files. Every field but
//! `server_addr` and `tick_hz` has a default, so a config file only needs
//! to name what it changes.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Capture a snapshot every N fixed ticks.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ticks: u32,
    /// Snapshots retained per session for delta baselines.
    #[serde(default = "default_snapshot_history")]
    pub snapshot_history: usize,
    /// Horizontal distance at which a client-claimed position is refused.
    #[serde(default = "default_teleport_threshold")]
    pub teleport_threshold: f32,
    /// How long an attacker keeps credit for a kill.
    #[serde(default = "default_kill_credit_window")]
    pub kill_credit_window_secs: f64,
    /// Damage suppression after a (re)spawn.
    #[serde(default = "default_spawn_protection")]
    pub spawn_protection_secs: f64,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
}

fn default_snapshot_interval() -> u32 {
    1
}

fn default_snapshot_history() -> usize {
    64
}

fn default_teleport_threshold() -> f32 {
    12.0
}

fn default_kill_credit_window() -> f64 {
    5.0
}

fn default_spawn_protection() -> f64 {
    2.0
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 30,
            snapshot_interval_ticks: default_snapshot_interval(),
            snapshot_history: default_snapshot_history(),
            teleport_threshold: default_teleport_threshold(),
            kill_credit_window_secs: default_kill_credit_window(),
            spawn_protection_secs: default_spawn_protection(),
            player_name: default_player_name(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Seconds per fixed tick.
    pub fn tick_secs(&self) -> f64 {
        1.0 / self.tick_hz.max(1) as f64
    }
}
