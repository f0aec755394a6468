//! Multiplexer configuration.
//!
//! Values come from an optional JSON file and environment overrides, the
//! same layering the hub config uses. Every field has a default, so an empty
//! object (or no file at all) is a valid configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_PROTOCOL_TAG;

/// Default readable-buffer high-water mark in bytes (16 KiB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Default number of peer-opened streams waiting for `accept()`.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 128;

/// Session and stream tunables.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MuxConfig {
    /// Tag placed in every frame's `source` field. Sessions with different
    /// tags can share one transport without seeing each other's frames.
    pub protocol_tag: String,
    /// Buffered bytes at which a stream asks its peer to pause.
    pub high_water_mark: usize,
    /// Peer-opened streams held for `accept()`; further Creates are refused.
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            protocol_tag: DEFAULT_PROTOCOL_TAG.to_string(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

impl MuxConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.normalized()
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("read mux config: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parse mux config: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config.normalized())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(tag) = std::env::var("BOTSTER_MUX_TAG") {
            if !tag.is_empty() {
                self.protocol_tag = tag;
            }
        }

        if let Ok(hwm) = std::env::var("BOTSTER_MUX_HIGH_WATER_MARK") {
            if let Ok(hwm) = hwm.parse::<usize>() {
                self.high_water_mark = hwm;
            }
        }

        if let Ok(backlog) = std::env::var("BOTSTER_MUX_ACCEPT_BACKLOG") {
            if let Ok(backlog) = backlog.parse::<usize>() {
                self.accept_backlog = backlog;
            }
        }
    }

    /// Clamp values a stream cannot work with.
    pub(crate) fn normalized(mut self) -> Self {
        self.high_water_mark = self.high_water_mark.max(1);
        self.accept_backlog = self.accept_backlog.max(1);
        self
    }
}
