//! Cluster Configuration
//!
//! Configuration types for the store-backed cluster bus.

use serde::Deserialize;

/// Cluster bus configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Broker identifier (auto-generated from hostname if not set).
    /// Must be unique across the cluster: events carrying this id as their
    /// origin are discarded on receipt.
    pub node_id: Option<String>,

    /// Pub/sub channel on the durable store that carries cluster events
    /// Default: "tidemq:cluster"
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "tidemq:cluster".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            channel: default_channel(),
        }
    }
}

impl ClusterConfig {
    /// Get the node ID, generating from hostname and process id if not set
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{}", rand_id()));
            format!("{}-{}", host, std::process::id())
        })
    }
}

/// Generate a random ID for node identification
fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFFFFFF)
}
