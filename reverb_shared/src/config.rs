//! Configuration shared by server and client.
//!
//! Loads from JSON strings/files (file IO left to the app).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverbConfig {
    /// Server listen address, e.g. `0.0.0.0:8080`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address a client connects to, e.g. `127.0.0.1:8080`.
    #[serde(default = "default_connect_addr")]
    pub connect_addr: String,
    /// Replication tick rate driven by the host application.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// How long a despawned uid stays tombstoned before it is reaped.
    /// Bounds the window in which in-flight remote calls naming that uid
    /// are silently dropped instead of erroring.
    #[serde(default = "default_reap_delay_ms")]
    pub reap_delay_ms: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_connect_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_reap_delay_ms() -> u64 {
    3_000
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_addr: default_connect_addr(),
            tick_hz: default_tick_hz(),
            reap_delay_ms: default_reap_delay_ms(),
        }
    }
}

impl ReverbConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn reap_delay(&self) -> Duration {
        Duration::from_millis(self.reap_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}
