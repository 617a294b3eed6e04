use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network interface to capture from
    pub interface: Option<String>,

    /// Port for the REST API server
    pub port: u16,

    /// Default listen address for the interception proxy
    pub proxy_addr: String,

    /// Packet store capacity
    pub packet_capacity: usize,

    /// Flow store capacity
    pub flow_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            interface: None,
            port: 8080,
            proxy_addr: ":8899".to_string(),
            packet_capacity: 10_000,
            flow_capacity: 20_000,
        }
    }
}
