pub mod handlers;
pub mod routes;

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::capture::dns::DnsCorrelator;
use crate::capture::engine::CaptureEngine;
use crate::models::config::AppConfig;
use crate::proxy::server::ProxyServer;
use crate::storage::{FlowStorage, PacketStorage};

/// Shared state handed to every handler.
pub struct AppState {
    pub config: AppConfig,
    pub packet_store: Arc<dyn PacketStorage>,
    pub flow_store: Arc<dyn FlowStorage>,
    pub correlator: Arc<DnsCorrelator>,
    pub capture: RwLock<Option<Arc<CaptureEngine>>>,
    pub proxy: RwLock<Option<Arc<ProxyServer>>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        packet_store: Arc<dyn PacketStorage>,
        flow_store: Arc<dyn FlowStorage>,
    ) -> Self {
        Self {
            config,
            packet_store,
            flow_store,
            correlator: Arc::new(DnsCorrelator::new()),
            capture: RwLock::new(None),
            proxy: RwLock::new(None),
        }
    }
}
