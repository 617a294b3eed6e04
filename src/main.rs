mod api;
mod capture;
mod models;
mod proxy;
mod storage;
mod utils;

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use log::info;
use std::sync::Arc;

use crate::api::{routes, AppState};
use crate::models::config::AppConfig;
use crate::storage::memory::{MemoryFlowStore, MemoryPacketStore};
use crate::utils::logging;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Local traffic observer: packet capture + HTTPS-intercepting proxy with a REST API")]
struct Args {
    /// Network interface to capture from (can also be passed per request)
    #[clap(short, long)]
    interface: Option<String>,

    /// Port for the REST API server
    #[clap(short, long, default_value = "8080")]
    port: u16,

    /// Default listen address for the interception proxy
    #[clap(long, default_value = ":8899")]
    proxy_addr: String,

    /// Packet store capacity
    #[clap(long, default_value = "10000")]
    packet_capacity: usize,

    /// Flow store capacity
    #[clap(long, default_value = "20000")]
    flow_capacity: usize,

    /// Log level (trace, debug, info, warn, error, off)
    #[clap(long, default_value = "info")]
    log_level: String,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_logger(logging::get_log_level(&args.log_level));

    info!("Starting CetiProbe v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig {
        interface: args.interface,
        port: args.port,
        proxy_addr: args.proxy_addr,
        packet_capacity: args.packet_capacity,
        flow_capacity: args.flow_capacity,
    };

    let packet_store = Arc::new(MemoryPacketStore::with_capacity(config.packet_capacity));
    let flow_store = Arc::new(MemoryFlowStore::with_capacity(config.flow_capacity));

    let state = web::Data::new(AppState::new(config.clone(), packet_store, flow_store));

    info!("Starting CetiProbe API server on port {}", config.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(routes::configure)
    })
    .bind(("127.0.0.1", config.port))?
    .run()
    .await?;

    Ok(())
}
