use actix_web::{web, HttpResponse, Responder};
use log::{error, info};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::AppState;
use crate::capture::engine::{self, CaptureEngine};
use crate::models::filter::PacketFilter;

/// Query parameters for starting capture
#[derive(Deserialize)]
pub struct StartQuery {
    /// Interface to capture on; falls back to the configured default
    pub iface: Option<String>,
}

/// Query parameters for listing packets
#[derive(Deserialize)]
pub struct PacketsQuery {
    #[serde(default = "default_packet_limit")]
    limit: i64,
}

fn default_packet_limit() -> i64 {
    100
}

/// Get capture status
pub async fn get_status(state: web::Data<AppState>) -> impl Responder {
    let capture = state.capture.read().await;
    let (running, iface) = match capture.as_ref() {
        Some(engine) => (engine.is_running(), engine.iface().to_string()),
        None => (false, String::new()),
    };
    HttpResponse::Ok().json(serde_json::json!({
        "running": running,
        "iface": iface,
    }))
}

/// List available network interfaces
pub async fn list_interfaces(_state: web::Data<AppState>) -> impl Responder {
    match engine::list_interfaces() {
        Ok(interfaces) => HttpResponse::Ok().json(interfaces),
        Err(e) => {
            error!("failed to list interfaces: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": format!("failed to list interfaces: {}", e)
            }))
        }
    }
}

/// Start packet capture
pub async fn start_capture(
    state: web::Data<AppState>,
    query: web::Query<StartQuery>,
) -> impl Responder {
    let iface = match query
        .iface
        .clone()
        .or_else(|| state.config.interface.clone())
    {
        Some(iface) if !iface.is_empty() => iface,
        _ => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "status": "error",
                "message": "missing iface parameter"
            }))
        }
    };

    let mut capture = state.capture.write().await;
    if capture.as_ref().is_some_and(|c| c.is_running()) {
        return HttpResponse::Conflict().json(serde_json::json!({
            "status": "error",
            "message": "capture is already running"
        }));
    }

    let new_engine = match CaptureEngine::new(
        &iface,
        state.packet_store.clone(),
        state.correlator.clone(),
    ) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("failed to open capture on {}: {}", iface, e);
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": format!("{}", e)
            }));
        }
    };

    if let Err(e) = new_engine.start() {
        error!("failed to start capture: {}", e);
        return HttpResponse::InternalServerError().json(serde_json::json!({
            "status": "error",
            "message": format!("{}", e)
        }));
    }

    info!("capture started on {}", iface);
    *capture = Some(new_engine);
    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": format!("capture started on {}", iface)
    }))
}

/// Stop packet capture
pub async fn stop_capture(state: web::Data<AppState>) -> impl Responder {
    let mut capture = state.capture.write().await;
    let Some(engine) = capture.as_ref() else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": "capture is not running"
        }));
    };

    match engine.stop() {
        Ok(()) => {
            *capture = None;
            HttpResponse::Ok().json(serde_json::json!({
                "status": "success",
                "message": "capture stopped"
            }))
        }
        Err(e) => HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": format!("{}", e)
        })),
    }
}

/// Get recent packets
pub async fn get_packets(
    state: web::Data<AppState>,
    query: web::Query<PacketsQuery>,
) -> impl Responder {
    let packets = state.packet_store.get_packets(query.limit);
    HttpResponse::Ok().json(packets)
}

/// Get packets matching a filter
pub async fn filter_packets(
    state: web::Data<AppState>,
    filter: web::Json<PacketFilter>,
) -> impl Responder {
    let packets = state.packet_store.get_by_filter(&filter);
    let count = packets.len();
    HttpResponse::Ok().json(serde_json::json!({
        "packets": packets,
        "count": count,
    }))
}

/// Get packet store statistics
pub async fn get_packet_stats(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.packet_store.get_stats())
}

/// Clear the packet store
pub async fn clear_packets(state: web::Data<AppState>) -> impl Responder {
    state.packet_store.clear();
    info!("packet store cleared");
    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": "packet store cleared"
    }))
}
