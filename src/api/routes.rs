use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

use crate::api::handlers::{capture, flows, proxy};

/// Root endpoint to provide information about the API
async fn index() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "name": "CetiProbe API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Local traffic observation: packet capture plus HTTPS-intercepting proxy",
        "endpoints": [
            {"path": "/api/status", "method": "GET", "description": "Capture status"},
            {"path": "/api/interfaces", "method": "GET", "description": "List network interfaces"},
            {"path": "/api/start", "method": "POST", "description": "Start capture (iface=...)"},
            {"path": "/api/stop", "method": "POST", "description": "Stop capture"},
            {"path": "/api/packets", "method": "GET", "description": "Recent packets (limit=N)"},
            {"path": "/api/packets", "method": "DELETE", "description": "Clear packet store"},
            {"path": "/api/packets/filter", "method": "POST", "description": "Filter packets"},
            {"path": "/api/stats", "method": "GET", "description": "Packet store statistics"},
            {"path": "/api/proxy/status", "method": "GET", "description": "Proxy status"},
            {"path": "/api/proxy/start", "method": "POST", "description": "Start proxy (addr=, https=1)"},
            {"path": "/api/proxy/stop", "method": "POST", "description": "Stop proxy"},
            {"path": "/api/proxy/ca", "method": "GET", "description": "Download root CA PEM"},
            {"path": "/api/proxy/ca/generate", "method": "POST", "description": "Regenerate root CA"},
            {"path": "/api/proxy/ca/install", "method": "POST", "description": "CA install script (os=...)"},
            {"path": "/api/proxy/ca/instructions", "method": "GET", "description": "CA install steps (os=...)"},
            {"path": "/api/proxy/stats", "method": "GET", "description": "Proxy network/performance stats"},
            {"path": "/api/flows", "method": "GET", "description": "Recent flows (limit=N)"},
            {"path": "/api/flows", "method": "DELETE", "description": "Clear flow store"},
            {"path": "/api/flows/stats", "method": "GET", "description": "Flow store statistics"},
            {"path": "/api/flows/export", "method": "GET", "description": "Export flows (format=json|csv)"},
            {"path": "/api/flows/{id}", "method": "GET", "description": "Single flow (decoded=1)"},
        ]
    }))
}

/// Configure API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index)).service(
        web::scope("/api")
            // Capture lifecycle and packets
            .route("/status", web::get().to(capture::get_status))
            .route("/interfaces", web::get().to(capture::list_interfaces))
            .route("/start", web::post().to(capture::start_capture))
            .route("/stop", web::post().to(capture::stop_capture))
            .route("/packets", web::get().to(capture::get_packets))
            .route("/packets", web::delete().to(capture::clear_packets))
            .route("/packets/filter", web::post().to(capture::filter_packets))
            .route("/stats", web::get().to(capture::get_packet_stats))
            // Proxy lifecycle and CA management
            .route("/proxy/status", web::get().to(proxy::proxy_status))
            .route("/proxy/start", web::post().to(proxy::proxy_start))
            .route("/proxy/stop", web::post().to(proxy::proxy_stop))
            .route("/proxy/ca", web::get().to(proxy::download_ca))
            .route("/proxy/ca/generate", web::post().to(proxy::generate_ca))
            .route("/proxy/ca/install", web::post().to(proxy::ca_install))
            .route("/proxy/ca/instructions", web::get().to(proxy::ca_instructions))
            .route("/proxy/stats", web::get().to(proxy::proxy_stats))
            // Flows
            .route("/flows", web::get().to(flows::get_flows))
            .route("/flows", web::delete().to(flows::clear_flows))
            .route("/flows/stats", web::get().to(flows::flow_stats))
            .route("/flows/export", web::get().to(flows::export_flows))
            .route("/flows/{id}", web::get().to(flows::get_flow)),
    );
}
