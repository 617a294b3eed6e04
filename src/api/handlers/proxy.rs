use actix_web::{web, HttpResponse, Responder};
use log::{error, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::AppState;
use crate::models::flow::PerformanceMetrics;
use crate::models::stats::NetworkStats;
use crate::proxy::ca;
use crate::proxy::installer;
use crate::proxy::server::ProxyServer;

/// Query parameters for starting the proxy
#[derive(Deserialize)]
pub struct ProxyStartQuery {
    pub addr: Option<String>,
    /// "1" enables HTTPS interception
    pub https: Option<String>,
}

/// Query parameters naming a platform
#[derive(Deserialize)]
pub struct OsQuery {
    pub os: Option<String>,
}

/// Get proxy status
pub async fn proxy_status(state: web::Data<AppState>) -> impl Responder {
    let proxy = state.proxy.read().await;
    let running = proxy.as_ref().is_some_and(|p| p.is_running());
    HttpResponse::Ok().json(serde_json::json!({ "running": running }))
}

/// Start the interception proxy
pub async fn proxy_start(
    state: web::Data<AppState>,
    query: web::Query<ProxyStartQuery>,
) -> impl Responder {
    let addr = query
        .addr
        .clone()
        .unwrap_or_else(|| state.config.proxy_addr.clone());
    let https = query.https.as_deref() == Some("1");

    let mut proxy = state.proxy.write().await;
    if proxy.as_ref().is_some_and(|p| p.is_running()) {
        return HttpResponse::Conflict().json(serde_json::json!({
            "status": "error",
            "message": "proxy is already running"
        }));
    }

    let server = match ProxyServer::new(&addr, https, state.flow_store.clone()) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("failed to build proxy: {}", e);
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": format!("{}", e)
            }));
        }
    };

    if let Err(e) = server.start().await {
        error!("failed to start proxy on {}: {}", addr, e);
        return HttpResponse::InternalServerError().json(serde_json::json!({
            "status": "error",
            "message": format!("{}", e)
        }));
    }

    info!("proxy started on {} (https={})", addr, https);
    *proxy = Some(server);
    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "addr": addr,
        "https": https,
    }))
}

/// Stop the interception proxy
pub async fn proxy_stop(state: web::Data<AppState>) -> impl Responder {
    let mut proxy = state.proxy.write().await;
    let Some(server) = proxy.as_ref() else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": "proxy is not running"
        }));
    };

    match server.stop() {
        Ok(()) => {
            *proxy = None;
            HttpResponse::Ok().json(serde_json::json!({
                "status": "success",
                "message": "proxy stopped"
            }))
        }
        Err(e) => HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": format!("{}", e)
        })),
    }
}

/// Download the root CA certificate, generating it on first use
pub async fn download_ca(_state: web::Data<AppState>) -> impl Responder {
    match ca::ensure_ca() {
        Ok(material) => HttpResponse::Ok()
            .content_type("application/x-pem-file")
            .insert_header((
                "Content-Disposition",
                "attachment; filename=proxy_root_ca.pem",
            ))
            .body(material.cert_pem),
        Err(e) => {
            error!("failed to provide CA certificate: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": format!("{}", e)
            }))
        }
    }
}

/// Regenerate the root CA, replacing the on-disk material
pub async fn generate_ca(_state: web::Data<AppState>) -> impl Responder {
    match ca::generate_ca() {
        Ok(material) => {
            info!("root CA regenerated at {}", material.files.cert_path.display());
            HttpResponse::Ok().json(serde_json::json!({
                "status": "success",
                "cert_path": material.files.cert_path.display().to_string(),
            }))
        }
        Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({
            "status": "error",
            "message": format!("{}", e)
        })),
    }
}

/// Return the platform install script and walkthrough for the root CA
pub async fn ca_install(
    _state: web::Data<AppState>,
    query: web::Query<OsQuery>,
) -> impl Responder {
    let os = query.os.clone().unwrap_or_else(|| "darwin".to_string());

    let material = match ca::ensure_ca() {
        Ok(material) => material,
        Err(e) => {
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": format!("{}", e)
            }))
        }
    };

    let cert_path = material.files.cert_path.display().to_string();
    HttpResponse::Ok().json(serde_json::json!({
        "script": installer::install_script(&os, &cert_path),
        "instructions": installer::install_instructions(&os),
        "cert_path": cert_path,
    }))
}

/// Return only the manual installation walkthrough
pub async fn ca_instructions(query: web::Query<OsQuery>) -> impl Responder {
    let os = query.os.clone().unwrap_or_else(|| "darwin".to_string());
    HttpResponse::Ok().json(serde_json::json!({
        "instructions": installer::install_instructions(&os),
    }))
}

/// Aggregated per-host and per-flow statistics from the running proxy
pub async fn proxy_stats(state: web::Data<AppState>) -> impl Responder {
    let proxy = state.proxy.read().await;
    let (network, performance) = match proxy.as_ref() {
        Some(server) => (server.network_stats(), server.performance_stats()),
        None => (
            HashMap::<String, NetworkStats>::new(),
            HashMap::<String, PerformanceMetrics>::new(),
        ),
    };
    HttpResponse::Ok().json(serde_json::json!({
        "network_stats": network,
        "performance_stats": performance,
    }))
}
