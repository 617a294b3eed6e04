use actix_web::{web, HttpResponse, Responder};
use log::info;
use serde::Deserialize;

use crate::api::AppState;
use crate::proxy::exporter;
use crate::utils::httpdecode;

/// Query parameters for listing flows
#[derive(Deserialize)]
pub struct FlowsQuery {
    #[serde(default = "default_flow_limit")]
    limit: i64,
}

fn default_flow_limit() -> i64 {
    200
}

/// Query parameters for a single flow
#[derive(Deserialize)]
pub struct FlowQuery {
    pub decoded: Option<String>,
}

/// Query parameters for export
#[derive(Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

/// Get recent flows
pub async fn get_flows(state: web::Data<AppState>, query: web::Query<FlowsQuery>) -> impl Responder {
    HttpResponse::Ok().json(state.flow_store.get_all(query.limit))
}

/// Get one flow; `decoded=1` adds a best-effort text rendering of the
/// response body.
pub async fn get_flow(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<FlowQuery>,
) -> impl Responder {
    let id = path.into_inner();
    let Some(flow) = state.flow_store.get_by_id(&id) else {
        return HttpResponse::NotFound().json(serde_json::json!({
            "status": "error",
            "message": format!("flow {} not found", id)
        }));
    };

    if query.decoded.as_deref() == Some("1") {
        if let Some(response) = &flow.response {
            let (body_text, _) = httpdecode::decode_body_to_text(&response.body, &response.headers);
            let mut view = serde_json::to_value(&flow).unwrap_or_default();
            if let Some(resp) = view.get_mut("response") {
                if let Some(obj) = resp.as_object_mut() {
                    obj.insert("body_text".to_string(), serde_json::Value::String(body_text));
                }
            }
            return HttpResponse::Ok().json(view);
        }
    }

    HttpResponse::Ok().json(flow)
}

/// Get flow store statistics
pub async fn flow_stats(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.flow_store.get_stats())
}

/// Clear the flow store
pub async fn clear_flows(state: web::Data<AppState>) -> impl Responder {
    state.flow_store.clear();
    info!("flow store cleared");
    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": "flow store cleared"
    }))
}

/// Export all flows as JSON or CSV
pub async fn export_flows(
    state: web::Data<AppState>,
    query: web::Query<ExportQuery>,
) -> impl Responder {
    let flows = state.flow_store.get_all(0);
    match query.format.as_deref().unwrap_or("json") {
        "csv" => HttpResponse::Ok()
            .content_type("text/csv")
            .insert_header(("Content-Disposition", "attachment; filename=flows.csv"))
            .body(exporter::export_csv(&flows)),
        "json" => match exporter::export_json(&flows) {
            Ok(json) => HttpResponse::Ok()
                .content_type("application/json")
                .insert_header(("Content-Disposition", "attachment; filename=flows.json"))
                .body(json),
            Err(e) => HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "error",
                "message": format!("{}", e)
            })),
        },
        other => HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": format!("unsupported export format {:?}", other)
        })),
    }
}
