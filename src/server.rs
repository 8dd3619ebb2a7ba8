//! HTTP endpoint exposing the collected metrics

use actix_web::{App, HttpResponse, HttpServer, Responder, get, web};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::registry::PrometheusRegistry;

pub struct AppState {
    pub registry: Arc<PrometheusRegistry>,
    pub repositories: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    repositories: usize,
}

#[get("/metrics")]
async fn metrics(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(data.registry.render())
}

#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    web::Json(HealthResponse {
        status: "OK".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        repositories: data.repositories,
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(metrics).service(health_check);
}

/// Serve `/metrics` and `/health` until the server stops
pub async fn serve(state: AppState, port: u16) -> std::io::Result<()> {
    let data = web::Data::new(state);

    info!("Prometheus metrics server started on port {}", port);
    HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .bind(("0.0.0.0", port))?
        .run()
        .await
}
