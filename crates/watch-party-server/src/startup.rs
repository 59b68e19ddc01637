//! Actix server startup and app wiring (§4.13).
//!
//! Grounded on the teacher's `startup.rs`: config load → state → `HttpServer`
//! with CORS and a request logger, plus a Ctrl+C shutdown hook. The
//! teacher's path-filtering logger middleware is dropped here (noted in
//! `DESIGN.md`) since this service has no high-frequency HTTP polling
//! routes to silence — the one stateful surface is the WebSocket upgrade,
//! which isn't logged per-request anyway.

use std::net::SocketAddr;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use serde::Serialize;

use crate::clock::SystemClock;
use crate::config::{self, FileConfig, ResolvedConfig};
use crate::extractor::Extractor;
use crate::state::AppState;
use crate::ws;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse { status: "ok", version: crate::VERSION })
}

fn load_config(path: Option<&std::path::Path>) -> Result<Option<FileConfig>> {
    match path {
        Some(path) => FileConfig::load(path).map(Some).context("loading --config file"),
        None => Ok(None),
    }
}

fn resolve(cli_bind: Option<SocketAddr>, cli_api_url: Option<String>, file: Option<&FileConfig>) -> Result<ResolvedConfig> {
    config::resolve_from_env(cli_bind, cli_api_url, file)
}

/// Build server state and run the Actix HTTP server until shut down.
pub async fn run(bind: Option<SocketAddr>, api_url: Option<String>, config_path: Option<std::path::PathBuf>) -> Result<()> {
    let file = load_config(config_path.as_deref())?;
    let resolved = resolve(bind, api_url, file.as_ref())?;

    tracing::info!(bind = %resolved.bind, api_url = %resolved.api_url, "starting watch-party-server");

    let extractor = Arc::new(Extractor::new(resolved.api_url.clone()).context("building extractor client")?);
    let clock = Arc::new(SystemClock);
    let state = web::Data::new(AppState::new(clock, extractor));

    setup_shutdown();
    actix_web::rt::spawn(ws::run_sweeper(state.clone()));

    HttpServer::new(move || {
        let cors = Cors::permissive();
        App::new()
            .app_data(state.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .route("/health", web::get().to(health))
            .service(ws::room_ws)
    })
    .bind(resolved.bind)?
    .run()
    .await?;

    Ok(())
}

/// Install a Ctrl+C handler that stops the Actix system cleanly.
fn setup_shutdown() {
    let _ = ctrlc::set_handler(|| {
        if let Some(system) = actix_web::rt::System::try_current() {
            system.stop();
        } else {
            std::process::exit(0);
        }
    });
}
