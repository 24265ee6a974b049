//! Scrape endpoint and companion routes, one server per listen address.

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::collector::{HttpCollector, MtrCollector, PingCollector, TcpCollector, encode_metrics};
use crate::monitor::Monitors;

/// Endpoint-protection subset honored from `--web.config.file`.
#[derive(Debug, Default, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub basic_auth_users: HashMap<String, String>,
}

pub async fn load_web_config(path: &str) -> Result<WebConfig> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading web config {path}"))?;
    toml::from_str(&data).with_context(|| format!("parsing web config {path}"))
}

pub struct AppState {
    pub monitors: Arc<Monitors>,
    pub ping: PingCollector,
    pub mtr: MtrCollector,
    pub tcp: TcpCollector,
    pub http: HttpCollector,
    pub metrics_path: String,
    pub profiling: bool,
    pub auth: Option<WebConfig>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/", get(index_handler))
        .route(&state.metrics_path, get(metrics_handler));
    if state.profiling {
        router = router.route("/debug/vars", get(vars_handler));
    }
    router
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .with_state(state)
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><meta charset=\"UTF-8\">\
         <title>netprobe {version}</title></head>\
         <body><h1>netprobe</h1><p><a href=\"{path}\">Metrics</a></p></body></html>",
        version = env!("CARGO_PKG_VERSION"),
        path = state.metrics_path,
    ))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut families = Vec::new();
    families.extend(state.ping.collect());
    families.extend(state.mtr.collect());
    families.extend(state.tcp.collect());
    families.extend(state.http.collect());
    let body = encode_metrics(families);
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

async fn vars_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
        "workers": state.monitors.inventory(),
    }))
}

async fn basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(request).await;
    };
    if auth.basic_auth_users.is_empty() {
        return next.run(request).await;
    }

    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if credentials_match(value.to_str().unwrap_or_default(), &auth.basic_auth_users) {
            return next.run(request).await;
        }
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"netprobe\"")],
        "unauthorized",
    )
        .into_response()
}

fn credentials_match(header_value: &str, users: &HashMap<String, String>) -> bool {
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return false;
    };
    users.get(user).is_some_and(|expected| expected == password)
}

/// `":9427"` listens on every interface, the way the flag is usually given.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Bind every listen address and serve until interrupted.
pub async fn serve(state: Arc<AppState>, addrs: &[String]) -> Result<()> {
    let router = build_router(state);

    for addr in addrs {
        let addr = normalize_listen_addr(addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        tracing::info!(addr = %addr, "listening");
        tokio::spawn(axum::serve(listener, router.clone()).into_future());
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");
    Ok(())
}
