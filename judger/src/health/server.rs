//! HTTP surface: `/healthz`, `/readyz`, `/status` and `/metrics`.

use hyper::{
    header,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use super::HealthMonitor;
use crate::{metrics::MemoryMetrics, prelude::CancellationToken};

#[derive(Clone)]
pub struct HealthServerState {
    pub monitor: Arc<HealthMonitor>,
    pub metrics: Arc<MemoryMetrics>,
}

/// Serve until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: HealthServerState,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(&state, req).await) }
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    tracing::info!(%addr, "health endpoint listening");
    server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

pub async fn route(state: &HealthServerState, req: Request<Body>) -> Response<Body> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n".into());
    }
    match req.uri().path() {
        "/healthz" => {
            let code = if state.monitor.is_live() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(code, &serde_json::json!({ "status": "alive" }))
        }
        "/readyz" => {
            let report = state.monitor.readiness_cached().await;
            let code = if report.is_ready() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(code, report.as_ref())
        }
        "/status" => {
            let report = state.monitor.status().await;
            json(StatusCode::OK, &report)
        }
        "/metrics" => text(StatusCode::OK, state.metrics.render()),
        _ => text(StatusCode::NOT_FOUND, "not found\n".into()),
    }
}

fn json<T: Serialize + ?Sized>(code: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(body) => response(code, "application/json", body.into()),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
    }
}

fn text(code: StatusCode, body: String) -> Response<Body> {
    response(code, "text/plain; charset=utf-8", body.into())
}

fn response(code: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut res = Response::new(body);
    *res.status_mut() = code;
    res.headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    res
}
