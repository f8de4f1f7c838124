//! HTTP/HTTPS front
//!
//! Serves `/health`, `/status` and `/maps/key` locally and routes the
//! Places endpoints to the proxy. CORS headers are attached uniformly and
//! bare OPTIONS requests answer 200. HTTP rides `axum::serve`; HTTPS
//! accepts TLS connections by hand and serves each one through hyper.

pub mod places;

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::http::places::{NearbySearchRequest, PlacesClient, ProxyResponse, TextSearchRequest};

const API_KEY_MISSING: &str = "Google Maps API key is not configured on the server";

/// Shared state behind the HTTP front
pub struct AppState {
    pub maps_api_key: String,
    pub places: PlacesClient,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            maps_api_key: config.maps_api_key.clone(),
            places: PlacesClient::new(config.maps_api_key.clone())?,
        })
    }
}

pub type SharedState = Arc<AppState>;

/// Build the router with the full HTTP surface
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/maps/key", get(maps_key))
        .route("/places/nearby", post(places_nearby))
        .route("/places/search", post(places_search))
        .route("/places/details/{place_id}", get(place_details))
        .route("/places/photo/{photo_reference}", get(place_photo))
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Answer any OPTIONS request with 200 and stamp the permissive CORS
/// header set onto every response, preflight or not.
async fn cors(req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, Accept"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        "OK",
    )
}

async fn status() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn maps_key(State(state): State<SharedState>) -> Response {
    if state.maps_api_key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "text/plain")],
            API_KEY_MISSING,
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        state.maps_api_key.clone(),
    )
        .into_response()
}

async fn places_nearby(
    State(state): State<SharedState>,
    Json(request): Json<NearbySearchRequest>,
) -> Response {
    info!("Received request for /places/nearby");
    if state.maps_api_key.is_empty() {
        return api_key_missing_response();
    }
    relay(state.places.nearby_search(&request).await)
}

async fn places_search(
    State(state): State<SharedState>,
    Json(request): Json<TextSearchRequest>,
) -> Response {
    info!("Received request for /places/search");
    if state.maps_api_key.is_empty() {
        return api_key_missing_response();
    }
    relay(state.places.text_search(&request).await)
}

async fn place_details(
    State(state): State<SharedState>,
    Path(place_id): Path<String>,
) -> Response {
    info!("Received request for /places/details/{}", place_id);
    if state.maps_api_key.is_empty() {
        return api_key_missing_response();
    }
    relay(state.places.place_details(&place_id).await)
}

#[derive(Debug, Deserialize)]
struct PhotoQuery {
    maxwidth: Option<u32>,
}

async fn place_photo(
    State(state): State<SharedState>,
    Path(photo_reference): Path<String>,
    Query(query): Query<PhotoQuery>,
) -> Response {
    info!("Received request for /places/photo/{}", photo_reference);
    if state.maps_api_key.is_empty() {
        return api_key_missing_response();
    }
    relay(state.places.place_photo(&photo_reference, query.maxwidth).await)
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain")],
        format!("The resource '{}' was not found.", uri.path()),
    )
}

fn api_key_missing_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": API_KEY_MISSING })),
    )
        .into_response()
}

/// Translate a proxy result: data responses relay the upstream status and
/// body; transport errors become a 500 with a short reason.
fn relay(result: Result<ProxyResponse>) -> Response {
    match result {
        Ok(proxy) => {
            let status =
                StatusCode::from_u16(proxy.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = HeaderValue::from_str(&proxy.content_type)
                .unwrap_or(HeaderValue::from_static("application/octet-stream"));
            (status, [(header::CONTENT_TYPE, content_type)], proxy.body).into_response()
        }
        Err(e) => {
            error!("Places proxy error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Serve the router over plain HTTP until shutdown
pub async fn run_http_server(
    listener: TcpListener,
    state: SharedState,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "HTTP server listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Serve the router over TLS. Each accepted socket gets its own hyper
/// connection; handshake failures are logged and skipped.
pub async fn run_https_server(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    state: SharedState,
    shutdown: CancellationToken,
) {
    info!(
        "HTTPS server listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    let acceptor = TlsAcceptor::from(tls_config);
    let app = router(state);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("HTTPS server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let acceptor = acceptor.clone();
                    let app = app.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("[{}] TLS handshake failed: {}", addr, e);
                                return;
                            }
                        };
                        let service = TowerToHyperService::new(app);
                        if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await
                        {
                            debug!("[{}] HTTPS connection ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("HTTPS accept error: {}", e);
                }
            }
        }
    }
}
