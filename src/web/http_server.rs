//! HTTP signaling routes
//!
//! All signaling routes live under the configured prefix:
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | POST | `/connections` | connection JSON with the initial offer |
//! | POST | `/connections/{id}/remote-description` | the installed remote description |
//! | GET | `/connections/{id}/additional-candidates` | candidates gathered since the last call |
//! | POST | `/connections/{id}/reconnect` | connection JSON with a fresh offer |
//! | POST | `/connections/{id}/close` | empty |
//! | POST | `/connections/{id}/streams` | correlation id → peer id map |
//!
//! `GET /health` sits outside the prefix.

use crate::config::HttpConfig;
use crate::web::auth::Rejection;
use crate::web::shared::SharedState;
use crate::webrtc::{ConnectionJson, IceCandidate, SessionDescription, StreamMap, WebRTCError};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

const MAX_ID_LEN: usize = 128;

/// Error response: a status and a JSON `{"error": ...}` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<WebRTCError> for ApiError {
    fn from(e: WebRTCError) -> Self {
        let status = match &e {
            WebRTCError::MalformedSignal(_) | WebRTCError::InvalidState(_) => StatusCode::BAD_REQUEST,
            WebRTCError::UnknownConnection(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Signaling request failed: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self {
            status: rejection.status,
            message: rejection.message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Build the application router
pub fn router(state: Arc<SharedState>) -> Router {
    let api = Router::new()
        .route("/connections", post(create_connection_handler))
        .route("/connections/{id}/remote-description", post(remote_description_handler))
        .route("/connections/{id}/additional-candidates", get(additional_candidates_handler))
        .route("/connections/{id}/reconnect", post(reconnect_handler))
        .route("/connections/{id}/close", post(close_handler))
        .route("/connections/{id}/streams", post(streams_handler));

    let prefix = state.config.http.path_prefix.trim_end_matches('/').to_string();
    let app = Router::new().route("/health", get(health_handler));
    let app = if prefix.is_empty() {
        app.merge(api)
    } else {
        app.nest(&prefix, api)
    };

    app.layer(cors_layer(&state.config.http)).with_state(state)
}

fn cors_layer(config: &HttpConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    match config.cors_origin.as_deref() {
        Some(origin) => match HeaderValue::from_str(origin) {
            Ok(value) => layer.allow_origin(value),
            Err(_) => {
                warn!("Invalid CORS origin {:?}, allowing any origin", origin);
                layer.allow_origin(Any)
            }
        },
        None => layer.allow_origin(Any),
    }
}

/// Run the HTTP server until `shutdown` resolves
pub async fn run_http_server(
    state: Arc<SharedState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let prefix = state.config.http.path_prefix.clone();
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("Signaling server listening on http://{}{}", addr, prefix);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("Signaling server stopped");
    Ok(())
}

fn check_id(id: &str) -> Result<(), ApiError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request("Invalid connection id"))
    }
}

/// Health check handler
async fn health_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.uptime().as_secs_f64(),
        "connections": state.connection_count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_connection_handler(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<ConnectionJson>, ApiError> {
    let user_data = match state.authorizer {
        Some(ref authorizer) => {
            let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
            authorizer.authorize(authorization).await?
        }
        None => Value::Null,
    };

    let connection = state.sessions.create_connection(user_data).await?;
    Ok(Json(connection.to_json().await))
}

async fn remote_description_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SessionDescription>, ApiError> {
    check_id(&id)?;
    state.sessions.get_connection(&id)?;

    let text = std::str::from_utf8(&body).map_err(|_| ApiError::bad_request("Body is not valid UTF-8"))?;
    let description = SessionDescription::from_json(text)?;
    let installed = state.sessions.apply_remote_description(&id, description).await?;
    Ok(Json(installed))
}

async fn additional_candidates_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<IceCandidate>>, ApiError> {
    check_id(&id)?;
    Ok(Json(state.sessions.drain_candidates(&id)?))
}

async fn reconnect_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionJson>, ApiError> {
    check_id(&id)?;
    Ok(Json(state.sessions.reconnect(&id).await?))
}

async fn close_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    check_id(&id)?;
    state.sessions.close_connection(&id).await?;
    Ok(StatusCode::OK)
}

async fn streams_handler(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<StreamMap>, ApiError> {
    check_id(&id)?;
    Ok(Json(state.sessions.streams(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::web::auth::BasicAuthorizer;
    use crate::webrtc::mock::{MockBehavior, MockFactory};
    use crate::webrtc::SessionManager;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn app_with(factory: MockFactory, config: Config) -> (Router, Arc<SharedState>) {
        let config = Arc::new(config);
        let (events, _) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionManager::new(&config, Arc::new(factory), events));
        let state = Arc::new(SharedState::new(config, sessions));
        (router(state.clone()), state)
    }

    fn app() -> (Router, Arc<SharedState>) {
        app_with(MockFactory::new(MockBehavior::default()), Config::default())
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &Router) -> Value {
        let response = app.clone().oneshot(post("/rtc/v1/connections", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_create_returns_connection_json() {
        let (app, state) = app();
        let body = create(&app).await;

        assert!(body["id"].is_string());
        assert!(body["userData"].is_null());
        assert_eq!(body["localDescription"]["type"], "offer");
        assert!(body["remoteDescription"].is_null());
        assert_eq!(body["signalingState"], "have-local-offer");
        assert_eq!(body["state"], "negotiating");
        assert_eq!(state.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_signaling_round_trip() {
        let (app, state) = app();
        let id = create(&app).await["id"].as_str().unwrap().to_string();
        let base = format!("/rtc/v1/connections/{}", id);

        let answer = r#"{"type": "answer", "sdp": "v=0\r\ns=answer\r\n"}"#;
        let response = app.clone().oneshot(post(&format!("{}/remote-description", base), answer)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let installed = json_body(response).await;
        assert_eq!(installed["type"], "answer");
        assert_eq!(installed["sdp"], "v=0\r\ns=answer\r\n");

        let response = app.clone().oneshot(get_req(&format!("{}/additional-candidates", base))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!([]));

        let response = app.clone().oneshot(post(&format!("{}/streams", base), "")).await.unwrap();
        assert_eq!(json_body(response).await, json!({"audio": {}, "video": {}}));

        // Not connected yet, so no renegotiation.
        let response = app.clone().oneshot(post(&format!("{}/reconnect", base), "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.clone().oneshot(post(&format!("{}/close", base), "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.connection_count(), 0);

        let response = app.clone().oneshot(post(&format!("{}/close", base), "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (app, _) = app();
        let answer = r#"{"type": "answer", "sdp": "v=0\r\n"}"#;

        let response = app
            .clone()
            .oneshot(post("/rtc/v1/connections/bad-id/remote-description", answer))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(json_body(response).await["error"].as_str().unwrap().contains("bad-id"));

        let response = app
            .oneshot(get_req("/rtc/v1/connections/bad-id/additional-candidates"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_requests_are_bad_requests() {
        let (app, state) = app();
        let id = create(&app).await["id"].as_str().unwrap().to_string();
        let uri = format!("/rtc/v1/connections/{}/remote-description", id);

        for body in ["", "{oops", r#"{"type": "offer", "sdp": "v=0\r\n"}"#, r#"{"type": "answer", "sdp": "x"}"#] {
            let response = app.clone().oneshot(post(&uri, body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {:?}", body);
        }
        assert_eq!(state.connection_count(), 1);

        let long_id = "a".repeat(MAX_ID_LEN + 1);
        let response = app
            .oneshot(post(&format!("/rtc/v1/connections/{}/close", long_id), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_transport_unavailable_is_server_error() {
        let (app, _) = app_with(MockFactory::unsupported(), Config::default());
        let response = app.oneshot(post("/rtc/v1/connections", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_authorizer_gates_creation() {
        let mut config = Config::default();
        config.http.basic_auth_enabled = true;
        config.http.basic_auth_user = "ada".to_string();
        config.http.basic_auth_password = "lovelace".to_string();
        let (app, state) = app_with(MockFactory::new(MockBehavior::default()), config);
        assert!(state.authorizer.is_some());

        let response = app.clone().oneshot(post("/rtc/v1/connections", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let credentials = base64::engine::general_purpose::STANDARD.encode("ada:lovelace");
        let request = Request::builder()
            .method("POST")
            .uri("/rtc/v1/connections")
            .header(header::AUTHORIZATION, format!("Basic {}", credentials))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["userData"], json!({"user": "ada"}));
    }

    #[tokio::test]
    async fn test_custom_authorizer_and_prefix() {
        let mut config = Config::default();
        config.http.path_prefix = "/signal/".to_string();
        let config = Arc::new(config);
        let (events, _) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionManager::new(
            &config,
            Arc::new(MockFactory::new(MockBehavior::default())),
            events,
        ));
        let state = SharedState::new(config, sessions).with_authorizer(Arc::new(BasicAuthorizer::new("u", "p")));
        let app = router(Arc::new(state));

        let response = app.clone().oneshot(post("/signal/connections", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app.oneshot(post("/rtc/v1/connections", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let (app, _) = app();
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/rtc/v1/connections")
            .header(header::ORIGIN, "https://app.example.org")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }
}
