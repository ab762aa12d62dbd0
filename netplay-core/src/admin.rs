//! Administrative HTTP surface.
//!
//! Routes:
//! - `POST   /token`            issue a bearer token (`X-Api-Key`)
//! - `GET    /rooms?q=`         list or search rooms (public)
//! - `GET    /rooms/{id}`       one room's public summary (public)
//! - `POST   /rooms`            create a room (admin)
//! - `DELETE /rooms/{id}`       delete a room (admin + bearer)
//! - `POST   /rooms/{id}/join`  availability probe (admin + bearer)
//!
//! Admin calls present `X-Admin-Key`; bearer tokens travel in
//! `Authorization: Bearer <token>`. Errors are JSON `{"error": reason}`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::auth::{bearer_token, check_credential, TokenIssuer};
use crate::error::RoomError;
use crate::protocol::{JoinOptions, MemberInfo, RoomOptions, RoomSummary};
use crate::registry::RoomRegistry;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<RoomRegistry>,
    pub tokens: Arc<TokenIssuer>,
    pub api_key: Option<String>,
    pub admin_key: Option<String>,
}

impl AdminState {
    fn require_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let presented = headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok());
        check_credential(self.admin_key.as_deref(), presented).map_err(|e| {
            warn!("admin call rejected: {}", e);
            ApiError::from(RoomError::Unauthorized)
        })
    }

    fn require_bearer(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or(ApiError::from(RoomError::Unauthorized))?;
        self.tokens.verify(token).map(|_| ()).map_err(|e| {
            warn!("bearer token rejected: {}", e);
            ApiError::from(RoomError::Unauthorized)
        })
    }
}

/// JSON error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub reason: &'static str,
}

impl From<RoomError> for ApiError {
    fn from(err: RoomError) -> Self {
        let status = match err {
            RoomError::Unauthorized => StatusCode::UNAUTHORIZED,
            RoomError::NoRoom | RoomError::RoomNotFound => StatusCode::NOT_FOUND,
            RoomError::AlreadyExists => StatusCode::CONFLICT,
            RoomError::SnapshotTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            reason: err.reason(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.reason }))).into_response()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub room_id: String,
    #[serde(flatten)]
    pub options: RoomOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/token", post(issue_token))
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/{id}", get(get_room).delete(delete_room))
        .route("/rooms/{id}/join", post(probe_join))
        .with_state(state)
}

/// Serve the admin router until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AdminState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Admin API listening on {}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

pub async fn issue_token(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, ApiError> {
    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    check_credential(state.api_key.as_deref(), presented)
        .map_err(|_| ApiError::from(RoomError::Unauthorized))?;
    let token = state
        .tokens
        .issue()
        .map_err(|_| ApiError::from(RoomError::Unauthorized))?;
    Ok(Json(TokenResponse { token }))
}

pub async fn list_rooms(
    State(state): State<AdminState>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<RoomSummary>> {
    let rooms = match params.q.as_deref() {
        Some(q) if !q.is_empty() => state.registry.search(q).await,
        _ => state.registry.list_rooms().await,
    };
    Json(rooms)
}

pub async fn get_room(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<RoomSummary>, ApiError> {
    state
        .registry
        .summary(&id)
        .await
        .map(Json)
        .ok_or(ApiError::from(RoomError::RoomNotFound))
}

pub async fn create_room(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.require_admin(&headers)?;
    state.registry.create_room(&body.room_id, body.options).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn delete_room(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    state.require_admin(&headers)?;
    state.require_bearer(&headers)?;
    state.registry.delete_room(&id).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn probe_join(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<JoinOptions>,
) -> Result<Json<MemberInfo>, ApiError> {
    state.require_admin(&headers)?;
    state.require_bearer(&headers)?;
    let member = state.registry.probe_join(&id, &body).await?;
    Ok(Json(member))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn state() -> AdminState {
        AdminState {
            registry: RoomRegistry::new(RegistryConfig::default()),
            tokens: Arc::new(TokenIssuer::new(Some("api"), Duration::from_secs(60))),
            api_key: Some("api".into()),
            admin_key: Some("admin".into()),
        }
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ApiError::from(RoomError::Unauthorized).status, StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::from(RoomError::RoomNotFound).status, StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(RoomError::BadPassword).status, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(RoomError::BadPassword).reason, "bad-password");
    }

    #[tokio::test]
    async fn test_admin_header_required() {
        let state = state();
        let mut headers = HeaderMap::new();
        assert!(state.require_admin(&headers).is_err());
        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("admin"));
        assert!(state.require_admin(&headers).is_ok());
    }

    #[tokio::test]
    async fn test_bearer_required() {
        let state = state();
        let token = state.tokens.issue().unwrap();
        let mut headers = HeaderMap::new();
        assert!(state.require_bearer(&headers).is_err());
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert!(state.require_bearer(&headers).is_ok());
    }
}
