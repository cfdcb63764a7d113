//! Route handlers. Each one resolves the session, delegates, and shapes JSON.

use super::error::ApiError;
use super::AppState;
use crate::session::{ConnectOutcome, Session};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::Json;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    client_id: String,
}

#[derive(Deserialize)]
pub struct SendTextRequest {
    #[serde(default)]
    to: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
pub struct SendImageRequest {
    #[serde(default)]
    to: String,
    /// Base64-encoded image bytes.
    #[serde(default)]
    image: String,
    #[serde(default)]
    caption: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Deserialize)]
pub struct SendDocumentRequest {
    #[serde(default)]
    to: String,
    /// Base64-encoded document bytes.
    #[serde(default)]
    document: String,
    #[serde(default, alias = "file_name")]
    filename: String,
    #[serde(default)]
    caption: String,
    #[serde(default)]
    mime_type: Option<String>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|_| ApiError::bad_request("invalid request body"))
}

async fn lookup(state: &AppState, session_id: &str) -> Result<Arc<Session>, ApiError> {
    state
        .manager
        .get_session(session_id)
        .await
        .ok_or_else(ApiError::session_not_found)
}

async fn connected(state: &AppState, session_id: &str) -> Result<Arc<Session>, ApiError> {
    let session = lookup(state, session_id).await?;
    if !session.is_connected() {
        return Err(ApiError::bad_request("session not connected"));
    }
    Ok(session)
}

fn decode_media(encoded: &str, what: &str) -> Result<Vec<u8>, ApiError> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| ApiError::bad_request(format!("{what} is not valid base64")))?;
    if data.is_empty() {
        return Err(ApiError::bad_request(format!("{what} data is empty")));
    }
    Ok(data)
}

/// Best-effort content type from magic bytes.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(&[0xff, 0xd8, 0xff]) {
        "image/jpeg"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else if data.starts_with(b"%PDF-") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

fn resolve_mime(given: Option<String>, data: &[u8]) -> String {
    given
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| sniff_mime(data).to_string())
}

/// A media send after the body has been read, in either encoding.
#[derive(Default)]
struct MediaUpload {
    to: String,
    caption: String,
    filename: String,
    mime_type: Option<String>,
    data: Vec<u8>,
}

impl MediaUpload {
    fn validate(&self, what: &str) -> Result<(), ApiError> {
        if self.to.trim().is_empty() {
            return Err(ApiError::bad_request("to is required"));
        }
        if self.data.is_empty() {
            return Err(ApiError::bad_request(format!("{what} data is empty")));
        }
        Ok(())
    }
}

fn is_multipart(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

/// Read a form upload. The file part named `file_field` supplies the bytes,
/// its content type and, when no `filename` field is sent, its file name.
async fn read_form(
    req: Request,
    state: &AppState,
    file_field: &str,
) -> Result<MediaUpload, ApiError> {
    let invalid = |_| ApiError::bad_request("invalid multipart body");
    let mut form = Multipart::from_request(req, state)
        .await
        .map_err(|_| ApiError::bad_request("invalid multipart body"))?;

    let mut upload = MediaUpload::default();
    let mut part_name = None;
    while let Some(field) = form.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == file_field {
            upload.mime_type = field.content_type().map(str::to_string);
            part_name = field.file_name().map(str::to_string);
            upload.data = field.bytes().await.map_err(invalid)?.to_vec();
            continue;
        }
        match name.as_str() {
            "to" => upload.to = field.text().await.map_err(invalid)?,
            "caption" => upload.caption = field.text().await.map_err(invalid)?,
            "filename" | "file_name" => upload.filename = field.text().await.map_err(invalid)?,
            "mime_type" if upload.mime_type.is_none() => {
                upload.mime_type = Some(field.text().await.map_err(invalid)?);
            }
            _ => {}
        }
    }

    if upload.filename.is_empty() {
        upload.filename = part_name.unwrap_or_default();
    }
    Ok(upload)
}

fn sent(message_id: String) -> Json<Value> {
    Json(json!({ "status": "sent", "message_id": message_id }))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "time": chrono::Utc::now().timestamp() }))
}

pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    if req.client_id.trim().is_empty() {
        return Err(ApiError::bad_request("client_id is required"));
    }
    let session = state.manager.create_session(&req.client_id).await?;
    Ok(Json(json!({
        "session_id": session.id(),
        "client_id": session.client_id(),
        "status": "created",
    })))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.manager.list_sessions().await;
    Json(json!({ "total": sessions.len(), "sessions": sessions }))
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = lookup(&state, &id).await?;
    Ok(Json(json!({
        "session_id": session.id(),
        "client_id": session.client_id(),
        "connected": session.is_connected(),
        "phone_number": session.phone_number(),
    })))
}

pub async fn connect_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = lookup(&state, &id).await?;
    if session.is_connected() {
        return Ok(Json(json!({
            "status": "already_connected",
            "phone_number": session.phone_number(),
        })));
    }

    session.connect().await?;

    let reply = match session.wait_for_connection_or_qr(state.connect_wait).await {
        ConnectOutcome::QrReady(qr_code) => json!({ "status": "qr_ready", "qr_code": qr_code }),
        ConnectOutcome::Connected(phone) => json!({ "status": "connected", "phone_number": phone }),
        ConnectOutcome::Pending if session.is_connected() => json!({
            "status": "connected",
            "phone_number": session.phone_number(),
        }),
        ConnectOutcome::Pending => json!({
            "status": "connecting",
            "message": "connection in progress, check webhook for updates",
        }),
    };
    Ok(Json(reply))
}

pub async fn get_qr(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = lookup(&state, &id).await?;
    if session.is_connected() {
        return Ok(Json(json!({
            "status": "already_connected",
            "phone_number": session.phone_number(),
        })));
    }

    match session.wait_for_qr(state.qr_wait).await {
        Some(qr_code) => Ok(Json(json!({ "status": "qr_ready", "qr_code": qr_code }))),
        None => Err(ApiError::new(StatusCode::REQUEST_TIMEOUT, "qr code timeout")),
    }
}

pub async fn disconnect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let session = lookup(&state, &id).await?;
    if let Err(e) = session.disconnect().await {
        warn!(session_id = %id, error = %e, "disconnect request failed");
    }
    Ok(Json(json!({ "status": "disconnected" })))
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.manager.delete_session(&id).await {
        Ok(()) => {
            info!(session_id = %id, "session deleted via api");
            Ok(Json(json!({ "status": "deleted" })))
        }
        Err(wamux_core::GatewayError::NotFound(_)) => Err(ApiError::session_not_found()),
        Err(e) => Err(e.into()),
    }
}

pub async fn send_text(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<SendTextRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    if req.to.trim().is_empty() || req.text.is_empty() {
        return Err(ApiError::bad_request("to and text are required"));
    }
    let session = connected(&state, &id).await?;
    let message_id = session.send_text(&req.to, &req.text).await?;
    Ok(sent(message_id))
}

/// Accepts a multipart upload with an `image` part, or JSON with base64 data.
pub async fn send_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult {
    let session = connected(&state, &id).await?;
    let upload = if is_multipart(&req) {
        read_form(req, &state, "image").await?
    } else {
        let req = body(Json::<SendImageRequest>::from_request(req, &state).await)?;
        if req.to.trim().is_empty() {
            return Err(ApiError::bad_request("to is required"));
        }
        MediaUpload {
            data: decode_media(&req.image, "image")?,
            to: req.to,
            caption: req.caption,
            filename: String::new(),
            mime_type: req.mime_type,
        }
    };
    upload.validate("image")?;
    let mime = resolve_mime(upload.mime_type, &upload.data);

    let message_id = session
        .send_image(&upload.to, upload.data, &upload.caption, &mime)
        .await?;
    Ok(sent(message_id))
}

/// Accepts a multipart upload with a `document` part, or JSON with base64 data.
pub async fn send_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> ApiResult {
    let session = connected(&state, &id).await?;
    let upload = if is_multipart(&req) {
        read_form(req, &state, "document").await?
    } else {
        let req = body(Json::<SendDocumentRequest>::from_request(req, &state).await)?;
        if req.to.trim().is_empty() {
            return Err(ApiError::bad_request("to is required"));
        }
        MediaUpload {
            data: decode_media(&req.document, "document")?,
            to: req.to,
            caption: req.caption,
            filename: req.filename,
            mime_type: req.mime_type,
        }
    };
    upload.validate("document")?;
    let mime = resolve_mime(upload.mime_type, &upload.data);

    let message_id = session
        .send_document(&upload.to, upload.data, &upload.filename, &upload.caption, &mime)
        .await?;
    Ok(sent(message_id))
}
