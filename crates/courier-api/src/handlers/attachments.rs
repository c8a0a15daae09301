//! Attachment API handlers.
//!
//! Upload flow: `POST /sessions` declares a message's files, chunks arrive
//! at `POST /uploads/{id}`, `POST /uploads/{id}/finalize` seals the bytes
//! and hands off to background processing. Downloads accept a capability
//! token or an authenticated participant session, and support single byte
//! ranges.

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use courier_attachments::{
    AttachmentError, CreateSessionsRequest, DownloadStream, TokenError, UploadChunkProgress,
};
use courier_core::types::Id;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::{ApiError, ApiResult};
use crate::extractors::{AppState, AuthenticatedUser};

/// POST /api/v1/attachments/sessions
pub async fn create_sessions(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<CreateSessionsRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = state.service.create_sessions(user_id, request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkParams {
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default = "default_total_chunks")]
    pub total_chunks: u32,
}

fn default_total_chunks() -> u32 {
    1
}

/// POST /api/v1/attachments/uploads/{upload_id}
///
/// Multipart with a single `chunk` (or `file`) part. Unchunked clients
/// omit the query parameters and send everything as chunk 0 of 1.
pub async fn upload_chunk(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(upload_id): Path<String>,
    Query(params): Query<ChunkParams>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadChunkProgress>> {
    let mut data = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("chunk") | Some("file") => {
                data = Some(field.bytes().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed to read chunk body: {e}"))
                })?);
            }
            _ => continue,
        }
    }
    let data = data.ok_or_else(|| ApiError::bad_request("Missing 'chunk' part"))?;
    if data.is_empty() {
        return Err(ApiError::bad_request("Chunk body is empty"));
    }

    let progress = state
        .service
        .upload_chunk(user_id, &upload_id, params.chunk_index, params.total_chunks, &data)
        .await?;
    Ok(Json(progress))
}

/// POST /api/v1/attachments/uploads/{upload_id}/finalize
///
/// Integrity checks run inline; scanning and thumbnailing are dispatched
/// to a background task, so the returned attachment is still UPLOADING.
pub async fn finalize_upload(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let attachment = state.service.finalize(user_id, &upload_id).await?;
    if let Some(id) = attachment.id {
        let service = state.service.clone();
        tokio::spawn(async move {
            if let Err(err) = service.process(id).await {
                tracing::error!(attachment_id = id, error = %err, "Post-processing failed");
            }
        });
    }
    let view = state.service.render_view(&attachment, user_id)?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

/// DELETE /api/v1/attachments/uploads/{upload_id}
pub async fn cancel_upload(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.cancel(user_id, &upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/attachments/{id}/meta
pub async fn get_metadata(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Id>,
) -> ApiResult<impl IntoResponse> {
    let view = state.service.view(user_id, id).await?;
    Ok(Json(view))
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// GET /api/v1/attachments/{id}?token=...
///
/// Either a capability token or an authenticated participant session
/// grants access; a bare request gets 401.
pub async fn download(
    State(state): State<AppState>,
    user: Option<AuthenticatedUser>,
    Path(id): Path<Id>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let stream = match (query.token.as_deref(), user) {
        (Some(token), _) => {
            let stream = state.service.open_download(token).await?;
            if stream.attachment_id != id {
                return Err(AttachmentError::NotFound.into());
            }
            stream
        }
        (None, Some(AuthenticatedUser(user_id))) => {
            state.service.open_download_for(user_id, id).await?
        }
        (None, None) => return Err(AttachmentError::Token(TokenError::Invalid).into()),
    };
    serve_blob(stream, headers.get(header::RANGE)).await
}

/// GET /api/v1/attachments/{id}/thumbnail?token=...
pub async fn download_thumbnail(
    State(state): State<AppState>,
    user: Option<AuthenticatedUser>,
    Path(id): Path<Id>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Response> {
    let stream = match (query.token.as_deref(), user) {
        (Some(token), _) => {
            let stream = state.service.open_thumbnail(token).await?;
            if stream.attachment_id != id {
                return Err(AttachmentError::NotFound.into());
            }
            stream
        }
        (None, Some(AuthenticatedUser(user_id))) => {
            state.service.open_thumbnail_for(user_id, id).await?
        }
        (None, None) => return Err(AttachmentError::Token(TokenError::Invalid).into()),
    };
    serve_blob(stream, None).await
}

async fn serve_blob(
    stream: DownloadStream,
    range: Option<&header::HeaderValue>,
) -> ApiResult<Response> {
    let DownloadStream {
        mut file,
        size_bytes,
        mime_type,
        file_name,
        ..
    } = stream;

    let disposition = match &file_name {
        Some(name) => format!("inline; filename=\"{}\"", name.replace('"', "_")),
        None => "inline".to_string(),
    };

    let range = match range.map(|value| parse_range(value, size_bytes)) {
        None => None,
        Some(Some(parsed)) => Some(parsed),
        Some(None) => return Err(ApiError::RangeNotSatisfiable { size_bytes }),
    };

    let response = match range {
        Some((start, end)) => {
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::Attachment(AttachmentError::Storage(e.into())))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, mime_type)
                .header(header::CONTENT_LENGTH, length)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size_bytes}"))
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_DISPOSITION, disposition)
                .body(body)
        }
        None => {
            let body = Body::from_stream(ReaderStream::new(file));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime_type)
                .header(header::CONTENT_LENGTH, size_bytes)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_DISPOSITION, disposition)
                .body(body)
        }
    };

    response.map_err(|e| ApiError::bad_request(format!("Response build failed: {e}")))
}

/// Parse a single `bytes=` range against a known size. Multi-range
/// requests and anything malformed or out of bounds return `None`.
fn parse_range(value: &header::HeaderValue, size_bytes: u64) -> Option<(u64, u64)> {
    if size_bytes == 0 {
        return None;
    }
    let raw = value.to_str().ok()?.strip_prefix("bytes=")?;
    if raw.contains(',') {
        return None;
    }
    let (start_raw, end_raw) = raw.split_once('-')?;

    if start_raw.is_empty() {
        // suffix form: last N bytes
        let suffix: u64 = end_raw.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        let start = size_bytes.saturating_sub(suffix);
        return Some((start, size_bytes - 1));
    }

    let start: u64 = start_raw.parse().ok()?;
    let end = if end_raw.is_empty() {
        size_bytes - 1
    } else {
        end_raw.parse::<u64>().ok()?.min(size_bytes - 1)
    };
    if start > end || start >= size_bytes {
        return None;
    }
    Some((start, end))
}
