//! HTTP surface of the backend.
//!
//! `/video/{filename}` is the range-aware byte server. Upload, listing and
//! like endpoints sit next to it and share one [`AppState`]. Every piece of
//! state is passed in explicitly so tests can point the server at a
//! temporary directory.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{debug, error, warn};

use crate::{
    config::ServerConfig,
    media::{MediaError, MediaResolver},
    metadata::{MetadataStore, VideoRecord},
    probe::MediaTools,
    range::{RangeError, parse_range},
    upload::{UploadError, process_upload, receive_upload},
};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    headers: HeaderMap,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        if let Ok(value) = HeaderValue::from_str(&value.into()) {
            self.headers.insert(name, value);
        }
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.message).into_response()
    }
}

impl From<RangeError> for ApiError {
    fn from(err: RangeError) -> Self {
        match err {
            RangeError::Malformed(_) => Self::bad_request(err.to_string()),
            RangeError::NotSatisfiable { total, .. } => {
                Self::new(StatusCode::RANGE_NOT_SATISFIABLE, err.to_string())
                    .with_header(header::CONTENT_RANGE, format!("bytes */{total}"))
            }
        }
    }
}

impl From<MediaError> for ApiError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::NotFound => Self::not_found(err.to_string()),
            MediaError::Io { .. } => {
                error!(error = %err, "failed to open video");
                Self::internal("Error reading video.")
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NoFile => Self::bad_request(err.to_string()),
            UploadError::Multipart(err) => {
                warn!(error = %err, "rejected upload body");
                Self::new(err.status(), err.body_text())
            }
            other => {
                error!(error = %other, "upload failed");
                Self::internal("Error processing video.")
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Shared handles for every request.
#[derive(Clone)]
pub struct AppState {
    store: MetadataStore,
    resolver: MediaResolver,
    tools: MediaTools,
    thumbnails_dir: PathBuf,
    cache: Arc<ApiCache>,
}

impl AppState {
    pub fn new(
        store: MetadataStore,
        resolver: MediaResolver,
        tools: MediaTools,
        thumbnails_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            resolver,
            tools,
            thumbnails_dir,
            cache: Arc::new(ApiCache::default()),
        }
    }

    /// Opens the metadata store and wires the resolver to the upload root.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let store = MetadataStore::open(&config.database_path)?;
        let resolver = MediaResolver::new(&config.upload_dir)
            .with_content_type_policy(config.content_type_policy);
        Ok(Self::new(
            store,
            resolver,
            config.media_tools.clone(),
            config.thumbnails_dir(),
        ))
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    async fn get_videos(&self) -> ApiResult<Vec<VideoRecord>> {
        if let Some(cached) = self.cache.videos.read().clone() {
            return Ok(cached);
        }

        let generation = self.cache.generation.load(Ordering::Acquire);
        let store = self.store.clone();
        let records = task::spawn_blocking(move || store.list_videos())
            .await
            .map_err(|err| {
                error!(error = %err, "listing task failed");
                ApiError::internal("Error fetching videos")
            })?
            .map_err(|err| {
                error!(error = %format!("{err:#}"), "listing videos failed");
                ApiError::internal("Error fetching videos")
            })?;

        let mut cached = self.cache.videos.write();
        if self.cache.generation.load(Ordering::Acquire) == generation {
            cached.replace(records.clone());
        }
        Ok(records)
    }

    async fn add_like(&self, id: i64) -> ApiResult<i64> {
        let store = self.store.clone();
        let likes = task::spawn_blocking(move || store.increment_likes(id))
            .await
            .map_err(|err| {
                error!(error = %err, "like task failed");
                ApiError::internal("Error updating likes")
            })?
            .map_err(|err| {
                error!(video = id, error = %format!("{err:#}"), "updating likes failed");
                ApiError::internal("Error updating likes")
            })?
            .ok_or_else(|| ApiError::not_found("Video not found."))?;

        self.cache.invalidate();
        Ok(likes)
    }
}

/// Listing cache. Writers bump `generation` so a listing that raced with a
/// write never repopulates the cache with stale rows.
#[derive(Default)]
struct ApiCache {
    videos: RwLock<Option<Vec<VideoRecord>>>,
    generation: AtomicU64,
}

impl ApiCache {
    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.videos.write().take();
    }
}

pub fn router(state: AppState, max_upload_bytes: u64) -> Router {
    let upload_limit = usize::try_from(max_upload_bytes).unwrap_or(usize::MAX);
    let thumbnails = ServeDir::new(&state.thumbnails_dir);

    Router::new()
        .route("/video/{filename}", get(stream_video))
        // Same parameter name as the streaming route; the router requires it.
        .route("/video/{filename}/like", post(like_video))
        .route("/videos", get(list_videos))
        .route(
            "/upload",
            post(upload_video).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .nest_service("/uploads/thumbnails", thumbnails)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn stream_video(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let range = headers
        .get(header::RANGE)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::bad_request("malformed range header: not ASCII"))
        })
        .transpose()?;
    serve_media(&state.resolver, &filename, range).await
}

/// Answers one byte-serving request: 200 with the whole file when
/// `range_header` is absent, 206 with exactly the requested slice otherwise.
pub async fn serve_media(
    resolver: &MediaResolver,
    filename: &str,
    range_header: Option<&str>,
) -> ApiResult<Response> {
    let media = resolver.open(filename).await?;
    let range = range_header
        .map(|raw| parse_range(raw, media.size()))
        .transpose()
        .inspect_err(|err| debug!(filename, error = %err, "rejected range request"))?;

    let (status, length) = match range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range.len()),
        None => (StatusCode::OK, media.size()),
    };
    debug!(
        filename,
        path = %media.path().display(),
        status = status.as_u16(),
        range = ?range.map(|range| (range.start, range.end)),
        length,
        "serving video"
    );

    let content_type = media.content_type().to_string();
    let body = media.into_body(range).await?;

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(range) = range {
        builder = builder.header(header::CONTENT_RANGE, range.content_range());
    }
    builder.body(body).map_err(|err| {
        error!(error = %err, "building video response");
        ApiError::internal("Error reading video.")
    })
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoRecord>>> {
    let videos = state.get_videos().await?;
    Ok(Json(videos))
}

#[derive(Debug, Serialize)]
struct LikesPayload {
    likes: i64,
}

async fn like_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<LikesPayload>> {
    let id: i64 = id
        .parse()
        .map_err(|_| ApiError::not_found("Video not found."))?;
    let likes = state.add_like(id).await?;
    Ok(Json(LikesPayload { likes }))
}

async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<VideoRecord>> {
    let upload = receive_upload(&mut multipart, state.resolver.root()).await?;
    let record = process_upload(&state.tools, &state.store, &state.thumbnails_dir, upload).await?;
    state.cache.invalidate();
    Ok(Json(record))
}
