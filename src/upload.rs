//! Upload pipeline: store the multipart `video` field on disk, then probe its
//! duration, render a thumbnail and record the metadata row.
//!
//! Each stage returns a typed error; a failure after the file is on disk
//! removes the video and any thumbnail so no half-processed upload is left
//! behind.

use std::{
    io,
    path::{Path, PathBuf},
};

use axum::extract::multipart::{Field, Multipart, MultipartError};
use chrono::Utc;
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    task,
};
use tracing::{info, warn};

use crate::{
    metadata::{MetadataStore, NewVideo, VideoRecord},
    probe::{MediaTools, ProbeError, thumbnail_timestamp},
};

/// Multipart field carrying the video.
pub const UPLOAD_FIELD: &str = "video";
/// Public URL prefix under which the upload directory is served.
pub const UPLOADS_URL_PREFIX: &str = "uploads";

const MAX_NAME_ATTEMPTS: i64 = 1000;
const MAX_EXTENSION_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No file uploaded.")]
    NoFile,
    #[error("reading upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("processing video: {0}")]
    Probe(#[from] ProbeError),
    #[error("storing metadata: {0:#}")]
    Store(anyhow::Error),
}

/// A video written to the upload directory but not yet processed.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

/// `<unix millis><.ext>`, keeping the client's extension only when it is a
/// short alphanumeric suffix.
pub fn stored_filename(original: Option<&str>, millis: i64) -> String {
    let extension = original
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        });
    match extension {
        Some(ext) => format!("{millis}.{ext}"),
        None => millis.to_string(),
    }
}

/// Relative URL of the thumbnail rendered for `filename`.
pub fn thumbnail_url(filename: &str) -> String {
    format!("{UPLOADS_URL_PREFIX}/thumbnails/{filename}.png")
}

/// Finds the `video` field and streams it to a fresh file in `upload_dir`.
pub async fn receive_upload(
    multipart: &mut Multipart,
    upload_dir: &Path,
) -> Result<StoredUpload, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let original = field.file_name().map(str::to_owned);
        let (filename, path, file) = create_upload_file(upload_dir, original.as_deref()).await?;
        return match write_field(field, file, &path).await {
            Ok(size) => Ok(StoredUpload {
                filename,
                path,
                size,
            }),
            Err(err) => {
                remove_if_present(&path).await;
                Err(err)
            }
        };
    }
    Err(UploadError::NoFile)
}

async fn create_upload_file(
    upload_dir: &Path,
    original: Option<&str>,
) -> Result<(String, PathBuf, File), UploadError> {
    let base = Utc::now().timestamp_millis();
    let mut last_err = None;
    for offset in 0..MAX_NAME_ATTEMPTS {
        let filename = stored_filename(original, base + offset);
        let path = upload_dir.join(&filename);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((filename, path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => last_err = Some(err),
            Err(source) => return Err(UploadError::Io { path, source }),
        }
    }
    Err(UploadError::Io {
        path: upload_dir.to_path_buf(),
        source: last_err.unwrap_or_else(|| io::Error::other("no free upload filename")),
    })
}

async fn write_field(mut field: Field<'_>, mut file: File, path: &Path) -> Result<u64, UploadError> {
    let io_err = |source| UploadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut size = 0u64;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await.map_err(io_err)?;
        size += chunk.len() as u64;
    }
    file.flush().await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    Ok(size)
}

/// Probes the stored video, renders its thumbnail and records it.
pub async fn process_upload(
    tools: &MediaTools,
    store: &MetadataStore,
    thumbnails_dir: &Path,
    upload: StoredUpload,
) -> Result<VideoRecord, UploadError> {
    let thumbnail_path = thumbnails_dir.join(format!("{}.png", upload.filename));

    match run_pipeline(tools, store, thumbnails_dir, &upload, &thumbnail_path).await {
        Ok(record) => {
            info!(
                filename = %record.filename,
                size = record.size,
                duration = ?record.duration,
                "video uploaded"
            );
            Ok(record)
        }
        Err(err) => {
            warn!(filename = %upload.filename, error = %err, "discarding failed upload");
            remove_if_present(&upload.path).await;
            remove_if_present(&thumbnail_path).await;
            Err(err)
        }
    }
}

async fn run_pipeline(
    tools: &MediaTools,
    store: &MetadataStore,
    thumbnails_dir: &Path,
    upload: &StoredUpload,
    thumbnail_path: &Path,
) -> Result<VideoRecord, UploadError> {
    let duration = tools.probe_duration(&upload.path).await?;

    fs::create_dir_all(thumbnails_dir)
        .await
        .map_err(|source| UploadError::Io {
            path: thumbnails_dir.to_path_buf(),
            source,
        })?;
    tools
        .generate_thumbnail(&upload.path, thumbnail_path, thumbnail_timestamp(duration))
        .await?;

    let new_video = NewVideo {
        filename: upload.filename.clone(),
        path: upload.path.clone(),
        size: upload.size,
        duration,
        thumbnail: thumbnail_url(&upload.filename),
    };
    let store = store.clone();
    task::spawn_blocking(move || store.insert_video(&new_video))
        .await
        .map_err(|err| UploadError::Store(anyhow::anyhow!("task join error: {err}")))?
        .map_err(UploadError::Store)
}

async fn remove_if_present(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %err, "failed to remove upload artifact");
    }
}
