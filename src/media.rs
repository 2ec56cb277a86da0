//! Resolution of stored media files and range-scoped streaming of their bytes.

use std::{
    io::{self, SeekFrom},
    path::{Component, Path, PathBuf},
};

use axum::body::Body;
use futures::{TryStreamExt, stream};
use mime_guess::MimeGuess;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tracing::error;

use crate::range::ByteRange;

/// Declared type for every video under [`ContentTypePolicy::Fixed`].
pub const VIDEO_CONTENT_TYPE: &str = "video/mp4";

/// How the `Content-Type` of a served video is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentTypePolicy {
    /// Always `video/mp4`, whatever the container.
    #[default]
    Fixed,
    /// Guessed from the file extension, falling back to `video/mp4`.
    ByExtension,
}

impl ContentTypePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" | "mp4" => Some(Self::Fixed),
            "extension" | "guess" => Some(Self::ByExtension),
            _ => None,
        }
    }

    fn content_type_for(self, path: &Path) -> String {
        match self {
            Self::Fixed => VIDEO_CONTENT_TYPE.to_string(),
            Self::ByExtension => MimeGuess::from_path(path)
                .first()
                .map(|mime| mime.essence_str().to_string())
                .unwrap_or_else(|| VIDEO_CONTENT_TYPE.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Video not found.")]
    NotFound,
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Maps client-supplied filenames onto files directly under the storage root.
#[derive(Debug, Clone)]
pub struct MediaResolver {
    root: PathBuf,
    policy: ContentTypePolicy,
}

impl MediaResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            policy: ContentTypePolicy::default(),
        }
    }

    pub fn with_content_type_policy(mut self, policy: ContentTypePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Only a single plain path component is accepted, so `..`, absolute
    /// paths and nested directories (including `thumbnails/`) never resolve.
    pub fn path_for(&self, filename: &str) -> Result<PathBuf, MediaError> {
        let candidate = Path::new(filename);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(candidate)),
            _ => Err(MediaError::NotFound),
        }
    }

    /// Opens the named file and records its size. The returned handle is
    /// owned by the caller and closed when dropped.
    pub async fn open(&self, filename: &str) -> Result<MediaFile, MediaError> {
        let path = self.path_for(filename)?;
        let file = File::open(&path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => MediaError::NotFound,
            _ => MediaError::Io {
                path: path.clone(),
                source: err,
            },
        })?;
        let metadata = file.metadata().await.map_err(|source| MediaError::Io {
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(MediaError::NotFound);
        }

        Ok(MediaFile {
            content_type: self.policy.content_type_for(&path),
            path,
            file,
            size: metadata.len(),
        })
    }
}

/// An open, read-only handle on a stored video.
#[derive(Debug)]
pub struct MediaFile {
    path: PathBuf,
    file: File,
    size: u64,
    content_type: String,
}

impl MediaFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Turns the handle into a streaming response body covering `range`, or
    /// the whole file when no range is given.
    ///
    /// Bytes are read lazily in chunks. Dropping the body (for instance when
    /// the client disconnects) drops the file handle with it. A read error
    /// after streaming started, or a file that ends before `range` does, is
    /// logged and ends the stream with an error.
    pub async fn into_body(self, range: Option<ByteRange>) -> Result<Body, MediaError> {
        let Self {
            path,
            mut file,
            size,
            ..
        } = self;

        let (offset, length) = match range {
            Some(range) => (range.start, range.len()),
            None => (0, size),
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|source| MediaError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        let reader = ReaderStream::new(file.take(length));
        let stream = stream::try_unfold((reader, 0u64), move |(mut reader, sent)| async move {
            match reader.try_next().await? {
                Some(chunk) => {
                    let sent = sent + chunk.len() as u64;
                    Ok(Some((chunk, (reader, sent))))
                }
                // The file shrank after it was opened.
                None if sent < length => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file ended after {sent} of {length} bytes"),
                )),
                None => Ok(None),
            }
        })
        .inspect_err(move |err| {
            error!(path = %path.display(), error = %err, "media read failed mid-stream");
        });
        Ok(Body::from_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::parse_range;
    use axum::body::to_bytes;
    use tempfile::tempdir;

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 251) as u8).collect()
    }

    #[test]
    fn path_for_rejects_traversal_and_nesting() {
        let resolver = MediaResolver::new("/srv/uploads");
        assert_eq!(
            resolver.path_for("123.mp4").unwrap(),
            PathBuf::from("/srv/uploads/123.mp4")
        );
        for bad in ["../secret", "/etc/passwd", "thumbnails/a.png", "", ".", ".."] {
            assert!(
                matches!(resolver.path_for(bad), Err(MediaError::NotFound)),
                "{bad} should not resolve"
            );
        }
    }

    #[tokio::test]
    async fn content_type_policy_controls_declared_type() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("clip.webm"), b"webm").unwrap();

        let fixed = MediaResolver::new(dir.path());
        assert_eq!(
            fixed.open("clip.webm").await.unwrap().content_type(),
            "video/mp4"
        );

        let guessed =
            MediaResolver::new(dir.path()).with_content_type_policy(ContentTypePolicy::ByExtension);
        assert_eq!(
            guessed.open("clip.webm").await.unwrap().content_type(),
            "video/webm"
        );
    }

    #[test]
    fn content_type_policy_parses_config_values() {
        assert_eq!(ContentTypePolicy::parse("Fixed"), Some(ContentTypePolicy::Fixed));
        assert_eq!(
            ContentTypePolicy::parse("extension"),
            Some(ContentTypePolicy::ByExtension)
        );
        assert_eq!(ContentTypePolicy::parse("sniff"), None);
    }

    #[tokio::test]
    async fn open_reports_missing_files_and_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("folder")).unwrap();
        let resolver = MediaResolver::new(dir.path());

        assert!(matches!(
            resolver.open("ghost.mp4").await,
            Err(MediaError::NotFound)
        ));
        assert!(matches!(
            resolver.open("folder").await,
            Err(MediaError::NotFound)
        ));
    }

    #[tokio::test]
    async fn full_body_returns_every_byte() {
        let dir = tempdir().unwrap();
        let bytes = sample_bytes(1000);
        std::fs::write(dir.path().join("clip.mp4"), &bytes).unwrap();
        let resolver = MediaResolver::new(dir.path());

        let media = resolver.open("clip.mp4").await.unwrap();
        assert_eq!(media.size(), 1000);
        assert_eq!(media.content_type(), "video/mp4");
        let body = media.into_body(None).await.unwrap();
        let collected = to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(collected.as_ref(), bytes.as_slice());
    }

    /// Open descriptors of this process that point at `path`.
    #[cfg(target_os = "linux")]
    fn open_handles(path: &Path) -> usize {
        let target = std::fs::canonicalize(path).unwrap();
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| std::fs::read_link(entry.path()).ok())
            .filter(|link| *link == target)
            .count()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_body_mid_stream_releases_the_file() {
        use futures::StreamExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let bytes = sample_bytes(4 * 1024 * 1024);
        std::fs::write(&path, &bytes).unwrap();
        let resolver = MediaResolver::new(dir.path());

        let media = resolver.open("clip.mp4").await.unwrap();
        let mut chunks = media.into_body(None).await.unwrap().into_data_stream();
        let first = chunks.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        assert!(first.len() < bytes.len(), "body should be read lazily");
        assert_eq!(first.as_ref(), &bytes[..first.len()]);
        assert_eq!(open_handles(&path), 1);

        drop(chunks);
        for _ in 0..50 {
            if open_handles(&path) == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(open_handles(&path), 0);
    }

    #[tokio::test]
    async fn file_truncated_after_open_ends_stream_with_error() {
        use futures::StreamExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let bytes = sample_bytes(200_000);
        std::fs::write(&path, &bytes).unwrap();
        let resolver = MediaResolver::new(dir.path());

        let media = resolver.open("clip.mp4").await.unwrap();
        assert_eq!(media.size(), 200_000);
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(1000)
            .unwrap();

        let mut chunks = media.into_body(None).await.unwrap().into_data_stream();
        let mut received = Vec::new();
        let mut failed = false;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => received.extend_from_slice(&chunk),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed, "a short file must not end the body cleanly");
        assert_eq!(received, &bytes[..1000]);
    }

    #[tokio::test]
    async fn ranged_body_matches_file_slice() {
        let dir = tempdir().unwrap();
        let bytes = sample_bytes(200_000);
        std::fs::write(dir.path().join("clip.mp4"), &bytes).unwrap();
        let resolver = MediaResolver::new(dir.path());

        for (start, end) in [(0u64, 0u64), (1, 65_536), (70_000, 199_999), (199_999, 199_999)] {
            let media = resolver.open("clip.mp4").await.unwrap();
            let range = parse_range(&format!("bytes={start}-{end}"), media.size()).unwrap();
            let body = media.into_body(Some(range)).await.unwrap();
            let collected = to_bytes(body, usize::MAX).await.unwrap();
            assert_eq!(collected.len() as u64, end - start + 1);
            assert_eq!(
                collected.as_ref(),
                &bytes[start as usize..=end as usize],
                "slice {start}-{end}"
            );
        }
    }
}
