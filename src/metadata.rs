//! Metadata persistence for uploaded videos.
//!
//! Each upload becomes one row in the `videos` table. The serialized field
//! names (`_id`, `uploadedAt`) match what the web front end already reads, so
//! the JSON shape stays stable even though the storage is SQLite.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A stored video as exposed by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    #[serde(rename = "_id")]
    pub id: i64,
    pub filename: String,
    pub path: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub thumbnail: String,
    pub likes: i64,
    #[serde(rename = "uploadedAt")]
    pub uploaded_at: DateTime<Utc>,
}

/// Everything the upload pipeline knows about a video before it is stored.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub duration: Option<f64>,
    pub thumbnail: String,
}

/// Handle on the SQLite database. Cheap to clone; every call opens its own
/// short-lived connection so it can be used from any blocking task.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    db_path: PathBuf,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the database and its schema. WAL mode
    /// keeps listing queries from blocking while a like or upload is written.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating metadata directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening metadata DB {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for metadata DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting metadata DB synchronous mode")?;
        ensure_tables(&mut conn)?;

        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening metadata DB {}", self.db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        f(&conn)
    }

    /// Stores a freshly uploaded video with zero likes and returns the row.
    pub fn insert_video(&self, video: &NewVideo) -> Result<VideoRecord> {
        let size = i64::try_from(video.size).context("video size does not fit in the database")?;
        let path = video.path.to_string_lossy().into_owned();
        let uploaded_at = Utc::now();

        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO videos (filename, path, size, duration, thumbnail, likes, uploaded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                "#,
                params![
                    video.filename,
                    path,
                    size,
                    video.duration,
                    video.thumbnail,
                    uploaded_at,
                ],
            )
            .with_context(|| format!("inserting metadata for {}", video.filename))?;

            Ok(VideoRecord {
                id: conn.last_insert_rowid(),
                filename: video.filename.clone(),
                path,
                size,
                duration: video.duration,
                thumbnail: video.thumbnail.clone(),
                likes: 0,
                uploaded_at,
            })
        })
    }

    /// All videos, most recent upload first.
    pub fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, filename, path, size, duration, thumbnail, likes, uploaded_at
                FROM videos
                ORDER BY uploaded_at DESC, id DESC
                "#,
            )?;

            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_video_record(row)?);
            }
            Ok(records)
        })
    }

    #[cfg(test)]
    fn get_video(&self, id: i64) -> Result<Option<VideoRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, filename, path, size, duration, thumbnail, likes, uploaded_at
                FROM videos
                WHERE id = ?1
                "#,
            )?;

            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_video_record(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Adds one like in a single statement and returns the new count, or
    /// `None` when no video has this id.
    pub fn increment_likes(&self, id: i64) -> Result<Option<i64>> {
        self.with_connection(|conn| {
            let likes = conn
                .query_row(
                    "UPDATE videos SET likes = likes + 1 WHERE id = ?1 RETURNING likes",
                    [id],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("incrementing likes for video {id}"))?;
            Ok(likes)
        })
    }
}

fn ensure_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL UNIQUE,
            path TEXT NOT NULL,
            size INTEGER NOT NULL,
            duration REAL,
            thumbnail TEXT NOT NULL,
            likes INTEGER NOT NULL DEFAULT 0,
            uploaded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_uploaded_at ON videos(uploaded_at);
        "#,
    )
    .context("creating metadata schema")?;
    tx.commit()?;
    Ok(())
}

fn row_to_video_record(row: &Row<'_>) -> Result<VideoRecord> {
    Ok(VideoRecord {
        id: row.get("id")?,
        filename: row.get("filename")?,
        path: row.get("path")?,
        size: row.get("size")?,
        duration: row.get("duration")?,
        thumbnail: row.get("thumbnail")?,
        likes: row.get("likes")?,
        uploaded_at: row.get("uploaded_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_video(filename: &str) -> NewVideo {
        NewVideo {
            filename: filename.into(),
            path: PathBuf::from("/uploads").join(filename),
            size: 1000,
            duration: Some(12.5),
            thumbnail: format!("uploads/thumbnails/{filename}.png"),
        }
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("metadata.db");
        let store = MetadataStore::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(store.path(), db_path.as_path());
        assert!(store.list_videos().unwrap().is_empty());
    }

    #[test]
    fn insert_then_fetch_roundtrips_fields() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata.db")).unwrap();

        let inserted = store.insert_video(&new_video("1700000000000.mp4")).unwrap();
        assert_eq!(inserted.likes, 0);

        let fetched = store.get_video(inserted.id).unwrap().unwrap();
        assert_eq!(fetched.filename, "1700000000000.mp4");
        assert_eq!(fetched.path, "/uploads/1700000000000.mp4");
        assert_eq!(fetched.size, 1000);
        assert_eq!(fetched.duration, Some(12.5));
        assert_eq!(fetched.uploaded_at, inserted.uploaded_at);
        assert!(store.get_video(inserted.id + 100).unwrap().is_none());
    }

    #[test]
    fn list_orders_newest_first() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata.db")).unwrap();

        let first = store.insert_video(&new_video("a.mp4")).unwrap();
        let second = store.insert_video(&new_video("b.mp4")).unwrap();

        let listed = store.list_videos().unwrap();
        let ids: Vec<i64> = listed.iter().map(|video| video.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn increment_likes_counts_up_and_ignores_unknown_ids() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata.db")).unwrap();
        let video = store.insert_video(&new_video("a.mp4")).unwrap();

        assert_eq!(store.increment_likes(video.id).unwrap(), Some(1));
        assert_eq!(store.increment_likes(video.id).unwrap(), Some(2));
        assert_eq!(store.increment_likes(video.id + 1).unwrap(), None);
        assert_eq!(store.get_video(video.id).unwrap().unwrap().likes, 2);
    }

    #[test]
    fn record_serializes_with_front_end_field_names() {
        let record = VideoRecord {
            id: 7,
            filename: "a.mp4".into(),
            path: "/uploads/a.mp4".into(),
            size: 10,
            duration: None,
            thumbnail: "uploads/thumbnails/a.mp4.png".into(),
            likes: 3,
            uploaded_at: Utc::now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["_id"], 7);
        assert_eq!(value["likes"], 3);
        assert!(value.get("uploadedAt").is_some());
        assert!(value.get("duration").is_none());
    }
}
