use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use crate::{media::ContentTypePolicy, probe::MediaTools};

pub const DEFAULT_CONFIG_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 10000;
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// Kept outside the upload directory so `/video/{filename}` can never serve it.
pub const DEFAULT_DATABASE_PATH: &str = "vidtoast.db";
pub const THUMBNAILS_SUBDIR: &str = "thumbnails";
/// Process environment variables need this prefix; only `PORT` is also read bare.
pub const ENV_PREFIX: &str = "VIDTOAST_";

/// One layer of settings. Layers come from the env file, the process
/// environment and the command line; later layers win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub upload_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub ffmpeg_bin: Option<PathBuf>,
    pub ffprobe_bin: Option<PathBuf>,
    pub max_upload_bytes: Option<u64>,
    pub content_type_policy: Option<ContentTypePolicy>,
}

impl EnvConfig {
    /// Applies one `KEY=value` pair. Unknown keys are ignored and empty
    /// values leave the setting untouched.
    fn apply(&mut self, key: &str, value: &str, source: &str) -> Result<()> {
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            return Ok(());
        }
        match key.trim() {
            "HOST" => self.host = Some(value.to_string()),
            "PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing PORT from {source}"))?;
                self.port = Some(port);
            }
            "UPLOAD_DIR" => self.upload_dir = Some(PathBuf::from(value)),
            "DATABASE_PATH" => self.database_path = Some(PathBuf::from(value)),
            "FFMPEG_BIN" => self.ffmpeg_bin = Some(PathBuf::from(value)),
            "FFPROBE_BIN" => self.ffprobe_bin = Some(PathBuf::from(value)),
            "MAX_UPLOAD_BYTES" => {
                let limit: u64 = value
                    .parse()
                    .with_context(|| format!("Parsing MAX_UPLOAD_BYTES from {source}"))?;
                self.max_upload_bytes = Some(limit);
            }
            "CONTENT_TYPE_POLICY" => {
                let policy = ContentTypePolicy::parse(value).ok_or_else(|| {
                    anyhow!(
                        "Parsing CONTENT_TYPE_POLICY from {source}: expected \"fixed\" or \"extension\", got {value:?}"
                    )
                })?;
                self.content_type_policy = Some(policy);
            }
            _ => {}
        }
        Ok(())
    }

    /// Fields set in `other` replace the ones in `self`.
    pub fn merge(self, other: EnvConfig) -> EnvConfig {
        EnvConfig {
            host: other.host.or(self.host),
            port: other.port.or(self.port),
            upload_dir: other.upload_dir.or(self.upload_dir),
            database_path: other.database_path.or(self.database_path),
            ffmpeg_bin: other.ffmpeg_bin.or(self.ffmpeg_bin),
            ffprobe_bin: other.ffprobe_bin.or(self.ffprobe_bin),
            max_upload_bytes: other.max_upload_bytes.or(self.max_upload_bytes),
            content_type_policy: other.content_type_policy.or(self.content_type_policy),
        }
    }
}

/// Fully resolved settings handed to the server at start-up.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub database_path: PathBuf,
    pub media_tools: MediaTools,
    pub max_upload_bytes: u64,
    pub content_type_policy: ContentTypePolicy,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.upload_dir.join(THUMBNAILS_SUBDIR)
    }
}

/// Reads a `KEY="value"` file. A missing file is not an error.
pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let source = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        if let Some((key, value)) = trimmed.split_once('=') {
            cfg.apply(key, value, &source)?;
        }
    }
    Ok(Some(cfg))
}

/// Builds a layer from environment variables.
pub fn env_vars_config<I>(vars: I) -> Result<EnvConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut cfg = EnvConfig::default();
    for (key, value) in vars {
        let key = match key.strip_prefix(ENV_PREFIX) {
            Some(stripped) => stripped,
            None if key == "PORT" => key.as_str(),
            None => continue,
        };
        cfg.apply(key, &value, "the environment")?;
    }
    Ok(cfg)
}

/// Resolves the final configuration: env file, then the process environment,
/// then `overrides` (usually the command line).
pub fn load_server_config(path: &Path, overrides: EnvConfig) -> Result<ServerConfig> {
    let file = read_env_config(path)?.unwrap_or_default();
    let env = env_vars_config(std::env::vars_os().filter_map(|(key, value)| {
        Some((key.into_string().ok()?, value.into_string().ok()?))
    }))?;
    resolve_server_config(file.merge(env).merge(overrides))
}

pub fn resolve_server_config(cfg: EnvConfig) -> Result<ServerConfig> {
    let host_raw = cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let host: IpAddr = host_raw
        .parse()
        .with_context(|| format!("expected a valid IPv4 or IPv6 address for HOST, got {host_raw}"))?;
    let upload_dir = cfg
        .upload_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));
    let database_path = cfg
        .database_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    let defaults = MediaTools::default();

    Ok(ServerConfig {
        host,
        port: cfg.port.unwrap_or(DEFAULT_PORT),
        database_path,
        upload_dir,
        media_tools: MediaTools {
            ffmpeg: cfg.ffmpeg_bin.unwrap_or(defaults.ffmpeg),
            ffprobe: cfg.ffprobe_bin.unwrap_or(defaults.ffprobe),
        },
        max_upload_bytes: cfg.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
        content_type_policy: cfg.content_type_policy.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_values() {
        let cfg = make_config(
            "# vidtoast\nPORT=\"4242\"\nUPLOAD_DIR=\"/srv/videos\"\nexport HOST=127.0.0.1\nUNKNOWN=1\n",
        );
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.port, Some(4242));
        assert_eq!(parsed.upload_dir, Some(PathBuf::from("/srv/videos")));
        assert_eq!(parsed.host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn read_env_config_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env_config(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn invalid_port_names_the_key() {
        let cfg = make_config("PORT=\"http\"\n");
        let err = read_env_config(cfg.path()).unwrap_err();
        assert!(format!("{err:#}").contains("PORT"));
    }

    #[test]
    fn content_type_policy_is_validated() {
        let cfg = make_config("CONTENT_TYPE_POLICY=\"extension\"\n");
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(
            parsed.content_type_policy,
            Some(ContentTypePolicy::ByExtension)
        );

        let bad = make_config("CONTENT_TYPE_POLICY=sniff\n");
        let err = read_env_config(bad.path()).unwrap_err();
        assert!(err.to_string().contains("CONTENT_TYPE_POLICY"));
    }

    #[test]
    fn defaults_fill_missing_values() {
        let resolved = resolve_server_config(EnvConfig::default()).unwrap();
        assert_eq!(resolved.port, DEFAULT_PORT);
        assert_eq!(resolved.host.to_string(), DEFAULT_HOST);
        assert_eq!(resolved.upload_dir, PathBuf::from(DEFAULT_UPLOAD_DIR));
        assert_eq!(resolved.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(resolved.media_tools.ffmpeg, PathBuf::from("ffmpeg"));
        assert_eq!(resolved.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(resolved.content_type_policy, ContentTypePolicy::Fixed);
        assert_eq!(
            resolved.thumbnails_dir(),
            PathBuf::from(DEFAULT_UPLOAD_DIR).join(THUMBNAILS_SUBDIR)
        );
    }

    #[test]
    fn later_layers_win() {
        let file = read_env_config(make_config("PORT=1\nHOST=127.0.0.1\n").path())
            .unwrap()
            .unwrap();
        let env = env_vars_config([
            ("VIDTOAST_PORT".to_string(), "2".to_string()),
            ("HOST".to_string(), "buildbox".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ])
        .unwrap();
        let cli = EnvConfig {
            upload_dir: Some(PathBuf::from("/cli")),
            ..EnvConfig::default()
        };

        let resolved = resolve_server_config(file.merge(env).merge(cli)).unwrap();
        assert_eq!(resolved.port, 2);
        assert_eq!(resolved.host.to_string(), "127.0.0.1");
        assert_eq!(resolved.upload_dir, PathBuf::from("/cli"));
    }

    #[test]
    fn bare_port_is_read_from_environment() {
        let env = env_vars_config([("PORT".to_string(), "8081".to_string())]).unwrap();
        assert_eq!(env.port, Some(8081));
    }

    #[test]
    fn invalid_host_is_rejected() {
        let cfg = EnvConfig {
            host: Some("localhost:80".into()),
            ..EnvConfig::default()
        };
        assert!(resolve_server_config(cfg).is_err());
    }
}
