use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_MONGODB_URI: &str = "mongodb://localhost:27017";
const DEFAULT_MONGO_DB: &str = "gdghackathon";
const DEFAULT_VOTERS_COLLECTION: &str = "voters";
const DEFAULT_SCRATCH_DIR: &str = "/tmp/voter_verification";
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.4;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// MongoDB connection string.
    pub mongodb_uri: String,
    /// Database holding the voter collection.
    pub mongo_db: String,
    /// Collection of voter registration records.
    pub voters_collection: String,
    /// Scratch directory for cached registered images and captured images.
    pub scratch_dir: PathBuf,
    pub bind_address: String,
    pub port: u16,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Similarity floor passed to the comparator. Informational: the verdict
    /// comes from the model profile.
    pub similarity_threshold: f32,
    /// Timeout for downloading a registered image from a URL.
    pub download_timeout_secs: u64,
    /// Request body limit for `/verify`.
    pub max_body_bytes: usize,
    /// Allowed CORS origins; empty allows any origin.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mongodb_uri: DEFAULT_MONGODB_URI.to_string(),
            mongo_db: DEFAULT_MONGO_DB.to_string(),
            voters_collection: DEFAULT_VOTERS_COLLECTION.to_string(),
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            model_dir: facegate_core::default_model_dir(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// Keys accepted in the optional TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mongodb_uri: Option<String>,
    mongo_db: Option<String>,
    voters_collection: Option<String>,
    scratch_dir: Option<PathBuf>,
    bind_address: Option<String>,
    port: Option<u16>,
    model_dir: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    download_timeout_secs: Option<u64>,
    max_body_bytes: Option<usize>,
    cors_allowed_origins: Option<Vec<String>>,
}

impl Config {
    /// Defaults, then the TOML file named by `FACEGATE_CONFIG` (if any),
    /// then environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("FACEGATE_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;

        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        take!(
            mongodb_uri,
            mongo_db,
            voters_collection,
            scratch_dir,
            bind_address,
            port,
            model_dir,
            similarity_threshold,
            download_timeout_secs,
            max_body_bytes,
            cors_allowed_origins,
        );
        Ok(())
    }

    /// Overlay environment variables read through `lookup`. Unparseable
    /// numbers keep the current value.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MONGODB_URI") {
            self.mongodb_uri = v;
        }
        if let Some(v) = lookup("MONGO_DB") {
            self.mongo_db = v;
        }
        if let Some(v) = lookup("VOTERS_COLLECTION") {
            self.voters_collection = v;
        }
        if let Some(v) = lookup("UPLOAD_TMP_DIR") {
            self.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = lookup("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_CORS_ORIGINS") {
            self.cors_allowed_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        self.port = parsed(&lookup, "PORT", self.port);
        self.similarity_threshold =
            parsed(&lookup, "FACEGATE_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.download_timeout_secs =
            parsed(&lookup, "FACEGATE_DOWNLOAD_TIMEOUT_SECS", self.download_timeout_secs);
        self.max_body_bytes = parsed(&lookup, "FACEGATE_MAX_BODY_BYTES", self.max_body_bytes);
    }

    /// Socket address string for the HTTP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration value");
            current
        }),
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mongo_db, "gdghackathon");
        assert_eq!(config.voters_collection, "voters");
        assert_eq!(config.scratch_dir, PathBuf::from("/tmp/voter_verification"));
        assert_eq!(config.port, 5000);
        assert_eq!(config.download_timeout_secs, 10);
        assert!((config.similarity_threshold - 0.4).abs() < 1e-6);
        assert_eq!(config.listen_addr(), "0.0.0.0:5000");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("MONGODB_URI", "mongodb://db:27017"),
            ("MONGO_DB", "elections"),
            ("UPLOAD_TMP_DIR", "/var/tmp/fg"),
            ("PORT", "8080"),
            ("FACEGATE_CORS_ORIGINS", "https://a.example, ,https://b.example"),
        ]));
        assert_eq!(config.mongodb_uri, "mongodb://db:27017");
        assert_eq!(config.mongo_db, "elections");
        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/fg"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.cors_allowed_origins, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_bad_numbers_keep_defaults() {
        let mut config = Config::default();
        config.apply_env(env(&[("PORT", "not-a-port"), ("FACEGATE_SIMILARITY_THRESHOLD", "high")]));
        assert_eq!(config.port, 5000);
        assert!((config.similarity_threshold - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facegate.toml");
        std::fs::write(
            &path,
            "mongo_db = \"from_file\"\nport = 6000\nmodel_dir = \"/opt/models\"\n",
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_file(&path).unwrap();
        config.apply_env(env(&[("PORT", "7000")]));

        assert_eq!(config.mongo_db, "from_file");
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn test_file_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facegate.toml");
        std::fs::write(&path, "mongo_database = \"typo\"\n").unwrap();
        let err = Config::default().apply_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::default()
            .apply_file(Path::new("/nonexistent/facegate.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
