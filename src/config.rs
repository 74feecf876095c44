use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the sharded blob tree
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    /// Where multipart uploads are spooled before they reach the blob store
    #[serde(default = "default_staging_dir", alias = "download_dir")]
    pub staging_dir: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_files_per_request")]
    pub max_files_per_request: usize,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
    /// How many days back a blob lookup walks before the full scan
    #[serde(default = "default_search_horizon_days")]
    pub search_horizon_days: u32,
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: Option<String>,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_db_path() -> String {
    "data/file-service.db".to_string()
}

fn default_upload_dir() -> String {
    "./uploads".to_string()
}

fn default_staging_dir() -> String {
    "./downloads".to_string()
}

fn default_max_file_size() -> u64 {
    5 << 20 // 5 MiB
}

fn default_max_files_per_request() -> usize {
    10
}

fn default_allowed_types() -> Vec<String> {
    [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "text/plain",
        "text/html",
        "text/css",
        "text/javascript",
        "application/javascript",
        "application/json",
        "application/pdf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_search_horizon_days() -> u32 {
    365
}

fn default_orphan_grace_secs() -> u64 {
    3600
}

fn default_log_dir() -> Option<String> {
    Some("./logs".to_string())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            staging_dir: default_staging_dir(),
            max_file_size: default_max_file_size(),
            max_files_per_request: default_max_files_per_request(),
            allowed_types: default_allowed_types(),
            search_horizon_days: default_search_horizon_days(),
            orphan_grace_secs: default_orphan_grace_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Whether a normalized media type is on the allow-list
    pub fn is_allowed(&self, media_type: &str) -> bool {
        self.allowed_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(media_type))
    }

    /// Upper bound for a whole upload request body, multipart framing included
    pub fn max_request_size(&self) -> usize {
        let files = self.max_files_per_request.max(1) as u64;
        self.max_file_size
            .saturating_mul(files)
            .saturating_add(1 << 20) as usize
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        Ok(config)
    }

    /// Load configuration from conf.ini or config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["conf.ini", "config.toml", "data/conf.ini", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: FS_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(val) = env::var("FS_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("FS_CONF_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        // Database overrides
        if let Ok(val) = env::var("FS_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        // Storage overrides
        if let Ok(val) = env::var("FS_CONF_STORAGE_UPLOAD_DIR") {
            self.storage.upload_dir = val;
        }
        if let Ok(val) = env::var("FS_CONF_STORAGE_STAGING_DIR") {
            self.storage.staging_dir = val;
        }
        if let Ok(val) = env::var("FS_CONF_STORAGE_MAX_FILE_SIZE") {
            if let Ok(size) = val.parse() {
                self.storage.max_file_size = size;
            }
        }
        if let Ok(val) = env::var("FS_CONF_STORAGE_MAX_FILES_PER_REQUEST") {
            if let Ok(count) = val.parse() {
                self.storage.max_files_per_request = count;
            }
        }
        if let Ok(val) = env::var("FS_CONF_STORAGE_ALLOWED_TYPES") {
            self.storage.allowed_types = val
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = env::var("FS_CONF_STORAGE_SEARCH_HORIZON_DAYS") {
            if let Ok(days) = val.parse() {
                self.storage.search_horizon_days = days;
            }
        }
        if let Ok(val) = env::var("FS_CONF_STORAGE_ORPHAN_GRACE_SECS") {
            if let Ok(secs) = val.parse() {
                self.storage.orphan_grace_secs = secs;
            }
        }

        // Log overrides
        if let Ok(val) = env::var("FS_CONF_LOG_DIR") {
            self.log.dir = if val.trim().is_empty() { None } else { Some(val) };
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        // Ensure database directory exists
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }

        fs::create_dir_all(&self.storage.upload_dir)?;
        fs::create_dir_all(&self.storage.staging_dir)?;

        if let Some(dir) = &self.log.dir {
            fs::create_dir_all(dir)?;
        }

        Ok(())
    }
}
