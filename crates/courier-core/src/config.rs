//! Configuration types and loading.
//!
//! Every limit the attachment engine enforces is overridable from the
//! environment; defaults match the production deployment.

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub limits: AttachmentLimits,
    pub scanner: ScannerConfig,
    pub token: TokenConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// External base URL used when building upload/finalize/download URLs.
    pub public_base_url: String,
    /// Database connection URL; memory repositories are used when empty.
    pub database_url: Option<String>,
}

/// Blob store namespace roots.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub permanent_dir: String,
    pub temp_dir: String,
    pub quarantine_dir: String,
    pub thumbnail_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachmentLimits {
    /// Hard ceiling on attachments per message.
    pub max_files: usize,
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
    pub max_document_bytes: u64,
    /// Ceiling on attachments a single user may hold in UPLOADING.
    pub max_pending_per_user: usize,
    /// Upper bound for client-requested expiry, in hours. Zero disables.
    pub max_expiry_hours: u64,
    /// Chunk size hint handed to clients at session creation.
    pub chunk_size_bytes: u64,
    /// Resurrections of a FAILED attachment allowed per session.
    pub max_upload_retries: u32,
    /// Interval between expiry sweeps, in seconds.
    pub expiry_sweep_secs: u64,
    /// Live sessions older than this are cancelled by the sweeper.
    pub session_max_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    /// When the scanner is unreachable: fail closed (attachment FAILED)
    /// or open (scan SKIPPED).
    pub fail_closed: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    pub secret: String,
    pub download_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                public_base_url: "http://localhost:8080".to_string(),
                database_url: None,
            },
            storage: StorageConfig {
                permanent_dir: "uploads/message-attachments".to_string(),
                temp_dir: "uploads/message-attachments/tmp".to_string(),
                quarantine_dir: "uploads/message-attachments/quarantine".to_string(),
                thumbnail_dir: "uploads/message-attachments/thumbs".to_string(),
            },
            limits: AttachmentLimits::default(),
            scanner: ScannerConfig {
                enabled: true,
                host: "clamav".to_string(),
                port: 3310,
                timeout_secs: 30,
                fail_closed: true,
            },
            token: TokenConfig {
                secret: "change-me-in-production".to_string(),
                download_ttl_secs: 900,
            },
        }
    }
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_files: 6,
            max_image_bytes: 10 * 1024 * 1024,
            max_video_bytes: 50 * 1024 * 1024,
            max_document_bytes: 20 * 1024 * 1024,
            max_pending_per_user: 12,
            max_expiry_hours: 168,
            chunk_size_bytes: 5 * 1024 * 1024,
            max_upload_retries: 3,
            expiry_sweep_secs: 900,
            session_max_age_secs: 24 * 3600,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port.parse().unwrap_or(8080);
        }
        if let Ok(url) = std::env::var("PUBLIC_BASE_URL") {
            config.server.public_base_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.server.database_url = Some(url);
        }

        if let Ok(dir) = std::env::var("COURIER_STORAGE_DIR") {
            config.storage.permanent_dir = format!("{dir}/message-attachments");
            config.storage.temp_dir = format!("{dir}/message-attachments/tmp");
            config.storage.quarantine_dir = format!("{dir}/message-attachments/quarantine");
            config.storage.thumbnail_dir = format!("{dir}/message-attachments/thumbs");
        }

        let limits = &mut config.limits;
        set_parsed(&mut limits.max_files, "COURIER_MAX_FILES");
        set_parsed(&mut limits.max_image_bytes, "COURIER_MAX_IMAGE_BYTES");
        set_parsed(&mut limits.max_video_bytes, "COURIER_MAX_VIDEO_BYTES");
        set_parsed(&mut limits.max_document_bytes, "COURIER_MAX_DOCUMENT_BYTES");
        set_parsed(&mut limits.max_pending_per_user, "COURIER_MAX_PENDING_PER_USER");
        set_parsed(&mut limits.max_expiry_hours, "COURIER_MAX_EXPIRY_HOURS");
        set_parsed(&mut limits.chunk_size_bytes, "COURIER_CHUNK_SIZE_BYTES");
        set_parsed(&mut limits.max_upload_retries, "COURIER_MAX_UPLOAD_RETRIES");
        set_parsed(&mut limits.expiry_sweep_secs, "COURIER_EXPIRY_SWEEP_SECS");
        set_parsed(&mut limits.session_max_age_secs, "COURIER_SESSION_MAX_AGE_SECS");

        if let Ok(v) = std::env::var("VIRUS_SCAN_ENABLED") {
            config.scanner.enabled = parse_bool(&v);
        }
        if let Ok(host) = std::env::var("VIRUS_SCAN_HOST") {
            config.scanner.host = host;
        }
        set_parsed(&mut config.scanner.port, "VIRUS_SCAN_PORT");
        set_parsed(&mut config.scanner.timeout_secs, "VIRUS_SCAN_TIMEOUT_SECS");
        if let Ok(v) = std::env::var("VIRUS_SCAN_FAIL_CLOSED") {
            config.scanner.fail_closed = parse_bool(&v);
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            config.token.secret = secret;
        }
        set_parsed(&mut config.token.download_ttl_secs, "COURIER_DOWNLOAD_TOKEN_TTL_SECS");

        config
    }

    pub fn server_addr(&self) -> std::net::SocketAddr {
        let ip: std::net::IpAddr = self.server.host.parse().unwrap_or([0, 0, 0, 0].into());
        std::net::SocketAddr::new(ip, self.server.port)
    }
}

fn set_parsed<T: std::str::FromStr + Copy>(slot: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(value) = raw.parse() {
            *slot = value;
        }
    }
}

fn parse_bool(v: &str) -> bool {
    v == "true" || v == "1" || v == "yes"
}
