use std::env;

/// Extensions that can never be uploaded, whatever the allow list says.
pub const DEFAULT_PROHIBITED_EXTENSIONS: &[&str] = &[
    // Executables
    "exe", "dll", "so", "dylib", "bin", "com", "bat", "cmd", "ps1", "sh", "bash", "scr", "msi",
    "cpl", "vbs", "vbe", "jse", "wsf", "wsh",
    // Server side scripts
    "php", "php3", "php4", "php5", "phtml", "phar", "pl", "py", "pyc", "pyo", "cgi", "asp", "aspx",
    "jsp", "jspx", "shtml", "jhtml", "js", "jar", "war", "class",
    // Web content that could be served inline
    "htm", "html", "xhtml", "htaccess", "htpasswd",
];

/// Upload pipeline configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Master switch for the upload module (default: true)
    pub enable_uploads: bool,

    /// Maximum file size in bytes (default: 100 MB)
    pub max_upload_size: usize,

    /// Minimum size of a non-final chunk in bytes (default: 1024)
    pub min_chunk_size: usize,

    /// Allow assembly and publishing to run as background jobs (default: false)
    pub enable_async_uploads: bool,

    /// Allow uploads fetched from a remote URL (default: false)
    pub enable_url_uploads: bool,

    /// Hosts allowed for URL uploads, empty means any host
    pub url_allowed_domains: Vec<String>,

    /// Timeout for a remote fetch in seconds (default: 25)
    pub url_fetch_timeout_secs: u64,

    /// Extensions accepted by the extension policy
    pub file_extensions: Vec<String>,

    /// Extensions that are always rejected
    pub prohibited_extensions: Vec<String>,

    /// Whether the allow list is consulted at all (default: true)
    pub check_file_extensions: bool,

    /// Reject, rather than warn about, extensions outside the allow list (default: true)
    pub strict_file_extensions: bool,

    /// Reject non-ASCII file names for the benefit of Windows clients (default: false)
    pub windows_nonascii_restricted: bool,

    /// Size above which a `large-file` warning is attached (default: none)
    pub large_file_warning_size: Option<usize>,

    /// Rate limit: published uploads per hour per user (default: 250)
    pub uploads_per_hour: u32,

    /// Enable virus scanning (default: false)
    pub enable_virus_scan: bool,

    /// Virus scanner type: "clamav" or "noop" (default: "noop")
    pub virus_scanner_type: String,

    /// ClamAV host (default: "127.0.0.1")
    pub clamav_host: String,

    /// ClamAV port (default: 3310)
    pub clamav_port: u16,

    /// Stash entries older than this are garbage collected (default: 48)
    pub stash_expiry_hours: u64,

    /// Capacity of the background job channel (default: 1000)
    pub job_queue_size: usize,

    /// Jobs executed concurrently (default: 4)
    pub job_workers: usize,

    /// Change tags a client may attach to an upload
    pub allowed_change_tags: Vec<String>,

    /// JWT Secret Key
    pub jwt_secret: String,

    /// Allowed CORS Origins (comma separated)
    pub allowed_origins: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enable_uploads: true,
            max_upload_size: 100 * 1024 * 1024, // 100 MB
            min_chunk_size: 1024,
            enable_async_uploads: false,
            enable_url_uploads: false,
            url_allowed_domains: Vec::new(),
            url_fetch_timeout_secs: 25,
            file_extensions: ["png", "gif", "jpg", "jpeg", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            prohibited_extensions: DEFAULT_PROHIBITED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            check_file_extensions: true,
            strict_file_extensions: true,
            windows_nonascii_restricted: false,
            large_file_warning_size: None,
            uploads_per_hour: 250,
            enable_virus_scan: false,
            virus_scanner_type: "noop".to_string(),
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 3310,
            stash_expiry_hours: 48,
            job_queue_size: 1000,
            job_workers: 4,
            allowed_change_tags: Vec::new(),
            jwt_secret: "secret".to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(), // Vite default
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| {
            let v = v.to_lowercase();
            v != "false" && v != "0" && v != "no"
        })
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl UploadConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            enable_uploads: env_flag("ENABLE_UPLOADS", default.enable_uploads),
            max_upload_size: env_parse("MAX_UPLOAD_SIZE", default.max_upload_size),
            min_chunk_size: env_parse("MIN_UPLOAD_CHUNK_SIZE", default.min_chunk_size),
            enable_async_uploads: env_flag("ENABLE_ASYNC_UPLOADS", default.enable_async_uploads),
            enable_url_uploads: env_flag("ENABLE_URL_UPLOADS", default.enable_url_uploads),
            url_allowed_domains: env::var("URL_UPLOAD_DOMAINS")
                .map(|v| parse_list(&v))
                .unwrap_or(default.url_allowed_domains),
            url_fetch_timeout_secs: env_parse(
                "URL_FETCH_TIMEOUT_SECS",
                default.url_fetch_timeout_secs,
            ),
            file_extensions: env::var("FILE_EXTENSIONS")
                .map(|v| parse_list(&v))
                .unwrap_or(default.file_extensions),
            prohibited_extensions: env::var("PROHIBITED_EXTENSIONS")
                .map(|v| parse_list(&v))
                .unwrap_or(default.prohibited_extensions),
            check_file_extensions: env_flag(
                "CHECK_FILE_EXTENSIONS",
                default.check_file_extensions,
            ),
            strict_file_extensions: env_flag(
                "STRICT_FILE_EXTENSIONS",
                default.strict_file_extensions,
            ),
            windows_nonascii_restricted: env_flag(
                "WINDOWS_UPLOADS",
                default.windows_nonascii_restricted,
            ),
            large_file_warning_size: env::var("LARGE_FILE_WARNING_SIZE")
                .ok()
                .and_then(|v| v.parse().ok()),
            uploads_per_hour: env_parse("UPLOADS_PER_HOUR", default.uploads_per_hour),
            enable_virus_scan: env_flag("ENABLE_VIRUS_SCAN", default.enable_virus_scan),
            virus_scanner_type: env::var("VIRUS_SCANNER_TYPE")
                .unwrap_or(default.virus_scanner_type),
            clamav_host: env::var("CLAMAV_HOST").unwrap_or(default.clamav_host),
            clamav_port: env_parse("CLAMAV_PORT", default.clamav_port),
            stash_expiry_hours: env_parse("STASH_EXPIRY_HOURS", default.stash_expiry_hours),
            job_queue_size: env_parse("UPLOAD_JOB_QUEUE_SIZE", default.job_queue_size).max(1),
            job_workers: env_parse("UPLOAD_JOB_WORKERS", default.job_workers).max(1),
            allowed_change_tags: env::var("ALLOWED_CHANGE_TAGS")
                .map(|v| parse_list(&v))
                .unwrap_or(default.allowed_change_tags),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(default.jwt_secret), // Fallback for dev convenience, strictly enforced in production method
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Create config for development (async jobs on, no virus scanning)
    pub fn development() -> Self {
        Self {
            enable_async_uploads: true,
            uploads_per_hour: 1000,
            ..Self::default()
        }
    }

    /// Create config for production (strict security)
    pub fn production() -> Self {
        Self {
            enable_virus_scan: env_flag("ENABLE_VIRUS_SCAN", true),
            virus_scanner_type: env::var("VIRUS_SCANNER_TYPE")
                .unwrap_or_else(|_| "clamav".to_string()),
            jwt_secret: env::var("JWT_SECRET").expect("CRITICAL: JWT_SECRET must be set"),
            ..Self::from_env()
        }
    }

    pub fn is_allowed_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.file_extensions.iter().any(|e| *e == ext)
    }

    pub fn is_prohibited_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.prohibited_extensions.iter().any(|e| *e == ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UploadConfig::default();
        assert_eq!(config.max_upload_size, 100 * 1024 * 1024);
        assert_eq!(config.min_chunk_size, 1024);
        assert_eq!(config.uploads_per_hour, 250);
        assert!(!config.enable_async_uploads);
        assert!(!config.enable_virus_scan);
        assert_eq!(config.virus_scanner_type, "noop");
    }

    #[test]
    fn test_development_config() {
        let config = UploadConfig::development();
        assert!(config.enable_async_uploads);
        assert!(!config.enable_virus_scan);
        assert_eq!(config.uploads_per_hour, 1000);
    }

    #[test]
    fn test_production_config() {
        unsafe { env::set_var("JWT_SECRET", "test_secret") };
        let config = UploadConfig::production();
        unsafe { env::remove_var("JWT_SECRET") };
        assert_eq!(config.jwt_secret, "test_secret");
    }

    #[test]
    fn test_extension_lists_are_case_insensitive() {
        let config = UploadConfig::default();
        assert!(config.is_allowed_extension("PNG"));
        assert!(!config.is_allowed_extension("pdf"));
        assert!(config.is_prohibited_extension("Exe"));
        assert!(!config.is_prohibited_extension("png"));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list(" PNG, jpg ,,"), vec!["png", "jpg"]);
        assert!(parse_list("").is_empty());
    }
}
