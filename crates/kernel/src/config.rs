use std::collections::HashMap;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the database, certificates, challenges, and proxy configs.
    pub data_dir: PathBuf,
    /// Bind address for the control API.
    pub http_addr: String,
    /// Bootstrap admin credential. Consumed into a hashed token row on
    /// first boot, then ignored.
    pub admin_token: Option<String>,
    pub log_level: String,
    pub cors_origins: Vec<String>,
    /// Docker socket path. Empty string selects the platform default.
    pub docker_socket: String,
    pub nginx: NginxConfig,
    pub acme: AcmeConfig,
    pub crash_loop: CrashLoopConfig,
    pub timeouts: TimeoutConfig,
    /// Health probe interval in seconds (jittered ±10% per service).
    pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NginxConfig {
    /// Gate for the proxy and certificate features. When disabled the
    /// reconciler renders and tracks hashes but never touches a process.
    pub enabled: bool,
    /// Binary used for `-t` validation and `-s reload`.
    pub binary: String,
    /// Debounce window for coalescing reconcile triggers, in milliseconds.
    pub debounce_ms: u64,
    pub reload_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
    /// ACME directory endpoint (production vs staging).
    pub directory_url: String,
    /// Certificates expiring within this many days become renewal-eligible.
    pub renewal_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashLoopConfig {
    /// Detection window W in seconds.
    pub window_secs: i64,
    /// Death count K within W that latches the service.
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub image_pull_secs: u64,
    pub container_start_secs: u64,
    /// SIGTERM grace period before SIGKILL.
    pub container_stop_secs: u64,
    pub health_probe_secs: u64,
    pub db_query_secs: u64,
}

impl Config {
    /// Load configuration from file or environment variables.
    /// Priority: Environment Variables > Config File > Defaults.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = std::env::var("GLINRDOCK_CONFIG_FILE")
            .unwrap_or_else(|_| "/etc/glinrdock/glinrdockd.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            tracing::info!("Loading configuration from: {}", config_path);
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env(&std::env::vars().collect());
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply recognized environment variables on top of the current values.
    /// Split out from [`Config::load`] so tests can drive it with a map.
    pub fn apply_env(&mut self, env: &HashMap<String, String>) {
        if let Some(v) = env.get("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env.get("HTTP_ADDR") {
            self.http_addr = v.clone();
        }
        if let Some(v) = env.get("ADMIN_TOKEN") {
            if !v.is_empty() {
                self.admin_token = Some(v.clone());
            }
        }
        if let Some(v) = env.get("LOG_LEVEL") {
            self.log_level = v.clone();
        }
        if let Some(v) = env.get("CORS_ORIGINS") {
            self.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env.get("DOCKER_SOCKET") {
            self.docker_socket = v.clone();
        }
        if let Some(v) = env.get("NGINX_PROXY_ENABLED") {
            if let Ok(enabled) = v.parse() {
                self.nginx.enabled = enabled;
            }
        }
        if let Some(v) = env.get("ACME_URL") {
            self.acme.directory_url = v.clone();
        }
        if let Some(v) = env.get("CERT_RENEWAL_DAYS") {
            if let Ok(days) = v.parse() {
                self.acme.renewal_days = days;
            }
        }
        if let Some(v) = env.get("CRASH_LOOP_WINDOW") {
            if let Ok(secs) = v.parse() {
                self.crash_loop.window_secs = secs;
            }
        }
        if let Some(v) = env.get("CRASH_LOOP_THRESHOLD") {
            if let Ok(count) = v.parse() {
                self.crash_loop.threshold = count;
            }
        }
    }

    /// Validate configuration values. File-system checks are deferred to
    /// the components that own the paths.
    pub fn validate(&self) -> Result<(), String> {
        if self.http_addr.is_empty() {
            return Err("http_addr must not be empty".to_string());
        }
        self.http_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| format!("invalid http_addr: {e}"))?;
        if self.data_dir.as_os_str().is_empty() {
            return Err("data_dir must not be empty".to_string());
        }
        if self.crash_loop.threshold == 0 {
            return Err("crash_loop.threshold must be > 0".to_string());
        }
        if self.crash_loop.window_secs <= 0 {
            return Err("crash_loop.window_secs must be > 0".to_string());
        }
        if self.probe_interval_secs == 0 {
            return Err("probe_interval_secs must be > 0".to_string());
        }
        if self.acme.renewal_days <= 0 {
            return Err("acme.renewal_days must be > 0".to_string());
        }
        Ok(())
    }

    // ── Data-directory layout ───────────────────────────────────

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("glinrdock.db")
    }

    pub fn secret_key_path(&self) -> PathBuf {
        self.data_dir.join("secret.key")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    pub fn challenges_dir(&self) -> PathBuf {
        self.data_dir.join("challenges")
    }

    pub fn proxy_dir(&self) -> PathBuf {
        self.data_dir.join("nginx")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/glinrdock"),
            http_addr: "127.0.0.1:8080".to_string(),
            admin_token: None,
            log_level: "info,glinr_kernel=debug".to_string(),
            cors_origins: vec![],
            docker_socket: String::new(),
            nginx: NginxConfig::default(),
            acme: AcmeConfig::default(),
            crash_loop: CrashLoopConfig::default(),
            timeouts: TimeoutConfig::default(),
            probe_interval_secs: 30,
        }
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: "nginx".to_string(),
            debounce_ms: 300,
            reload_timeout_secs: 10,
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
            renewal_days: 30,
        }
    }
}

impl Default for CrashLoopConfig {
    fn default() -> Self {
        Self {
            window_secs: 600,
            threshold: 5,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            image_pull_secs: 600,
            container_start_secs: 60,
            container_stop_secs: 10,
            health_probe_secs: 1,
            db_query_secs: 5,
        }
    }
}
