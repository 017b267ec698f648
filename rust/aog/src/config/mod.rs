//! Configuration management for the gateway.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file
//! (`{root}/aog.yaml`), then `AOG__`-prefixed environment variables, then the
//! handful of documented flat `AOG_*` variables that override individual
//! knobs (`AOG_HOST`, `AOG_MODEL_IDLE_TIMEOUT`, ...).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application name; appears in the API base path, the PID file, and the
/// database file name.
pub const APP_NAME: &str = "aog";

/// API specification version; appears in the API base path.
pub const SPEC_VERSION: &str = "v0.2";

/// The API base path: `/aog/v0.2`.
pub fn api_base() -> String {
    format!("/{APP_NAME}/{SPEC_VERSION}")
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Data root and derived paths.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Model memory manager tuning.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Plugin discovery and transport tuning.
    #[serde(default)]
    pub plugins: PluginConfig,
    /// Scheduler timeouts.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Graceful shutdown bound in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    16688
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// The bind address, `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The base URL clients use to reach this server.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, api_base())
    }
}

/// Data root and derived file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory for all persisted state.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
}

fn default_root_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!(".{APP_NAME}"))
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
        }
    }
}

impl PathsConfig {
    /// `{root}/aog.db` — the embedded relational store.
    pub fn db_path(&self) -> PathBuf {
        self.root_dir.join(format!("{APP_NAME}.db"))
    }

    /// `{root}/aog.pid`.
    pub fn pid_path(&self) -> PathBuf {
        self.root_dir.join(format!("{APP_NAME}.pid"))
    }

    /// `{root}/logs`.
    pub fn log_dir(&self) -> PathBuf {
        self.root_dir.join("logs")
    }

    /// `{root}/plugins` — one subdirectory per plugin.
    pub fn plugin_dir(&self) -> PathBuf {
        self.root_dir.join("plugins")
    }
}

/// Model memory manager tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Evict a model idle for longer than this.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Cleaner tick interval.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Admission queue capacity per engine.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Upper bound on one preparation (queue wait + model switch).
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_queue_size() -> usize {
    100
}

fn default_queue_timeout() -> u64 {
    300
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            queue_size: default_queue_size(),
            queue_timeout_secs: default_queue_timeout(),
        }
    }
}

impl MemoryConfig {
    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Cleanup interval as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Queue timeout as a [`Duration`].
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

/// Plugin discovery and transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Override for the plugin directory; defaults to `{root}/plugins`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Rescan the plugin directory this often.
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
    /// Handshake + RPC connection timeout for a plugin subprocess.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_rescan_interval() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            dir: None,
            rescan_interval_secs: default_rescan_interval(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl PluginConfig {
    /// The effective plugin directory.
    pub fn effective_dir(&self, paths: &PathsConfig) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| paths.plugin_dir())
    }

    /// Connection timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Scheduler timeouts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on dispatch preparation (model admission).
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_secs: u64,
    /// Default unary invocation timeout.
    #[serde(default = "default_unary_timeout")]
    pub unary_timeout_secs: u64,
    /// Default streaming invocation timeout.
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
}

fn default_prepare_timeout() -> u64 {
    300
}

fn default_unary_timeout() -> u64 {
    60
}

fn default_stream_timeout() -> u64 {
    300
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_secs: default_prepare_timeout(),
            unary_timeout_secs: default_unary_timeout(),
            stream_timeout_secs: default_stream_timeout(),
        }
    }
}

impl SchedulerConfig {
    /// Preparation timeout as a [`Duration`].
    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.prepare_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, the optional config file, and the
    /// environment.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let root_dir = std::env::var("AOG_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_root_dir());

        let builder = config::Config::builder()
            .add_source(
                config::File::from(root_dir.join(format!("{APP_NAME}.yaml"))).required(false),
            )
            .add_source(
                config::Environment::with_prefix("AOG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: AppConfig = builder.try_deserialize().unwrap_or_default();
        cfg.paths.root_dir = root_dir;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Apply the documented flat `AOG_*` environment variables.
    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = std::env::var("AOG_HOST") {
            let (h, p) = parse_host(&host)?;
            self.server.host = h;
            if let Some(p) = p {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("AOG_MODEL_IDLE_TIMEOUT") {
            self.memory.idle_timeout_secs = parse_duration(&v)?.as_secs();
        }
        if let Ok(v) = std::env::var("AOG_MODEL_CLEANUP_INTERVAL") {
            self.memory.cleanup_interval_secs = parse_duration(&v)?.as_secs();
        }
        if let Ok(v) = std::env::var("AOG_LOCAL_MODEL_QUEUE_SIZE") {
            self.memory.queue_size = v
                .parse()
                .map_err(|_| anyhow::anyhow!("AOG_LOCAL_MODEL_QUEUE_SIZE: not a number: {v}"))?;
        }
        if let Ok(v) = std::env::var("AOG_LOCAL_MODEL_QUEUE_TIMEOUT") {
            self.memory.queue_timeout_secs = parse_duration(&v)?.as_secs();
        }
        if let Ok(v) = std::env::var("AOG_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Ensure the data root and log directory exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.paths.root_dir)?;
        std::fs::create_dir_all(self.paths.log_dir())?;
        Ok(())
    }
}

/// Parse `AOG_HOST`: `host`, `host:port`, or `scheme://host:port[/path]`.
fn parse_host(value: &str) -> anyhow::Result<(String, Option<u16>)> {
    let value = value.trim();
    if value.contains("://") {
        let url = url::Url::parse(value)
            .map_err(|e| anyhow::anyhow!("AOG_HOST: invalid URL {value:?}: {e}"))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("AOG_HOST: no host in {value:?}"))?
            .to_string();
        return Ok((host, url.port()));
    }
    match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow::anyhow!("AOG_HOST: invalid port in {value:?}"))?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((value.to_string(), None)),
    }
}

/// Parse a duration: plain seconds (`300`) or suffixed `30s` / `5m` / `1h`.
pub fn parse_duration(value: &str) -> anyhow::Result<Duration> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let number: u64 = number
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration {value:?}"))?;
    let secs = match unit {
        "s" | "" => number,
        "m" => number * 60,
        "h" => number * 3600,
        other => anyhow::bail!("invalid duration unit {other:?} in {value:?}"),
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.memory.idle_timeout_secs, 300);
        assert_eq!(cfg.memory.cleanup_interval_secs, 60);
        assert_eq!(cfg.memory.queue_size, 100);
        assert_eq!(cfg.scheduler.prepare_timeout_secs, 300);
        assert_eq!(cfg.plugins.rescan_interval_secs, 10);
        assert_eq!(cfg.plugins.connect_timeout_secs, 10);
        assert_eq!(cfg.server.shutdown_timeout_secs, 30);
    }

    #[test]
    fn test_api_base() {
        assert_eq!(api_base(), "/aog/v0.2");
    }

    #[test]
    fn test_derived_paths() {
        let paths = PathsConfig {
            root_dir: PathBuf::from("/data/aog"),
        };
        assert_eq!(paths.db_path(), PathBuf::from("/data/aog/aog.db"));
        assert_eq!(paths.pid_path(), PathBuf::from("/data/aog/aog.pid"));
        assert_eq!(paths.log_dir(), PathBuf::from("/data/aog/logs"));
        assert_eq!(paths.plugin_dir(), PathBuf::from("/data/aog/plugins"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_host_forms() {
        assert_eq!(parse_host("localhost").unwrap(), ("localhost".into(), None));
        assert_eq!(
            parse_host("0.0.0.0:9000").unwrap(),
            ("0.0.0.0".into(), Some(9000))
        );
        assert_eq!(
            parse_host("http://127.0.0.1:16688/aog").unwrap(),
            ("127.0.0.1".into(), Some(16688))
        );
    }
}
