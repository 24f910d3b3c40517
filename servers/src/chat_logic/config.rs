use crate::chat_logic::limiter::RouteLimits;
use clap::Parser;
use lib_chat::DeliveryOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_chat.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Chat relay: WebSocket fan-out over Redis Pub/Sub", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "CHAT_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "CHAT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CHAT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "CHAT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "Redis URL of the upstream bus. Without it an in-process bus is used.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "CHAT_TOPIC", help = "Pub/Sub channel carrying chat messages.")]
    pub topic: Option<String>,

    #[clap(long, env = "CHAT_SEND_TIMEOUT_MS", help = "Milliseconds a single send to a client may take before the client is dropped.")]
    pub send_timeout_ms: Option<u64>,

    #[clap(long, env = "CHAT_CLIENT_BUFFER", help = "Messages queued per client before it is evicted as too slow.")]
    pub client_buffer: Option<usize>,

    #[clap(long, env = "CHAT_RECEIVE_RATE", help = "New /receive connections allowed per second per IP (0 disables the limit).")]
    pub receive_rate_per_second: Option<u32>,

    #[clap(long, env = "CHAT_LIMIT_PER_DAY", help = "Requests per route allowed per day per IP (0 disables the limit).")]
    pub limit_per_day: Option<u32>,

    #[clap(long, env = "CHAT_LIMIT_PER_HOUR", help = "Requests per route allowed per hour per IP (0 disables the limit).")]
    pub limit_per_hour: Option<u32>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            topic: other.topic.or(self.topic),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            client_buffer: other.client_buffer.or(self.client_buffer),
            receive_rate_per_second: other.receive_rate_per_second.or(self.receive_rate_per_second),
            limit_per_day: other.limit_per_day.or(self.limit_per_day),
            limit_per_hour: other.limit_per_hour.or(self.limit_per_hour),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            topic: Some("chat".to_string()),
            send_timeout_ms: Some(5000),
            client_buffer: Some(64),
            receive_rate_per_second: Some(1),
            limit_per_day: Some(100),
            limit_per_hour: Some(10),
            ..Default::default()
        }
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub redis_url: Option<String>,
    pub topic: String,
    pub send_timeout: Duration,
    pub client_buffer: usize,
    pub receive_rate_per_second: u32,
    pub limit_per_day: u32,
    pub limit_per_hour: u32,
    /// Certificate and key, present only when both files exist.
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl Settings {
    pub fn route_limits(&self) -> RouteLimits {
        RouteLimits::new(self.limit_per_day, self.limit_per_hour, self.receive_rate_per_second)
    }

    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            send_timeout: self.send_timeout,
            mailbox_capacity: self.client_buffer,
        }
    }
}

/// A message produced while loading the config, before logging is set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigNotice {
    pub level: log::Level,
    pub message: String,
}

impl ConfigNotice {
    fn new(level: log::Level, message: String) -> Self {
        Self { level, message }
    }

    pub fn emit(&self) {
        log::log!(self.level, "{}", self.message);
    }
}

/// Loads the settings, returning them together with any notices to log once
/// the logger is installed.
pub fn load_config() -> (Settings, Vec<ConfigNotice>) {
    let mut notices = Vec::new();

    // Parse CLI (and env) first to learn about a config_path override.
    let cli_args = Config::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let file_config = read_config_file(&config_file_path, &mut notices);
    let debug = std::env::var_os("DEBUG").is_some();

    let settings = resolve(file_config, cli_args, debug, dirs::home_dir(), &mut notices);
    (settings, notices)
}

fn read_config_file(path: &Path, notices: &mut Vec<ConfigNotice>) -> Option<Config> {
    if !path.exists() {
        notices.push(ConfigNotice::new(
            log::Level::Info,
            format!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display()),
        ));
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => {
                notices.push(ConfigNotice::new(log::Level::Info, format!("Loaded config file {}", path.display())));
                Some(file_config)
            }
            Err(e) => {
                notices.push(ConfigNotice::new(
                    log::Level::Warn,
                    format!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e),
                ));
                None
            }
        },
        Err(e) => {
            notices.push(ConfigNotice::new(
                log::Level::Warn,
                format!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e),
            ));
            None
        }
    }
}

/// Layers defaults, the config file and CLI/env (in that order of precedence).
pub fn resolve(
    file_config: Option<Config>,
    cli_config: Config,
    debug: bool,
    home_dir: Option<PathBuf>,
    notices: &mut Vec<ConfigNotice>,
) -> Settings {
    let mut merged = Config::defaults();
    if let Some(file_config) = file_config {
        merged = merged.merge(file_config);
    }
    merged = merged.merge(cli_config);

    // Fall back to the usual LetsEncrypt location, but only if it is really there.
    if merged.tls_cert_path.is_none() && merged.tls_key_path.is_none() {
        if let Some(home_dir) = home_dir {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            merged.tls_cert_path = Some(letsencrypt_dir.join("fullchain.pem"));
            merged.tls_key_path = Some(letsencrypt_dir.join("privkey.pem"));
        }
    }
    let tls = match (merged.tls_cert_path, merged.tls_key_path) {
        (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert, key)),
        (Some(cert), Some(key)) => {
            notices.push(ConfigNotice::new(
                log::Level::Debug,
                format!("TLS files {} / {} not found; serving plain HTTP.", cert.display(), key.display()),
            ));
            None
        }
        _ => None,
    };

    let log_level = if debug {
        "debug".to_string()
    } else {
        merged.log_level.unwrap_or_else(|| "info".to_string())
    };

    Settings {
        port: merged.port.unwrap_or(8080),
        log_dir: merged.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level,
        redis_url: merged.redis_url.filter(|url| !url.trim().is_empty()),
        topic: merged.topic.unwrap_or_else(|| "chat".to_string()),
        send_timeout: Duration::from_millis(merged.send_timeout_ms.unwrap_or(5000).max(1)),
        client_buffer: merged.client_buffer.unwrap_or(64).max(1),
        receive_rate_per_second: merged.receive_rate_per_second.unwrap_or(1),
        limit_per_day: merged.limit_per_day.unwrap_or(100),
        limit_per_hour: merged.limit_per_hour.unwrap_or(10),
        tls,
    }
}
