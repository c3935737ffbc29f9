use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gate::GateLimits;

/// Main configuration structure that can be loaded from CLI, config file, or environment
///
/// Example configuration file content
/// # File share configuration
///
/// path = "/srv/share"
/// bind = "0.0.0.0"
/// listen_on_port = 8080
///
/// # Session and abuse limits
/// duration = "1h"
/// rate_limit = 100
/// rate_window = "1m"
/// backoff = "2s"
///
/// # Connection timeouts
/// read_timeout = "15s"
/// request_timeout = "15s"
/// idle_timeout = "30s"
/// compaction_interval = "5m"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// File or directory to share
    #[arg(default_value = ".")]
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Address to bind
    #[arg(short, long, default_value_t = default_bind())]
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// How long the access token and the session stay valid (e.g. 30m, 2h)
    #[arg(short, long, default_value = "1h", value_parser = humantime::parse_duration)]
    #[serde(default = "default_duration", with = "duration_str")]
    pub duration: Duration,

    /// Requests allowed per source address within one rate window
    #[arg(long, default_value_t = 100)]
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,

    /// Length of the sliding rate window
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    #[serde(default = "default_rate_window", with = "duration_str")]
    pub rate_window: Duration,

    /// Cooldown after a failed authentication from a source address
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    #[serde(default = "default_backoff", with = "duration_str")]
    pub backoff: Duration,

    /// Time allowed to receive request headers
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    #[serde(default = "default_read_timeout", with = "duration_str")]
    pub read_timeout: Duration,

    /// Time allowed for a handler to produce response headers
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,

    /// Close connections that make no I/O progress for this long
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    #[serde(default = "default_idle_timeout", with = "duration_str")]
    pub idle_timeout: Duration,

    /// How often stale rate-limit and backoff entries are dropped
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    #[serde(default = "default_compaction_interval", with = "duration_str")]
    pub compaction_interval: Duration,

    /// Configuration file path (fills every option left at its default)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let repr = String::deserialize(de)?;
        humantime::parse_duration(&repr).map_err(serde::de::Error::custom)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: default_path(),
            bind: default_bind(),
            listen_on_port: default_port(),
            duration: default_duration(),
            rate_limit: default_rate_limit(),
            rate_window: default_rate_window(),
            backoff: default_backoff(),
            read_timeout: default_read_timeout(),
            request_timeout: default_request_timeout(),
            idle_timeout: default_idle_timeout(),
            compaction_interval: default_compaction_interval(),
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence unless left at default
    fn merge_with_file(mut self, file_config: Config) -> Self {
        if self.path == default_path() {
            self.path = file_config.path;
        }
        if self.bind == default_bind() {
            self.bind = file_config.bind;
        }
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.duration == default_duration() {
            self.duration = file_config.duration;
        }
        if self.rate_limit == default_rate_limit() {
            self.rate_limit = file_config.rate_limit;
        }
        if self.rate_window == default_rate_window() {
            self.rate_window = file_config.rate_window;
        }
        if self.backoff == default_backoff() {
            self.backoff = file_config.backoff;
        }
        if self.read_timeout == default_read_timeout() {
            self.read_timeout = file_config.read_timeout;
        }
        if self.request_timeout == default_request_timeout() {
            self.request_timeout = file_config.request_timeout;
        }
        if self.idle_timeout == default_idle_timeout() {
            self.idle_timeout = file_config.idle_timeout;
        }
        if self.compaction_interval == default_compaction_interval() {
            self.compaction_interval = file_config.compaction_interval;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit == 0 {
            return Err(anyhow::anyhow!("rate_limit must be at least 1"));
        }

        for (name, value) in [
            ("duration", self.duration),
            ("rate_window", self.rate_window),
            ("backoff", self.backoff),
            ("read_timeout", self.read_timeout),
            ("request_timeout", self.request_timeout),
            ("idle_timeout", self.idle_timeout),
            ("compaction_interval", self.compaction_interval),
        ] {
            if value.is_zero() {
                return Err(anyhow::anyhow!("{name} must be greater than zero"));
            }
        }

        Ok(())
    }

    pub fn gate_limits(&self) -> GateLimits {
        GateLimits {
            session: self.duration,
            rate_limit: self.rate_limit,
            rate_window: self.rate_window,
            backoff: self.backoff,
        }
    }
}

// Default value functions
fn default_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_duration() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_rate_limit() -> usize {
    100
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_compaction_interval() -> Duration {
    Duration::from_secs(5 * 60)
}
