// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::Level;

pub const DEFAULT_VHOST: &str = "__defaultVhost__";

const fn default_true() -> bool {
    true
}

const fn default_chunk_size() -> u32 {
    4096
}

const fn default_ack_size() -> u32 {
    2_500_000
}

const fn default_mw_sleep_ms() -> u64 {
    350
}

const fn default_mw_msgs() -> usize {
    8
}

const fn default_publish_1stpkt_timeout_ms() -> u64 {
    20_000
}

const fn default_publish_normal_timeout_ms() -> u64 {
    5_000
}

fn default_rtmp_listen() -> String {
    "0.0.0.0:1935".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_mounts() -> Vec<String> {
    vec!["[vhost]/[app]/[stream]".to_string()]
}

/// RTMP ingest listener configuration.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct RtmpConfig {
    #[serde(default = "default_rtmp_listen")]
    pub listen: String,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self { listen: default_rtmp_listen() }
    }
}

/// HTTP live-egress listener configuration (component K).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct HttpConfig {
    /// Set to `None` to disable the HTTP egress listener entirely.
    #[serde(default = "default_http_listen")]
    pub listen: Option<String>,
    /// Mount templates matched against request paths, e.g. `[vhost]/[app]/[stream]`.
    #[serde(default = "default_mounts")]
    pub mounts: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { listen: Some(default_http_listen()), mounts: default_mounts() }
    }
}

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default = "default_log_file_path")]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

fn default_log_file_path() -> String {
    "./rtmpd.log".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: default_log_file_path(),
            file_format: LogFormat::default(),
        }
    }
}

/// One security rule: `allow`/`deny` a `verb` for connections matching `target`.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct SecurityRuleConfig {
    /// `"allow"` or `"deny"`.
    pub action: String,
    /// `"play"` or `"publish"`.
    pub verb: String,
    /// `"all"`, an IPv4 literal, or a CIDR range (`a.b.c.d/nn`).
    pub target: String,
}

/// Security gate configuration (`spec.md` §4.M).
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct SecurityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<SecurityRuleConfig>,
}

/// Page-referer suffix check configuration (`spec.md` §4.M).
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct ReferConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Suffixes applied to both play and publish if set; `play`/`publish`
    /// below narrow the check to that verb only.
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub play: Vec<String>,
    #[serde(default)]
    pub publish: Vec<String>,
}

/// HTTP-hooks endpoint lists (`spec.md` §4.J, §6).
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct HttpHooksConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub on_connect: Vec<String>,
    #[serde(default)]
    pub on_publish: Vec<String>,
    #[serde(default)]
    pub on_play: Vec<String>,
    #[serde(default)]
    pub on_stop: Vec<String>,
    #[serde(default)]
    pub on_unpublish: Vec<String>,
    #[serde(default)]
    pub on_close: Vec<String>,
}

/// Per-vhost configuration: every field named in `spec.md` §6's
/// "Environment/config" bullet.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct VhostConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub gop_cache: bool,
    #[serde(default)]
    pub realtime: bool,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    #[serde(default)]
    pub edge: bool,
    #[serde(default)]
    pub origin_cluster: bool,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_ack_size")]
    pub in_ack_size: u32,
    #[serde(default = "default_ack_size")]
    pub out_ack_size: u32,
    #[serde(default = "default_mw_sleep_ms")]
    pub mw_sleep_ms: u64,
    #[serde(default = "default_mw_msgs")]
    pub mw_msgs: usize,
    /// Minimum interval between consumer-queue flushes, in milliseconds;
    /// `0` disables the throttle.
    #[serde(default)]
    pub send_min_interval_ms: u64,
    #[serde(default = "default_publish_1stpkt_timeout_ms")]
    pub publish_1stpkt_timeout_ms: u64,
    #[serde(default = "default_publish_normal_timeout_ms")]
    pub publish_normal_timeout_ms: u64,

    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub refer: ReferConfig,
    #[serde(default)]
    pub http_hooks: HttpHooksConfig,

    /// Upstream origins tried in order by edge token-traverse
    /// (`spec.md` §4.J "Edge token traverse"), as `host:port` pairs.
    #[serde(default)]
    pub edge_origin: Vec<String>,
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gop_cache: true,
            realtime: false,
            tcp_nodelay: true,
            edge: false,
            origin_cluster: false,
            chunk_size: default_chunk_size(),
            in_ack_size: default_ack_size(),
            out_ack_size: default_ack_size(),
            mw_sleep_ms: default_mw_sleep_ms(),
            mw_msgs: default_mw_msgs(),
            send_min_interval_ms: 0,
            publish_1stpkt_timeout_ms: default_publish_1stpkt_timeout_ms(),
            publish_normal_timeout_ms: default_publish_normal_timeout_ms(),
            security: SecurityConfig::default(),
            refer: ReferConfig::default(),
            http_hooks: HttpHooksConfig::default(),
            edge_origin: Vec::new(),
        }
    }
}

fn default_vhosts() -> HashMap<String, VhostConfig> {
    let mut vhosts = HashMap::new();
    vhosts.insert(DEFAULT_VHOST.to_string(), VhostConfig::default());
    vhosts
}

/// Root configuration for the `rtmpd` server.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub rtmp: RtmpConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default = "default_vhosts")]
    pub vhosts: HashMap<String, VhostConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self { rtmp: RtmpConfig::default(), http: HttpConfig::default(), log: LogConfig::default(), vhosts: default_vhosts() }
    }
}

impl Config {
    /// Looks up a vhost by name, falling back to [`DEFAULT_VHOST`] when the
    /// requested vhost has no explicit entry.
    #[must_use]
    pub fn vhost(&self, name: &str) -> Option<&VhostConfig> {
        self.vhosts.get(name).or_else(|| self.vhosts.get(DEFAULT_VHOST))
    }
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and
/// environment variables (`RTMPD_` prefixed, `__` as the nesting separator).
///
/// # Errors
/// Returns an error if the configuration file exists but contains invalid
/// TOML, or if an environment variable overlay fails to deserialize into
/// [`Config`].
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment = Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config = figment.merge(Env::prefixed("RTMPD_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
/// Returns an error if the default configuration cannot be serialized to
/// TOML; extremely unlikely in practice.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_default_vhost() {
        let config = Config::default();
        assert!(config.vhosts.contains_key(DEFAULT_VHOST));
    }

    #[test]
    fn test_vhost_lookup_falls_back_to_default() {
        let config = Config::default();
        assert!(config.vhost("unknown-vhost").is_some());
    }

    #[test]
    fn test_generate_default_round_trips_through_toml() {
        let toml_string = generate_default().unwrap();
        let parsed: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(parsed.vhosts.len(), config_default_vhost_count());
    }

    fn config_default_vhost_count() -> usize {
        Config::default().vhosts.len()
    }
}
