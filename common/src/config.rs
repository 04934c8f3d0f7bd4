//! Configuration – read from the process environment, optionally layered
//! over a `KEY=VALUE` file.
//!
//! Every required key is checked up front so a misconfigured deployment
//! fails once with the full list of what is missing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::info;

/// Keys that must be present in every capture mode.
const REQUIRED: &[&str] = &[
    "SAVE_DIR",
    "ERROR_DIR",
    "MQTT_BROKER",
    "MQTT_PORT",
    "MQTT_TOPIC_TRIGGER",
    "MQTT_TOPIC_STATUS",
    "TLS_VERIFY",
];

/// Extra keys required by [`CaptureMode::Web`].
const REQUIRED_WEB: &[&str] = &[
    "CAMERA_USER",
    "CAMERA_PASS",
    "CAMERA_IP",
    "SNAPSHOT_URL_TEMPLATE",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Which capture strategy the daemon runs for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Fetch the camera's HTTP snapshot endpoint.
    Web,
    /// Decode a single frame from the camera's media stream.
    Stream,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Stream => "stream",
        }
    }
}

/// What the dispatcher does with a trigger when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the incoming trigger.
    Reject,
    /// Evict the oldest queued job to make room.
    DropOldest,
    /// Make the receive path wait for space.
    Block,
}

/// Camera credentials and URL template for [`CaptureMode::Web`].
#[derive(Clone)]
pub struct CameraConfig {
    pub ip: String,
    pub user: String,
    pub password: String,
    pub url_template: String,
}

impl std::fmt::Debug for CameraConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraConfig")
            .field("ip", &self.ip)
            .field("user", &self.user)
            .field("password", &"***")
            .field("url_template", &self.url_template)
            .finish()
    }
}

#[derive(Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_trigger: String,
    pub topic_status: String,
    /// MQTT QoS level, 0..=2.
    pub qos: u8,
    pub client_id: String,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("topic_trigger", &self.topic_trigger)
            .field("topic_status", &self.topic_status)
            .field("qos", &self.qos)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Job scheduling.  `workers == 0` (the default) means one task per trigger,
/// no cap.  `queue_size` and `overflow` only apply once a pool is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub overflow: OverflowPolicy,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            workers: 0,
            queue_size: 32,
            overflow: OverflowPolicy::Reject,
        }
    }
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── storage ──────────────────────────────────────────────────────
    pub save_dir: PathBuf,
    pub error_dir: PathBuf,

    // ── broker ───────────────────────────────────────────────────────
    pub mqtt: MqttConfig,

    // ── capture ──────────────────────────────────────────────────────
    pub mode: CaptureMode,
    /// Only present in [`CaptureMode::Web`].
    pub camera: Option<CameraConfig>,
    pub stream_url: Option<String>,
    pub ffmpeg_bin: String,
    pub stream_timeout: Duration,
    pub tls_verify: bool,

    // ── runtime ──────────────────────────────────────────────────────
    pub jobs: JobConfig,
    pub log_level: String,
}

impl Config {
    /// Name of the error log inside `error_dir`.
    pub fn error_log_path(&self) -> PathBuf {
        self.error_dir.join("error.log")
    }

    /// Load from the environment, layered over `file` when one is given.
    pub fn from_env(file: Option<&Path>) -> Result<Config> {
        let mut map = match file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Cannot read config: {}", path.display()))?;
                parse_conf(&text)
            }
            None => HashMap::new(),
        };
        map.extend(std::env::vars());
        let config = Config::from_map(&map)?;
        if let Some(path) = file {
            info!("Loaded config from {} and environment", path.display());
        }
        Ok(config)
    }

    /// Build and validate a config from a key/value map.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Config, ConfigError> {
        let get = |key: &str| -> Option<String> { map.get(key).cloned() };
        let get_opt = |key: &str| -> Option<String> { get(key).filter(|s| !s.is_empty()) };

        let mode = match get_opt("CAPTURE_MODE").as_deref() {
            None => CaptureMode::Web,
            Some(m) if m.eq_ignore_ascii_case("web") => CaptureMode::Web,
            Some(m) if m.eq_ignore_ascii_case("stream") => CaptureMode::Stream,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "CAPTURE_MODE",
                    value: other.to_string(),
                    reason: "expected 'web' or 'stream'",
                })
            }
        };

        let mode_keys: &[&str] = match mode {
            CaptureMode::Web => REQUIRED_WEB,
            CaptureMode::Stream => &[],
        };
        let mut missing: Vec<String> = REQUIRED
            .iter()
            .chain(mode_keys)
            .filter(|key| !map.contains_key(**key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(ConfigError::Missing(missing));
        }

        // Presence was checked above.
        let req = |key: &str| map.get(key).cloned().unwrap_or_default();

        let port = parse_required_num::<u16>(map, "MQTT_PORT")?;
        let qos = parse_num::<u8>(map, "QOS")?.unwrap_or(1);
        if qos > 2 {
            return Err(ConfigError::Invalid {
                key: "QOS",
                value: qos.to_string(),
                reason: "expected 0, 1 or 2",
            });
        }

        let camera = match mode {
            CaptureMode::Web => Some(CameraConfig {
                ip: req("CAMERA_IP"),
                user: req("CAMERA_USER"),
                password: req("CAMERA_PASS"),
                url_template: req("SNAPSHOT_URL_TEMPLATE"),
            }),
            CaptureMode::Stream => None,
        };

        let overflow = match get_opt("JOB_OVERFLOW").as_deref() {
            None => JobConfig::default().overflow,
            Some("reject") => OverflowPolicy::Reject,
            Some("drop_oldest") => OverflowPolicy::DropOldest,
            Some("block") => OverflowPolicy::Block,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "JOB_OVERFLOW",
                    value: other.to_string(),
                    reason: "expected 'reject', 'drop_oldest' or 'block'",
                })
            }
        };
        let jobs = JobConfig {
            workers: parse_num(map, "JOB_WORKERS")?.unwrap_or(JobConfig::default().workers),
            queue_size: parse_num::<usize>(map, "JOB_QUEUE_SIZE")?
                .unwrap_or(JobConfig::default().queue_size)
                .max(1),
            overflow,
        };

        let client_id = get_opt("CLIENT_ID").unwrap_or_else(|| {
            format!("snapper-{}", chrono::Utc::now().timestamp())
        });

        Ok(Config {
            save_dir: PathBuf::from(req("SAVE_DIR")),
            error_dir: PathBuf::from(req("ERROR_DIR")),
            mqtt: MqttConfig {
                broker: req("MQTT_BROKER"),
                port,
                username: get_opt("MQTT_USER"),
                password: get("MQTT_PASS"),
                topic_trigger: req("MQTT_TOPIC_TRIGGER"),
                topic_status: req("MQTT_TOPIC_STATUS"),
                qos,
                client_id,
            },
            mode,
            camera,
            stream_url: get_opt("STREAM_URL"),
            ffmpeg_bin: get_opt("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".into()),
            stream_timeout: Duration::from_secs(
                parse_num(map, "STREAM_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            tls_verify: parse_bool(&req("TLS_VERIFY")),
            jobs,
            log_level: get_opt("LOG_LEVEL").unwrap_or_else(|| "info".into()),
        })
    }
}

/// `0`, `false`, `False` and the empty string are false; anything else is true.
pub fn parse_bool(value: &str) -> bool {
    !matches!(value, "0" | "false" | "False" | "")
}

fn parse_num<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| ConfigError::Invalid {
            key,
            value: v.to_string(),
            reason: "not a number",
        }),
    }
}

/// Like [`parse_num`] for keys that must hold a value: blank is an error.
fn parse_required_num<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    key: &'static str,
) -> Result<T, ConfigError> {
    parse_num(map, key)?.ok_or_else(|| ConfigError::Invalid {
        key,
        value: map.get(key).cloned().unwrap_or_default(),
        reason: "not a number",
    })
}

/// Parse an env-file: `KEY=VALUE` lines, optionally prefixed with `export`.
///
/// A value wrapped in a matching pair of `"` or `'` is taken verbatim;
/// unquoted values end at ` #`.  Lines without `=` or with an empty key are
/// skipped.
fn parse_conf(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, raw) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), conf_value(raw.trim()).to_string()))
        })
        .collect()
}

fn conf_value(raw: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    match raw.find(" #") {
        Some(at) => raw[..at].trim_end(),
        None => raw,
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
