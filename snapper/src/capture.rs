//! Snapshot capture – fetches a JPEG from the camera's HTTP snapshot
//! endpoint, or decodes a single frame from its media stream with ffmpeg.
//!
//! The strategy is picked once at startup from `CAPTURE_MODE`; the rest of
//! the daemon only sees `Arc<dyn CaptureStrategy>`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use snapper_common::config::{CameraConfig, CaptureMode, Config};
use snapper_common::protocol::CaptureRequest;
use snapper_common::snapshot;

/// Upper bound for one snapshot HTTP request, body included.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Distinguishes temporary download files of concurrent jobs.
static PART_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("snapshot request failed: {0}")]
    Http(reqwest::Error),
    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stream URL is not configured (set STREAM_URL)")]
    StreamNotConfigured,
    #[error("cannot run {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{bin} exited with {status}")]
    Decoder { bin: String, status: ExitStatus },
    #[error("{bin} timed out after {}s", timeout.as_secs())]
    Timeout { bin: String, timeout: Duration },
}

impl From<reqwest::Error> for CaptureError {
    /// Strips the URL: it carries the camera credentials.
    fn from(e: reqwest::Error) -> Self {
        CaptureError::Http(e.without_url())
    }
}

/// One way of getting a still image out of the camera.
#[async_trait]
pub trait CaptureStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Take one snapshot and return the path it was written to.
    async fn capture(&self, request: &CaptureRequest) -> Result<PathBuf, CaptureError>;
}

/// Build the strategy selected by `config.mode`.
pub fn from_config(config: &Config) -> Result<Arc<dyn CaptureStrategy>> {
    let save_dir = std::path::absolute(&config.save_dir)
        .with_context(|| format!("Cannot resolve {}", config.save_dir.display()))?;

    let strategy: Arc<dyn CaptureStrategy> = match config.mode {
        CaptureMode::Web => {
            let camera = config
                .camera
                .clone()
                .context("Web capture mode needs camera settings")?;
            Arc::new(WebSnapshot::new(camera, save_dir, config.tls_verify)?)
        }
        CaptureMode::Stream => {
            if config.stream_url.is_none() {
                warn!("CAPTURE_MODE=stream but STREAM_URL is not set – every capture will fail");
            }
            Arc::new(StreamFrame {
                stream_url: config.stream_url.clone(),
                ffmpeg_bin: config.ffmpeg_bin.clone(),
                timeout: config.stream_timeout,
                save_dir,
            })
        }
    };

    info!("Capture strategy: {}", strategy.name());
    Ok(strategy)
}

// ── direct HTTP snapshot ─────────────────────────────────────────────────

pub struct WebSnapshot {
    client: reqwest::Client,
    camera: CameraConfig,
    save_dir: PathBuf,
}

impl WebSnapshot {
    pub fn new(camera: CameraConfig, save_dir: PathBuf, tls_verify: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(!tls_verify)
            .build()
            .context("Cannot create HTTP client")?;
        Ok(WebSnapshot {
            client,
            camera,
            save_dir,
        })
    }

    /// Fill `{ip}`, `{user}` and `{password}` into the URL template.
    ///
    /// Substitution is literal: values are not URL-encoded, and text
    /// inside a substituted value is never expanded again.
    pub fn snapshot_url(&self) -> String {
        let vars = [
            ("ip", self.camera.ip.as_str()),
            ("user", self.camera.user.as_str()),
            ("password", self.camera.password.as_str()),
        ];
        let template = &self.camera.url_template;
        let mut out = String::with_capacity(template.len());
        let mut rest = template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open + 1..];
            let var = tail
                .find('}')
                .and_then(|close| vars.iter().find(|(k, _)| *k == &tail[..close]));
            match var {
                Some((key, value)) => {
                    out.push_str(value);
                    rest = &tail[key.len() + 1..];
                }
                None => {
                    out.push('{');
                    rest = tail;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[async_trait]
impl CaptureStrategy for WebSnapshot {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<PathBuf, CaptureError> {
        let url = self.snapshot_url();
        let path = snapshot::output_path(&self.save_dir, &request.prefix);
        info!("Requesting snapshot from camera {}", self.camera.ip);

        let mut resp = self.client.get(&url).send().await?.error_for_status()?;

        // Stream into a private temp file so a failed download never
        // leaves a truncated snapshot behind.
        let part = part_path(&path);
        if let Err(e) = write_body(&mut resp, &part).await {
            tokio::fs::remove_file(&part).await.ok();
            return Err(e);
        }
        tokio::fs::rename(&part, &path)
            .await
            .map_err(|source| CaptureError::Io {
                path: path.clone(),
                source,
            })?;

        info!("Saved snapshot to {}", path.display());
        Ok(path)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let n = PART_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!(".{name}.{}.{n}.part", std::process::id()))
}

async fn write_body(resp: &mut reqwest::Response, part: &Path) -> Result<(), CaptureError> {
    let io_err = |source| CaptureError::Io {
        path: part.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(part).await.map_err(io_err)?;
    let mut written = 0usize;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len();
    }
    file.flush().await.map_err(io_err)?;
    debug!("Wrote {written} bytes to {}", part.display());
    Ok(())
}

// ── single frame from a media stream ─────────────────────────────────────

pub struct StreamFrame {
    pub stream_url: Option<String>,
    pub ffmpeg_bin: String,
    pub timeout: Duration,
    pub save_dir: PathBuf,
}

/// ffmpeg arguments to grab exactly one frame from `url` into `out`.
fn decoder_args(url: &str, out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        "-rtsp_transport",
        "tcp",
        "-i",
        url,
        "-frames:v",
        "1",
        "-q:v",
        "2",
        "-y",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(out.as_os_str().to_owned());
    args
}

#[async_trait]
impl CaptureStrategy for StreamFrame {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<PathBuf, CaptureError> {
        let url = self
            .stream_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(CaptureError::StreamNotConfigured)?;
        let path = snapshot::output_path(&self.save_dir, &request.prefix);

        info!("Grabbing one frame from stream into {}", path.display());
        let mut child = Command::new(&self.ffmpeg_bin)
            .args(decoder_args(url, &path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                bin: self.ffmpeg_bin.clone(),
                source,
            })?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|source| CaptureError::Spawn {
                bin: self.ffmpeg_bin.clone(),
                source,
            })?,
            Err(_) => {
                child.kill().await.ok();
                return Err(CaptureError::Timeout {
                    bin: self.ffmpeg_bin.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if !status.success() {
            return Err(CaptureError::Decoder {
                bin: self.ffmpeg_bin.clone(),
                status,
            });
        }

        info!("Saved snapshot to {}", path.display());
        Ok(path)
    }
}
