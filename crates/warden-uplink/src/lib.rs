//! Ground-station uplink: best-effort HTTP posts from the background I/O
//! stage. Failed posts are spooled to disk and flushed when the link comes
//! back; nothing here may ever block the perception path.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use warden_proto::uplink::{DetectionReport, TargetReport, TelemetryReport, UploadItem};

#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    pub enable: bool,
    /// Ground-station base URL, e.g. "https://gs.example.net".
    pub base_url: String,
    /// Bearer token for the Authorization header.
    pub token: Option<String>,
    pub spool_dir: String,
    pub spool_max_mb: u64,
    pub timeout_s: Option<u64>,
}

/// Link quality tracking; drives the adaptive telemetry interval.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    pub rtt_ms: Option<u32>,
    pub quality: u8, // 0-100
    pub consecutive_failures: u32,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self {
            rtt_ms: None,
            quality: 100,
            consecutive_failures: 0,
        }
    }
}

pub struct UplinkClient {
    http: Client,
    base_url: String,
    token: Option<String>,
    spool_dir: PathBuf,
    spool_max_bytes: u64,
    health: LinkHealth,
}

impl UplinkClient {
    pub fn new(cfg: &UplinkConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_s.unwrap_or(5));
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("build uplink http client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            spool_dir: PathBuf::from(&cfg.spool_dir),
            spool_max_bytes: cfg.spool_max_mb * 1024 * 1024,
            health: LinkHealth::default(),
        })
    }

    pub fn link_health(&self) -> &LinkHealth {
        &self.health
    }

    /// Telemetry cadence recommendation from link quality, with exponential
    /// backoff after consecutive failures.
    pub fn recommended_interval_secs(&self) -> u64 {
        if self.health.consecutive_failures > 0 {
            let backoff = 30u64 << self.health.consecutive_failures.min(4);
            return backoff.min(600);
        }
        match self.health.quality {
            80..=100 => 30,
            50..=79 => 60,
            20..=49 => 120,
            _ => 300,
        }
    }

    pub fn send(&mut self, item: &UploadItem) -> Result<()> {
        match item {
            UploadItem::Telemetry(t) => self.post_json("/api/telemetry", t),
            UploadItem::Detections(d) => self.post_json("/api/detections", d),
            UploadItem::Target(t) => self.post_json("/api/targets", t),
        }
    }

    pub fn send_telemetry(&mut self, report: &TelemetryReport) -> Result<()> {
        self.post_json("/api/telemetry", report)
    }

    pub fn send_detections(&mut self, report: &DetectionReport) -> Result<()> {
        self.post_json("/api/detections", report)
    }

    pub fn send_target(&mut self, report: &TargetReport) -> Result<()> {
        self.post_json("/api/targets", report)
    }

    /// JPEG snapshot as multipart form data.
    pub fn send_image(&mut self, frame_id: u64, jpeg: Vec<u8>) -> Result<()> {
        let url = format!("{}/api/images", self.base_url);
        let part = reqwest::blocking::multipart::Part::bytes(jpeg)
            .file_name(format!("frame-{}.jpg", frame_id))
            .mime_str("image/jpeg")?;
        let form = reqwest::blocking::multipart::Form::new()
            .text("frame_id", frame_id.to_string())
            .part("image", part);

        let start = Instant::now();
        let mut req = self.http.post(&url).multipart(form);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let result = req
            .send()
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(anyhow::Error::from);
        self.note_result(start, result)
    }

    fn post_json<T: serde::Serialize>(&mut self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let start = Instant::now();
        let mut req = self.http.post(&url).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let result = req
            .send()
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(anyhow::Error::from);

        match self.note_result(start, result) {
            Ok(()) => Ok(()),
            Err(e) => {
                // keep the record for a later flush
                if let Err(se) = self.spool_json(path, body) {
                    warn!("spool write failed: {:#}", se);
                }
                Err(e)
            }
        }
    }

    fn note_result(&mut self, start: Instant, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                let rtt = start.elapsed().as_millis() as u32;
                self.health.rtt_ms = Some(rtt);
                self.health.consecutive_failures = 0;
                self.health.quality = (self.health.quality + 10).min(100);
                debug!(rtt_ms = rtt, quality = self.health.quality, "uplink ok");
                Ok(())
            }
            Err(e) => {
                self.health.consecutive_failures += 1;
                self.health.quality = self.health.quality.saturating_sub(20);
                warn!(
                    failures = self.health.consecutive_failures,
                    quality = self.health.quality,
                    "uplink send failed: {:#}",
                    e
                );
                Err(e)
            }
        }
    }

    // ---- spool ----

    fn spool_json<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<()> {
        std::fs::create_dir_all(&self.spool_dir)?;
        if self.spool_usage_bytes()? >= self.spool_max_bytes {
            anyhow::bail!("spool full ({} bytes)", self.spool_max_bytes);
        }
        let kind = path.trim_start_matches("/api/").replace('/', "_");
        let name = format!(
            "{}-{}.json",
            time::OffsetDateTime::now_utc().unix_timestamp_nanos(),
            kind
        );
        let record = SpoolRecord {
            path: path.to_string(),
            body: serde_json::to_value(body)?,
        };
        std::fs::write(self.spool_dir.join(name), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    fn spool_usage_bytes(&self) -> Result<u64> {
        let mut total = 0;
        if !self.spool_dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.spool_dir)? {
            total += entry?.metadata()?.len();
        }
        Ok(total)
    }

    /// Replay spooled records oldest-first. Stops at the first failure so
    /// the rest stay on disk for the next pass.
    pub fn flush_spool(&mut self) -> Result<usize> {
        if !self.spool_dir.exists() {
            return Ok(0);
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.spool_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut flushed = 0;
        for file in paths {
            let record: SpoolRecord = match read_record(&file) {
                Ok(r) => r,
                Err(e) => {
                    warn!("dropping unreadable spool file {:?}: {:#}", file, e);
                    let _ = std::fs::remove_file(&file);
                    continue;
                }
            };
            let url = format!("{}{}", self.base_url, record.path);
            let start = Instant::now();
            let mut req = self.http.post(&url).json(&record.body);
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            let result = req
                .send()
                .and_then(|r| r.error_for_status())
                .map(|_| ())
                .map_err(anyhow::Error::from);
            self.note_result(start, result)?;
            std::fs::remove_file(&file).ok();
            flushed += 1;
        }
        if flushed > 0 {
            info!(flushed, "uplink spool drained");
        }
        Ok(flushed)
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SpoolRecord {
    path: String,
    body: serde_json::Value,
}

fn read_record(path: &Path) -> Result<SpoolRecord> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
