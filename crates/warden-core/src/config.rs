use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::retry::RetryPolicy;
use crate::server::LaunchSpec;

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(name: &str, default: &str) -> PathBuf {
    absolutize(PathBuf::from(
        env_string(name).unwrap_or_else(|| default.to_string()),
    ))
}

fn absolutize(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        return p;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(p)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub launch: LaunchSpec,
    /// Relative to the working directory.
    pub lock_file: PathBuf,
    pub stop_command: String,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub artifact: PathBuf,
    pub download_url: Option<String>,
    pub sha1: Option<String>,
    pub args: Vec<String>,
    pub retry: RetryPolicy,
    pub stop_grace: Duration,
}

impl TunnelConfig {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
            download_url: None,
            sha1: None,
            args: Vec::new(),
            retry: RetryPolicy::default(),
            stop_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub interval: Duration,
    pub alert_percent: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            alert_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub freshness: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsoleLogConfig {
    pub max_lines: usize,
    pub file_max_bytes: u64,
    pub file_max_files: usize,
}

#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub data_root: PathBuf,
    pub server: ServerConfig,
    pub tunnel: TunnelConfig,
    pub sampler: SamplerConfig,
    pub snapshot: SnapshotConfig,
    pub console_log: ConsoleLogConfig,
}

impl WardenConfig {
    pub fn from_env() -> Self {
        let jar = env_path("WARDEN_SERVER_JAR", "./server/server.jar");
        let java = env_string("WARDEN_JAVA").unwrap_or_else(|| "java".to_string());
        let memory_mb = env_u64("WARDEN_MEMORY_MB")
            .map(|v| v.clamp(512, 65536) as u32)
            .unwrap_or(2048);

        let server = ServerConfig {
            launch: LaunchSpec::java_jar(java, &jar, memory_mb),
            lock_file: env_string("WARDEN_LOCK_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| Path::new("world").join("session.lock")),
            stop_command: env_string("WARDEN_STOP_COMMAND").unwrap_or_else(|| "stop".to_string()),
            stop_timeout: Duration::from_secs(
                env_u64("WARDEN_STOP_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(30),
            ),
        };

        let base_ms = env_u64("WARDEN_TUNNEL_BACKOFF_MS")
            .map(|v| v.clamp(100, 10 * 60 * 1000))
            .unwrap_or(1000);
        let cap_ms = env_u64("WARDEN_TUNNEL_BACKOFF_MAX_MS")
            .map(|v| v.clamp(base_ms, 60 * 60 * 1000))
            .unwrap_or(30_000.max(base_ms));

        let tunnel = TunnelConfig {
            artifact: env_path("WARDEN_TUNNEL_BIN", "./tunnel/playit"),
            download_url: env_string("WARDEN_TUNNEL_URL"),
            sha1: env_string("WARDEN_TUNNEL_SHA1").map(|s| s.to_ascii_lowercase()),
            args: env_string("WARDEN_TUNNEL_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            retry: RetryPolicy {
                base: Duration::from_millis(base_ms),
                cap: Duration::from_millis(cap_ms),
            },
            stop_grace: Duration::from_millis(
                env_u64("WARDEN_TUNNEL_STOP_GRACE_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(3000),
            ),
        };

        let sampler = SamplerConfig {
            interval: Duration::from_millis(
                env_u64("WARDEN_SAMPLE_INTERVAL_MS")
                    .map(|v| v.clamp(250, 60_000))
                    .unwrap_or(5000),
            ),
            alert_percent: env_u64("WARDEN_MEMORY_ALERT_PERCENT")
                .map(|v| v.clamp(1, 100) as f64)
                .unwrap_or(90.0),
        };

        let snapshot = SnapshotConfig {
            path: env_string("WARDEN_SNAPSHOT_FILE").map(|p| absolutize(PathBuf::from(p))),
            poll_interval: Duration::from_millis(
                env_u64("WARDEN_SNAPSHOT_POLL_MS")
                    .map(|v| v.clamp(250, 10 * 60 * 1000))
                    .unwrap_or(5000),
            ),
            freshness: Duration::from_millis(
                env_u64("WARDEN_SNAPSHOT_FRESH_MS")
                    .map(|v| v.clamp(0, 10 * 60 * 1000))
                    .unwrap_or(5000),
            ),
        };

        let console_log = ConsoleLogConfig {
            max_lines: env_usize("WARDEN_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(DEFAULT_LOG_MAX_LINES),
            file_max_bytes: env_u64("WARDEN_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES),
            file_max_files: env_usize("WARDEN_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES),
        };

        let data_root = env_path("WARDEN_DATA_ROOT", "./data");
        // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
        let data_root = std::fs::canonicalize(&data_root).unwrap_or(data_root);

        Self {
            data_root,
            server,
            tunnel,
            sampler,
            snapshot,
            console_log,
        }
    }
}
