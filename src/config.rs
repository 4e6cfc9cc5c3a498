//! Runtime configuration with defaults and environment overrides.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the directory holding both service sockets.
pub const SOCKET_DIR_ENV: &str = "APPFADERS_SOCKET_DIR";
/// Overrides the client request timeout, in milliseconds.
pub const TIMEOUT_ENV: &str = "APPFADERS_TIMEOUT_MS";
/// Maximum tracing level (`error`, `warn`, `info`, `debug`, `trace`).
pub const LOG_ENV: &str = "APPFADERS_LOG";

const TRUSTED_SOCKET_NAME: &str = "appfaders-trusted.sock";
const RESTRICTED_SOCKET_NAME: &str = "appfaders-restricted.sock";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
/// Fills an 8192 slot ring exactly, roughly 170 ms at 48 kHz.
const DEFAULT_CAPACITY_FRAMES: usize = 8_191;
const DEFAULT_CHANNELS: usize = 2;
const DEFAULT_MAX_CONNECTIONS: usize = 64;

fn default_socket_dir() -> PathBuf {
    if let Some(dir) = env::var_os(SOCKET_DIR_ENV) {
        return PathBuf::from(dir);
    }
    match env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime) => PathBuf::from(runtime).join("appfaders"),
        None => env::temp_dir().join("appfaders"),
    }
}

fn timeout_from_env() -> Duration {
    env::var(TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
}

/// Where the authoritative service listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Directory created to hold the sockets.
    pub socket_dir: PathBuf,
    /// Read-write endpoint for the gain-setting client.
    pub trusted_socket: PathBuf,
    /// Read-only endpoint for the real-time side.
    pub restricted_socket: PathBuf,
    /// Live connections allowed per socket; further connections are closed.
    pub max_connections: usize,
}

impl ServiceConfig {
    /// Both sockets inside `dir` with their standard names.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            socket_dir: dir.to_path_buf(),
            trusted_socket: dir.join(TRUSTED_SOCKET_NAME),
            restricted_socket: dir.join(RESTRICTED_SOCKET_NAME),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Default locations, honouring [`SOCKET_DIR_ENV`].
    pub fn from_env() -> Self {
        Self::in_dir(default_socket_dir())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Trusted client settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Trusted socket to dial.
    pub socket: PathBuf,
    /// Per request read/write timeout.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Client for the trusted socket of `service`.
    pub fn for_service(service: &ServiceConfig) -> Self {
        Self {
            socket: service.trusted_socket.clone(),
            request_timeout: timeout_from_env(),
        }
    }
}

/// Cache bridge settings.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Restricted socket to dial.
    pub socket: PathBuf,
    /// Fixed delay between losing the service and the next connect attempt.
    pub reconnect_backoff: Duration,
    /// Period of the scheduled refresh while connected.
    pub refresh_interval: Duration,
    /// Per request timeout for refresh calls.
    pub request_timeout: Duration,
}

impl BridgeConfig {
    /// Bridge for the restricted socket of `service`.
    pub fn for_service(service: &ServiceConfig) -> Self {
        Self {
            socket: service.restricted_socket.clone(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            request_timeout: timeout_from_env(),
        }
    }
}

/// Passthrough engine settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Minimum ring capacity in frames, rounded up to a power of two.
    pub capacity_frames: usize,
    /// Interleaved channels carried by the ring.
    pub channels: usize,
    /// Back the ring with an anonymous shared mapping instead of the heap.
    pub shared_memory: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity_frames: DEFAULT_CAPACITY_FRAMES,
            channels: DEFAULT_CHANNELS,
            shared_memory: false,
        }
    }
}

/// Parse [`LOG_ENV`] into a tracing level, defaulting to `INFO`.
pub fn log_level_from_env() -> tracing::Level {
    env::var(LOG_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO)
}
