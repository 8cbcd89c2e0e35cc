use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::MIN_FRAME_LEN;
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub timeouts: TimeoutConfig,
    pub streaming: StreamingConfig,
    pub limits: LimitConfig,
    pub monitoring: MonitoringConfig,
}

/// Where the engine process listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// Unix domain socket path
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Unix(PathBuf::from("/tmp/inference-engine.sock"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl FromStr for Endpoint {
    type Err = SessionError;

    /// Accepts `unix:<path>`, `tcp:<host:port>`, a bare path or a bare `host:port`
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(SessionError::Configuration {
                parameter: "endpoint".to_string(),
                message: "endpoint cannot be empty".to_string(),
            });
        }
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if s.starts_with('/') || s.starts_with('.') || !s.contains(':') {
            Ok(Endpoint::Unix(PathBuf::from(s)))
        } else {
            Ok(Endpoint::Tcp(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Opening the transport
    pub connect: Duration,

    /// Waiting for the engine to acknowledge `init`
    pub handshake: Duration,

    /// Waiting for any single frame of an in-flight request
    pub receive: Duration,

    /// Waiting for the engine to acknowledge `terminate`
    pub terminate: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            handshake: Duration::from_secs(30),
            receive: Duration::from_secs(60),
            terminate: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Chunks buffered between the receive path and the sink
    pub queue_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Largest frame accepted from the engine, header included
    pub max_frame_bytes: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Whether to collect per-session metrics
    pub enable_metrics: bool,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            log_level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(SessionError::Configuration {
                parameter: "log_level".to_string(),
                message: format!("unknown log level '{}'", other),
            }),
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: SessionConfig =
            serde_json::from_str(&contents).map_err(|e| SessionError::Configuration {
                parameter: path.display().to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("timeouts.connect", self.timeouts.connect),
            ("timeouts.handshake", self.timeouts.handshake),
            ("timeouts.receive", self.timeouts.receive),
            ("timeouts.terminate", self.timeouts.terminate),
        ];
        for (parameter, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(SessionError::Configuration {
                    message: "Timeout must be greater than zero".to_string(),
                    parameter: parameter.to_string(),
                });
            }
        }

        if self.streaming.queue_capacity == 0 {
            return Err(SessionError::Configuration {
                message: "Queue capacity must be greater than zero".to_string(),
                parameter: "streaming.queue_capacity".to_string(),
            });
        }

        if self.limits.max_frame_bytes < MIN_FRAME_LEN {
            return Err(SessionError::Configuration {
                message: format!("Frame limit must be at least {} bytes", MIN_FRAME_LEN),
                parameter: "limits.max_frame_bytes".to_string(),
            });
        }

        if let Endpoint::Unix(path) = &self.endpoint {
            if path.as_os_str().is_empty() {
                return Err(SessionError::Configuration {
                    message: "Socket path cannot be empty".to_string(),
                    parameter: "endpoint".to_string(),
                });
            }
        }

        Ok(())
    }
}
