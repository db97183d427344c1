use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level settings (termbridge.toml)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Name of the shared sandbox container. The bridge never creates or
    /// starts it; external tooling owns its lifecycle.
    #[serde(default = "default_container_name")]
    pub name: String,
    /// Shell launched for each session exec
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Non-privileged user the exec runs as
    #[serde(default = "default_exec_user")]
    pub user: String,
}

fn default_container_name() -> String {
    "terminal-shared".to_string()
}

fn default_shell() -> String {
    "/bin/zsh".to_string()
}

fn default_exec_user() -> String {
    "workspace".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: default_container_name(),
            shell: default_shell(),
            user: default_exec_user(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Connections allowed per client IP within a 60 s window
    #[serde(default = "default_rate_limit_connections")]
    pub rate_limit_connections: u32,
    /// Input frames allowed per connection within a 3600 s window
    #[serde(default = "default_rate_limit_commands")]
    pub rate_limit_commands: u32,
    /// Seconds of inactivity before a session is reaped
    #[serde(default = "default_session_idle_timeout_sec")]
    pub session_idle_timeout_sec: u64,
    /// Largest accepted inbound frame, in UTF-8 bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Cumulative input allowed per session, in bytes
    #[serde(default = "default_max_input_per_session_bytes")]
    pub max_input_per_session_bytes: u64,
    /// Read size for the PTY reader task
    #[serde(default = "default_pty_chunk_bytes")]
    pub pty_chunk_bytes: usize,
}

fn default_rate_limit_connections() -> u32 {
    10
}

fn default_rate_limit_commands() -> u32 {
    1000
}

fn default_session_idle_timeout_sec() -> u64 {
    1800
}

fn default_max_frame_bytes() -> usize {
    65_536
}

fn default_max_input_per_session_bytes() -> u64 {
    10_485_760
}

fn default_pty_chunk_bytes() -> usize {
    4096
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limit_connections: default_rate_limit_connections(),
            rate_limit_commands: default_rate_limit_commands(),
            session_idle_timeout_sec: default_session_idle_timeout_sec(),
            max_frame_bytes: default_max_frame_bytes(),
            max_input_per_session_bytes: default_max_input_per_session_bytes(),
            pty_chunk_bytes: default_pty_chunk_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origins")]
    pub origins: Vec<String>,
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: default_cors_origins(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. No path, or a missing file, means
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(settings)
    }
}
