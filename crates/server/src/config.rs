//! Server configuration management

use crate::service::Limits;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub security: SecuritySettings,
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// USB/IP listener address
    pub usbip_addr: String,
    /// Management + device-stream listener address
    pub control_addr: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Require the authenticated session handshake on every connection
    pub auth: bool,
    /// Password file override; default is viiper.key.txt in the platform
    /// config directory
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// How long a freshly created device may stay unclaimed
    pub claim_timeout_ms: u64,
    /// Session handshake deadline; VIIPER_CONNECTION_TIMEOUT (ms) overrides
    pub handshake_timeout_ms: u64,
    /// Total deadline for one management request
    pub request_timeout_ms: u64,
    /// Drain window for URB loops on shutdown and forced detach
    pub drain_timeout_ms: u64,
    /// Bound of each device's feedback queue
    pub feedback_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            usbip_addr: "0.0.0.0:3240".to_string(),
            control_addr: "0.0.0.0:3242".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            auth: true,
            key_file: None,
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            claim_timeout_ms: 2000,
            handshake_timeout_ms: 5000,
            request_timeout_ms: 30_000,
            drain_timeout_ms: 2000,
            feedback_queue: 64,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            security: SecuritySettings::default(),
            limits: LimitSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path or the standard
    /// locations, then apply environment overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/viiper/server.toml")];
            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("no configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;

        let mut config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", config_path.display()))?;

        config.apply_env();
        config.validate()?;

        tracing::info!("loaded configuration from {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or fall back to defaults (plus env overrides).
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("using default configuration: {}", e);
                let mut config = Self::default();
                config.apply_env();
                config
            }
        }
    }

    /// Save configuration (used by `viiper config init`).
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }

        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        tracing::info!("saved configuration to {}", path.display());
        Ok(())
    }

    /// Default configuration file path.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("viiper").join("server.toml")
        } else {
            PathBuf::from(".config/viiper/server.toml")
        }
    }

    /// Expand a user-supplied path (`~`, env vars) into a real one.
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).as_ref())
    }

    /// Environment overrides recognized by the runtime. VIIPER_CODEGEN_*
    /// belongs to the offline SDK generator and is ignored here.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("VIIPER_CONNECTION_TIMEOUT")
            && let Ok(ms) = value.parse::<u64>()
        {
            self.limits.handshake_timeout_ms = ms;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if !common::logging::is_valid_level(&self.server.log_level) {
            return Err(anyhow!(
                "invalid log level '{}', must be one of: {}",
                self.server.log_level,
                common::logging::LOG_LEVELS.join(", ")
            ));
        }

        for (name, addr) in [
            ("server.usbip_addr", &self.server.usbip_addr),
            ("server.control_addr", &self.server.control_addr),
        ] {
            addr.parse::<SocketAddr>()
                .map_err(|_| anyhow!("invalid {} '{}'", name, addr))?;
        }

        if self.limits.feedback_queue == 0 {
            return Err(anyhow!("limits.feedback_queue must be at least 1"));
        }
        Ok(())
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.claim_timeout_ms)
    }

    pub fn timeout_limits(&self) -> Limits {
        Limits {
            handshake_timeout: Duration::from_millis(self.limits.handshake_timeout_ms),
            request_timeout: Duration::from_millis(self.limits.request_timeout_ms),
            drain_timeout: Duration::from_millis(self.limits.drain_timeout_ms),
        }
    }
}
