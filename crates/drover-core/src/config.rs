//! Configuration system for Drover.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DROVER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/drover/config.toml
//!   3. ~/.config/drover/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub manager: ManagerConfig,
    pub payments: PaymentConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the manager's private key file. Auto-generated on first run.
    /// The signing key derives from the first 32 bytes of this file.
    pub private_key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// WebSocket p2p transport port.
    pub port: u16,
    /// HTTP transport + admin surface port.
    pub http_port: u16,
    /// Bind addresses for both listeners.
    pub listen: Vec<String>,
    /// Addresses advertised in the identify response.
    pub announce: Vec<String>,
    /// Mount the admin routes on the HTTP listener.
    pub with_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Run the dispatch step on every cycle tick.
    pub auto_manage: bool,
    /// Gate worker onboarding on single-use access codes.
    pub require_access_codes: bool,
    /// Access codes seeded into the whitelist at startup. Each admits
    /// one worker; consumed codes stay consumed across restarts.
    pub access_codes: Vec<String>,
    /// Seconds a task may stay Offered before the sweep expires it.
    pub task_acceptance_secs: u64,
    /// Cycle tick cadence in milliseconds.
    pub tick_interval_ms: u64,
    /// Bound on the graceful-stop drain of in-flight Accepted tasks.
    pub drain_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Max records a single proof batch may span.
    pub payment_batch_size: u64,
    /// Hex-encoded 32-byte address authorized to receive settlements.
    /// Payments are disabled while unset.
    pub payment_account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the filesystem store.
    pub root: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            manager: ManagerConfig::default(),
            payments: PaymentConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            private_key_path: config_dir().join("identity"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 19955,
            http_port: 8889,
            listen: vec!["0.0.0.0".to_string()],
            announce: Vec::new(),
            with_admin: true,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            auto_manage: true,
            require_access_codes: true,
            access_codes: Vec::new(),
            task_acceptance_secs: 30,
            tick_interval_ms: 1000,
            drain_deadline_secs: 10,
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            payment_batch_size: 100,
            payment_account: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("store"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("drover")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("drover")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid payment account {0}: must be 32 hex-encoded bytes")]
    BadPaymentAccount(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DroverConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DroverConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DROVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DroverConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The configured settlement account, decoded. None = payments disabled.
    pub fn payment_account_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        match &self.payments.payment_account {
            None => Ok(None),
            Some(hex_str) => {
                let bytes = hex::decode(hex_str)
                    .map_err(|_| ConfigError::BadPaymentAccount(hex_str.clone()))?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| ConfigError::BadPaymentAccount(hex_str.clone()))?;
                Ok(Some(arr))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // Fail at load time rather than at first accrual.
        self.payment_account_bytes()?;
        Ok(())
    }

    /// Apply DROVER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DROVER_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("DROVER_NETWORK__HTTP_PORT") {
            if let Ok(p) = v.parse() {
                self.network.http_port = p;
            }
        }
        if let Ok(v) = std::env::var("DROVER_NETWORK__WITH_ADMIN") {
            self.network.with_admin = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DROVER_MANAGER__AUTO_MANAGE") {
            self.manager.auto_manage = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DROVER_MANAGER__REQUIRE_ACCESS_CODES") {
            self.manager.require_access_codes = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DROVER_MANAGER__TASK_ACCEPTANCE_SECS") {
            if let Ok(s) = v.parse() {
                self.manager.task_acceptance_secs = s;
            }
        }
        if let Ok(v) = std::env::var("DROVER_PAYMENTS__PAYMENT_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.payments.payment_batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("DROVER_PAYMENTS__PAYMENT_ACCOUNT") {
            self.payments.payment_account = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("DROVER_STORE__ROOT") {
            self.store.root = PathBuf::from(v);
        }
    }
}
