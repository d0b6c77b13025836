//! Configuration for FxBlox onboarding tools.
//!
//! TOML settings file, `FXBLOX_` environment overrides, Wi-Fi credential
//! resolution (env + keyring + plaintext), and translation to
//! `fxblox_core::BloxConfig`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fxblox_core::{
    BloxConfig, DialPolicy, HealthPolicy, HotspotPolicy, HotspotSelection, WifiCredentials,
};

const KEYRING_SERVICE: &str = "fxblox";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no Wi-Fi password configured for '{ssid}'")]
    NoCredentials { ssid: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub hotspot: HotspotSection,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub dial: DialSection,

    #[serde(default)]
    pub health: HealthSection,

    /// Known target networks, keyed by SSID.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HotspotSection {
    #[serde(default = "default_ssid_prefix")]
    pub ssid_prefix: String,

    #[serde(default)]
    pub selection: HotspotSelection,
}

impl Default for HotspotSection {
    fn default() -> Self {
        Self {
            ssid_prefix: default_ssid_prefix(),
            selection: HotspotSelection::default(),
        }
    }
}

fn default_ssid_prefix() -> String {
    "Blox-".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Timeouts {
    /// Per-request deadline for radio and device calls, in seconds.
    #[serde(default = "default_call_secs")]
    pub call_secs: u64,

    #[serde(default = "default_deploy_secs")]
    pub deploy_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            call_secs: default_call_secs(),
            deploy_secs: default_deploy_secs(),
        }
    }
}

fn default_call_secs() -> u64 {
    15
}
fn default_deploy_secs() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DialSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Total dial budget before the connection faults.
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,

    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for DialSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            budget_secs: default_budget_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_secs() -> u64 {
    30
}
fn default_budget_secs() -> u64 {
    120
}
fn default_attempt_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// 0 disables the background refresh.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// 0 keeps unreachable devices forever.
    #[serde(default = "default_evict_after_failures")]
    pub evict_after_failures: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            probe_timeout_secs: default_probe_timeout_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            evict_after_failures: default_evict_after_failures(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_refresh_interval_secs() -> u64 {
    30
}
fn default_evict_after_failures() -> u32 {
    20
}

/// Credentials for one target network.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkProfile {
    /// Plaintext password. Prefer the keyring or `password_env`.
    pub password: Option<String>,

    /// Environment variable name containing the password.
    pub password_env: Option<String>,
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Validate and convert into the core runtime configuration.
    pub fn to_blox_config(&self) -> Result<BloxConfig, ConfigError> {
        if self.hotspot.ssid_prefix.trim().is_empty() {
            return Err(invalid("hotspot.ssid_prefix", "must not be empty"));
        }
        if self.timeouts.call_secs == 0 {
            return Err(invalid("timeouts.call_secs", "must be at least 1"));
        }
        if self.timeouts.deploy_secs == 0 {
            return Err(invalid("timeouts.deploy_secs", "must be at least 1"));
        }
        if self.dial.budget_secs == 0 {
            return Err(invalid("dial.budget_secs", "must be at least 1"));
        }
        if self.dial.attempt_timeout_secs == 0 {
            return Err(invalid("dial.attempt_timeout_secs", "must be at least 1"));
        }
        if self.health.failure_threshold == 0 {
            return Err(invalid("health.failure_threshold", "must be at least 1"));
        }
        if self.health.probe_timeout_secs == 0 {
            return Err(invalid("health.probe_timeout_secs", "must be at least 1"));
        }

        Ok(BloxConfig {
            hotspot: HotspotPolicy {
                ssid_prefix: self.hotspot.ssid_prefix.clone(),
                selection: self.hotspot.selection,
            },
            call_timeout: Duration::from_secs(self.timeouts.call_secs),
            dial: DialPolicy {
                initial_delay: Duration::from_millis(self.dial.initial_delay_ms),
                max_delay: Duration::from_secs(self.dial.max_delay_secs),
                budget: Duration::from_secs(self.dial.budget_secs),
                attempt_timeout: Duration::from_secs(self.dial.attempt_timeout_secs),
            },
            health: HealthPolicy {
                failure_threshold: self.health.failure_threshold,
                probe_timeout: Duration::from_secs(self.health.probe_timeout_secs),
                refresh_interval: Duration::from_secs(self.health.refresh_interval_secs),
                evict_after_failures: Some(self.health.evict_after_failures)
                    .filter(|n| *n > 0),
            },
            deploy_timeout: Duration::from_secs(self.timeouts.deploy_secs),
        })
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("land", "fx", "fxblox").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("fxblox");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the Config from `path` + environment. A missing file yields the
/// defaults.
///
/// Environment overrides use a double underscore between section and key,
/// e.g. `FXBLOX_DIAL__BUDGET_SECS=300`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("FXBLOX_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(&config_path(), cfg)
}

pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

fn keyring_user(ssid: &str) -> String {
    format!("wifi/{ssid}")
}

/// Resolve the password for `ssid` from the credential chain:
/// the profile's `password_env`, then the system keyring, then plaintext.
pub fn resolve_wifi_credentials(cfg: &Config, ssid: &str) -> Result<WifiCredentials, ConfigError> {
    let profile = cfg.networks.get(ssid);

    // 1. Profile's password_env → env var lookup
    if let Some(env_name) = profile.and_then(|p| p.password_env.as_deref()) {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(WifiCredentials::new(ssid, val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &keyring_user(ssid)) {
        if let Ok(secret) = entry.get_password() {
            return Ok(WifiCredentials::new(ssid, secret));
        }
    }

    // 3. Plaintext in config
    if let Some(pw) = profile.and_then(|p| p.password.as_deref()) {
        return Ok(WifiCredentials::new(ssid, pw));
    }

    Err(ConfigError::NoCredentials { ssid: ssid.into() })
}

/// Store the password for `ssid` in the system keyring.
pub fn store_wifi_password(ssid: &str, password: &SecretString) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, &keyring_user(ssid))?;
    entry.set_password(password.expose_secret())?;
    Ok(())
}
