// ── Wi-Fi domain types ──

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WifiSecurity {
    Open,
    Wep,
    WpaPersonal,
    Wpa2Personal,
    Wpa3Personal,
    Enterprise,
    #[default]
    Unknown,
}

/// A network seen by a scan, either from the local radio or from the device.
///
/// Ephemeral: produced by scans and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    /// Human-readable name; equals the SSID unless the scanner knows better.
    pub display_name: String,
    /// Received signal strength in dBm (closer to zero is stronger).
    pub signal_dbm: Option<i32>,
    pub security: WifiSecurity,
    pub frequency_mhz: Option<u32>,
}

impl WifiNetwork {
    pub fn new(ssid: impl Into<String>) -> Self {
        let ssid = ssid.into();
        Self {
            display_name: ssid.clone(),
            ssid,
            signal_dbm: None,
            security: WifiSecurity::Unknown,
            frequency_mhz: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_signal(mut self, dbm: i32) -> Self {
        self.signal_dbm = Some(dbm);
        self
    }

    pub fn with_security(mut self, security: WifiSecurity) -> Self {
        self.security = security;
        self
    }

    pub fn is_open(&self) -> bool {
        matches!(self.security, WifiSecurity::Open)
    }
}

/// Credentials for the network the device is handed off to.
#[derive(Debug, Clone)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: SecretString,
}

impl WifiCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: SecretString::from(password.into()),
        }
    }
}
