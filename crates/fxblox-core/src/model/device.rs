// ── Device domain types ──
//
// A Device is identified by the name it broadcasts on its hotspot. The
// identity never changes; everything else is filled in as onboarding
// phases complete.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::wifi::WifiNetwork;

// ── DeviceId ────────────────────────────────────────────────────────

/// Stable identity of a Blox, derived from its hotspot SSID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_owned())
    }

    /// Identity of the device broadcasting `hotspot`.
    pub fn from_hotspot(hotspot: &WifiNetwork) -> Self {
        Self::new(&hotspot.ssid)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── PeerId ──────────────────────────────────────────────────────────

/// Overlay (Libp2p) peer identifier, kept in its base58 text form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── Device-reported data ────────────────────────────────────────────

/// Hardware identity reported by the device's control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub hardware_id: String,
    pub model: String,
    pub firmware_version: Option<String>,
    /// Peer ID the device will announce on the overlay once it has left
    /// its hotspot.
    pub peer_id: PeerId,
}

/// Liveness report returned by the device itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub healthy: bool,
    pub uptime_secs: Option<u64>,
    pub message: Option<String>,
}

// ── Device ──────────────────────────────────────────────────────────

/// The canonical Device type.
///
/// Created when a hotspot is discovered. `target_ssid` and `peer_id` are
/// populated by the handoff; `info` by pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    id: DeviceId,
    pub title: String,
    pub hotspot: Option<WifiNetwork>,
    pub info: Option<DeviceInfo>,
    pub target_ssid: Option<String>,
    pub peer_id: Option<PeerId>,
}

impl Device {
    pub fn new(id: DeviceId) -> Self {
        Self {
            title: id.as_str().to_owned(),
            id,
            hotspot: None,
            info: None,
            target_ssid: None,
            peer_id: None,
        }
    }

    pub fn from_hotspot(hotspot: WifiNetwork) -> Self {
        let mut device = Self::new(DeviceId::from_hotspot(&hotspot));
        device.title.clone_from(&hotspot.display_name);
        device.hotspot = Some(hotspot);
        device
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }
}
