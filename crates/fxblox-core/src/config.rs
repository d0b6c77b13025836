// ── Runtime policy configuration ──
//
// These types describe *how* the core drives devices: naming convention,
// timeouts, retry budgets and health thresholds. They never touch disk;
// `fxblox-config` (or any embedder) builds a `BloxConfig` and hands it in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::WifiNetwork;

/// What to do when several hotspots match the naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotspotSelection {
    /// First match in scan order. Stable for a given driver.
    #[default]
    FirstMatch,
    /// Strongest signal; ties keep scan order.
    StrongestSignal,
}

/// How Blox hotspots are recognized among scan results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotspotPolicy {
    /// SSID prefix every Blox hotspot carries.
    pub ssid_prefix: String,
    pub selection: HotspotSelection,
}

impl Default for HotspotPolicy {
    fn default() -> Self {
        Self {
            ssid_prefix: "Blox-".into(),
            selection: HotspotSelection::FirstMatch,
        }
    }
}

impl HotspotPolicy {
    /// Whether `network` looks like a Blox hotspot (and, with a hint, the
    /// one the caller is after). Hint matching ignores case.
    pub fn matches(&self, network: &WifiNetwork, hint: Option<&str>) -> bool {
        if !network.ssid.starts_with(&self.ssid_prefix) {
            return false;
        }
        hint.is_none_or(|h| {
            network
                .ssid
                .to_ascii_lowercase()
                .contains(&h.trim().to_ascii_lowercase())
        })
    }

    /// Pick one hotspot from `networks` according to the selection policy.
    pub fn select<'a>(
        &self,
        networks: &'a [WifiNetwork],
        hint: Option<&str>,
    ) -> Option<&'a WifiNetwork> {
        let mut candidates = networks.iter().filter(|n| self.matches(n, hint));
        match self.selection {
            HotspotSelection::FirstMatch => candidates.next(),
            HotspotSelection::StrongestSignal => candidates.reduce(|best, n| {
                if n.signal_dbm.unwrap_or(i32::MIN) > best.signal_dbm.unwrap_or(i32::MIN) {
                    n
                } else {
                    best
                }
            }),
        }
    }
}

/// Overlay dial retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPolicy {
    /// Delay before the second attempt. Default: 1s.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts. Default: 30s.
    pub max_delay: Duration,
    /// Total time allowed for dialing before the connection faults.
    /// Default: 2 minutes.
    pub budget: Duration,
    /// Deadline for a single dial + ping. Default: 10s.
    pub attempt_timeout: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            budget: Duration::from_secs(120),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Health probing and eviction policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive failed probes before a connection faults. Default: 3.
    pub failure_threshold: u32,
    /// Deadline for one whole probe (overlay ping + device status).
    pub probe_timeout: Duration,
    /// How often the registry refreshes. Zero disables the background task.
    pub refresh_interval: Duration,
    /// Consecutive failed probes before the registry drops a connection.
    /// `None` keeps unreachable connections forever.
    pub evict_after_failures: Option<u32>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_timeout: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(30),
            evict_after_failures: Some(20),
        }
    }
}

/// Configuration for the onboarding core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloxConfig {
    pub hotspot: HotspotPolicy,
    /// Deadline for individual radio and device requests.
    pub call_timeout: Duration,
    pub dial: DialPolicy,
    pub health: HealthPolicy,
    /// Deadline for a device to accept a stack deployment.
    pub deploy_timeout: Duration,
}

impl Default for BloxConfig {
    fn default() -> Self {
        Self {
            hotspot: HotspotPolicy::default(),
            call_timeout: Duration::from_secs(15),
            dial: DialPolicy::default(),
            health: HealthPolicy::default(),
            deploy_timeout: Duration::from_secs(300),
        }
    }
}
