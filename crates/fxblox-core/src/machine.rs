// ── Connection state machine ──
//
// Drives a Connection through hotspot discovery, pairing, Wi-Fi handoff
// and the overlay dial, and probes it afterwards. Every capability call
// runs under `transport::call` so it is bounded and cancellable. Any
// failure faults the connection and closes the progress stream with a
// `Fail` event.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::BoxStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::config::BloxConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::error::CoreError;
use crate::model::{Device, PeerId, Phase, WifiCredentials, WifiNetwork};
use crate::progress::Progress;
use crate::transport::{
    CallError, ControlClientFactory, OverlayClient, TransportError, WifiTransport, call,
};

/// Onboarding driver shared by every connection.
pub struct ConnectionStateMachine {
    config: BloxConfig,
    wifi: Arc<dyn WifiTransport>,
    controls: Arc<dyn ControlClientFactory>,
    overlay: Arc<dyn OverlayClient>,
    /// The local radio can only be associated with one hotspot at a time.
    radio: Mutex<()>,
}

impl ConnectionStateMachine {
    pub fn new(
        config: BloxConfig,
        wifi: Arc<dyn WifiTransport>,
        controls: Arc<dyn ControlClientFactory>,
        overlay: Arc<dyn OverlayClient>,
    ) -> Self {
        Self {
            config,
            wifi,
            controls,
            overlay,
            radio: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BloxConfig {
        &self.config
    }

    // ── Discovery & pairing ──────────────────────────────────────

    /// Scan for a Blox hotspot, optionally narrowed by `hint`.
    pub async fn discover_hotspot(
        &self,
        hint: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<WifiNetwork, CoreError> {
        progress.running("Looking for your Blox Hotspot Wi-Fi...");

        let result = async {
            let _radio = self.acquire_radio("hotspot scan", cancel).await?;
            let networks = call(self.config.call_timeout, cancel, self.wifi.scan())
                .await
                .map_err(|e| {
                    e.into_core("hotspot scan", Phase::Idle, |e| CoreError::ScanFailed {
                        reason: e.to_string(),
                    })
                })?;
            debug!(visible = networks.len(), "wifi scan complete");

            self.config
                .hotspot
                .select(&networks, hint)
                .cloned()
                .ok_or_else(|| CoreError::HotspotNotFound {
                    hint: hint.map(str::to_owned),
                })
        }
        .await;

        match result {
            Ok(hotspot) => {
                progress.done(format!("Blox found: '{}'.", hotspot.display_name));
                info!(ssid = %hotspot.ssid, "blox hotspot found");
                Ok(hotspot)
            }
            Err(CoreError::HotspotNotFound { hint }) => {
                progress.fail("Blox not found. Turn on the Blox and try again.");
                Err(CoreError::HotspotNotFound { hint })
            }
            Err(e) => {
                progress.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Join `hotspot` and read the device's hardware information.
    ///
    /// On success the returned Connection is `HotspotConnected`.
    pub async fn pair_via_hotspot(
        &self,
        hotspot: &WifiNetwork,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<Connection, CoreError> {
        let _radio = match self.acquire_radio("hotspot pairing", cancel).await {
            Ok(guard) => guard,
            Err(e) => {
                progress.fail(e.to_string());
                return Err(e);
            }
        };

        let device = Device::from_hotspot(hotspot.clone());
        let control = self.controls.client_for(&device);
        let conn = Connection::new(device, control);
        let transitions = conn.lock_transitions().await;
        conn.advance(Phase::HotspotFound)?;

        progress.running("Connecting to directly Blox hotspot...");
        let ssid = hotspot.ssid.clone();
        if let Err(e) = call(self.config.call_timeout, cancel, self.wifi.connect(hotspot)).await {
            let err = e.into_core("hotspot connect", Phase::HotspotFound, |e| {
                CoreError::ConnectFailed {
                    ssid: ssid.clone(),
                    reason: e.to_string(),
                }
            });
            return Err(fault(&conn, progress, err));
        }
        progress.done("Connected to Blox hotspot.");

        progress.running(format!(
            "Loading hardware information from: '{}'...",
            hotspot.display_name
        ));
        let info = match call(
            self.config.call_timeout,
            cancel,
            conn.control().get_hardware_info(),
        )
        .await
        {
            Ok(info) => info,
            Err(e) => {
                let err = e.into_core("hardware handshake", Phase::HotspotFound, |e| {
                    CoreError::HandshakeFailed {
                        ssid: ssid.clone(),
                        reason: e.to_string(),
                    }
                });
                return Err(fault(&conn, progress, err));
            }
        };
        info!(device = %conn.id(), hardware_id = %info.hardware_id, "hardware info loaded");
        conn.update_device(|d| d.info = Some(info));
        conn.advance(Phase::HotspotConnected)?;
        progress.done("Hardware information loaded.");

        drop(transitions);
        Ok(conn)
    }

    /// Networks the device can see, fetched lazily from the device while
    /// it is still reachable through its hotspot.
    pub fn list_target_networks(&self, conn: &Connection) -> TargetNetworks {
        TargetNetworks {
            conn: conn.clone(),
            timeout: self.config.call_timeout,
        }
    }

    // ── Handoff ──────────────────────────────────────────────────

    /// Push the target network credentials to the device.
    ///
    /// The device drops its hotspot once it accepts them, so a lost link
    /// after the request was sent counts as success. On return the
    /// connection is `OverlayDialing`.
    pub async fn hand_off(
        &self,
        conn: &Connection,
        credentials: &WifiCredentials,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let _transitions = conn.lock_transitions().await;
        let phase = conn.phase();
        if phase != Phase::HotspotConnected {
            return Err(CoreError::WrongPhase {
                expected: Phase::HotspotConnected,
                actual: phase,
            });
        }
        let ssid = credentials.ssid.trim().to_owned();
        if ssid.is_empty() {
            return Err(CoreError::HandoffRejected {
                ssid,
                reason: "target SSID is empty".into(),
            });
        }

        conn.advance(Phase::HandoffInProgress)?;
        progress.running("Configuring the Blox Wi-Fi...");

        let sent = call(
            self.config.call_timeout,
            cancel,
            conn.control().configure_wifi(&ssid, &credentials.password),
        )
        .await;
        match sent {
            Ok(()) => {}
            Err(CallError::Transport(e)) if e.is_link_loss() => {
                debug!(device = %conn.id(), error = %e, "hotspot dropped after handoff");
            }
            Err(e) => {
                let err = e.into_core("Wi-Fi handoff", Phase::HandoffInProgress, |e| {
                    CoreError::HandoffRejected {
                        ssid: ssid.clone(),
                        reason: e.to_string(),
                    }
                });
                return Err(fault(conn, progress, err));
            }
        }

        conn.update_device(|d| {
            d.target_ssid = Some(ssid.clone());
            if d.peer_id.is_none() {
                d.peer_id = d.info.as_ref().map(|i| i.peer_id.clone());
            }
        });
        progress.done("Blox Wi-Fi configured.");
        info!(device = %conn.id(), target = %ssid, "wifi handoff complete");
        conn.advance(Phase::OverlayDialing)
    }

    // ── Overlay dial ─────────────────────────────────────────────

    /// Dial the device over the overlay until it answers or the dial
    /// budget runs out.
    pub async fn dial_overlay(
        &self,
        conn: &Connection,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let _transitions = conn.lock_transitions().await;
        let phase = conn.phase();
        if phase != Phase::OverlayDialing {
            return Err(CoreError::WrongPhase {
                expected: Phase::OverlayDialing,
                actual: phase,
            });
        }
        let Some(peer) = conn.device().peer_id else {
            let err = CoreError::PeerUnreachable {
                peer_id: String::new(),
                reason: "device did not report a peer id".into(),
            };
            return Err(fault(conn, progress, err));
        };

        progress.running("Connecting to Blox via blockchain (Libp2p)...");
        let policy = &self.config.dial;
        let deadline = Instant::now() + policy.budget;
        let mut attempts: u32 = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;
            let limit = policy.attempt_timeout.min(remaining);

            match call(limit, cancel, self.dial_once(&peer, limit)).await {
                Ok(()) => {
                    conn.note_probe(true);
                    conn.advance(Phase::OverlayConnected)?;
                    progress.done("Blox Libp2p connection established.");
                    info!(device = %conn.id(), peer = %peer, attempts, "overlay connected");
                    return Ok(());
                }
                Err(CallError::Cancelled) => {
                    let err = CoreError::Cancelled {
                        operation: "overlay dial".into(),
                        phase: Phase::OverlayDialing,
                    };
                    return Err(fault(conn, progress, err));
                }
                Err(CallError::Transport(TransportError::Rejected(reason))) => {
                    let err = CoreError::PeerUnreachable {
                        peer_id: peer.to_string(),
                        reason,
                    };
                    return Err(fault(conn, progress, err));
                }
                Err(e) => {
                    debug!(device = %conn.id(), attempt = attempts, error = ?e, "overlay dial attempt failed");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let delay =
                backoff::delay_for(attempts - 1, policy.initial_delay, policy.max_delay).min(remaining);
            debug!(device = %conn.id(), attempt = attempts, delay_ms = delay.as_millis(), "retrying overlay dial");
            progress.running("Checking the Blox Libp2p connection...");

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let err = CoreError::Cancelled {
                        operation: "overlay dial".into(),
                        phase: Phase::OverlayDialing,
                    };
                    return Err(fault(conn, progress, err));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        let err = CoreError::DialTimeout {
            peer_id: peer.to_string(),
            attempts,
            budget_secs: policy.budget.as_secs(),
        };
        Err(fault(conn, progress, err))
    }

    async fn dial_once(&self, peer: &PeerId, limit: Duration) -> Result<(), TransportError> {
        self.overlay.dial(peer, limit).await?;
        if self.overlay.ping(peer).await? {
            Ok(())
        } else {
            Err(TransportError::Unreachable(format!("{peer} did not answer ping")))
        }
    }

    // ── Health ───────────────────────────────────────────────────

    /// Probe a connected device over the overlay.
    ///
    /// Connections still onboarding are reported without probing. Enough
    /// consecutive failures fault an `OverlayConnected` connection; a
    /// faulted one keeps being counted so the registry can evict it.
    pub async fn check_health(
        &self,
        conn: &Connection,
        cancel: &CancellationToken,
    ) -> Result<ConnectionStatus, CoreError> {
        let phase = conn.phase();
        let peer = conn.device().peer_id;
        let peer = match peer {
            Some(peer) if matches!(phase, Phase::OverlayConnected | Phase::Faulted) => peer,
            _ => {
                return Ok(ConnectionStatus {
                    device_id: conn.id().clone(),
                    phase,
                    probed: false,
                    overlay_reachable: false,
                    device_status: None,
                    consecutive_failures: conn.consecutive_health_failures(),
                    checked_at: Utc::now(),
                });
            }
        };

        let probe = async {
            let reachable = match self.overlay.ping(&peer).await {
                Ok(answered) => answered,
                Err(e) => {
                    debug!(device = %conn.id(), error = %e, "health ping failed");
                    false
                }
            };
            if !reachable {
                return (false, None);
            }
            match conn.control().get_device_status().await {
                Ok(status) => (true, Some(status)),
                Err(e) => {
                    debug!(device = %conn.id(), error = %e, "device status request failed");
                    (true, None)
                }
            }
        };

        let (overlay_reachable, device_status) = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(CoreError::Cancelled {
                    operation: "health check".into(),
                    phase,
                });
            }
            res = tokio::time::timeout(self.config.health.probe_timeout, probe) => {
                res.unwrap_or_else(|_| {
                    debug!(device = %conn.id(), "health probe timed out");
                    (false, None)
                })
            }
        };

        let responsive =
            overlay_reachable && device_status.as_ref().is_some_and(|s| s.healthy);
        let failures = conn.note_probe(responsive);
        let threshold = self.config.health.failure_threshold;
        if failures >= threshold
            && conn.fault_if(
                Phase::OverlayConnected,
                CoreError::HealthCheckFailed { failures },
            )
        {
            warn!(device = %conn.id(), failures, "device stopped answering health probes");
        }

        Ok(ConnectionStatus {
            device_id: conn.id().clone(),
            phase: conn.phase(),
            probed: true,
            overlay_reachable,
            device_status,
            consecutive_failures: failures,
            checked_at: Utc::now(),
        })
    }

    /// Bring a faulted connection back to the last phase it can resume
    /// from. See [`Connection`] for the rules.
    pub async fn reset(&self, conn: &Connection) -> Result<Phase, CoreError> {
        let _transitions = conn.lock_transitions().await;
        conn.reset_from_fault()
    }

    // ── Helpers ──────────────────────────────────────────────────

    async fn acquire_radio(
        &self,
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, ()>, CoreError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::Cancelled {
                operation: operation.to_owned(),
                phase: Phase::Idle,
            }),
            guard = self.radio.lock() => Ok(guard),
        }
    }

}

fn fault(conn: &Connection, progress: &Progress, err: CoreError) -> CoreError {
    let from = conn.fault(err.clone());
    warn!(device = %conn.id(), from = ?from, error = %err, "connection faulted");
    progress.fail(err.to_string());
    err
}

/// Lazily fetched list of networks visible to a device.
///
/// Each call to [`stream`](Self::stream) asks the device again, so a
/// consumer can restart the listing after a failure.
#[derive(Debug, Clone)]
pub struct TargetNetworks {
    conn: Connection,
    timeout: Duration,
}

impl TargetNetworks {
    /// Networks in the order the device reports them, without blank or
    /// repeated SSIDs.
    pub fn stream(&self) -> BoxStream<'static, Result<WifiNetwork, CoreError>> {
        let conn = self.conn.clone();
        let limit = self.timeout;
        Box::pin(async_stream::try_stream! {
            let networks = fetch_visible(&conn, limit).await?;
            let mut seen = HashSet::new();
            for network in networks {
                if network.ssid.trim().is_empty() || !seen.insert(network.ssid.clone()) {
                    continue;
                }
                yield network;
            }
        })
    }
}

async fn fetch_visible(conn: &Connection, limit: Duration) -> Result<Vec<WifiNetwork>, CoreError> {
    let phase = conn.phase();
    if phase != Phase::HotspotConnected {
        return Err(CoreError::WrongPhase {
            expected: Phase::HotspotConnected,
            actual: phase,
        });
    }
    match tokio::time::timeout(limit, conn.control().list_visible_networks()).await {
        Ok(Ok(networks)) => Ok(networks),
        Ok(Err(e)) => Err(CoreError::DeviceRequestFailed {
            reason: e.to_string(),
        }),
        Err(_) => Err(CoreError::Timeout {
            operation: "network listing".into(),
            timeout_secs: limit.as_secs(),
        }),
    }
}
