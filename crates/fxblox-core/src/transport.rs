// ── Capability contracts ──
//
// The Wi-Fi radio, the device's embedded control API and the overlay
// dialer are supplied by the embedding application. The core only sees
// these traits, and every call goes through `call()` so it is bounded by
// a timeout and abandoned on cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::{
    Device, DeviceInfo, DeviceStatus, PeerId, Phase, StackId, StackStatus, WifiNetwork,
    WorkloadDescriptor,
};

// ── TransportError ──────────────────────────────────────────────────

/// Raw failure reported by a capability implementation.
///
/// Carries no domain context; the core maps it into a [`CoreError`]
/// depending on which operation was running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The link could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// An established link went away mid-request.
    #[error("link lost: {0}")]
    Disconnected(String),

    /// The peer or host did not answer.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The capability's own deadline expired.
    #[error("request timed out")]
    Timeout,

    /// The remote side understood the request and refused it.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::Disconnected(_) | Self::Unreachable(_) | Self::Timeout
        )
    }

    /// Returns `true` if the failure means the link itself is gone.
    pub fn is_link_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::Disconnected(_) | Self::Unreachable(_)
        )
    }
}

// ── Capabilities ────────────────────────────────────────────────────

/// The local Wi-Fi radio.
#[async_trait]
pub trait WifiTransport: Send + Sync {
    /// Networks visible to the local radio, in the order the driver reports them.
    async fn scan(&self) -> Result<Vec<WifiNetwork>, TransportError>;

    async fn connect(&self, network: &WifiNetwork) -> Result<(), TransportError>;
}

/// The control API of one device, reachable over whichever transport is
/// currently associated (hotspot first, then the overlay).
#[async_trait]
pub trait DeviceControlClient: Send + Sync {
    async fn get_hardware_info(&self) -> Result<DeviceInfo, TransportError>;

    /// Networks the device itself can see.
    async fn list_visible_networks(&self) -> Result<Vec<WifiNetwork>, TransportError>;

    /// Push target network credentials. The device is expected to drop its
    /// hotspot right after accepting them.
    async fn configure_wifi(
        &self,
        ssid: &str,
        credential: &SecretString,
    ) -> Result<(), TransportError>;

    async fn get_device_status(&self) -> Result<DeviceStatus, TransportError>;

    async fn deploy_stack(
        &self,
        stack_id: StackId,
        descriptor: &WorkloadDescriptor,
    ) -> Result<(), TransportError>;

    async fn get_stack_status(&self, stack_id: StackId) -> Result<StackStatus, TransportError>;
}

/// Hands out a control client bound to a single device.
pub trait ControlClientFactory: Send + Sync {
    fn client_for(&self, device: &Device) -> Arc<dyn DeviceControlClient>;
}

/// The peer-to-peer overlay dialer.
#[async_trait]
pub trait OverlayClient: Send + Sync {
    async fn dial(&self, peer: &PeerId, timeout: Duration) -> Result<(), TransportError>;

    /// `Ok(true)` if the peer answered.
    async fn ping(&self, peer: &PeerId) -> Result<bool, TransportError>;
}

// ── Guarded calls ───────────────────────────────────────────────────

/// Why a guarded capability call did not produce a value.
#[derive(Debug)]
pub(crate) enum CallError {
    Transport(TransportError),
    TimedOut(Duration),
    Cancelled,
}

impl CallError {
    /// Translate into a [`CoreError`]. Timeouts and cancellation get their
    /// generic variants; transport failures go through `map`.
    pub(crate) fn into_core(
        self,
        operation: &str,
        phase: Phase,
        map: impl FnOnce(TransportError) -> CoreError,
    ) -> CoreError {
        match self {
            Self::Transport(TransportError::Timeout) => CoreError::Timeout {
                operation: operation.to_owned(),
                timeout_secs: 0,
            },
            Self::Transport(err) => map(err),
            Self::TimedOut(limit) => CoreError::Timeout {
                operation: operation.to_owned(),
                timeout_secs: limit.as_secs(),
            },
            Self::Cancelled => CoreError::Cancelled {
                operation: operation.to_owned(),
                phase,
            },
        }
    }
}

/// Run one capability call under a deadline and a cancellation signal.
pub(crate) async fn call<T, F>(
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, CallError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CallError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallError::Transport(e)),
            Err(_) => Err(CallError::TimedOut(limit)),
        },
    }
}
