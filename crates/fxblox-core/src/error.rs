// ── Core error types ──
//
// User-facing errors from fxblox-core. Capabilities report raw
// `TransportError`s; the state machine, registry and deployment manager
// translate them into these variants with the context the caller needs
// (which operation, which SSID, which peer).

use thiserror::Error;

use crate::model::{DeviceId, Phase, StackId, StackStatus};

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorClass {
    /// Timeouts and dropped links. Retried automatically up to policy limits.
    Transient,
    /// The device refused the request. Not retried automatically.
    Rejected,
    /// The session is unusable until the caller resets or retries it.
    FatalToSession,
    /// The caller asked for something the lifecycle does not allow.
    InvariantViolation,
}

/// Unified error type for the core crate.
///
/// `Clone` so the last error can be attached to the Connection or Stack it
/// concerns and rendered later without replaying events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    // ── Hotspot / pairing ────────────────────────────────────────────
    #[error("No Blox hotspot found{}", hint_suffix(.hint.as_deref()))]
    HotspotNotFound { hint: Option<String> },

    #[error("Wi-Fi scan failed: {reason}")]
    ScanFailed { reason: String },

    #[error("Cannot connect to '{ssid}': {reason}")]
    ConnectFailed { ssid: String, reason: String },

    #[error("Device on '{ssid}' did not answer the handshake: {reason}")]
    HandshakeFailed { ssid: String, reason: String },

    // ── Handoff ──────────────────────────────────────────────────────
    #[error("Device rejected credentials for '{ssid}': {reason}")]
    HandoffRejected { ssid: String, reason: String },

    // ── Overlay ──────────────────────────────────────────────────────
    #[error("Overlay dial to {peer_id} gave up after {attempts} attempts ({budget_secs}s budget)")]
    DialTimeout {
        peer_id: String,
        attempts: u32,
        budget_secs: u64,
    },

    #[error("Peer {peer_id} is unreachable: {reason}")]
    PeerUnreachable { peer_id: String, reason: String },

    #[error("Device stopped answering health probes ({failures} consecutive failures)")]
    HealthCheckFailed { failures: u32 },

    // ── Stacks ───────────────────────────────────────────────────────
    #[error("Device rejected deployment: {reason}")]
    DeployRejected { reason: String },

    #[error("Device request failed: {reason}")]
    DeviceRequestFailed { reason: String },

    // ── Generic transport ────────────────────────────────────────────
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("{operation} cancelled during {phase}")]
    Cancelled { operation: String, phase: Phase },

    // ── Invariant violations ─────────────────────────────────────────
    #[error("Connection is not usable (phase {phase})")]
    NotConnected { phase: Phase },

    #[error("Illegal phase transition {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Operation requires phase {expected}, connection is {actual}")]
    WrongPhase { expected: Phase, actual: Phase },

    #[error("Stack {stack_id} cannot be retried from {status}")]
    InvalidState { stack_id: StackId, status: StackStatus },

    #[error("Device {device_id} is not registered")]
    UnknownConnection { device_id: DeviceId },

    #[error("Device {device_id} is already registered (phase {phase})")]
    AlreadyRegistered { device_id: DeviceId, phase: Phase },

    #[error("Device {device_id} is busy: {running} already in progress")]
    OnboardingInProgress { device_id: DeviceId, running: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn hint_suffix(hint: Option<&str>) -> String {
    hint.map(|h| format!(" matching '{h}'")).unwrap_or_default()
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ScanFailed { .. }
            | Self::ConnectFailed { .. }
            | Self::HandshakeFailed { .. }
            | Self::DeviceRequestFailed { .. }
            | Self::Timeout { .. } => ErrorClass::Transient,
            Self::HandoffRejected { .. } | Self::DeployRejected { .. } => ErrorClass::Rejected,
            Self::HotspotNotFound { .. }
            | Self::DialTimeout { .. }
            | Self::PeerUnreachable { .. }
            | Self::HealthCheckFailed { .. }
            | Self::Cancelled { .. } => ErrorClass::FatalToSession,
            Self::NotConnected { .. }
            | Self::InvalidTransition { .. }
            | Self::WrongPhase { .. }
            | Self::InvalidState { .. }
            | Self::UnknownConnection { .. }
            | Self::AlreadyRegistered { .. }
            | Self::OnboardingInProgress { .. }
            | Self::Internal(_) => ErrorClass::InvariantViolation,
        }
    }

    /// Returns `true` if running the same operation again (after a reset
    /// where the session faulted) has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self.class() {
            ErrorClass::Transient => true,
            ErrorClass::FatalToSession => !matches!(self, Self::PeerUnreachable { .. }),
            ErrorClass::Rejected | ErrorClass::InvariantViolation => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
