// ── Connection ──
//
// One Connection per Device. It owns the Device record, the lifecycle
// Phase, the last error and the device's Stacks. Phase changes go through
// `advance`/`fault` which check the lifecycle atomically; multi-step
// operations additionally hold the per-connection transition lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::debug;

use crate::collection::EntityCollection;
use crate::error::CoreError;
use crate::model::{Device, DeviceId, DeviceStatus, Phase, StackId};
use crate::stack::Stack;
use crate::stream::EntityStream;
use crate::transport::DeviceControlClient;

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub device_id: DeviceId,
    pub phase: Phase,
    /// `false` when the probe was skipped because the connection is still
    /// onboarding.
    pub probed: bool,
    pub overlay_reachable: bool,
    pub device_status: Option<DeviceStatus>,
    pub consecutive_failures: u32,
    pub checked_at: DateTime<Utc>,
}

impl ConnectionStatus {
    pub fn is_healthy(&self) -> bool {
        self.probed
            && self.overlay_reachable
            && self.device_status.as_ref().is_some_and(|s| s.healthy)
    }
}

/// Handle to a device connection.
///
/// Cheaply cloneable via `Arc<ConnectionInner>`; all clones observe the
/// same state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: DeviceId,
    device: watch::Sender<Device>,
    phase: watch::Sender<Phase>,
    last_error: watch::Sender<Option<CoreError>>,
    stacks: EntityCollection<StackId, Stack>,
    control: Arc<dyn DeviceControlClient>,
    /// Serializes multi-step phase operations on this connection.
    transitions: Mutex<()>,
    health_failures: AtomicU32,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.inner.id)
            .field("phase", &self.phase())
            .field("last_error", &self.last_error())
            .field("stacks", &self.inner.stacks.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(device: Device, control: Arc<dyn DeviceControlClient>) -> Self {
        let id = device.id().clone();
        let (device, _) = watch::channel(device);
        let (phase, _) = watch::channel(Phase::Idle);
        let (last_error, _) = watch::channel(None);

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                device,
                phase,
                last_error,
                stacks: EntityCollection::new(),
                control,
                transitions: Mutex::new(()),
                health_failures: AtomicU32::new(0),
                created_at: Utc::now(),
            }),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn id(&self) -> &DeviceId {
        &self.inner.id
    }

    /// Copy of the current device record.
    pub fn device(&self) -> Device {
        self.inner.device.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// Subscribe to phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    pub fn last_error(&self) -> Option<CoreError> {
        self.inner.last_error.borrow().clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn consecutive_health_failures(&self) -> u32 {
        self.inner.health_failures.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Stacks ───────────────────────────────────────────────────

    /// Stacks in the order they were requested.
    pub fn stacks(&self) -> Arc<Vec<Stack>> {
        self.inner.stacks.snapshot()
    }

    pub fn stack(&self, id: StackId) -> Option<Stack> {
        self.inner.stacks.get(&id)
    }

    pub fn subscribe_stacks(&self) -> EntityStream<Stack> {
        EntityStream::new(self.inner.stacks.subscribe())
    }

    pub(crate) fn push_stack(&self, stack: Stack) {
        self.inner.stacks.upsert(stack.id(), stack);
    }

    // ── Crate-internal state changes ─────────────────────────────

    pub(crate) fn control(&self) -> &Arc<dyn DeviceControlClient> {
        &self.inner.control
    }

    pub(crate) async fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.inner.transitions.lock().await
    }

    pub(crate) fn update_device(&self, f: impl FnOnce(&mut Device)) {
        self.inner.device.send_modify(f);
    }

    /// Advance exactly one step forward.
    pub(crate) fn advance(&self, to: Phase) -> Result<(), CoreError> {
        let mut from = None;
        self.inner.phase.send_if_modified(|phase| {
            if phase.can_transition_to(to) && to != Phase::Faulted {
                *phase = to;
                true
            } else {
                from = Some(*phase);
                false
            }
        });
        match from {
            None => {
                debug!(device = %self.inner.id, phase = %to, "phase advanced");
                Ok(())
            }
            Some(from) => Err(CoreError::InvalidTransition { from, to }),
        }
    }

    /// Move to `Faulted` from any live phase and attach `error`.
    /// Returns the phase the connection faulted from, or `None` if it was
    /// already faulted (the error is still recorded).
    pub(crate) fn fault(&self, error: CoreError) -> Option<Phase> {
        let mut from = None;
        self.inner.phase.send_if_modified(|phase| {
            if phase.is_faulted() {
                false
            } else {
                from = Some(*phase);
                *phase = Phase::Faulted;
                true
            }
        });
        self.record_error(error);
        from
    }

    /// Fault only if the connection is still in `expected`.
    pub(crate) fn fault_if(&self, expected: Phase, error: CoreError) -> bool {
        let faulted = self.inner.phase.send_if_modified(|phase| {
            if *phase == expected && !phase.is_faulted() {
                *phase = Phase::Faulted;
                true
            } else {
                false
            }
        });
        if faulted {
            self.record_error(error);
        }
        faulted
    }

    pub(crate) fn record_error(&self, error: CoreError) {
        self.inner.last_error.send_replace(Some(error));
    }

    /// Record one probe result and return the consecutive failure count.
    pub(crate) fn note_probe(&self, healthy: bool) -> u32 {
        if healthy {
            self.inner.health_failures.store(0, Ordering::Release);
            0
        } else {
            self.inner.health_failures.fetch_add(1, Ordering::AcqRel) + 1
        }
    }

    /// Leave `Faulted` for the last phase that can be resumed from:
    /// `OverlayDialing` once the device has been handed off, otherwise
    /// `HotspotConnected` once paired, otherwise `Idle`.
    pub(crate) fn reset_from_fault(&self) -> Result<Phase, CoreError> {
        let target = {
            let device = self.inner.device.borrow();
            if device.peer_id.is_some() {
                Phase::OverlayDialing
            } else if device.info.is_some() {
                Phase::HotspotConnected
            } else {
                Phase::Idle
            }
        };

        let mut from = None;
        self.inner.phase.send_if_modified(|phase| {
            if phase.is_faulted() {
                *phase = target;
                true
            } else {
                from = Some(*phase);
                false
            }
        });
        if let Some(from) = from {
            return Err(CoreError::InvalidTransition { from, to: target });
        }

        self.inner.last_error.send_replace(None);
        self.inner.health_failures.store(0, Ordering::Release);
        debug!(device = %self.inner.id, phase = %target, "connection reset");
        Ok(target)
    }
}
