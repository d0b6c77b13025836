// ── Live stack handle ──
//
// A `Stack` is owned by the Connection it was deployed on. The handle is
// cheaply cloneable; status changes are published through a `watch`
// channel so callers can render every step.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::CoreError;
use crate::model::{DeviceId, Phase, StackId, StackStatus, WorkloadDescriptor};
use crate::transport::DeviceControlClient;

/// Status of a stack plus the error that put it there, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackState {
    pub status: StackStatus,
    pub error: Option<CoreError>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

struct StackInner {
    id: StackId,
    device_id: DeviceId,
    descriptor: WorkloadDescriptor,
    created_at: DateTime<Utc>,
    state: watch::Sender<StackState>,
    /// Phase of the owning connection; polling stops once it faults.
    owner_phase: watch::Receiver<Phase>,
    control: Arc<dyn DeviceControlClient>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("id", &self.inner.id)
            .field("device_id", &self.inner.device_id)
            .field("name", &self.inner.descriptor.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Stack {
    pub(crate) fn new(
        device_id: DeviceId,
        descriptor: WorkloadDescriptor,
        owner_phase: watch::Receiver<Phase>,
        control: Arc<dyn DeviceControlClient>,
    ) -> Self {
        let now = Utc::now();
        let (state, _) = watch::channel(StackState {
            status: StackStatus::None,
            error: None,
            updated_at: now,
        });
        Self {
            inner: Arc::new(StackInner {
                id: StackId::new(),
                device_id,
                descriptor,
                created_at: now,
                state,
                owner_phase,
                control,
            }),
        }
    }

    pub fn id(&self) -> StackId {
        self.inner.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn descriptor(&self) -> &WorkloadDescriptor {
        &self.inner.descriptor
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn status(&self) -> StackStatus {
        self.inner.state.borrow().status
    }

    pub fn state(&self) -> StackState {
        self.inner.state.borrow().clone()
    }

    pub fn last_error(&self) -> Option<CoreError> {
        self.inner.state.borrow().error.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StackState> {
        self.inner.state.subscribe()
    }

    /// Wait until the current deployment attempt has finished.
    pub async fn settled(&self) -> StackState {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.status.is_settled()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    pub(crate) fn owner_phase(&self) -> Phase {
        *self.inner.owner_phase.borrow()
    }

    pub(crate) fn control(&self) -> &Arc<dyn DeviceControlClient> {
        &self.inner.control
    }

    /// Move to `to` if the lifecycle allows it. On refusal the current
    /// status is returned and nothing changes.
    pub(crate) fn transition(
        &self,
        to: StackStatus,
        error: Option<CoreError>,
    ) -> Result<(), StackStatus> {
        let mut refused = None;
        self.inner.state.send_if_modified(|state| {
            if state.status.can_transition_to(to) {
                state.status = to;
                state.error = error;
                state.updated_at = Utc::now();
                true
            } else {
                refused = Some(state.status);
                false
            }
        });
        refused.map_or(Ok(()), Err)
    }
}
