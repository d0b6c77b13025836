// ── Stack deployment ──
//
// Stacks are requested on usable connections only. `deploy` returns as
// soon as the stack is `Deploying`; a background task drives the device
// call and settles the stack as `Running` or `Faulted`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BloxConfig;
use crate::connection::Connection;
use crate::error::CoreError;
use crate::model::{StackStatus, WorkloadDescriptor};
use crate::stack::Stack;
use crate::transport::{TransportError, call};

pub struct StackDeploymentManager {
    deploy_timeout: Duration,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl StackDeploymentManager {
    pub fn new(config: &BloxConfig) -> Self {
        Self {
            deploy_timeout: config.deploy_timeout,
            call_timeout: config.call_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Request `descriptor` on the device behind `conn`.
    ///
    /// Fails without creating a stack if the connection is not
    /// `OverlayConnected` or the descriptor is malformed. Must be called
    /// from within a Tokio runtime.
    pub fn deploy(
        &self,
        conn: &Connection,
        descriptor: WorkloadDescriptor,
    ) -> Result<Stack, CoreError> {
        let phase = conn.phase();
        if !phase.is_usable() {
            return Err(CoreError::NotConnected { phase });
        }
        descriptor
            .validate()
            .map_err(|reason| CoreError::DeployRejected { reason })?;

        let stack = Stack::new(
            conn.id().clone(),
            descriptor,
            conn.subscribe_phase(),
            conn.control().clone(),
        );
        conn.push_stack(stack.clone());
        stack
            .transition(StackStatus::Deploying, None)
            .map_err(|status| CoreError::InvalidState {
                stack_id: stack.id(),
                status,
            })?;

        info!(
            device = %conn.id(),
            stack = %stack.id(),
            kind = stack.descriptor().kind.label(),
            "stack deployment requested"
        );
        self.spawn_drive(stack.clone());
        Ok(stack)
    }

    /// Redeploy a faulted stack. Any other status is left untouched.
    pub fn retry(&self, stack: &Stack) -> Result<(), CoreError> {
        let status = stack.status();
        if status != StackStatus::Faulted {
            return Err(CoreError::InvalidState {
                stack_id: stack.id(),
                status,
            });
        }
        let phase = stack.owner_phase();
        if !phase.is_usable() {
            return Err(CoreError::NotConnected { phase });
        }
        stack
            .transition(StackStatus::Deploying, None)
            .map_err(|status| CoreError::InvalidState {
                stack_id: stack.id(),
                status,
            })?;

        info!(stack = %stack.id(), "retrying stack deployment");
        self.spawn_drive(stack.clone());
        Ok(())
    }

    /// Ask the device for the stack's status and apply it.
    ///
    /// Nothing is polled while the owning connection is unusable; the last
    /// known status is returned instead. Reports that would move the stack
    /// backwards are ignored.
    pub async fn poll_status(&self, stack: &Stack) -> Result<StackStatus, CoreError> {
        let current = stack.status();
        if !stack.owner_phase().is_usable() {
            debug!(stack = %stack.id(), "owner not connected, skipping poll");
            return Ok(current);
        }

        let reported = call(
            self.call_timeout,
            &self.cancel,
            stack.control().get_stack_status(stack.id()),
        )
        .await
        .map_err(|e| {
            e.into_core("stack status", stack.owner_phase(), |e| {
                CoreError::DeviceRequestFailed {
                    reason: e.to_string(),
                }
            })
        })?;

        if reported == current || reported == StackStatus::Deploying {
            return Ok(current);
        }
        let error = (reported == StackStatus::Faulted).then(|| CoreError::DeviceRequestFailed {
            reason: "device reported the stack as faulted".into(),
        });
        match stack.transition(reported, error) {
            Ok(()) => {
                info!(stack = %stack.id(), from = %current, to = %reported, "stack status changed");
                Ok(reported)
            }
            Err(status) => {
                debug!(stack = %stack.id(), %status, %reported, "ignoring stale stack status");
                Ok(status)
            }
        }
    }

    /// Abandon every in-flight deployment call. Stacks still deploying
    /// settle as `Faulted` with a cancellation error.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_drive(&self, stack: Stack) {
        let cancel = self.cancel.child_token();
        let limit = self.deploy_timeout;
        tokio::spawn(drive(stack, limit, cancel));
    }
}

impl Drop for StackDeploymentManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(stack: Stack, limit: Duration, cancel: CancellationToken) {
    let result = call(
        limit,
        &cancel,
        stack.control().deploy_stack(stack.id(), stack.descriptor()),
    )
    .await;

    let (to, error) = match result {
        Ok(()) => (StackStatus::Running, None),
        Err(e) => {
            let err = e.into_core("stack deployment", stack.owner_phase(), |e| match e {
                TransportError::Rejected(reason) => CoreError::DeployRejected { reason },
                other => CoreError::DeviceRequestFailed {
                    reason: other.to_string(),
                },
            });
            warn!(stack = %stack.id(), error = %err, "stack deployment failed");
            (StackStatus::Faulted, Some(err))
        }
    };

    if let Err(status) = stack.transition(to, error) {
        debug!(stack = %stack.id(), %status, "stack settled elsewhere");
    } else if to == StackStatus::Running {
        info!(stack = %stack.id(), "stack running");
    }
}
