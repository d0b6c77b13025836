// ── Connection registry ──
//
// Owns every Connection the application knows about, keyed by DeviceId.
// At most one pairing, onboarding or reconnect runs per device: a second
// caller asking for the same thing attaches to the running attempt, a
// caller asking for something else is turned away. A periodic refresh probes every
// connection concurrently so one unreachable device never stalls the rest.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collection::EntityCollection;
use crate::connection::{Connection, ConnectionStatus};
use crate::deploy::StackDeploymentManager;
use crate::error::CoreError;
use crate::machine::ConnectionStateMachine;
use crate::model::{DeviceId, Phase, StackStatus, WifiCredentials, WifiNetwork, WorkloadDescriptor};
use crate::progress::Progress;
use crate::stack::Stack;
use crate::stream::EntityStream;

type Attempt = Shared<BoxFuture<'static, Result<Connection, CoreError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum AttemptKind {
    Pair,
    Onboard,
    Reconnect,
}

struct InFlight {
    generation: u64,
    kind: AttemptKind,
    attempt: Attempt,
}

enum Slot {
    Attach(Attempt),
    Lead {
        generation: u64,
        tx: oneshot::Sender<Result<Connection, CoreError>>,
        attempt: Attempt,
    },
}

/// Outcome of one [`ConnectionRegistry::refresh_all`] pass.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub outcomes: Vec<(DeviceId, Result<ConnectionStatus, CoreError>)>,
    /// Connections dropped for failing too many consecutive probes.
    pub evicted: Vec<DeviceId>,
}

impl RefreshReport {
    pub fn healthy(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.as_ref().is_ok_and(ConnectionStatus::is_healthy))
            .count()
    }
}

/// Registry of device connections.
///
/// Cheaply cloneable; all clones share the same state.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    machine: Arc<ConnectionStateMachine>,
    deployer: Arc<StackDeploymentManager>,
    connections: EntityCollection<DeviceId, Connection>,
    in_flight: DashMap<DeviceId, InFlight>,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(machine: Arc<ConnectionStateMachine>, deployer: Arc<StackDeploymentManager>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                machine,
                deployer,
                connections: EntityCollection::new(),
                in_flight: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.inner.machine
    }

    pub fn deployer(&self) -> &Arc<StackDeploymentManager> {
        &self.inner.deployer
    }

    // ── Lookup ───────────────────────────────────────────────────

    /// Register `conn`, replacing any connection for the same device.
    ///
    /// `pair` and `onboard` refuse to replace a live connection; this is
    /// the explicit way to do it.
    pub fn add(&self, conn: Connection) -> Option<Connection> {
        let replaced = self.inner.connections.upsert(conn.id().clone(), conn);
        if let Some(ref old) = replaced {
            debug!(device = %old.id(), "replaced registered connection");
        }
        replaced
    }

    pub fn remove(&self, id: &DeviceId) -> Result<Connection, CoreError> {
        self.inner
            .connections
            .remove(id)
            .ok_or_else(|| CoreError::UnknownConnection {
                device_id: id.clone(),
            })
    }

    pub fn get(&self, id: &DeviceId) -> Result<Connection, CoreError> {
        self.inner
            .connections
            .get(id)
            .ok_or_else(|| CoreError::UnknownConnection {
                device_id: id.clone(),
            })
    }

    /// Connections in registration order.
    pub fn list(&self) -> Arc<Vec<Connection>> {
        self.inner.connections.snapshot()
    }

    pub fn subscribe(&self) -> EntityStream<Connection> {
        EntityStream::new(self.inner.connections.subscribe())
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a pairing, onboarding or reconnect is running for `id`.
    pub fn is_onboarding(&self, id: &DeviceId) -> bool {
        self.inner.in_flight.contains_key(id)
    }

    /// Fails if `id` has a registered connection that is not faulted.
    fn ensure_vacant(&self, id: &DeviceId) -> Result<(), CoreError> {
        match self.inner.connections.get(id) {
            Some(conn) if !conn.phase().is_faulted() => Err(CoreError::AlreadyRegistered {
                device_id: id.clone(),
                phase: conn.phase(),
            }),
            _ => Ok(()),
        }
    }

    // ── Onboarding ───────────────────────────────────────────────

    /// Pair with `hotspot` and register the resulting connection.
    ///
    /// A device that is already registered must be faulted or removed
    /// first.
    pub async fn pair(
        &self,
        hotspot: &WifiNetwork,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<Connection, CoreError> {
        let id = DeviceId::from_hotspot(hotspot);
        let registry = self.clone();
        let hotspot = hotspot.clone();
        let lead_progress = progress.clone();
        let cancel = cancel.clone();

        self.exclusive(id.clone(), AttemptKind::Pair, progress, move || async move {
            registry
                .ensure_vacant(&id)
                .inspect_err(|e| lead_progress.fail(e.to_string()))?;
            let conn = registry
                .inner
                .machine
                .pair_via_hotspot(&hotspot, &lead_progress, &cancel)
                .await?;
            registry.add(conn.clone());
            Ok(conn)
        })
        .await
    }

    /// Full onboarding: pair, hand off `credentials`, then dial the overlay.
    ///
    /// The connection is registered as soon as the handoff succeeds, so a
    /// device whose overlay dial fails can be picked up later with
    /// [`reconnect`](Self::reconnect). A faulted registration is replaced;
    /// any other is refused with [`CoreError::AlreadyRegistered`].
    pub async fn onboard(
        &self,
        hotspot: &WifiNetwork,
        credentials: &WifiCredentials,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<Connection, CoreError> {
        let id = DeviceId::from_hotspot(hotspot);
        let registry = self.clone();
        let hotspot = hotspot.clone();
        let credentials = credentials.clone();
        let lead_progress = progress.clone();
        let cancel = cancel.clone();

        self.exclusive(id.clone(), AttemptKind::Onboard, progress, move || async move {
            registry
                .ensure_vacant(&id)
                .inspect_err(|e| lead_progress.fail(e.to_string()))?;
            let machine = &registry.inner.machine;
            let conn = machine
                .pair_via_hotspot(&hotspot, &lead_progress, &cancel)
                .await?;
            machine
                .hand_off(&conn, &credentials, &lead_progress, &cancel)
                .await?;
            registry.add(conn.clone());
            machine.dial_overlay(&conn, &lead_progress, &cancel).await?;
            info!(device = %conn.id(), "device onboarded");
            Ok(conn)
        })
        .await
    }

    /// Re-establish the overlay link of a registered connection.
    ///
    /// A faulted connection is reset first. Connections that never got
    /// past pairing cannot be reconnected and must be onboarded again.
    pub async fn reconnect(
        &self,
        id: &DeviceId,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<Connection, CoreError> {
        let conn = self.get(id)?;
        let registry = self.clone();
        let lead_progress = progress.clone();
        let cancel = cancel.clone();

        self.exclusive(id.clone(), AttemptKind::Reconnect, progress, move || async move {
            let machine = &registry.inner.machine;
            if conn.phase().is_faulted() {
                machine.reset(&conn).await?;
            }

            match conn.phase() {
                Phase::OverlayDialing => {
                    machine.dial_overlay(&conn, &lead_progress, &cancel).await?;
                    Ok(conn)
                }
                Phase::OverlayConnected => {
                    lead_progress.done("Blox already connected.");
                    Ok(conn)
                }
                actual => Err(CoreError::WrongPhase {
                    expected: Phase::OverlayDialing,
                    actual,
                }),
            }
        })
        .await
    }

    /// Deploy `descriptor` on a registered device.
    pub fn deploy(&self, id: &DeviceId, descriptor: WorkloadDescriptor) -> Result<Stack, CoreError> {
        let conn = self.get(id)?;
        self.inner.deployer.deploy(&conn, descriptor)
    }

    /// Run `make` as the only attempt for `id`, or wait for the attempt
    /// already running if it is of the same `kind`.
    ///
    /// The attempt runs on its own task so it finishes for every waiter
    /// even if the caller that started it goes away.
    async fn exclusive<F, Fut>(
        &self,
        id: DeviceId,
        kind: AttemptKind,
        progress: &Progress,
        make: F,
    ) -> Result<Connection, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Connection, CoreError>> + Send + 'static,
    {
        let slot = match self.inner.in_flight.entry(id.clone()) {
            Entry::Occupied(entry) => {
                let running = entry.get();
                if running.kind != kind {
                    let err = CoreError::OnboardingInProgress {
                        device_id: id,
                        running: running.kind.to_string(),
                    };
                    progress.fail(err.to_string());
                    return Err(err);
                }
                Slot::Attach(running.attempt.clone())
            }
            Entry::Vacant(entry) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                let attempt = async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(CoreError::Internal("onboarding task ended without a result".into()))
                    })
                }
                .boxed()
                .shared();
                entry.insert(InFlight {
                    generation,
                    kind,
                    attempt: attempt.clone(),
                });
                Slot::Lead {
                    generation,
                    tx,
                    attempt,
                }
            }
        };

        match slot {
            Slot::Attach(attempt) => {
                debug!(device = %id, ?kind, "attaching to in-flight attempt");
                progress.running(format!("'{id}' is already being set up, waiting for it..."));
                let result = attempt.await;
                match &result {
                    Ok(_) => progress.done(format!("'{id}' is ready.")),
                    Err(e) => progress.fail(e.to_string()),
                }
                result
            }
            Slot::Lead {
                generation,
                tx,
                attempt,
            } => {
                let work = make();
                let registry = self.clone();
                tokio::spawn(async move {
                    let result = work.await;
                    registry
                        .inner
                        .in_flight
                        .remove_if(&id, |_, running| running.generation == generation);
                    // Nobody waiting is fine.
                    let _ = tx.send(result);
                });
                attempt.await
            }
        }
    }

    // ── Refresh ──────────────────────────────────────────────────

    /// Probe every registered connection concurrently, poll the status of
    /// their running stacks, and evict connections that failed too many
    /// probes in a row.
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> RefreshReport {
        let snapshot = self.list();
        let mut tasks = JoinSet::new();
        for conn in snapshot.iter().cloned() {
            let registry = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let status = registry.refresh_one(&conn, &cancel).await;
                (conn, status)
            });
        }

        let evict_after = self.inner.machine.config().health.evict_after_failures;
        let mut report = RefreshReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (conn, status) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "refresh task failed");
                    continue;
                }
            };

            if let Some(limit) = evict_after {
                let exhausted = conn.phase().is_faulted()
                    && conn.consecutive_health_failures() >= limit;
                if exhausted
                    && self
                        .inner
                        .connections
                        .remove_if(conn.id(), |c| c.ptr_eq(&conn))
                        .is_some()
                {
                    info!(device = %conn.id(), limit, "evicted unreachable device");
                    report.evicted.push(conn.id().clone());
                }
            }
            report.outcomes.push((conn.id().clone(), status));
        }

        debug!(
            probed = report.outcomes.len(),
            healthy = report.healthy(),
            evicted = report.evicted.len(),
            "refresh complete"
        );
        report
    }

    async fn refresh_one(
        &self,
        conn: &Connection,
        cancel: &CancellationToken,
    ) -> Result<ConnectionStatus, CoreError> {
        let status = self.inner.machine.check_health(conn, cancel).await?;
        if !conn.phase().is_usable() {
            return Ok(status);
        }
        for stack in conn.stacks().iter() {
            if stack.status() != StackStatus::Running {
                continue;
            }
            if let Err(e) = self.inner.deployer.poll_status(stack).await {
                debug!(stack = %stack.id(), error = %e, "stack status poll failed");
            }
        }
        Ok(status)
    }

    /// Start the periodic refresh task. Returns `None` when the configured
    /// refresh interval is zero.
    pub fn spawn_refresh(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.inner.machine.config().health.refresh_interval;
        if period.is_zero() {
            return None;
        }
        let registry = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let report = registry.refresh_all(&cancel).await;
                        let failures = report
                            .outcomes
                            .iter()
                            .filter_map(|(device, r)| r.as_ref().err().map(|e| (device, e)))
                            .filter(|(_, e)| !e.is_cancelled());
                        for (device, e) in failures {
                            warn!(%device, error = %e, "health refresh failed");
                        }
                    }
                }
            }
        }))
    }
}
