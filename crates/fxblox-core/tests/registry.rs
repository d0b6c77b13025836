#![allow(clippy::unwrap_used)]
// Registry behavior: deduplicated onboarding, concurrent refresh, health
// faults and eviction.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use common::{Harness, Reply, blox, peer_for, test_config, unreachable};
use fxblox_core::{
    ChainNetwork, Connection, CoreError, DeviceId, Phase, Progress, ProgressKind, StackKind,
    StackStatus, WifiCredentials, WorkloadDescriptor,
};

fn home() -> WifiCredentials {
    WifiCredentials::new("Home", "pw123")
}

async fn onboard(h: &Harness, ssid: &str) -> Connection {
    h.registry
        .onboard(
            &blox(ssid),
            &home(),
            &Progress::silent(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
}

// ── Onboarding ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_onboarding_runs_once() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    *h.wifi.connect_delay.lock().unwrap() = Duration::from_secs(1);
    let cancel = CancellationToken::new();
    let (first_progress, _first_events) = Progress::channel();
    let (second_progress, mut second_events) = Progress::channel();

    let hotspot = blox("Blox-AA11");
    let credentials = home();

    let (first, second) = tokio::join!(
        h.registry
            .onboard(&hotspot, &credentials, &first_progress, &cancel),
        h.registry
            .onboard(&hotspot, &credentials, &second_progress, &cancel),
    );

    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first.ptr_eq(&second));
    assert_eq!(h.wifi.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.registry.len(), 1);
    assert!(!h.registry.is_onboarding(first.id()));

    let waited = second_events.drain();
    assert_eq!(waited.len(), 2);
    assert_eq!(waited[0].kind, ProgressKind::Running);
    assert_eq!(
        waited[0].message,
        "'Blox-AA11' is already being set up, waiting for it..."
    );
    assert_eq!(waited[1].kind, ProgressKind::Done);
}

#[tokio::test(start_paused = true)]
async fn pairing_and_onboarding_one_device_do_not_overlap() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    *h.wifi.connect_delay.lock().unwrap() = Duration::from_secs(1);
    let cancel = CancellationToken::new();
    let (refused_progress, mut refused_events) = Progress::channel();

    let hotspot = blox("Blox-AA11");
    let credentials = home();
    let silent = Progress::silent();

    let (paired, onboarded) = tokio::join!(
        h.registry.pair(&hotspot, &silent, &cancel),
        h.registry
            .onboard(&hotspot, &credentials, &refused_progress, &cancel),
    );

    let paired = paired.unwrap();
    assert_eq!(
        onboarded.unwrap_err(),
        CoreError::OnboardingInProgress {
            device_id: DeviceId::new("Blox-AA11"),
            running: "pair".into(),
        }
    );
    assert_eq!(h.wifi.connects.load(Ordering::SeqCst), 1);
    assert!(h.registry.get(paired.id()).unwrap().ptr_eq(&paired));
    assert_eq!(paired.phase(), Phase::HotspotConnected);
    assert_eq!(refused_events.drain().pop().unwrap().kind, ProgressKind::Fail);
}

#[tokio::test]
async fn live_registration_is_never_replaced() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    let conn = onboard(&h, "Blox-AA11").await;
    let stack = h
        .registry
        .deploy(
            conn.id(),
            WorkloadDescriptor::new(
                "rocketpool",
                StackKind::RocketPool {
                    network: ChainNetwork::EthereumTestnet,
                },
            ),
        )
        .unwrap();
    assert_eq!(stack.settled().await.status, StackStatus::Running);

    let cancel = CancellationToken::new();
    let err = h
        .registry
        .pair(&blox("Blox-AA11"), &Progress::silent(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::AlreadyRegistered {
            device_id: conn.id().clone(),
            phase: Phase::OverlayConnected,
        }
    );
    let err = h
        .registry
        .onboard(&blox("Blox-AA11"), &home(), &Progress::silent(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyRegistered { .. }), "got {err:?}");

    assert_eq!(h.wifi.connects.load(Ordering::SeqCst), 1);
    let registered = h.registry.get(conn.id()).unwrap();
    assert!(registered.ptr_eq(&conn));
    assert_eq!(registered.stacks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn faulted_registration_can_be_onboarded_again() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    h.overlay
        .set_dial(peer_for("Blox-AA11"), Reply::Fail(unreachable()));
    let cancel = CancellationToken::new();
    h.registry
        .onboard(&blox("Blox-AA11"), &home(), &Progress::silent(), &cancel)
        .await
        .unwrap_err();
    let faulted = h.registry.get(&DeviceId::new("Blox-AA11")).unwrap();
    assert_eq!(faulted.phase(), Phase::Faulted);

    h.overlay.set_dial(peer_for("Blox-AA11"), Reply::Ok);
    let fresh = onboard(&h, "Blox-AA11").await;

    assert!(!fresh.ptr_eq(&faulted));
    assert!(h.registry.get(fresh.id()).unwrap().ptr_eq(&fresh));
    assert_eq!(fresh.phase(), Phase::OverlayConnected);
    assert_eq!(h.registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_dial_still_registers_for_reconnect() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    h.overlay
        .set_dial(peer_for("Blox-AA11"), Reply::Fail(unreachable()));
    let cancel = CancellationToken::new();

    let err = h
        .registry
        .onboard(&blox("Blox-AA11"), &home(), &Progress::silent(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DialTimeout { .. }), "got {err:?}");

    let id = DeviceId::new("Blox-AA11");
    let conn = h.registry.get(&id).unwrap();
    assert_eq!(conn.phase(), Phase::Faulted);

    h.overlay.set_dial(peer_for("Blox-AA11"), Reply::Ok);
    let again = h
        .registry
        .reconnect(&id, &Progress::silent(), &cancel)
        .await
        .unwrap();
    assert!(again.ptr_eq(&conn));
    assert_eq!(conn.phase(), Phase::OverlayConnected);
}

#[tokio::test]
async fn failed_pairing_registers_nothing() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    *h.wifi.connect.lock().unwrap() = Reply::Fail(unreachable());

    let err = h
        .registry
        .onboard(
            &blox("Blox-AA11"),
            &home(),
            &Progress::silent(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::ConnectFailed { .. }), "got {err:?}");
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_reconnects_share_one_dial() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    h.overlay
        .set_dial(peer_for("Blox-AA11"), Reply::Fail(unreachable()));
    let cancel = CancellationToken::new();
    h.registry
        .onboard(&blox("Blox-AA11"), &home(), &Progress::silent(), &cancel)
        .await
        .unwrap_err();

    h.overlay.set_dial(peer_for("Blox-AA11"), Reply::Ok);
    let dials_before = h.overlay.dials.load(Ordering::SeqCst);
    let id = DeviceId::new("Blox-AA11");
    let silent = Progress::silent();

    let (first, second) = tokio::join!(
        h.registry.reconnect(&id, &silent, &cancel),
        h.registry.reconnect(&id, &silent, &cancel),
    );

    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first.ptr_eq(&second));
    assert_eq!(first.phase(), Phase::OverlayConnected);
    assert_eq!(h.overlay.dials.load(Ordering::SeqCst) - dials_before, 1);
}

#[tokio::test]
async fn reconnect_needs_a_handed_off_device() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    let cancel = CancellationToken::new();
    let conn = h
        .registry
        .pair(&blox("Blox-AA11"), &Progress::silent(), &cancel)
        .await
        .unwrap();

    let err = h
        .registry
        .reconnect(conn.id(), &Progress::silent(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::WrongPhase {
            expected: Phase::OverlayDialing,
            actual: Phase::HotspotConnected
        }
    );
}

#[tokio::test]
async fn unknown_devices_are_reported() {
    let h = Harness::new(vec![]);
    let id = DeviceId::new("Blox-ZZ99");

    assert_eq!(
        h.registry.remove(&id).unwrap_err(),
        CoreError::UnknownConnection { device_id: id.clone() }
    );
    assert!(h.registry.get(&id).is_err());
}

#[tokio::test]
async fn subscribers_see_new_connections() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    let mut stream = h.registry.subscribe();
    assert!(stream.current().is_empty());

    onboard(&h, "Blox-AA11").await;

    let snapshot = stream.changed().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id().as_str(), "Blox-AA11");
}

// ── Refresh ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn hung_probe_does_not_block_other_devices() {
    let h = Harness::new(vec![blox("Blox-AA11"), blox("Blox-BB22")]);
    let a = onboard(&h, "Blox-AA11").await;
    let b = onboard(&h, "Blox-BB22").await;
    h.overlay.set_ping(peer_for("Blox-AA11"), Reply::Hang);

    let report = h.registry.refresh_all(&CancellationToken::new()).await;

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.healthy(), 1);
    let status_of = |id: &DeviceId| {
        report
            .outcomes
            .iter()
            .find(|(d, _)| d == id)
            .map(|(_, s)| s.clone().unwrap())
            .unwrap()
    };
    let a_status = status_of(a.id());
    assert!(a_status.probed);
    assert!(!a_status.overlay_reachable);
    assert_eq!(a_status.consecutive_failures, 1);
    assert!(status_of(b.id()).is_healthy());
    assert_eq!(a.phase(), Phase::OverlayConnected);
}

#[tokio::test(start_paused = true)]
async fn repeated_probe_failures_fault_then_evict() {
    let h = Harness::new(vec![blox("Blox-AA11"), blox("Blox-BB22")]);
    let a = onboard(&h, "Blox-AA11").await;
    let b = onboard(&h, "Blox-BB22").await;
    h.overlay
        .set_ping(peer_for("Blox-AA11"), Reply::Fail(unreachable()));
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let report = h.registry.refresh_all(&cancel).await;
        assert!(report.evicted.is_empty());
    }
    assert_eq!(a.phase(), Phase::Faulted);
    assert_eq!(
        a.last_error(),
        Some(CoreError::HealthCheckFailed { failures: 3 })
    );
    assert_eq!(b.phase(), Phase::OverlayConnected);

    h.registry.refresh_all(&cancel).await;
    let report = h.registry.refresh_all(&cancel).await;
    assert_eq!(report.evicted, vec![a.id().clone()]);
    assert!(h.registry.get(a.id()).is_err());
    assert!(h.registry.get(b.id()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn device_reporting_unhealthy_counts_as_a_failed_health_check() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    let a = onboard(&h, "Blox-AA11").await;
    *h.controls.control("Blox-AA11").reports_healthy.lock().unwrap() = false;
    let cancel = CancellationToken::new();

    for round in 1..=3 {
        let report = h.registry.refresh_all(&cancel).await;
        assert_eq!(report.healthy(), 0);
        let status = report.outcomes[0].1.as_ref().unwrap();
        assert!(status.overlay_reachable);
        assert_eq!(status.consecutive_failures, round);
    }

    assert_eq!(a.phase(), Phase::Faulted);
    assert_eq!(
        a.last_error(),
        Some(CoreError::HealthCheckFailed { failures: 3 })
    );
}

#[tokio::test(start_paused = true)]
async fn recovered_probe_resets_failure_count() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    let a = onboard(&h, "Blox-AA11").await;
    let cancel = CancellationToken::new();

    h.overlay
        .set_ping(peer_for("Blox-AA11"), Reply::Fail(unreachable()));
    h.registry.refresh_all(&cancel).await;
    h.registry.refresh_all(&cancel).await;
    assert_eq!(a.consecutive_health_failures(), 2);

    h.overlay.set_ping(peer_for("Blox-AA11"), Reply::Ok);
    h.registry.refresh_all(&cancel).await;
    assert_eq!(a.consecutive_health_failures(), 0);
    assert_eq!(a.phase(), Phase::OverlayConnected);
}

#[tokio::test(start_paused = true)]
async fn removal_during_refresh_is_safe() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    let a = onboard(&h, "Blox-AA11").await;
    h.overlay.set_ping(peer_for("Blox-AA11"), Reply::Hang);

    let registry = h.registry.clone();
    let refresh = tokio::spawn(async move { registry.refresh_all(&CancellationToken::new()).await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let removed = h.registry.remove(a.id()).unwrap();
    assert!(removed.ptr_eq(&a));

    let report = refresh.await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_refresh_leaves_connections_alone() {
    let h = Harness::new(vec![blox("Blox-AA11")]);
    let a = onboard(&h, "Blox-AA11").await;
    h.overlay.set_ping(peer_for("Blox-AA11"), Reply::Hang);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.registry.refresh_all(&cancel).await;

    assert!(report.outcomes[0].1.as_ref().unwrap_err().is_cancelled());
    assert_eq!(a.consecutive_health_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn background_refresh_probes_periodically() {
    let mut config = test_config();
    config.health.refresh_interval = Duration::from_secs(10);
    let h = Harness::with_config(vec![blox("Blox-AA11")], config);
    onboard(&h, "Blox-AA11").await;
    let pings_before = h.overlay.pings.load(Ordering::SeqCst);

    let cancel = CancellationToken::new();
    let handle = h.registry.spawn_refresh(cancel.clone()).unwrap();
    tokio::time::sleep(Duration::from_secs(35)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(h.overlay.pings.load(Ordering::SeqCst) - pings_before, 3);
}

#[tokio::test]
async fn zero_interval_disables_background_refresh() {
    let h = Harness::new(vec![]);
    assert!(h.registry.spawn_refresh(CancellationToken::new()).is_none());
}
