#![allow(clippy::unwrap_used, dead_code)]
// In-memory capability fakes shared by the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use fxblox_core::{
    BloxConfig, ConnectionRegistry, ConnectionStateMachine, ControlClientFactory, Device,
    DeviceControlClient, DeviceInfo, DeviceStatus, OverlayClient, PeerId, StackDeploymentManager,
    StackId, StackStatus, TransportError, WifiNetwork, WifiTransport, WorkloadDescriptor,
};

// ── Scripted replies ────────────────────────────────────────────────

/// How a fake answers one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    /// Ping only: the peer was dialed but did not answer.
    NoAnswer,
    Fail(TransportError),
    Hang,
}

impl Reply {
    async fn play(&self) -> Result<bool, TransportError> {
        match self {
            Self::Ok => Ok(true),
            Self::NoAnswer => Ok(false),
            Self::Fail(e) => Err(e.clone()),
            Self::Hang => std::future::pending().await,
        }
    }
}

pub fn unreachable() -> TransportError {
    TransportError::Unreachable("no route to peer".into())
}

pub fn peer_for(ssid: &str) -> PeerId {
    PeerId::new(format!("12D3KooW-{ssid}"))
}

// ── Wi-Fi radio ─────────────────────────────────────────────────────

pub struct FakeWifi {
    pub networks: Mutex<Vec<WifiNetwork>>,
    pub connect: Mutex<Reply>,
    pub scans: AtomicU32,
    pub connects: AtomicU32,
    /// Delay before `connect` answers, to widen race windows.
    pub connect_delay: Mutex<Duration>,
}

impl FakeWifi {
    pub fn new(networks: Vec<WifiNetwork>) -> Self {
        Self {
            networks: Mutex::new(networks),
            connect: Mutex::new(Reply::Ok),
            scans: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
        }
    }
}

#[async_trait]
impl WifiTransport for FakeWifi {
    async fn scan(&self) -> Result<Vec<WifiNetwork>, TransportError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self.networks.lock().unwrap().clone())
    }

    async fn connect(&self, _network: &WifiNetwork) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = self.connect.lock().unwrap().clone();
        reply.play().await.map(|_| ())
    }
}

// ── Device control API ──────────────────────────────────────────────

pub struct FakeControl {
    pub ssid: String,
    pub hardware: Mutex<Reply>,
    pub visible: Mutex<Vec<WifiNetwork>>,
    pub configure: Mutex<Reply>,
    pub status: Mutex<Reply>,
    /// What the device says about itself when its status is requested.
    pub reports_healthy: Mutex<bool>,
    pub deploy: Mutex<Reply>,
    pub stack_status: Mutex<StackStatus>,
    pub configured: Mutex<Vec<(String, String)>>,
    pub deployed: Mutex<Vec<(StackId, WorkloadDescriptor)>>,
    pub list_calls: AtomicU32,
}

impl FakeControl {
    pub fn new(ssid: &str) -> Self {
        Self {
            ssid: ssid.to_owned(),
            hardware: Mutex::new(Reply::Ok),
            visible: Mutex::new(vec![
                WifiNetwork::new("Home").with_signal(-45),
                WifiNetwork::new("Neighbour").with_signal(-80),
            ]),
            configure: Mutex::new(Reply::Ok),
            status: Mutex::new(Reply::Ok),
            reports_healthy: Mutex::new(true),
            deploy: Mutex::new(Reply::Ok),
            stack_status: Mutex::new(StackStatus::Running),
            configured: Mutex::new(Vec::new()),
            deployed: Mutex::new(Vec::new()),
            list_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DeviceControlClient for FakeControl {
    async fn get_hardware_info(&self) -> Result<DeviceInfo, TransportError> {
        let reply = self.hardware.lock().unwrap().clone();
        reply.play().await?;
        Ok(DeviceInfo {
            hardware_id: format!("hw-{}", self.ssid),
            model: "FxBlox".into(),
            firmware_version: Some("1.4.2".into()),
            peer_id: peer_for(&self.ssid),
        })
    }

    async fn list_visible_networks(&self) -> Result<Vec<WifiNetwork>, TransportError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.visible.lock().unwrap().clone())
    }

    async fn configure_wifi(
        &self,
        ssid: &str,
        credential: &SecretString,
    ) -> Result<(), TransportError> {
        self.configured
            .lock()
            .unwrap()
            .push((ssid.to_owned(), credential.expose_secret().to_owned()));
        let reply = self.configure.lock().unwrap().clone();
        reply.play().await.map(|_| ())
    }

    async fn get_device_status(&self) -> Result<DeviceStatus, TransportError> {
        let reply = self.status.lock().unwrap().clone();
        reply.play().await?;
        Ok(DeviceStatus {
            healthy: *self.reports_healthy.lock().unwrap(),
            uptime_secs: Some(3600),
            message: None,
        })
    }

    async fn deploy_stack(
        &self,
        stack_id: StackId,
        descriptor: &WorkloadDescriptor,
    ) -> Result<(), TransportError> {
        self.deployed
            .lock()
            .unwrap()
            .push((stack_id, descriptor.clone()));
        let reply = self.deploy.lock().unwrap().clone();
        reply.play().await.map(|_| ())
    }

    async fn get_stack_status(&self, _stack_id: StackId) -> Result<StackStatus, TransportError> {
        Ok(*self.stack_status.lock().unwrap())
    }
}

/// Hands out one `FakeControl` per device, created on first use.
#[derive(Default)]
pub struct FakeFactory {
    controls: Mutex<HashMap<String, Arc<FakeControl>>>,
}

impl FakeFactory {
    pub fn control(&self, ssid: &str) -> Arc<FakeControl> {
        self.controls
            .lock()
            .unwrap()
            .entry(ssid.to_owned())
            .or_insert_with(|| Arc::new(FakeControl::new(ssid)))
            .clone()
    }
}

impl ControlClientFactory for FakeFactory {
    fn client_for(&self, device: &Device) -> Arc<dyn DeviceControlClient> {
        self.control(device.id().as_str())
    }
}

// ── Overlay ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeOverlay {
    dial: Mutex<HashMap<PeerId, Reply>>,
    ping: Mutex<HashMap<PeerId, Reply>>,
    pub dials: AtomicU32,
    pub pings: AtomicU32,
}

impl FakeOverlay {
    pub fn set_dial(&self, peer: PeerId, reply: Reply) {
        self.dial.lock().unwrap().insert(peer, reply);
    }

    pub fn set_ping(&self, peer: PeerId, reply: Reply) {
        self.ping.lock().unwrap().insert(peer, reply);
    }
}

#[async_trait]
impl OverlayClient for FakeOverlay {
    async fn dial(&self, peer: &PeerId, _timeout: Duration) -> Result<(), TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .dial
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or(Reply::Ok);
        reply.play().await.map(|_| ())
    }

    async fn ping(&self, peer: &PeerId) -> Result<bool, TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .ping
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or(Reply::Ok);
        reply.play().await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// Short timeouts so paused-clock tests stay readable.
pub fn test_config() -> BloxConfig {
    let mut config = BloxConfig::default();
    config.call_timeout = Duration::from_secs(5);
    config.dial.initial_delay = Duration::from_secs(1);
    config.dial.max_delay = Duration::from_secs(8);
    config.dial.budget = Duration::from_secs(30);
    config.dial.attempt_timeout = Duration::from_secs(5);
    config.health.failure_threshold = 3;
    config.health.probe_timeout = Duration::from_secs(2);
    config.health.refresh_interval = Duration::ZERO;
    config.health.evict_after_failures = Some(5);
    config.deploy_timeout = Duration::from_secs(20);
    config
}

pub struct Harness {
    pub wifi: Arc<FakeWifi>,
    pub controls: Arc<FakeFactory>,
    pub overlay: Arc<FakeOverlay>,
    pub machine: Arc<ConnectionStateMachine>,
    pub deployer: Arc<StackDeploymentManager>,
    pub registry: ConnectionRegistry,
}

impl Harness {
    pub fn new(networks: Vec<WifiNetwork>) -> Self {
        Self::with_config(networks, test_config())
    }

    pub fn with_config(networks: Vec<WifiNetwork>, config: BloxConfig) -> Self {
        let wifi = Arc::new(FakeWifi::new(networks));
        let controls = Arc::new(FakeFactory::default());
        let overlay = Arc::new(FakeOverlay::default());
        let deployer = Arc::new(StackDeploymentManager::new(&config));
        let machine = Arc::new(ConnectionStateMachine::new(
            config,
            wifi.clone(),
            controls.clone(),
            overlay.clone(),
        ));
        let registry = ConnectionRegistry::new(machine.clone(), deployer.clone());
        Self {
            wifi,
            controls,
            overlay,
            machine,
            deployer,
            registry,
        }
    }
}

pub fn blox(ssid: &str) -> WifiNetwork {
    WifiNetwork::new(ssid).with_signal(-60)
}
