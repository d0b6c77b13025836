//! Device onboarding and connection lifecycle for FxBlox appliances.
//!
//! A factory-fresh Blox advertises a Wi-Fi hotspot. This crate finds it,
//! pairs with the device through it, hands the device credentials for the
//! user's own network, and then reaches it again over the Libp2p overlay
//! once the hotspot is gone. Afterwards it keeps probing the device and
//! deploys workloads onto it.
//!
//! - **[`ConnectionStateMachine`]** drives one [`Connection`] through the
//!   onboarding [`Phase`]s: [`discover_hotspot`](ConnectionStateMachine::discover_hotspot),
//!   [`pair_via_hotspot`](ConnectionStateMachine::pair_via_hotspot),
//!   [`hand_off`](ConnectionStateMachine::hand_off) and
//!   [`dial_overlay`](ConnectionStateMachine::dial_overlay). Any failure
//!   faults the connection with a [`CoreError`] attached.
//!
//! - **[`ConnectionRegistry`]** owns every connection by [`DeviceId`],
//!   deduplicates concurrent onboarding of the same device, and refreshes
//!   all connections periodically.
//!
//! - **[`StackDeploymentManager`]** deploys [`WorkloadDescriptor`]s onto
//!   connected devices and tracks each [`Stack`] from `Deploying` to
//!   `Running` or `Faulted`.
//!
//! - **Capabilities** ([`transport`]) are the seams to the outside world:
//!   the local Wi-Fi radio, the device control API and the overlay dialer.
//!   The embedding application implements them.
//!
//! Long-running operations report what they are doing through a
//! [`Progress`] handle.

mod backoff;
mod collection;
pub mod config;
pub mod connection;
pub mod deploy;
pub mod error;
pub mod machine;
pub mod model;
pub mod progress;
pub mod registry;
pub mod stack;
pub mod stream;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{BloxConfig, DialPolicy, HealthPolicy, HotspotPolicy, HotspotSelection};
pub use connection::{Connection, ConnectionStatus};
pub use deploy::StackDeploymentManager;
pub use error::{CoreError, ErrorClass};
pub use machine::{ConnectionStateMachine, TargetNetworks};
pub use progress::{Progress, ProgressStream};
pub use registry::{ConnectionRegistry, RefreshReport};
pub use stack::{Stack, StackState};
pub use stream::{EntityStream, EntityWatchStream};
pub use transport::{
    ControlClientFactory, DeviceControlClient, OverlayClient, TransportError, WifiTransport,
};

pub use model::{
    ChainNetwork, Device, DeviceId, DeviceInfo, DeviceStatus, PeerId, Phase, ProgressEvent,
    ProgressKind, StackId, StackKind, StackStatus, WifiCredentials, WifiNetwork, WifiSecurity,
    WorkloadDescriptor,
};
