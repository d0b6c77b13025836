// ── Domain model ──

pub mod device;
pub mod phase;
pub mod progress;
pub mod stack;
pub mod wifi;

pub use device::{Device, DeviceId, DeviceInfo, DeviceStatus, PeerId};
pub use phase::Phase;
pub use progress::{ProgressEvent, ProgressKind};
pub use stack::{ChainNetwork, StackId, StackKind, StackStatus, WorkloadDescriptor};
pub use wifi::{WifiCredentials, WifiNetwork, WifiSecurity};
