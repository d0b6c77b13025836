// ── Stack domain types ──
//
// Plain data describing a workload. The live, observable handle lives in
// `crate::stack`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── StackId ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackId(Uuid);

impl StackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for StackId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

// ── StackStatus ─────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
pub enum StackStatus {
    #[default]
    None,
    Deploying,
    Running,
    Faulted,
}

impl StackStatus {
    /// Status moves forward only; `Faulted -> Deploying` is the retry edge.
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::None, Self::Deploying)
                | (Self::Deploying, Self::Running | Self::Faulted)
                | (Self::Running, Self::Faulted)
                | (Self::Faulted, Self::Deploying)
        )
    }

    /// Whether a deployment attempt has finished, one way or the other.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Running | Self::Faulted)
    }
}

// ── Workload description ────────────────────────────────────────────

/// Blockchain network a staking workload attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum ChainNetwork {
    EthereumMainnet,
    EthereumTestnet,
}

/// The closed set of workloads a Blox knows how to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StackKind {
    /// RocketPool staking node.
    RocketPool { network: ChainNetwork },
    /// Arbitrary container image.
    Container { image: String },
}

impl StackKind {
    pub fn label(&self) -> &str {
        match self {
            Self::RocketPool { .. } => "rocketpool",
            Self::Container { .. } => "container",
        }
    }
}

/// What to deploy, as sent to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: StackKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl WorkloadDescriptor {
    pub fn new(name: impl Into<String>, kind: StackKind) -> Self {
        Self {
            name: name.into(),
            kind,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Local sanity checks run before anything is sent to the device.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("stack name must not be empty".into());
        }
        if let StackKind::Container { image } = &self.kind {
            if image.trim().is_empty() {
                return Err("container image must not be empty".into());
            }
        }
        Ok(())
    }
}
