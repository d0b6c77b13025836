// ── Connection phase ──

use serde::{Deserialize, Serialize};

/// Where a Connection is in the onboarding lifecycle.
///
/// Phases advance one step at a time in declaration order. `Faulted` is
/// reachable from every other phase; leaving it requires an explicit reset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
pub enum Phase {
    Idle,
    HotspotFound,
    HotspotConnected,
    HandoffInProgress,
    OverlayDialing,
    OverlayConnected,
    Faulted,
}

impl Phase {
    /// The single phase that may follow this one on the happy path.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::HotspotFound),
            Self::HotspotFound => Some(Self::HotspotConnected),
            Self::HotspotConnected => Some(Self::HandoffInProgress),
            Self::HandoffInProgress => Some(Self::OverlayDialing),
            Self::OverlayDialing => Some(Self::OverlayConnected),
            Self::OverlayConnected | Self::Faulted => None,
        }
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        match to {
            Self::Faulted => self != Self::Faulted,
            _ => self.next() == Some(to),
        }
    }

    pub fn is_usable(self) -> bool {
        matches!(self, Self::OverlayConnected)
    }

    pub fn is_faulted(self) -> bool {
        matches!(self, Self::Faulted)
    }
}
