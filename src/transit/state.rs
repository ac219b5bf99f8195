//! Per-server remap lifecycle states.

use std::fmt;

use crate::utils::StripeKvError;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one storage server as seen by a node.
///
/// Failure path: `Normal -> Intermediate -> WaitDegraded -> Degraded`.
/// Recovery path: `Degraded -> Coordinated -> WaitNormal -> Normal`.
/// Servers and the coordinator skip the `Wait*` steps.
/// The `Wait*` states are client-local markers meaning "acked, waiting for
/// the coordinator to finish the phase".
#[repr(u8)]
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Default, Serialize, Deserialize,
)]
pub enum RemapState {
    #[default]
    Undefined = 0,
    Normal = 1,
    Intermediate = 2,
    Coordinated = 3,
    Degraded = 4,
    WaitDegraded = 5,
    WaitNormal = 6,
}

/// Classification of an observed state change.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StateChange {
    /// A legal forward step.
    Advance,

    /// Re-delivery of a state already reached (or already acked).
    Duplicate,

    /// An edge that the protocol never produces.
    Illegal,
}

impl RemapState {
    pub const ALL: [RemapState; 7] = [
        RemapState::Undefined,
        RemapState::Normal,
        RemapState::Intermediate,
        RemapState::Coordinated,
        RemapState::Degraded,
        RemapState::WaitDegraded,
        RemapState::WaitNormal,
    ];

    /// Raw wire value.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Remapping path may be used for the server.
    #[inline]
    pub fn allows_remapping(self) -> bool {
        matches!(
            self,
            RemapState::Intermediate
                | RemapState::WaitDegraded
                | RemapState::Degraded
        )
    }

    /// Writes must go through the coordinated flow.
    #[inline]
    pub fn uses_coordinated_flow(self) -> bool {
        self != RemapState::Normal
    }

    /// Server is in the middle of a coordinator-driven phase.
    #[inline]
    pub fn in_transition(self) -> bool {
        matches!(self, RemapState::Intermediate | RemapState::Coordinated)
    }

    /// Classifies the change `from -> to` against the lifecycle graph.
    pub fn classify(from: RemapState, to: RemapState) -> StateChange {
        use RemapState::*;

        if from == to {
            return StateChange::Duplicate;
        }
        match (from, to) {
            // late joiner catching up from a snapshot
            (Undefined, _) if to != Undefined => StateChange::Advance,

            // failure path
            (Normal, Intermediate)
            | (Intermediate, WaitDegraded)
            | (Intermediate, Degraded)
            | (WaitDegraded, Degraded) => StateChange::Advance,

            // recovery path
            (Degraded, Coordinated)
            | (Coordinated, WaitNormal)
            | (Coordinated, Normal)
            | (WaitNormal, Normal) => StateChange::Advance,

            // coordinator re-broadcasting a phase we already acked
            (WaitDegraded, Intermediate) | (WaitNormal, Coordinated) => {
                StateChange::Duplicate
            }

            _ => StateChange::Illegal,
        }
    }
}

impl TryFrom<u8> for RemapState {
    type Error = StripeKvError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        RemapState::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| {
                StripeKvError::msg(format!("invalid remap state {}", value))
            })
    }
}

impl fmt::Display for RemapState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RemapState::Undefined => "UNDEFINED",
            RemapState::Normal => "NORMAL",
            RemapState::Intermediate => "INTERMEDIATE",
            RemapState::Coordinated => "COORDINATED",
            RemapState::Degraded => "DEGRADED",
            RemapState::WaitDegraded => "WAIT_DEGRADED",
            RemapState::WaitNormal => "WAIT_NORMAL",
        };
        write!(f, "{}", name)
    }
}
