//! Emission state machine.
//!
//! `Off -> Starting -> On -> Stopping -> Off`, with every state except Off
//! able to drop into `Error` on fault detection. Leaving `Error` requires an
//! explicit external acknowledgment; the machine never auto-clears a fault.
//!
//! The decision is pure: [`EmissionStateMachine::evaluate`] looks at the
//! inputs for this tick and returns the proposed next state plus the side
//! effects to issue. The supervisor executes the effects and commits the
//! transition, keeping the safety decision auditable separately from the
//! serial I/O it triggers.

use crate::fault::{self, FaultDef};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Time the head needs after a start command before ready is meaningful.
/// A hard protocol requirement, not a tunable.
pub const STARTUP_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaserState {
    Off = 0,
    Starting = 1,
    On = 2,
    Stopping = 3,
    Error = 4,
}

impl LaserState {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl std::fmt::Display for LaserState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LaserState::Off => "OFF",
            LaserState::Starting => "STARTING",
            LaserState::On => "ON",
            LaserState::Stopping => "STOPPING",
            LaserState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Everything the machine looks at in one tick.
#[derive(Debug, Clone, Default)]
pub struct StateInputs {
    /// Operator wants emission (level, sticky).
    pub laser_on: bool,
    /// Edge-triggered emergency stop request.
    pub emergency_stop: bool,
    /// Device reports ready for emission (last status poll).
    pub ready: bool,
    /// Device reports diode current on (last status poll).
    pub emitting: bool,
    /// Deadman monitor verdict for this tick.
    pub deadman_expired: bool,
    /// Active faults from the last register decode.
    pub faults: Vec<&'static FaultDef>,
}

/// Side effects the supervisor must perform for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Issue SSD_1. The proposed transition commits only if acknowledged.
    StartEmission,
    /// Issue SSD_0. The transition commits even if the write fails;
    /// the safe direction never waits on the link.
    StopEmission,
    ClearLaserOn,
    ClearEmergencyStop,
    SetLastError(String),
    ClearLastError,
}

/// Proposed outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub next: LaserState,
    pub actions: Vec<Action>,
}

impl Evaluation {
    fn quiet(next: LaserState) -> Self {
        Self {
            next,
            actions: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct EmissionStateMachine {
    state: LaserState,
    entered_at: Instant,
}

impl EmissionStateMachine {
    pub fn new(now: Instant) -> Self {
        Self {
            state: LaserState::Off,
            entered_at: now,
        }
    }

    pub fn state(&self) -> LaserState {
        self.state
    }

    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    /// Pure transition decision. Priority order: emergency stop, then
    /// critical faults, then the per-state logic.
    pub fn evaluate(&self, now: Instant, inputs: &StateInputs) -> Evaluation {
        // Emergency stop short-circuits everything, from any state.
        if inputs.emergency_stop {
            return Evaluation {
                next: LaserState::Error,
                actions: vec![
                    Action::StopEmission,
                    Action::ClearEmergencyStop,
                    Action::ClearLaserOn,
                    Action::SetLastError("Emergency stop".to_string()),
                ],
            };
        }

        // Critical faults force shutdown from any live state. Error is
        // excluded so the stop is issued exactly once per fault entry, and
        // Off because there is nothing to shut down; starts from Off are
        // gated on the fault set separately below.
        if fault::has_critical(&inputs.faults)
            && !matches!(self.state, LaserState::Off | LaserState::Error)
        {
            return Evaluation {
                next: LaserState::Error,
                actions: vec![
                    Action::StopEmission,
                    Action::SetLastError(format!(
                        "Critical: {}",
                        fault::critical_codes(&inputs.faults)
                    )),
                ],
            };
        }

        match self.state {
            LaserState::Off => {
                // A start is refused while any critical fault is active;
                // the fault channels already carry the reason.
                if inputs.laser_on && !fault::has_critical(&inputs.faults) {
                    Evaluation {
                        next: LaserState::Starting,
                        actions: vec![Action::StartEmission],
                    }
                } else {
                    Evaluation::quiet(self.state)
                }
            }
            LaserState::Starting => {
                if self.time_in_state(now) >= STARTUP_DELAY {
                    if inputs.ready {
                        Evaluation::quiet(LaserState::On)
                    } else {
                        Evaluation {
                            next: LaserState::Error,
                            actions: vec![Action::SetLastError(
                                "Not ready after startup delay".to_string(),
                            )],
                        }
                    }
                } else {
                    Evaluation::quiet(self.state)
                }
            }
            LaserState::On => {
                if !inputs.laser_on {
                    Evaluation {
                        next: LaserState::Stopping,
                        actions: vec![Action::StopEmission],
                    }
                } else if inputs.deadman_expired {
                    Evaluation {
                        next: LaserState::Stopping,
                        actions: vec![
                            Action::StopEmission,
                            Action::ClearLaserOn,
                            Action::SetLastError("Deadman timeout".to_string()),
                        ],
                    }
                } else {
                    Evaluation::quiet(self.state)
                }
            }
            LaserState::Stopping => {
                if !inputs.emitting {
                    Evaluation::quiet(LaserState::Off)
                } else {
                    Evaluation::quiet(self.state)
                }
            }
            LaserState::Error => {
                // Deliberate operator reset only: laser-on must be cleared.
                if !inputs.laser_on {
                    Evaluation {
                        next: LaserState::Off,
                        actions: vec![Action::ClearLastError],
                    }
                } else {
                    Evaluation::quiet(self.state)
                }
            }
        }
    }

    /// Commit a transition, resetting the state entry time. Returns true if
    /// the state actually changed. The sole mutator of the laser state.
    pub fn commit(&mut self, next: LaserState, now: Instant) -> bool {
        if next == self.state {
            return false;
        }
        self.state = next;
        self.entered_at = now;
        true
    }
}
