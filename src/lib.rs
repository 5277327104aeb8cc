//! # Laser Bridge
//!
//! Supervisory bridge between a class-4 laser head's RS232 control protocol
//! and a named-channel control plane, enforcing the safety interlocks a human
//! operator cannot be trusted to enforce manually.
//!
//! ## Features
//!
//! - **Framed serial protocol client**: request/response exchange with the
//!   mandated 1 s inter-command gap and bounded reads
//! - **Fault decoding**: 24-bit error-register catalogue classified into
//!   critical and advisory faults
//! - **Deadman switch**: emission continues only while an external heartbeat
//!   is actively maintained; the flag re-arms to the unsafe-by-default value
//!   on every check
//! - **Emission state machine**: Off/Starting/On/Stopping/Error sequencing
//!   with explicit-acknowledgment-only fault recovery
//! - **Multi-rate supervisor**: 10 Hz command/deadman evaluation, 1 Hz status
//!   polls, 0.1 Hz runtime counters and diagnostics
//!
//! ## Architecture
//!
//! - [`controller`] - serial link ownership, command framing, typed decoding
//! - [`fault`] - error-register bit catalogue and severity classification
//! - [`deadman`] - heartbeat bookkeeping and fail-safe flag re-arm
//! - [`state`] - emission state machine with a pure transition function
//! - [`supervisor`] - multi-rate orchestration loop and bus republication
//! - [`bus`] - control-plane channel abstraction and channel names

pub mod bus;
pub mod controller;
pub mod deadman;
pub mod fault;
pub mod state;
pub mod supervisor;

// Re-export main public types for convenience
pub use bus::{ChannelBus, ChannelValue, MemoryBus};
pub use controller::{CommError, LaserController, ProtocolError, StatusRegisters};
pub use deadman::DeadmanSwitch;
pub use state::{EmissionStateMachine, LaserState};
pub use supervisor::{LaserSupervisor, SupervisorConfig};
