//! Control-plane channel bus.
//!
//! The supervisor is commanded and observed exclusively through named
//! channels: plain get/set of scalar or string values. The trait keeps the
//! transport out of the safety core; [`MemoryBus`] backs both the service
//! (fronted by a TCP line server in `laserbridged`) and the tests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// A value stored on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ChannelValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ChannelValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Int(v) => Some(*v as f64),
            ChannelValue::Float(v) => Some(*v),
            ChannelValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ChannelValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for ChannelValue {
    fn from(v: i64) -> Self {
        ChannelValue::Int(v)
    }
}

impl From<bool> for ChannelValue {
    fn from(v: bool) -> Self {
        ChannelValue::Int(i64::from(v))
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        ChannelValue::Float(v)
    }
}

impl From<&str> for ChannelValue {
    fn from(v: &str) -> Self {
        ChannelValue::Str(v.to_string())
    }
}

impl From<String> for ChannelValue {
    fn from(v: String) -> Self {
        ChannelValue::Str(v)
    }
}

/// Named value get/set. Writes are best-effort and must not block the
/// supervisor loop; reads return the last written value or `None`.
pub trait ChannelBus: Send + Sync {
    fn get(&self, name: &str) -> Option<ChannelValue>;
    fn put(&self, name: &str, value: ChannelValue);
}

/// Process-local channel store.
#[derive(Debug, Default)]
pub struct MemoryBus {
    channels: RwLock<HashMap<String, ChannelValue>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all channels, for diagnostics and the status client.
    pub fn snapshot(&self) -> HashMap<String, ChannelValue> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ChannelBus for MemoryBus {
    fn get(&self, name: &str) -> Option<ChannelValue> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn put(&self, name: &str, value: ChannelValue) {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
    }
}

/// One request line on the TCP channel server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum BusRequest {
    Get { channel: String },
    Set { channel: String, value: ChannelValue },
}

/// One reply line on the TCP channel server. The reply itself is the
/// acknowledgment for blocking writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ChannelValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BusReply {
    pub fn ok(value: Option<ChannelValue>) -> Self {
        Self {
            ok: true,
            value,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(message.into()),
        }
    }
}

/// Channel names published and consumed by the supervisor.
pub mod channels {
    /// Current [`crate::LaserState`] as an integer.
    pub const LASER_STATE: &str = "laser_state";
    /// Operator request: 1 = emission wanted, 0 = off / error acknowledge.
    pub const LASER_ON: &str = "laser_on";
    /// Edge-triggered emergency stop; cleared by the supervisor on consume.
    pub const EMERGENCY_STOP: &str = "emergency_stop";
    /// Deadman flag: external actors write 0 to heartbeat; the supervisor
    /// re-arms it to 1 on every check.
    pub const TURN_OFF: &str = "turn_off";
    pub const LAST_ERROR: &str = "last_error";

    pub const READY: &str = "ready";
    pub const EMITTING: &str = "emitting";
    pub const TEMP_OK: &str = "temp_ok";

    pub const EREG1: &str = "ereg1";
    pub const EREG2: &str = "ereg2";
    pub const EREG3: &str = "ereg3";
    pub const IREG1: &str = "ireg1";
    pub const IREG2: &str = "ireg2";
    pub const IREG3: &str = "ireg3";

    pub const DIODE_TEMP: &str = "diode_temp";
    pub const CRYSTAL_TEMP: &str = "crystal_temp";
    pub const HEATSINK_TEMP: &str = "heatsink_temp";
    pub const LASER_HEATSINK_TEMP: &str = "laser_heatsink_temp";

    pub const DIODE_HOURS: &str = "diode_hours";
    pub const DIODE_MINUTES: &str = "diode_minutes";
    pub const EMISSION_HOURS: &str = "emission_hours";
    pub const EMISSION_MINUTES: &str = "emission_minutes";

    pub const SERIAL_NUMBER: &str = "serial_number";
    pub const FW_HEAD: &str = "fw_head";
    pub const FW_CONTROLLER: &str = "fw_controller";

    pub const UPTIME: &str = "uptime";
    pub const LAST_HEARTBEAT: &str = "last_heartbeat";
    pub const HEARTBEAT_COUNT: &str = "heartbeat_count";
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
}
