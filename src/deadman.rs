//! Deadman switch.
//!
//! External actors prove liveness by writing 0 to the turn-off channel; the
//! supervisor re-arms the channel to 1 on every check. A crashed client
//! therefore stops clearing the flag and the timeout fires on its own. The
//! unsafe-by-default polarity means a bus wipe or a missing channel also
//! counts as "no heartbeat".

use crate::bus::{channels, ChannelBus};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct DeadmanSwitch {
    timeout: Duration,
    last_heartbeat: Option<Instant>,
    heartbeat_count: u64,
}

impl DeadmanSwitch {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_heartbeat: None,
            heartbeat_count: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeat_count
    }

    /// Consume one heartbeat cycle and report whether the deadman has
    /// expired. Called once per fast tick.
    ///
    /// The flag is re-armed to 1 unconditionally, even on expiry, so a
    /// client that resumes heartbeating is picked up without any reset
    /// step. No heartbeat has been seen yet means not expired: the switch
    /// only guards emission that a live client requested, and that request
    /// itself arms it.
    pub fn check_and_reset(&mut self, now: Instant, bus: &dyn ChannelBus) -> bool {
        let armed = bus
            .get(channels::TURN_OFF)
            .and_then(|v| v.as_int())
            .unwrap_or(1);

        if armed == 0 {
            self.last_heartbeat = Some(now);
            self.heartbeat_count += 1;
            bus.put(channels::HEARTBEAT_COUNT, (self.heartbeat_count as i64).into());
            bus.put(channels::LAST_HEARTBEAT, (unix_now() as i64).into());
            debug!(count = self.heartbeat_count, "heartbeat received");
        }

        bus.put(channels::TURN_OFF, 1i64.into());

        let expired = self
            .last_heartbeat
            .map(|t| now.saturating_duration_since(t) > self.timeout)
            .unwrap_or(false);
        if expired {
            warn!(
                timeout_secs = self.timeout.as_secs(),
                "deadman heartbeat timeout"
            );
        }
        expired
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
