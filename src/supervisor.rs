//! Multi-rate supervision loop.
//!
//! One task owns the serial link and the state machine and runs a fast tick
//! (default 10 Hz) for command and deadman evaluation. Status polls (1 Hz)
//! and diagnostics polls (0.1 Hz) piggyback on the fast tick via cadence
//! timers, so a slow serial exchange delays but never overlaps another.
//!
//! Serial exchanges take over a second each because of the mandatory
//! inter-command gap, so a tick that polls will overrun its slot. The
//! interval uses skip semantics and the cadence timers measure from actual
//! completion, which keeps the long-run rates honest without ever queueing
//! stale ticks.

use crate::bus::{channels, ChannelBus};
use crate::controller::{LaserController, ProtocolError, StatusRegisters};
use crate::deadman::{DeadmanSwitch, DEFAULT_HEARTBEAT_TIMEOUT};
use crate::fault::{self, FaultDef, FAULT_TABLE};
use crate::state::{Action, EmissionStateMachine, LaserState, StateInputs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_FAST_PERIOD: Duration = Duration::from_millis(100);
pub const DEFAULT_STATUS_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_DIAGNOSTICS_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat_timeout: Duration,
    pub fast_period: Duration,
    pub status_period: Duration,
    pub diagnostics_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            fast_period: DEFAULT_FAST_PERIOD,
            status_period: DEFAULT_STATUS_PERIOD,
            diagnostics_period: DEFAULT_DIAGNOSTICS_PERIOD,
        }
    }
}

/// Fires at most once per period, measured from the previous firing. The
/// first check always fires.
#[derive(Debug)]
struct Cadence {
    period: Duration,
    last: Option<Instant>,
}

impl Cadence {
    fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    fn due(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.period,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

pub struct LaserSupervisor<T> {
    controller: LaserController<T>,
    bus: Arc<dyn ChannelBus>,
    machine: EmissionStateMachine,
    deadman: DeadmanSwitch,
    status_cadence: Cadence,
    diagnostics_cadence: Cadence,
    started_at: Instant,
    last_registers: Option<StatusRegisters>,
    active_faults: Vec<&'static FaultDef>,
    poll_failures: u32,
}

impl<T> LaserSupervisor<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        controller: LaserController<T>,
        bus: Arc<dyn ChannelBus>,
        config: &SupervisorConfig,
    ) -> Self {
        let now = clock_now();
        Self {
            controller,
            bus,
            machine: EmissionStateMachine::new(now),
            deadman: DeadmanSwitch::new(config.heartbeat_timeout),
            status_cadence: Cadence::new(config.status_period),
            diagnostics_cadence: Cadence::new(config.diagnostics_period),
            started_at: now,
            last_registers: None,
            active_faults: Vec::new(),
            poll_failures: 0,
        }
    }

    pub fn state(&self) -> LaserState {
        self.machine.state()
    }

    /// Seed the bus and read the head identity. Identity reads are
    /// best-effort; a head that answers status polls but garbles SEN/FVE
    /// still gets supervised.
    pub async fn startup(&mut self) {
        self.bus.put(channels::LASER_ON, 0i64.into());
        self.bus.put(channels::EMERGENCY_STOP, 0i64.into());
        self.bus.put(channels::TURN_OFF, 1i64.into());
        self.bus.put(channels::LAST_ERROR, "".into());
        self.bus
            .put(channels::LASER_STATE, self.machine.state().as_i64().into());
        self.bus.put(
            channels::HEARTBEAT_TIMEOUT,
            (self.deadman.timeout().as_secs() as i64).into(),
        );

        match self.controller.get_serial_number().await {
            Ok(serial) => {
                info!(serial = serial.as_str(), "head serial number");
                self.bus.put(channels::SERIAL_NUMBER, serial.into());
            }
            Err(e) => warn!(error = %e, "serial number read failed"),
        }
        match self.controller.get_firmware_versions().await {
            Ok(fw) => {
                info!(
                    head = fw.head.as_str(),
                    controller = fw.controller.as_str(),
                    "firmware versions"
                );
                self.bus
                    .put(channels::FW_HEAD, format!("V{}", fw.head).into());
                self.bus
                    .put(channels::FW_CONTROLLER, format!("V{}", fw.controller).into());
            }
            Err(e) => warn!(error = %e, "firmware version read failed"),
        }
    }

    /// One fast tick: status poll if due, deadman, state machine step,
    /// diagnostics poll if due.
    pub async fn step(&mut self) {
        let now = clock_now();
        if self.status_cadence.due(now) {
            self.poll_status().await;
        }

        let deadman_expired = self.deadman.check_and_reset(clock_now(), self.bus.as_ref());

        let inputs = StateInputs {
            laser_on: self.read_flag(channels::LASER_ON),
            emergency_stop: self.read_flag(channels::EMERGENCY_STOP),
            ready: self.last_registers.map(|r| r.ready()).unwrap_or(false),
            emitting: self.last_registers.map(|r| r.emitting()).unwrap_or(false),
            deadman_expired,
            faults: self.active_faults.clone(),
        };

        let now = clock_now();
        let evaluation = self.machine.evaluate(now, &inputs);
        let mut commit = true;
        for action in &evaluation.actions {
            if !self.execute(action).await {
                commit = false;
            }
        }
        if commit && self.machine.commit(evaluation.next, clock_now()) {
            info!(state = %self.machine.state(), "laser state changed");
            self.bus
                .put(channels::LASER_STATE, self.machine.state().as_i64().into());
        }

        let now = clock_now();
        if self.diagnostics_cadence.due(now) {
            self.poll_diagnostics().await;
        }
    }

    /// Execute one side effect. Returns false when the proposed transition
    /// must not commit: only a failed start blocks, since staying out of
    /// `Starting` on a refused SSD_1 is the safe direction. A failed stop
    /// commits anyway and is retried from the new state's logic.
    async fn execute(&mut self, action: &Action) -> bool {
        match action {
            Action::StartEmission => match self.controller.start_emission().await {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "start emission failed");
                    self.bus
                        .put(channels::LAST_ERROR, format!("Start failed: {}", e).into());
                    false
                }
            },
            Action::StopEmission => {
                if let Err(e) = self.controller.stop_emission().await {
                    error!(error = %e, "stop emission failed");
                    self.bus
                        .put(channels::LAST_ERROR, format!("Stop failed: {}", e).into());
                }
                true
            }
            Action::ClearLaserOn => {
                self.bus.put(channels::LASER_ON, 0i64.into());
                true
            }
            Action::ClearEmergencyStop => {
                self.bus.put(channels::EMERGENCY_STOP, 0i64.into());
                true
            }
            Action::SetLastError(message) => {
                warn!(message = message.as_str(), "fault recorded");
                self.bus.put(channels::LAST_ERROR, message.clone().into());
                true
            }
            Action::ClearLastError => {
                self.bus.put(channels::LAST_ERROR, "".into());
                true
            }
        }
    }

    /// SER then MTE. A failed exchange leaves the previous snapshot in
    /// place; the state machine runs on stale data rather than fabricated
    /// zeros.
    async fn poll_status(&mut self) {
        match self.controller.get_status_registers().await {
            Ok(regs) => {
                self.poll_failures = 0;
                self.publish_registers(&regs);
                self.update_faults(&regs);
                self.last_registers = Some(regs);
            }
            Err(e) => self.note_poll_failure("status", &e),
        }

        match self.controller.get_temperatures().await {
            Ok(temps) => {
                self.bus.put(channels::DIODE_TEMP, temps.diode_c.into());
                self.bus.put(channels::CRYSTAL_TEMP, temps.crystal_c.into());
                self.bus
                    .put(channels::HEATSINK_TEMP, i64::from(temps.heatsink_c).into());
                self.bus.put(
                    channels::LASER_HEATSINK_TEMP,
                    i64::from(temps.laser_heatsink_c).into(),
                );
            }
            Err(e) => self.note_poll_failure("temperature", &e),
        }
    }

    fn publish_registers(&self, regs: &StatusRegisters) {
        self.bus.put(channels::EREG1, i64::from(regs.ereg1).into());
        self.bus.put(channels::EREG2, i64::from(regs.ereg2).into());
        self.bus.put(channels::EREG3, i64::from(regs.ereg3).into());
        self.bus.put(channels::IREG1, i64::from(regs.ireg1).into());
        self.bus.put(channels::IREG2, i64::from(regs.ireg2).into());
        self.bus.put(channels::IREG3, i64::from(regs.ireg3).into());
        self.bus.put(channels::READY, regs.ready().into());
        self.bus.put(channels::EMITTING, regs.emitting().into());
        // The head ties temperature-ok to the same ready flag.
        self.bus.put(channels::TEMP_OK, regs.ready().into());
    }

    fn update_faults(&mut self, regs: &StatusRegisters) {
        let decoded = fault::decode(regs.ereg1, regs.ereg2, regs.ereg3);
        let faults: Vec<&'static FaultDef> = decoded.iter().copied().collect();

        // Every catalogue channel gets written so cleared faults drop back
        // to 0 on the bus.
        for def in &FAULT_TABLE {
            let active = faults.iter().any(|f| f.code == def.code);
            self.bus.put(def.channel, active.into());
        }

        if faults != self.active_faults {
            let codes: Vec<&str> = faults.iter().map(|f| f.code).collect();
            if faults.is_empty() {
                info!("all faults cleared");
            } else {
                warn!(faults = codes.join(",").as_str(), "active fault set changed");
            }
        }
        self.active_faults = faults;
    }

    /// EMT plus service uptime.
    async fn poll_diagnostics(&mut self) {
        match self.controller.get_emission_time().await {
            Ok(rt) => {
                self.bus
                    .put(channels::DIODE_HOURS, i64::from(rt.diode_hours).into());
                self.bus
                    .put(channels::DIODE_MINUTES, i64::from(rt.diode_minutes).into());
                self.bus
                    .put(channels::EMISSION_HOURS, i64::from(rt.emission_hours).into());
                self.bus.put(
                    channels::EMISSION_MINUTES,
                    i64::from(rt.emission_minutes).into(),
                );
            }
            Err(e) => self.note_poll_failure("runtime counter", &e),
        }

        let uptime = clock_now().saturating_duration_since(self.started_at);
        self.bus
            .put(channels::UPTIME, (uptime.as_secs() as i64).into());
        debug!(uptime_secs = uptime.as_secs(), "diagnostics published");
    }

    fn note_poll_failure(&mut self, what: &str, error: &ProtocolError) {
        self.poll_failures += 1;
        warn!(
            error = %error,
            consecutive = self.poll_failures,
            "{} poll failed",
            what
        );
    }

    fn read_flag(&self, channel: &str) -> bool {
        self.bus
            .get(channel)
            .and_then(|v| v.as_int())
            .unwrap_or(0)
            != 0
    }

    /// Run until the shutdown signal flips. Performs startup first.
    pub async fn run(&mut self, config: &SupervisorConfig, mut shutdown: watch::Receiver<bool>) {
        self.startup().await;

        let mut ticker = interval(config.fast_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            fast_ms = config.fast_period.as_millis() as u64,
            status_secs = config.status_period.as_secs(),
            diagnostics_secs = config.diagnostics_period.as_secs(),
            "supervisor running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.step().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Orderly shutdown: emission is never left running behind a dead
    /// supervisor.
    pub async fn shutdown(&mut self) {
        if !matches!(self.machine.state(), LaserState::Off | LaserState::Error) {
            info!("stopping emission for shutdown");
            if let Err(e) = self.controller.stop_emission().await {
                error!(error = %e, "shutdown stop failed");
            }
            self.machine.commit(LaserState::Off, clock_now());
        }
        self.bus
            .put(channels::LASER_STATE, self.machine.state().as_i64().into());
        info!("supervisor stopped");
    }
}

// Routed through the tokio clock so paused-clock tests control it.
fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}
