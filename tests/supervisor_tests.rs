//! End-to-end supervision tests: a scripted laser head on the far side of an
//! in-memory duplex link, the real supervisor on the near side, driven tick
//! by tick under the paused tokio clock.

use laserbridge::bus::{channels, ChannelBus, MemoryBus};
use laserbridge::controller::LaserController;
use laserbridge::state::LaserState;
use laserbridge::supervisor::{LaserSupervisor, SupervisorConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Mutable laser head model shared with the emulator task.
#[derive(Debug, Default)]
struct HeadModel {
    ereg1: u8,
    ereg2: u8,
    ereg3: u8,
    ready: bool,
    emitting: bool,
    start_count: u32,
    stop_count: u32,
}

impl HeadModel {
    fn ireg2(&self) -> u8 {
        u8::from(self.emitting) | (u8::from(self.ready) << 2)
    }
}

fn spawn_head(mut device: DuplexStream, model: Arc<Mutex<HeadModel>>) {
    tokio::spawn(async move {
        let mut frame = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            frame.clear();
            loop {
                match device.read_exact(&mut byte).await {
                    Ok(_) => {}
                    Err(_) => return,
                }
                frame.push(byte[0]);
                if byte[0] == b'\r' {
                    break;
                }
            }
            let command = String::from_utf8_lossy(&frame).trim().to_string();
            let response = {
                let mut m = model.lock().unwrap();
                match command.as_str() {
                    "GSER" => format!(
                        "GSER_{:02X}_{:02X}_{:02X}_00_{:02X}_00>",
                        m.ereg1,
                        m.ereg2,
                        m.ereg3,
                        m.ireg2()
                    ),
                    "GMTE" => "GMTE_2550_2437_25_31>".to_string(),
                    "GEMT" => "GEMT_100_30_50_15>".to_string(),
                    "GSEN" => "GSEN_MLC12345>".to_string(),
                    "GFVE" => "GFVE_1.23_4.56>".to_string(),
                    "SSSD_1" => {
                        m.start_count += 1;
                        m.emitting = true;
                        m.ready = true;
                        "SSSD_1>".to_string()
                    }
                    "SSSD_0" => {
                        m.stop_count += 1;
                        m.emitting = false;
                        "SSSD_0>".to_string()
                    }
                    other => format!("?{}>", other),
                }
            };
            if device.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    });
}

struct Rig {
    supervisor: LaserSupervisor<DuplexStream>,
    bus: Arc<MemoryBus>,
    model: Arc<Mutex<HeadModel>>,
}

fn rig() -> Rig {
    let (port, device) = tokio::io::duplex(256);
    let model = Arc::new(Mutex::new(HeadModel::default()));
    spawn_head(device, Arc::clone(&model));

    let bus = Arc::new(MemoryBus::new());
    let config = SupervisorConfig {
        heartbeat_timeout: Duration::from_secs(5),
        ..SupervisorConfig::default()
    };
    let supervisor = LaserSupervisor::new(
        LaserController::from_transport(port),
        bus.clone() as Arc<dyn ChannelBus>,
        &config,
    );
    Rig {
        supervisor,
        bus,
        model,
    }
}

fn get_int(bus: &MemoryBus, channel: &str) -> Option<i64> {
    bus.get(channel).and_then(|v| v.as_int())
}

fn get_str(bus: &MemoryBus, channel: &str) -> Option<String> {
    bus.get(channel).and_then(|v| v.as_str().map(String::from))
}

async fn step_until(rig: &mut Rig, target: LaserState, max_steps: usize) {
    for _ in 0..max_steps {
        if rig.supervisor.state() == target {
            return;
        }
        rig.supervisor.step().await;
    }
    assert_eq!(rig.supervisor.state(), target, "state not reached");
}

fn heartbeat(bus: &MemoryBus) {
    bus.put(channels::TURN_OFF, 0i64.into());
}

#[tokio::test(start_paused = true)]
async fn startup_publishes_identity_and_defaults() {
    let mut rig = rig();
    rig.supervisor.startup().await;

    assert_eq!(get_str(&rig.bus, channels::SERIAL_NUMBER).as_deref(), Some("MLC12345"));
    assert_eq!(get_str(&rig.bus, channels::FW_HEAD).as_deref(), Some("V1.23"));
    assert_eq!(get_str(&rig.bus, channels::FW_CONTROLLER).as_deref(), Some("V4.56"));
    assert_eq!(get_int(&rig.bus, channels::LASER_STATE), Some(0));
    assert_eq!(get_int(&rig.bus, channels::TURN_OFF), Some(1));
    assert_eq!(get_int(&rig.bus, channels::HEARTBEAT_TIMEOUT), Some(5));
}

#[tokio::test(start_paused = true)]
async fn emission_sequence_reaches_on() {
    let mut rig = rig();
    rig.supervisor.startup().await;

    rig.bus.put(channels::LASER_ON, 1i64.into());
    heartbeat(&rig.bus);
    rig.supervisor.step().await;
    assert_eq!(rig.supervisor.state(), LaserState::Starting);
    assert_eq!(rig.model.lock().unwrap().start_count, 1);
    assert_eq!(get_int(&rig.bus, channels::LASER_STATE), Some(1));

    // Each polling step spends serial-gap time, so the startup delay
    // elapses across a few ticks.
    for _ in 0..10 {
        if rig.supervisor.state() == LaserState::On {
            break;
        }
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
    }
    assert_eq!(rig.supervisor.state(), LaserState::On);
    assert_eq!(get_int(&rig.bus, channels::LASER_STATE), Some(2));
    assert_eq!(get_int(&rig.bus, channels::EMITTING), Some(1));
    assert_eq!(get_int(&rig.bus, channels::READY), Some(1));
    // Exactly one start command for the whole sequence.
    assert_eq!(rig.model.lock().unwrap().start_count, 1);
}

#[tokio::test(start_paused = true)]
async fn operator_off_stops_and_returns_to_off() {
    let mut rig = rig();
    rig.supervisor.startup().await;
    rig.bus.put(channels::LASER_ON, 1i64.into());
    for _ in 0..10 {
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
        if rig.supervisor.state() == LaserState::On {
            break;
        }
    }
    assert_eq!(rig.supervisor.state(), LaserState::On);

    rig.bus.put(channels::LASER_ON, 0i64.into());
    heartbeat(&rig.bus);
    rig.supervisor.step().await;
    assert!(matches!(
        rig.supervisor.state(),
        LaserState::Stopping | LaserState::Off
    ));
    assert_eq!(rig.model.lock().unwrap().stop_count, 1);

    step_until(&mut rig, LaserState::Off, 5).await;
    assert_eq!(get_int(&rig.bus, channels::LASER_STATE), Some(0));
}

#[tokio::test(start_paused = true)]
async fn critical_fault_stops_emission_exactly_once() {
    let mut rig = rig();
    rig.supervisor.startup().await;
    rig.bus.put(channels::LASER_ON, 1i64.into());
    for _ in 0..10 {
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
        if rig.supervisor.state() == LaserState::On {
            break;
        }
    }
    assert_eq!(rig.supervisor.state(), LaserState::On);

    // Interlock open: EREG1 bit 2 (E3), critical.
    rig.model.lock().unwrap().ereg1 = 0b100;
    for _ in 0..5 {
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
        if rig.supervisor.state() == LaserState::Error {
            break;
        }
    }
    assert_eq!(rig.supervisor.state(), LaserState::Error);
    assert_eq!(rig.model.lock().unwrap().stop_count, 1);
    assert_eq!(
        get_str(&rig.bus, channels::LAST_ERROR).as_deref(),
        Some("Critical: E3")
    );
    assert_eq!(get_int(&rig.bus, "err_interlock"), Some(1));

    // Fault persists, operator still asking for emission: latched, no
    // further stop commands.
    heartbeat(&rig.bus);
    rig.supervisor.step().await;
    heartbeat(&rig.bus);
    rig.supervisor.step().await;
    assert_eq!(rig.supervisor.state(), LaserState::Error);
    assert_eq!(rig.model.lock().unwrap().stop_count, 1);

    // Recovery: fault clears and the operator acknowledges by dropping the
    // emission request.
    rig.model.lock().unwrap().ereg1 = 0;
    rig.bus.put(channels::LASER_ON, 0i64.into());
    step_until(&mut rig, LaserState::Off, 5).await;
    assert_eq!(get_str(&rig.bus, channels::LAST_ERROR).as_deref(), Some(""));
    assert_eq!(get_int(&rig.bus, "err_interlock"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn on_command_is_refused_while_critical_fault_is_active() {
    let mut rig = rig();
    rig.supervisor.startup().await;

    // Interlock already open before any emission request.
    rig.model.lock().unwrap().ereg1 = 0b100;
    rig.supervisor.step().await;
    assert_eq!(get_int(&rig.bus, "err_interlock"), Some(1));

    rig.bus.put(channels::LASER_ON, 1i64.into());
    for _ in 0..3 {
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
    }
    assert_eq!(rig.supervisor.state(), LaserState::Off);
    assert_eq!(rig.model.lock().unwrap().start_count, 0);

    // Fault clears: the standing request may now proceed.
    rig.model.lock().unwrap().ereg1 = 0;
    for _ in 0..3 {
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
        if rig.supervisor.state() != LaserState::Off {
            break;
        }
    }
    assert_eq!(rig.supervisor.state(), LaserState::Starting);
    assert_eq!(rig.model.lock().unwrap().start_count, 1);
}

#[tokio::test(start_paused = true)]
async fn deadman_timeout_shuts_down_and_clears_request() {
    let mut rig = rig();
    rig.supervisor.startup().await;
    rig.bus.put(channels::LASER_ON, 1i64.into());
    for _ in 0..10 {
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
        if rig.supervisor.state() == LaserState::On {
            break;
        }
    }
    assert_eq!(rig.supervisor.state(), LaserState::On);

    // Client dies: no more heartbeats. Polling steps burn serial-gap time,
    // so the 5 s timeout expires within a few ticks.
    for _ in 0..10 {
        rig.supervisor.step().await;
        if rig.supervisor.state() != LaserState::On {
            break;
        }
    }
    assert!(matches!(
        rig.supervisor.state(),
        LaserState::Stopping | LaserState::Off
    ));
    assert_eq!(rig.model.lock().unwrap().stop_count, 1);
    assert_eq!(get_int(&rig.bus, channels::LASER_ON), Some(0));
    assert_eq!(
        get_str(&rig.bus, channels::LAST_ERROR).as_deref(),
        Some("Deadman timeout")
    );

    step_until(&mut rig, LaserState::Off, 5).await;
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_overrides_running_emission() {
    let mut rig = rig();
    rig.supervisor.startup().await;
    rig.bus.put(channels::LASER_ON, 1i64.into());
    for _ in 0..10 {
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
        if rig.supervisor.state() == LaserState::On {
            break;
        }
    }
    assert_eq!(rig.supervisor.state(), LaserState::On);

    rig.bus.put(channels::EMERGENCY_STOP, 1i64.into());
    heartbeat(&rig.bus);
    rig.supervisor.step().await;

    assert_eq!(rig.supervisor.state(), LaserState::Error);
    assert_eq!(rig.model.lock().unwrap().stop_count, 1);
    assert!(!rig.model.lock().unwrap().emitting);
    // Both request flags consumed.
    assert_eq!(get_int(&rig.bus, channels::LASER_ON), Some(0));
    assert_eq!(get_int(&rig.bus, channels::EMERGENCY_STOP), Some(0));
    assert_eq!(
        get_str(&rig.bus, channels::LAST_ERROR).as_deref(),
        Some("Emergency stop")
    );
}

#[tokio::test(start_paused = true)]
async fn status_poll_publishes_registers_and_temperatures() {
    let mut rig = rig();
    rig.supervisor.startup().await;
    rig.supervisor.step().await;

    assert_eq!(get_int(&rig.bus, channels::EREG1), Some(0));
    // Head not started: temp_ok tracks the ready flag.
    assert_eq!(get_int(&rig.bus, channels::TEMP_OK), Some(0));
    let diode = rig
        .bus
        .get(channels::DIODE_TEMP)
        .and_then(|v| v.as_f64())
        .unwrap();
    assert!((diode - 25.50).abs() < 1e-9);
    assert_eq!(get_int(&rig.bus, channels::HEATSINK_TEMP), Some(25));
}

#[tokio::test(start_paused = true)]
async fn diagnostics_poll_publishes_runtime_counters() {
    let mut rig = rig();
    rig.supervisor.startup().await;
    // First step runs every cadence, including the 0.1 Hz one.
    rig.supervisor.step().await;

    assert_eq!(get_int(&rig.bus, channels::DIODE_HOURS), Some(100));
    assert_eq!(get_int(&rig.bus, channels::DIODE_MINUTES), Some(30));
    assert_eq!(get_int(&rig.bus, channels::EMISSION_HOURS), Some(50));
    assert_eq!(get_int(&rig.bus, channels::EMISSION_MINUTES), Some(15));
    assert!(get_int(&rig.bus, channels::UPTIME).is_some());
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_on_stops_emission() {
    let mut rig = rig();
    rig.supervisor.startup().await;
    rig.bus.put(channels::LASER_ON, 1i64.into());
    for _ in 0..10 {
        heartbeat(&rig.bus);
        rig.supervisor.step().await;
        if rig.supervisor.state() == LaserState::On {
            break;
        }
    }
    assert_eq!(rig.supervisor.state(), LaserState::On);

    rig.supervisor.shutdown().await;
    assert_eq!(rig.model.lock().unwrap().stop_count, 1);
    assert!(!rig.model.lock().unwrap().emitting);
    assert_eq!(get_int(&rig.bus, channels::LASER_STATE), Some(0));
}
