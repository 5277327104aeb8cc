use clap::{App, Arg};
use laserbridge::bus::{channels, BusReply, BusRequest, ChannelBus, MemoryBus};
use laserbridge::controller::LaserController;
use laserbridge::supervisor::{LaserSupervisor, SupervisorConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "127.0.0.1:7045";

/// Channels external clients may write. Everything else on the bus is
/// supervisor-owned telemetry.
const WRITABLE_CHANNELS: &[&str] = &[
    channels::LASER_ON,
    channels::EMERGENCY_STOP,
    channels::TURN_OFF,
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("laserbridged")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Laser head supervision daemon: serial protocol client, safety interlocks, channel bus")
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("PATH")
                .help("Serial device of the laser head controller")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("ADDR")
                .help("TCP listen address for the channel bus")
                .takes_value(true)
                .default_value(DEFAULT_LISTEN),
        )
        .arg(
            Arg::with_name("heartbeat-timeout")
                .long("heartbeat-timeout")
                .value_name("SECONDS")
                .help("Deadman heartbeat timeout")
                .takes_value(true)
                .default_value("5")
                .validator(|v| {
                    v.parse::<u64>()
                        .map(|_| ())
                        .map_err(|_| "timeout must be a whole number of seconds".into())
                }),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level when RUST_LOG is unset")
                .takes_value(true)
                .default_value("info"),
        )
        .get_matches();

    let log_level = matches.value_of("log-level").unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let device = matches.value_of("device").unwrap_or_default().to_string();
    let listen = matches.value_of("listen").unwrap_or(DEFAULT_LISTEN).to_string();
    let heartbeat_timeout = matches
        .value_of("heartbeat-timeout")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);

    let config = SupervisorConfig {
        heartbeat_timeout: Duration::from_secs(heartbeat_timeout),
        ..SupervisorConfig::default()
    };

    // No link, no service. Everything downstream assumes a working port.
    let controller = LaserController::open(&device)?;
    let bus = Arc::new(MemoryBus::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor_bus: Arc<dyn ChannelBus> = bus.clone();
    let supervisor_config = config.clone();
    let supervisor = tokio::spawn(async move {
        let mut sup = LaserSupervisor::new(controller, supervisor_bus, &supervisor_config);
        sup.run(&supervisor_config, shutdown_rx).await;
    });

    let listener = TcpListener::bind(&listen).await?;
    info!(listen = listen.as_str(), device = device.as_str(), "channel bus listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "client connected");
                        let client_bus = Arc::clone(&bus);
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, client_bus).await {
                                warn!(peer = %peer, error = %e, "client connection ended");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    supervisor.await?;
    Ok(())
}

/// JSON-lines request/response. The reply line is the write acknowledgment;
/// heartbeat clients rely on it to pace themselves.
async fn handle_client(
    stream: TcpStream,
    bus: Arc<MemoryBus>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<BusRequest>(trimmed) {
            Ok(BusRequest::Get { channel }) => BusReply::ok(bus.get(&channel)),
            Ok(BusRequest::Set { channel, value }) => {
                if WRITABLE_CHANNELS.contains(&channel.as_str()) {
                    bus.put(&channel, value);
                    BusReply::ok(None)
                } else {
                    BusReply::err(format!("channel {:?} is read-only", channel))
                }
            }
            Err(e) => BusReply::err(format!("invalid request: {}", e)),
        };

        let mut payload = serde_json::to_string(&reply)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}
