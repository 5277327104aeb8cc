use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use laserbridge::bus::{channels, BusReply, BusRequest, ChannelValue};
use laserbridge::fault::{Severity, FAULT_TABLE};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "7045";

type CliError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let matches = App::new("laserctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Operator client for the laser bridge daemon")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Daemon host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Daemon port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("on")
                .about("Request emission and hold the deadman heartbeat")
                .arg(
                    Arg::with_name("seconds")
                        .help("How long to keep emission requested; -1 holds until Ctrl-C")
                        .required(true)
                        .allow_hyphen_values(true)
                        .validator(|v| {
                            parse_hold(&v).map(|_| ()).ok_or_else(|| {
                                "duration must be whole seconds, or -1 for continuous".to_string()
                            })
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("off").about("Request emission off and wait for confirmation"),
        )
        .subcommand(
            SubCommand::with_name("estop").about("Trigger the emergency stop"),
        )
        .subcommand(
            SubCommand::with_name("status").about("Show laser state, faults and diagnostics"),
        )
        .get_matches();

    let addr = connect_addr(&matches);
    let mut client = BusClient::connect(&addr).await.map_err(|e| {
        format!("cannot reach laserbridged at {}: {}", addr, e)
    })?;

    match matches.subcommand() {
        ("on", Some(sub)) => {
            let hold = sub
                .value_of("seconds")
                .and_then(parse_hold)
                .unwrap_or(Some(Duration::from_secs(0)));
            run_on(&mut client, hold).await
        }
        ("off", _) => run_off(&mut client).await,
        ("estop", _) => {
            client
                .set(channels::EMERGENCY_STOP, ChannelValue::Int(1))
                .await?;
            println!("{}", "Emergency stop triggered".red().bold());
            Ok(())
        }
        ("status", _) => run_status(&mut client).await,
        _ => {
            eprintln!("No command given; try `laserctl status`.");
            std::process::exit(2);
        }
    }
}

fn connect_addr(matches: &ArgMatches<'_>) -> String {
    format!(
        "{}:{}",
        matches.value_of("host").unwrap_or(DEFAULT_HOST),
        matches.value_of("port").unwrap_or(DEFAULT_PORT)
    )
}

/// `-1` means hold until interrupted.
fn parse_hold(raw: &str) -> Option<Option<Duration>> {
    match raw.parse::<i64>() {
        Ok(-1) => Some(None),
        Ok(n) if n >= 0 => Some(Some(Duration::from_secs(n as u64))),
        _ => None,
    }
}

/// Hold emission on, heartbeating at a quarter of the daemon's deadman
/// timeout, until the duration elapses or Ctrl-C; then request off. Even if
/// this client dies outright, the lost heartbeat stops the laser on its own.
async fn run_on(client: &mut BusClient, hold: Option<Duration>) -> Result<(), CliError> {
    let timeout_secs = client
        .get_int(channels::HEARTBEAT_TIMEOUT)
        .await?
        .unwrap_or(5)
        .max(1) as u64;
    let heartbeat_period = Duration::from_secs(timeout_secs).div_f64(4.0);

    client.set(channels::LASER_ON, ChannelValue::Int(1)).await?;
    match hold {
        Some(duration) => println!(
            "Emission requested for {}s (heartbeat every {:.2}s). Ctrl-C requests off early.",
            duration.as_secs(),
            heartbeat_period.as_secs_f64()
        ),
        None => println!(
            "Emission requested until Ctrl-C (heartbeat every {:.2}s).",
            heartbeat_period.as_secs_f64()
        ),
    }

    let deadline = hold.map(|duration| Instant::now() + duration);
    let mut last_state = -1;
    let mut next_report = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }

        client.set(channels::TURN_OFF, ChannelValue::Int(0)).await?;

        let state = client.get_int(channels::LASER_STATE).await?.unwrap_or(0);
        if state != last_state {
            println!("  state: {}", state_label(state));
            last_state = state;
        } else if Instant::now() >= next_report {
            match deadline {
                Some(deadline) => println!(
                    "  state: {} ({}s remaining)",
                    state_label(state),
                    deadline.saturating_duration_since(Instant::now()).as_secs()
                ),
                None => println!("  state: {}", state_label(state)),
            }
            next_report = Instant::now() + Duration::from_secs(10);
        }
        if state == 4 {
            let detail = client
                .get_str(channels::LAST_ERROR)
                .await?
                .unwrap_or_default();
            println!("{} {}", "Fault:".red().bold(), detail);
            return Ok(());
        }

        tokio::select! {
            _ = sleep(heartbeat_period) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted; requesting off.");
                break;
            }
        }
    }

    run_off(client).await
}

/// Request off and wait for the bridge to confirm the diode current is gone.
async fn run_off(client: &mut BusClient) -> Result<(), CliError> {
    client.set(channels::LASER_ON, ChannelValue::Int(0)).await?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let state = client.get_int(channels::LASER_STATE).await?.unwrap_or(0);
        let emitting = client.get_int(channels::EMITTING).await?.unwrap_or(0);
        if state == 0 && emitting == 0 {
            println!("{}", "Emission off".green());
            return Ok(());
        }
        sleep(Duration::from_millis(500)).await;
    }

    println!(
        "{}",
        "Off requested, but emission is not yet confirmed off; check `laserctl status`."
            .yellow()
    );
    Ok(())
}

async fn run_status(client: &mut BusClient) -> Result<(), CliError> {
    let state = client.get_int(channels::LASER_STATE).await?;
    println!("Laser:    {}", match state {
        Some(s) => state_label(s),
        None => "unknown (supervisor not started?)".dimmed().to_string(),
    });
    println!(
        "Flags:    ready={} emitting={} temp_ok={}",
        yes_no(client.get_int(channels::READY).await?),
        yes_no(client.get_int(channels::EMITTING).await?),
        yes_no(client.get_int(channels::TEMP_OK).await?)
    );

    if let Some(message) = client.get_str(channels::LAST_ERROR).await? {
        if !message.is_empty() {
            println!("Error:    {}", message.red());
        }
    }

    let mut active = Vec::new();
    for def in &FAULT_TABLE {
        if client.get_int(def.channel).await?.unwrap_or(0) != 0 {
            let label = match def.severity {
                Severity::Critical => def.code.red().bold().to_string(),
                Severity::Advisory => def.code.yellow().to_string(),
            };
            active.push(label);
        }
    }
    if active.is_empty() {
        println!("Faults:   {}", "none".green());
    } else {
        println!("Faults:   {}", active.join(" "));
    }

    if let (Some(diode), Some(crystal)) = (
        client.get_f64(channels::DIODE_TEMP).await?,
        client.get_f64(channels::CRYSTAL_TEMP).await?,
    ) {
        println!(
            "Temps:    diode {:.2}C crystal {:.2}C heatsink {}C/{}C",
            diode,
            crystal,
            client.get_int(channels::HEATSINK_TEMP).await?.unwrap_or(0),
            client
                .get_int(channels::LASER_HEATSINK_TEMP)
                .await?
                .unwrap_or(0)
        );
    }

    if let Some(hours) = client.get_int(channels::DIODE_HOURS).await? {
        println!(
            "Runtime:  diode {}h{:02}m, emission {}h{:02}m",
            hours,
            client.get_int(channels::DIODE_MINUTES).await?.unwrap_or(0),
            client.get_int(channels::EMISSION_HOURS).await?.unwrap_or(0),
            client
                .get_int(channels::EMISSION_MINUTES)
                .await?
                .unwrap_or(0)
        );
    }

    if let Some(serial) = client.get_str(channels::SERIAL_NUMBER).await? {
        println!(
            "Head:     s/n {} fw {}/{}",
            serial,
            client
                .get_str(channels::FW_HEAD)
                .await?
                .unwrap_or_else(|| "?".into()),
            client
                .get_str(channels::FW_CONTROLLER)
                .await?
                .unwrap_or_else(|| "?".into())
        );
    }

    match client.get_int(channels::UPTIME).await? {
        Some(uptime) if uptime > 0 => {
            println!(
                "Bridge:   up {}s, {} heartbeats",
                uptime,
                client
                    .get_int(channels::HEARTBEAT_COUNT)
                    .await?
                    .unwrap_or(0)
            );
        }
        _ => println!(
            "Bridge:   {}",
            "uptime not published yet; the daemon may have just started".yellow()
        ),
    }
    Ok(())
}

fn state_label(state: i64) -> String {
    match state {
        0 => "OFF".green().to_string(),
        1 => "STARTING".yellow().to_string(),
        2 => "ON (emitting)".red().bold().to_string(),
        3 => "STOPPING".yellow().to_string(),
        4 => "ERROR".red().bold().to_string(),
        other => format!("unknown ({})", other),
    }
}

fn yes_no(value: Option<i64>) -> ColoredString {
    match value {
        Some(v) if v != 0 => "yes".normal(),
        Some(_) => "no".normal(),
        None => "?".dimmed(),
    }
}

/// JSON-lines client for the daemon's channel bus.
struct BusClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl BusClient {
    async fn connect(addr: &str) -> Result<Self, CliError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn request(&mut self, request: &BusRequest) -> Result<BusReply, CliError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply).await? == 0 {
            return Err("daemon closed the connection".into());
        }
        Ok(serde_json::from_str(reply.trim())?)
    }

    async fn get(&mut self, channel: &str) -> Result<Option<ChannelValue>, CliError> {
        let reply = self
            .request(&BusRequest::Get {
                channel: channel.to_string(),
            })
            .await?;
        if reply.ok {
            Ok(reply.value)
        } else {
            Err(reply.error.unwrap_or_else(|| "request refused".into()).into())
        }
    }

    async fn set(&mut self, channel: &str, value: ChannelValue) -> Result<(), CliError> {
        let reply = self
            .request(&BusRequest::Set {
                channel: channel.to_string(),
                value,
            })
            .await?;
        if reply.ok {
            Ok(())
        } else {
            Err(reply.error.unwrap_or_else(|| "request refused".into()).into())
        }
    }

    async fn get_int(&mut self, channel: &str) -> Result<Option<i64>, CliError> {
        Ok(self.get(channel).await?.and_then(|v| v.as_int()))
    }

    async fn get_f64(&mut self, channel: &str) -> Result<Option<f64>, CliError> {
        Ok(self.get(channel).await?.and_then(|v| v.as_f64()))
    }

    async fn get_str(&mut self, channel: &str) -> Result<Option<String>, CliError> {
        Ok(self
            .get(channel)
            .await?
            .and_then(|v| v.as_str().map(String::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_argument_parsing() {
        assert_eq!(parse_hold("30"), Some(Some(Duration::from_secs(30))));
        assert_eq!(parse_hold("0"), Some(Some(Duration::from_secs(0))));
        assert_eq!(parse_hold("-1"), Some(None));
        assert_eq!(parse_hold("-2"), None);
        assert_eq!(parse_hold("abc"), None);
        assert_eq!(parse_hold("1.5"), None);
    }
}
