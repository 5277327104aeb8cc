//! Serial protocol client for the laser head controller.
//!
//! Commands are ASCII frames `<Op><Code>[_<Data>]<LF><CR>` with Op `G` (get)
//! or `S` (set) and a fixed 3-character code. Responses are ASCII terminated
//! by the `>` prompt, fields separated by `_`. The controller mandates at
//! least 1 s between commands; the client enforces that gap and serializes
//! all exchanges so exactly one command is in flight on the link.

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

pub const SERIAL_BAUDRATE: u32 = 19_200;
/// Mandatory gap between commands, measured from completion of the previous
/// exchange. A protocol requirement, not a tuning knob.
pub const COMMAND_GAP: Duration = Duration::from_secs(1);
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

const MAX_FRAME_SIZE: usize = 32;
const RESPONSE_TERMINATOR: u8 = b'>';

/// Command codes understood by the head controller.
pub mod cmd {
    /// Status and error registers.
    pub const SER: &str = "SER";
    /// Temperature measurements.
    pub const MTE: &str = "MTE";
    /// Diode and emission runtime counters.
    pub const EMT: &str = "EMT";
    /// Serial number.
    pub const SEN: &str = "SEN";
    /// Firmware versions.
    pub const FVE: &str = "FVE";
    /// Set emission on/off.
    pub const SSD: &str = "SSD";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Set,
}

impl Op {
    fn key(self) -> char {
        match self {
            Op::Get => 'G',
            Op::Set => 'S',
        }
    }
}

/// One serial command before framing.
#[derive(Debug, Clone, Copy)]
pub struct CommandFrame<'a> {
    pub op: Op,
    pub code: &'static str,
    pub payload: Option<&'a str>,
}

impl<'a> CommandFrame<'a> {
    pub fn get(code: &'static str) -> Self {
        Self { op: Op::Get, code, payload: None }
    }

    pub fn set(code: &'static str, payload: &'a str) -> Self {
        Self { op: Op::Set, code, payload: Some(payload) }
    }

    /// Wire form: `<op><code>_<payload><LF><CR>`, or without `_<payload>`
    /// when there is none.
    pub fn serialize(&self) -> ArrayString<MAX_FRAME_SIZE> {
        let mut frame = ArrayString::new();
        frame.push(self.op.key());
        frame.push_str(self.code);
        if let Some(payload) = self.payload {
            frame.push('_');
            frame.push_str(payload);
        }
        frame.push_str("\n\r");
        frame
    }
}

/// Link-level failures. Neither variant changes laser state by itself; the
/// supervisor treats them as "no new data this cycle".
#[derive(Debug, Error)]
pub enum CommError {
    #[error("response terminator not seen within {READ_TIMEOUT:?}")]
    Timeout,
    #[error("serial link failure: {0}")]
    Link(#[from] io::Error),
}

/// Response-level failures on an otherwise working link.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error("malformed {command} response: {response:?}")]
    Malformed {
        command: &'static str,
        response: String,
    },
    #[error("{command} not acknowledged, got {response:?}")]
    Nack {
        command: &'static str,
        response: String,
    },
}

/// Snapshot of the six status/error registers (SER).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRegisters {
    pub ereg1: u8,
    pub ereg2: u8,
    pub ereg3: u8,
    pub ireg1: u8,
    pub ireg2: u8,
    pub ireg3: u8,
}

impl StatusRegisters {
    /// IREG2 bit 2: temperatures settled, ready for emission.
    pub fn ready(&self) -> bool {
        (self.ireg2 >> 2) & 1 == 1
    }

    /// IREG2 bit 0: laser diode current on.
    pub fn emitting(&self) -> bool {
        self.ireg2 & 1 == 1
    }
}

/// Temperature measurements (MTE).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub diode_c: f64,
    pub crystal_c: f64,
    pub heatsink_c: i32,
    pub laser_heatsink_c: i32,
}

/// Runtime counters (EMT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionTime {
    pub diode_hours: u32,
    pub diode_minutes: u32,
    pub emission_hours: u32,
    pub emission_minutes: u32,
}

/// Head serial number and firmware versions, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersions {
    pub head: String,
    pub controller: String,
}

struct Link<T> {
    port: T,
    last_exchange: Option<Instant>,
}

/// Protocol client owning the serial link. Generic over the transport so
/// tests can drive it through an in-memory duplex stream.
pub struct LaserController<T> {
    link: Mutex<Link<T>>,
}

impl LaserController<SerialStream> {
    /// Open the serial device at 19200 8N1 and flush both buffers. Failure
    /// here is fatal for the service: there is no degraded mode without a
    /// working link.
    pub fn open(device: &str) -> Result<Self, CommError> {
        let port = tokio_serial::new(device, SERIAL_BAUDRATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| CommError::Link(io::Error::new(io::ErrorKind::Other, e)))?;
        port.clear(tokio_serial::ClearBuffer::All)
            .map_err(|e| CommError::Link(io::Error::new(io::ErrorKind::Other, e)))?;
        info!(device, "serial link opened");
        Ok(Self::from_transport(port))
    }
}

impl<T> LaserController<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_transport(port: T) -> Self {
        Self {
            link: Mutex::new(Link {
                port,
                last_exchange: None,
            }),
        }
    }

    /// Send one command and collect the response up to the `>` prompt.
    ///
    /// Waits out the remainder of the mandatory inter-command gap before
    /// transmitting. The completion time is recorded whether or not the
    /// exchange succeeded, so the gap is honored after failures too.
    pub async fn exchange(&self, frame: CommandFrame<'_>) -> Result<String, CommError> {
        let mut link = self.link.lock().await;

        if let Some(last) = link.last_exchange {
            let since = last.elapsed();
            if since < COMMAND_GAP {
                sleep(COMMAND_GAP - since).await;
            }
        }

        let result = Self::exchange_inner(&mut link.port, frame).await;
        link.last_exchange = Some(Instant::now());
        result
    }

    async fn exchange_inner(port: &mut T, frame: CommandFrame<'_>) -> Result<String, CommError> {
        let wire = frame.serialize();
        debug!(tx = wire.trim(), "serial write");
        port.write_all(wire.as_bytes()).await?;
        port.flush().await?;

        let deadline = Instant::now() + READ_TIMEOUT;
        let mut raw: Vec<u8> = Vec::with_capacity(64);
        let mut byte = [0u8; 1];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CommError::Timeout);
            }
            let n = match timeout(remaining, port.read(&mut byte)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(CommError::Link(e)),
                Err(_) => return Err(CommError::Timeout),
            };
            if n == 0 {
                return Err(CommError::Link(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial link closed",
                )));
            }
            raw.push(byte[0]);
            if byte[0] == RESPONSE_TERMINATOR {
                break;
            }
        }

        let text = String::from_utf8_lossy(&raw);
        let trimmed = text
            .trim_matches(|c: char| c == '>' || c == '\n' || c == '\r' || c == ' ')
            .to_string();
        debug!(rx = trimmed.as_str(), "serial read");
        Ok(trimmed)
    }

    /// SER: the six hex-encoded status/error registers.
    pub async fn get_status_registers(&self) -> Result<StatusRegisters, ProtocolError> {
        let response = self.exchange(CommandFrame::get(cmd::SER)).await?;
        let fields = split_fields(&response, cmd::SER, 7)?;
        Ok(StatusRegisters {
            ereg1: parse_hex(fields[1], cmd::SER, &response)?,
            ereg2: parse_hex(fields[2], cmd::SER, &response)?,
            ereg3: parse_hex(fields[3], cmd::SER, &response)?,
            ireg1: parse_hex(fields[4], cmd::SER, &response)?,
            ireg2: parse_hex(fields[5], cmd::SER, &response)?,
            ireg3: parse_hex(fields[6], cmd::SER, &response)?,
        })
    }

    /// MTE: diode/crystal in hundredths of a degree, heatsinks in whole
    /// degrees.
    pub async fn get_temperatures(&self) -> Result<Temperatures, ProtocolError> {
        let response = self.exchange(CommandFrame::get(cmd::MTE)).await?;
        let fields = split_fields(&response, cmd::MTE, 5)?;
        Ok(Temperatures {
            diode_c: f64::from(parse_num::<i32>(fields[1], cmd::MTE, &response)?) * 0.01,
            crystal_c: f64::from(parse_num::<i32>(fields[2], cmd::MTE, &response)?) * 0.01,
            heatsink_c: parse_num(fields[3], cmd::MTE, &response)?,
            laser_heatsink_c: parse_num(fields[4], cmd::MTE, &response)?,
        })
    }

    /// EMT: diode and emission runtime counters.
    pub async fn get_emission_time(&self) -> Result<EmissionTime, ProtocolError> {
        let response = self.exchange(CommandFrame::get(cmd::EMT)).await?;
        let fields = split_fields(&response, cmd::EMT, 5)?;
        Ok(EmissionTime {
            diode_hours: parse_num(fields[1], cmd::EMT, &response)?,
            diode_minutes: parse_num(fields[2], cmd::EMT, &response)?,
            emission_hours: parse_num(fields[3], cmd::EMT, &response)?,
            emission_minutes: parse_num(fields[4], cmd::EMT, &response)?,
        })
    }

    /// SEN: opaque serial number string.
    pub async fn get_serial_number(&self) -> Result<String, ProtocolError> {
        let response = self.exchange(CommandFrame::get(cmd::SEN)).await?;
        let fields = split_fields(&response, cmd::SEN, 2)?;
        Ok(fields[1].to_string())
    }

    /// FVE: (head, controller) firmware versions.
    pub async fn get_firmware_versions(&self) -> Result<FirmwareVersions, ProtocolError> {
        let response = self.exchange(CommandFrame::get(cmd::FVE)).await?;
        let fields = split_fields(&response, cmd::FVE, 3)?;
        Ok(FirmwareVersions {
            head: fields[1].to_string(),
            controller: fields[2].to_string(),
        })
    }

    /// SSD_1: start emission. The controller must echo `SSSD_1`; anything
    /// else is a failure for the caller to handle (no automatic retry).
    pub async fn start_emission(&self) -> Result<(), ProtocolError> {
        self.set_emission("1").await
    }

    /// SSD_0: stop emission, acknowledged by `SSSD_0`.
    pub async fn stop_emission(&self) -> Result<(), ProtocolError> {
        self.set_emission("0").await
    }

    async fn set_emission(&self, payload: &str) -> Result<(), ProtocolError> {
        let response = self.exchange(CommandFrame::set(cmd::SSD, payload)).await?;
        let ack = format!("SSSD_{}", payload);
        if response.contains(&ack) {
            info!(payload, "emission command acknowledged");
            Ok(())
        } else {
            Err(ProtocolError::Nack {
                command: cmd::SSD,
                response,
            })
        }
    }
}

fn split_fields<'a>(
    response: &'a str,
    command: &'static str,
    min_fields: usize,
) -> Result<Vec<&'a str>, ProtocolError> {
    let fields: Vec<&str> = response.split('_').collect();
    if fields.len() < min_fields {
        return Err(ProtocolError::Malformed {
            command,
            response: response.to_string(),
        });
    }
    Ok(fields)
}

fn parse_hex(field: &str, command: &'static str, response: &str) -> Result<u8, ProtocolError> {
    u8::from_str_radix(field, 16).map_err(|_| ProtocolError::Malformed {
        command,
        response: response.to_string(),
    })
}

fn parse_num<N: std::str::FromStr>(
    field: &str,
    command: &'static str,
    response: &str,
) -> Result<N, ProtocolError> {
    field.parse().map_err(|_| ProtocolError::Malformed {
        command,
        response: response.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_with_payload() {
        let frame = CommandFrame::set(cmd::SSD, "1");
        assert_eq!(frame.serialize().as_str(), "SSSD_1\n\r");
    }

    #[test]
    fn frame_without_payload() {
        let frame = CommandFrame::get(cmd::SER);
        assert_eq!(frame.serialize().as_str(), "GSER\n\r");
    }

    #[test]
    fn frame_bytes_end_with_lf_cr() {
        let bytes = CommandFrame::get(cmd::MTE).serialize();
        assert_eq!(&bytes.as_bytes()[bytes.len() - 2..], b"\n\r");
    }

    #[test]
    fn register_snapshot_flags() {
        let regs = StatusRegisters {
            ereg1: 0,
            ereg2: 0,
            ereg3: 0,
            ireg1: 0,
            ireg2: 0b0000_0101,
            ireg3: 0,
        };
        assert!(regs.ready());
        assert!(regs.emitting());

        let idle = StatusRegisters { ireg2: 0b0000_0100, ..regs };
        assert!(idle.ready());
        assert!(!idle.emitting());
    }
}
