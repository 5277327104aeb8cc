//! Error-register fault catalogue.
//!
//! The laser head reports faults as bits in three 8-bit error registers.
//! The mapping from (register, bit) to fault code and severity comes from
//! the hardware manual and is fixed data: 24 entries, 15 critical and
//! 9 advisory. Decoding is pure and stateless.

use heapless::Vec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorRegister {
    Ereg1,
    Ereg2,
    Ereg3,
}

/// Critical faults mandate immediate emission shutdown; advisory faults are
/// reported but do not by themselves halt emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    Advisory,
}

/// One entry of the fault catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultDef {
    pub register: ErrorRegister,
    pub bit: u8,
    /// Stable short identifier from the hardware manual (E1..E24).
    pub code: &'static str,
    /// Bus channel carrying this fault as a boolean flag.
    pub channel: &'static str,
    pub severity: Severity,
}

use ErrorRegister::{Ereg1, Ereg2, Ereg3};
use Severity::{Advisory, Critical};

/// The full catalogue, register-major then bit-minor. This ordering is an
/// observable contract: decoded fault lists preserve it.
pub const FAULT_TABLE: [FaultDef; 24] = [
    FaultDef { register: Ereg1, bit: 0, code: "E1", channel: "err_heatsink", severity: Critical },
    FaultDef { register: Ereg1, bit: 1, code: "E2", channel: "err_low_voltage", severity: Advisory },
    FaultDef { register: Ereg1, bit: 2, code: "E3", channel: "err_interlock", severity: Critical },
    FaultDef { register: Ereg1, bit: 3, code: "E4", channel: "err_head_overtemp", severity: Critical },
    FaultDef { register: Ereg1, bit: 4, code: "E5", channel: "err_diode_undertemp", severity: Critical },
    FaultDef { register: Ereg1, bit: 5, code: "E6", channel: "err_diode_overtemp", severity: Critical },
    FaultDef { register: Ereg1, bit: 6, code: "E7", channel: "err_crystal_undertemp", severity: Critical },
    FaultDef { register: Ereg1, bit: 7, code: "E8", channel: "err_crystal_overtemp", severity: Critical },
    FaultDef { register: Ereg2, bit: 0, code: "E9", channel: "err_tec_overload", severity: Advisory },
    FaultDef { register: Ereg2, bit: 1, code: "E10", channel: "err_head_read", severity: Advisory },
    FaultDef { register: Ereg2, bit: 2, code: "E11", channel: "err_diode_boundary", severity: Critical },
    FaultDef { register: Ereg2, bit: 3, code: "E12", channel: "err_high_voltage", severity: Advisory },
    FaultDef { register: Ereg2, bit: 4, code: "E13", channel: "err_tec_diode_open", severity: Critical },
    FaultDef { register: Ereg2, bit: 5, code: "E14", channel: "err_tec_diode_short", severity: Critical },
    FaultDef { register: Ereg2, bit: 6, code: "E15", channel: "err_tec_crystal_open", severity: Critical },
    FaultDef { register: Ereg2, bit: 7, code: "E16", channel: "err_tec_crystal_short", severity: Critical },
    FaultDef { register: Ereg3, bit: 0, code: "E17", channel: "err_diode_open", severity: Critical },
    FaultDef { register: Ereg3, bit: 1, code: "E18", channel: "err_diode_short", severity: Critical },
    FaultDef { register: Ereg3, bit: 2, code: "E19", channel: "err_lamp_failure", severity: Advisory },
    FaultDef { register: Ereg3, bit: 3, code: "E20", channel: "err_head_id", severity: Advisory },
    FaultDef { register: Ereg3, bit: 4, code: "E21", channel: "err_crossed_cables", severity: Advisory },
    FaultDef { register: Ereg3, bit: 5, code: "E22", channel: "err_config", severity: Advisory },
    FaultDef { register: Ereg3, bit: 6, code: "E23", channel: "err_comm", severity: Advisory },
    FaultDef { register: Ereg3, bit: 7, code: "E24", channel: "err_crystal_boundary", severity: Critical },
];

pub type FaultList = Vec<&'static FaultDef, 24>;

/// Decode the three error registers into the list of active faults,
/// register-major bit-minor.
pub fn decode(ereg1: u8, ereg2: u8, ereg3: u8) -> FaultList {
    let mut faults = FaultList::new();
    for def in &FAULT_TABLE {
        let reg = match def.register {
            Ereg1 => ereg1,
            Ereg2 => ereg2,
            Ereg3 => ereg3,
        };
        if (reg >> def.bit) & 1 == 1 {
            // Cannot overflow: the table has exactly 24 entries.
            let _ = faults.push(def);
        }
    }
    faults
}

pub fn has_critical(faults: &[&'static FaultDef]) -> bool {
    faults.iter().any(|f| f.severity == Critical)
}

/// Comma-joined critical fault codes, e.g. "E1,E5", for the last-error
/// channel.
pub fn critical_codes(faults: &[&'static FaultDef]) -> String {
    let codes: std::vec::Vec<&str> = faults
        .iter()
        .filter(|f| f.severity == Critical)
        .map(|f| f.code)
        .collect();
    codes.join(",")
}
