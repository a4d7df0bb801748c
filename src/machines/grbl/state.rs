//! Machine state types mirrored from the Grbl firmware.
//!
//! Types only — no logic. Used by the parser, the streaming engine and the
//! event surface.

use serde::{Deserialize, Serialize};

/// Position in machine or work coordinates (X, Y, Z).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn as_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f64; 3]> for Position {
    fn from(p: [f64; 3]) -> Self {
        Self {
            x: p[0],
            y: p[1],
            z: p[2],
        }
    }
}

/// Reason for Hold state (feed hold or safety door).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldReason {
    FeedHold,
    SafetyDoor,
}

/// Alarm code sent by Grbl. Matches the v1.1 alarm table (codes 1–9).
/// Unknown codes map to `Unknown(n)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmCode {
    HardLimit,          // 1
    SoftLimit,          // 2
    AbortDuringCycle,   // 3
    ProbeFailInitial,   // 4
    ProbeFailContact,   // 5
    HomingFailReset,    // 6
    HomingFailDoor,     // 7
    HomingFailPulloff,  // 8
    HomingFailApproach, // 9
    /// Unknown or extended alarm code.
    Unknown(u8),
}

impl From<u8> for AlarmCode {
    fn from(n: u8) -> Self {
        match n {
            1 => AlarmCode::HardLimit,
            2 => AlarmCode::SoftLimit,
            3 => AlarmCode::AbortDuringCycle,
            4 => AlarmCode::ProbeFailInitial,
            5 => AlarmCode::ProbeFailContact,
            6 => AlarmCode::HomingFailReset,
            7 => AlarmCode::HomingFailDoor,
            8 => AlarmCode::HomingFailPulloff,
            9 => AlarmCode::HomingFailApproach,
            _ => AlarmCode::Unknown(n),
        }
    }
}

/// High-level machine mode from the status report's first token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Run,
    Hold(HoldReason),
    Jog,
    Alarm(Option<AlarmCode>),
    Door,
    Check,
    Home,
    Sleep,
    Unknown(String),
}

impl MachineState {
    /// True for the modes in which immediate sends are refused.
    pub fn refuses_immediate(&self) -> bool {
        matches!(self, MachineState::Alarm(_) | MachineState::Hold(_))
    }
}

/// One EEPROM setting echoed by the firmware (`$k=v (cmt)`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub val: String,
    pub cmt: String,
}

/// Where preprocessed lines go: the serial port or an in-memory simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamTarget {
    Firmware,
    Simulator,
}
