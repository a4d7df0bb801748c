//! Typed Grbl commands.
//!
//! Line-based commands implement `Display` to produce the exact string sent
//! over serial (the sender appends the newline). Real-time commands are
//! single bytes with no newline; use `as_byte()` for the wire format.

use std::fmt;

/// Line-based Grbl command. Format with `Display` (e.g. `.to_string()`) to
/// get the serial string. The sender appends the line terminator.
#[derive(Clone, Debug, PartialEq)]
pub enum GrblCommand {
    /// Request all EEPROM settings (sends `$$`).
    SettingsRequest,
    /// Request the hash state: coordinate system offsets, probe (sends `$#`).
    HashStateRequest,
    /// Request the G-code parser state (sends `$G`).
    ParserStateRequest,
    /// Run homing cycle (sends `$H`).
    Home,
    /// Unlock after alarm (sends `$X`).
    KillAlarm,
    /// Raw g-code line (preprocessed job or immediate line). Sent as-is.
    GcodeLine(String),
}

impl fmt::Display for GrblCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrblCommand::SettingsRequest => write!(f, "$$"),
            GrblCommand::HashStateRequest => write!(f, "$#"),
            GrblCommand::ParserStateRequest => write!(f, "$G"),
            GrblCommand::Home => write!(f, "$H"),
            GrblCommand::KillAlarm => write!(f, "$X"),
            GrblCommand::GcodeLine(line) => write!(f, "{}", line),
        }
    }
}

/// Real-time single-byte command. Sent without a newline; use `as_byte()`
/// when writing to the port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RealtimeCommand {
    /// Status report query. Byte `?`.
    StatusQuery,
    /// Feed hold. Byte `!`.
    FeedHold,
    /// Cycle start / resume. Byte `~`.
    CycleStart,
    /// Soft reset (Ctrl-X). Byte 0x18.
    SoftReset,
}

impl RealtimeCommand {
    /// Returns the single byte to send on the serial line (no newline).
    pub fn as_byte(self) -> u8 {
        match self {
            RealtimeCommand::StatusQuery => b'?',
            RealtimeCommand::FeedHold => b'!',
            RealtimeCommand::CycleStart => b'~',
            RealtimeCommand::SoftReset => 0x18,
        }
    }
}

impl fmt::Display for RealtimeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.as_byte())
    }
}
