//! The event surface: everything externally visible that the controller does
//! is routed through a single callback taking one [`Event`] value.
//!
//! The controller never inspects the callback's effect; delivery is
//! synchronous from whichever task originates the event, and no internal
//! lock is held across a dispatch.

use super::state::{MachineState, Position, Setting};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// The host application's event sink. May be called from any of the
/// controller's tasks.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// One externally visible state change.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Grbl booted (e.g. after a soft reset).
    Boot,
    /// The serial connection has been shut down.
    Disconnected,
    /// Informational message for UIs that surface controller logs.
    Log { message: String },
    /// A line was written to the firmware as part of a job.
    LineSent { line_nr: usize, line: String },
    /// The job buffer length changed.
    BufsizeChange { lines: usize },
    /// The job buffer cursor was moved explicitly.
    LineNumberChange { line_nr: usize },
    /// Grbl acknowledged a line with `ok`; it is now being executed.
    ProcessedCommand { line_nr: usize, line: String },
    /// Raw `ALARM:…` line.
    Alarm { raw: String },
    /// Raw `error:…` line plus the buffered command that caused it.
    Error {
        raw: String,
        line: String,
        line_nr: Option<usize>,
    },
    /// Fill grade of the firmware's serial receive buffer.
    RxBufferPercent { percent: u8 },
    /// Completion of the current job buffer.
    ProgressPercent { percent: u8 },
    /// The job buffer has been streamed and physically executed entirely.
    JobCompleted,
    /// Grbl's mode or position changed.
    StateUpdate {
        mode: MachineState,
        mpos: Position,
        wpos: Position,
    },
    /// A `$#` batch completed.
    HashStateUpdate { offsets: HashMap<String, Position> },
    /// A `$$` download completed.
    SettingsDownloaded { settings: HashMap<u32, Setting> },
    /// A `$G` report arrived (12 parser state fields).
    GcodeParserStateUpdate { state: Vec<String> },
    /// The job ran against the simulator target.
    SimulationFinished { lines: Vec<String> },
    /// Variables were detected in, or assigned for, the loaded G-code.
    VarsChange {
        vars: HashMap<String, Option<String>>,
    },
    /// An `F` word was parsed from (or injected into) the G-code.
    PreprocessorFeedChange { feed: f64 },
    /// A `#n` variable had no value at substitution time; the job halts.
    PreprocessorVarUndefined { key: String },
    /// A probe cycle reported its result.
    Probe { position: Position },
    /// Position started changing after a standstill.
    Movement,
    /// Position has not changed for several consecutive status reports.
    Standstill,
    /// A firmware line that was consumed without a dedicated handler.
    Read { line: String },
    /// Data written to the firmware.
    Write { line: String },
}

impl Event {
    /// The flat `on_*` tag of this event, for hosts that route by name.
    pub fn tag(&self) -> &'static str {
        match self {
            Event::Boot => "on_boot",
            Event::Disconnected => "on_disconnected",
            Event::Log { .. } => "on_log",
            Event::LineSent { .. } => "on_line_sent",
            Event::BufsizeChange { .. } => "on_bufsize_change",
            Event::LineNumberChange { .. } => "on_line_number_change",
            Event::ProcessedCommand { .. } => "on_processed_command",
            Event::Alarm { .. } => "on_alarm",
            Event::Error { .. } => "on_error",
            Event::RxBufferPercent { .. } => "on_rx_buffer_percent",
            Event::ProgressPercent { .. } => "on_progress_percent",
            Event::JobCompleted => "on_job_completed",
            Event::StateUpdate { .. } => "on_stateupdate",
            Event::HashStateUpdate { .. } => "on_hash_stateupdate",
            Event::SettingsDownloaded { .. } => "on_settings_downloaded",
            Event::GcodeParserStateUpdate { .. } => "on_gcode_parser_stateupdate",
            Event::SimulationFinished { .. } => "on_simulation_finished",
            Event::VarsChange { .. } => "on_vars_change",
            Event::PreprocessorFeedChange { .. } => "on_preprocessor_feed_change",
            Event::PreprocessorVarUndefined { .. } => "on_preprocessor_var_undefined",
            Event::Probe { .. } => "on_probe",
            Event::Movement => "on_movement",
            Event::Standstill => "on_standstill",
            Event::Read { .. } => "on_read",
            Event::Write { .. } => "on_write",
        }
    }
}
