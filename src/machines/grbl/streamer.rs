//! Streaming engine: owns the job buffer, the firmware RX-buffer
//! accounting, the send/ack decision procedure, error handling and the
//! event fan-out.
//!
//! Grbl's serial receive buffer holds 128 bytes. In the default
//! character-counting mode the engine keeps that buffer as full as possible
//! (so the motion planner never starves) by tracking the exact byte length
//! of every line in flight and popping one record per `ok`. Incremental
//! mode sends one line at a time and is required when flashing `$`
//! settings to the EEPROM.
//!
//! All mutating entry points queue their events internally; callers drain
//! them with [`Streamer::take_events`] after releasing the engine lock, so
//! no lock is ever held across a callback.

use super::commands::{GrblCommand, RealtimeCommand};
use super::event::Event;
use super::interface::SharedWriter;
use super::parser::{self, GrblLine, StatusReport};
use super::preprocessor::{is_preserved_comment, Preprocessor};
use super::state::{MachineState, Position, Setting, StreamTarget};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::PoisonError;
use tracing::{debug, error, info, warn};

/// Size of Grbl's serial receive buffer in bytes.
pub const RX_BUFFER_SIZE: usize = 128;

/// The highest setting number echoed by a `$$` dump; its arrival completes
/// the download.
pub const LAST_SETTING_NUMBER: u32 = 132;

/// Consecutive unchanged status reports before standstill is reported.
const STANDSTILL_THRESHOLD: u32 = 10;

/// Engine configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct StreamerConfig {
    /// Firmware receive buffer size for character counting.
    pub rx_buffer_size: usize,
    /// Setting number that terminates a `$$` download.
    pub last_setting_number: u32,
    /// Start in incremental mode.
    pub incremental_streaming: bool,
    /// Initial stream target.
    pub target: StreamTarget,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: RX_BUFFER_SIZE,
            last_setting_number: LAST_SETTING_NUMBER,
            incremental_streaming: false,
            target: StreamTarget::Firmware,
        }
    }
}

/// One transmitted-but-unacknowledged line: its byte cost in the firmware
/// buffer (including the newline), the text, and its job buffer index.
#[derive(Clone, Debug)]
struct TxRecord {
    bytes: usize,
    line: String,
    line_nr: usize,
}

/// Stashed job: buffer plus cursor, for suspend/resume around settings
/// changes.
#[derive(Clone, Debug)]
struct JobStash {
    buffer: Vec<String>,
    line_nr: usize,
}

/// The streaming engine. One instance per controlled firmware, owned by the
/// façade behind a mutex; see the module docs for the event contract.
pub struct Streamer {
    name: String,
    config: StreamerConfig,
    pub preprocessor: Preprocessor,
    writer: SharedWriter,

    // firmware view
    connected: bool,
    cmode: Option<MachineState>,
    cmpos: Position,
    cwpos: Position,
    last_cmode: Option<MachineState>,
    last_cmpos: Position,
    last_cwpos: Position,
    gps: Vec<String>,
    settings: HashMap<u32, Setting>,
    cs_offsets: HashMap<String, Position>,
    pub(crate) hash_state_requested: bool,
    hash_state_sent: bool,
    pub(crate) parser_state_requested: bool,

    // streaming state
    target: StreamTarget,
    incremental_streaming: bool,
    rx_fifo: VecDeque<TxRecord>,
    current_line: String,
    current_line_sent: bool,
    wait_empty_buffer: bool,
    streaming_complete: bool,
    job_finished: bool,
    streaming_src_end_reached: bool,
    streaming_enabled: bool,
    error: bool,

    buffer: Vec<String>,
    current_line_nr: usize,
    stash: Option<JobStash>,

    standstill_counter: u32,
    is_standstill: bool,

    events: Vec<Event>,
}

impl Streamer {
    pub fn new(name: &str, config: StreamerConfig, writer: SharedWriter) -> Self {
        let incremental = config.incremental_streaming;
        let target = config.target;
        Self {
            name: name.to_string(),
            config,
            preprocessor: Preprocessor::new(),
            writer,
            connected: false,
            cmode: None,
            cmpos: Position::default(),
            cwpos: Position::default(),
            last_cmode: None,
            last_cmpos: Position::default(),
            last_cwpos: Position::default(),
            gps: default_parser_state(),
            settings: default_settings(),
            cs_offsets: default_cs_offsets(),
            hash_state_requested: false,
            hash_state_sent: false,
            parser_state_requested: false,
            target,
            incremental_streaming: incremental,
            rx_fifo: VecDeque::new(),
            current_line: String::new(),
            current_line_sent: true,
            wait_empty_buffer: false,
            streaming_complete: true,
            job_finished: true,
            streaming_src_end_reached: true,
            streaming_enabled: true,
            error: false,
            buffer: Vec::new(),
            current_line_nr: 0,
            stash: None,
            standstill_counter: 0,
            is_standstill: false,
            events: Vec::new(),
        }
    }

    /// Emits the built-in defaults (settings, hash state, parser state) so a
    /// UI is operational before the first connection.
    pub fn push_initial_state(&mut self) {
        self.events.push(Event::SettingsDownloaded {
            settings: self.settings.clone(),
        });
        self.events.push(Event::HashStateUpdate {
            offsets: self.cs_offsets.clone(),
        });
        self.preprocessor.cs_offsets = self.cs_offsets.clone();
        self.events.push(Event::GcodeParserStateUpdate {
            state: self.gps.clone(),
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn job_is_finished(&self) -> bool {
        self.job_finished
    }

    /// Drains the events queued since the last call. Callers dispatch them
    /// after releasing the engine lock.
    pub fn take_events(&mut self) -> Vec<Event> {
        let mut events = std::mem::take(&mut self.events);
        // transform events raised inside the preprocessor ride along
        for event in self.preprocessor.take_events() {
            events.push(event);
        }
        events
    }

    // ------------------------------------------------------------------
    // dispatcher: one handler per firmware line form
    // ------------------------------------------------------------------

    /// Consumes one line from the framer. This is the only path that
    /// mutates streaming state in reaction to firmware messages.
    pub fn handle_line(&mut self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        match parser::classify(raw) {
            GrblLine::Status(report) => self.update_state(report),
            GrblLine::Ok => self.handle_ok(),
            GrblLine::ParserState(fields) => {
                self.gps = fields.clone();
                self.events
                    .push(Event::GcodeParserStateUpdate { state: fields });
                self.update_preprocessor_position();
                self.events.push(Event::Read {
                    line: raw.to_string(),
                });
            }
            GrblLine::Msg(line) => {
                debug!("{}: {}", self.name, line);
            }
            GrblLine::HashState { key, position } => self.update_hash_state(raw, key, position),
            GrblLine::Alarm(line) => self.handle_alarm(line),
            GrblLine::Error(line) => self.handle_error(line),
            GrblLine::Boot(line) => self.handle_boot(line),
            GrblLine::Setting { key, setting } => {
                self.settings.insert(key, setting);
                self.events.push(Event::Read {
                    line: raw.to_string(),
                });
                if key == self.config.last_setting_number {
                    self.events.push(Event::SettingsDownloaded {
                        settings: self.settings.clone(),
                    });
                }
            }
            GrblLine::Malformed { raw, reason } => {
                debug!("{}: could not parse {:?}: {}", self.name, raw, reason);
                self.events.push(Event::Read { line: raw });
            }
            GrblLine::Other(line) => {
                self.events.push(Event::Read { line });
            }
        }
    }

    fn handle_ok(&mut self) {
        if !self.streaming_complete {
            self.rx_fifo_pop(true);
            if !(self.wait_empty_buffer && !self.rx_fifo.is_empty()) {
                self.wait_empty_buffer = false;
                self.stream();
            }
        } else if !self.rx_fifo.is_empty() {
            // the in-flight window keeps draining after an error
            self.rx_fifo_pop(true);
        }
        self.events.push(Event::RxBufferPercent {
            percent: self.rx_fill_percent(),
        });
    }

    fn handle_alarm(&mut self, line: String) {
        // Grbl stops answering `?` polls in some alarm conditions, so the
        // mode is forced here rather than waiting for a status report.
        self.cmode = Some(MachineState::Alarm(
            parser::parse_alarm_code(&line).ok(),
        ));
        self.events.push(Event::StateUpdate {
            mode: self.current_mode(),
            mpos: self.cmpos,
            wpos: self.cwpos,
        });
        self.events.push(Event::Read { line: line.clone() });
        self.events.push(Event::Alarm { raw: line });
    }

    fn handle_error(&mut self, raw: String) {
        self.error = true;
        let (line, line_nr) = match self.rx_fifo.front() {
            Some(record) => (record.line.clone(), Some(record.line_nr)),
            None => ("unknown".to_string(), None),
        };
        error!("{}: firmware error for {:?}: {}", self.name, line, raw);
        self.events.push(Event::Error { raw, line, line_nr });
        self.streaming_complete = true;
        self.streaming_src_end_reached = true;
        // the error response acknowledged the offending line
        self.rx_fifo_pop(false);
    }

    fn handle_boot(&mut self, line: String) {
        self.events.push(Event::Read { line });
        self.onboot_init();
        self.connected = true;
        debug!("{}: grbl has booted", self.name);
        self.events.push(Event::Boot);
        self.hash_state_requested = true;
        self.request_settings();
        self.parser_state_requested = true;
    }

    /// Mimics Grbl's internal state right after boot.
    fn onboot_init(&mut self) {
        self.rx_fifo.clear();
        self.streaming_complete = true;
        self.job_finished = true;
        self.streaming_src_end_reached = true;
        self.error = false;
        self.current_line.clear();
        self.current_line_sent = true;
        self.is_standstill = false;
        self.standstill_counter = 0;
        self.preprocessor.onboot_init();
        self.events.push(Event::ProgressPercent { percent: 0 });
        self.events.push(Event::RxBufferPercent { percent: 0 });
    }

    fn update_hash_state(&mut self, raw: &str, key: String, position: Position) {
        self.cs_offsets.insert(key.clone(), position);
        self.events.push(Event::Read {
            line: raw.to_string(),
        });
        if key == "PRB" {
            // PRB terminates the batch; it also arrives after probe
            // cycles, so the request flag disambiguates the two.
            if self.hash_state_requested {
                self.hash_state_sent = false;
                self.hash_state_requested = false;
                self.events.push(Event::HashStateUpdate {
                    offsets: self.cs_offsets.clone(),
                });
                self.preprocessor.cs_offsets = self.cs_offsets.clone();
            } else {
                self.events.push(Event::Probe { position });
            }
        }
    }

    fn update_state(&mut self, report: StatusReport) {
        self.cmode = Some(report.mode);
        if let Some(mpos) = report.mpos {
            self.cmpos = mpos;
        }
        if let Some(wpos) = report.wpos {
            self.cwpos = wpos;
        }

        if self.cmode != self.last_cmode
            || self.cmpos != self.last_cmpos
            || self.cwpos != self.last_cwpos
        {
            self.events.push(Event::StateUpdate {
                mode: self.current_mode(),
                mpos: self.cmpos,
                wpos: self.cwpos,
            });
            if self.streaming_complete && self.cmode == Some(MachineState::Idle) {
                self.update_preprocessor_position();
                self.parser_state_requested = true;
            }
        }

        // standstill watchdog
        if self.cmpos != self.last_cmpos {
            self.standstill_counter = 0;
            if self.is_standstill {
                self.is_standstill = false;
                self.events.push(Event::Movement);
            }
        } else {
            self.standstill_counter += 1;
        }
        if !self.is_standstill && self.standstill_counter > STANDSTILL_THRESHOLD {
            self.is_standstill = true;
            self.events.push(Event::Standstill);
        }

        self.last_cmode = self.cmode.clone();
        self.last_cmpos = self.cmpos;
        self.last_cwpos = self.cwpos;
    }

    fn current_mode(&self) -> MachineState {
        self.cmode
            .clone()
            .unwrap_or(MachineState::Unknown(String::new()))
    }

    // ------------------------------------------------------------------
    // job buffer management
    // ------------------------------------------------------------------

    /// Appends preprocessed G-code to the job buffer. Each physical line is
    /// split, stripped, tidied, scanned for variables and fractionized.
    pub fn load_lines(&mut self, lines: &str) {
        for line in lines.split('\n') {
            self.load_line(line);
        }
        self.events.push(Event::BufsizeChange {
            lines: self.buffer.len(),
        });
        self.events.push(Event::VarsChange {
            vars: self.preprocessor.vars.clone(),
        });
    }

    fn load_line(&mut self, raw: &str) {
        self.preprocessor.set_line(raw);
        let comment = self.preprocessor.comment.clone();
        for sub in self.preprocessor.split_lines() {
            self.preprocessor.set_line(&sub);
            self.preprocessor.strip();
            self.preprocessor.tidy();
            self.preprocessor.parse_state();
            self.preprocessor.find_vars();
            for line in self.preprocessor.fractionize() {
                if !line.is_empty() {
                    self.buffer.push(line);
                }
            }
            self.preprocessor.done();
        }
        if is_preserved_comment(&comment) {
            self.buffer.push(comment);
        }
    }

    /// Starts or resumes streaming the buffer, optionally from a given
    /// line.
    pub fn job_run(&mut self, line_nr: Option<usize>) {
        if self.buffer.is_empty() {
            warn!("{}: cannot run job, nothing in the buffer", self.name);
            return;
        }
        if let Some(nr) = line_nr {
            self.set_current_line_number(nr);
        }
        self.streaming_src_end_reached = false;
        self.streaming_complete = false;
        self.streaming_enabled = true;
        self.current_line_sent = true;
        self.job_finished = false;
        self.stream();
    }

    /// Stops feeding the firmware. Lines already in its receive buffer
    /// still execute.
    pub fn job_halt(&mut self) {
        self.streaming_enabled = false;
    }

    /// Empties the buffer and resets job state. Modal state survives, the
    /// variables do not.
    pub fn job_new(&mut self) {
        self.buffer.clear();
        self.current_line_nr = 0;
        self.events.push(Event::LineNumberChange { line_nr: 0 });
        self.events.push(Event::BufsizeChange { lines: 0 });
        self.streaming_complete = true;
        self.job_finished = true;
        self.streaming_src_end_reached = true;
        self.error = false;
        self.current_line.clear();
        self.current_line_sent = true;
        self.preprocessor.job_new();
        self.events.push(Event::VarsChange {
            vars: self.preprocessor.vars.clone(),
        });
    }

    /// Moves the buffer cursor. Ignored when out of range.
    pub fn set_current_line_number(&mut self, line_nr: usize) {
        if line_nr < self.buffer.len() {
            self.current_line_nr = line_nr;
            self.events.push(Event::LineNumberChange { line_nr });
        }
    }

    pub fn current_line_number(&self) -> usize {
        self.current_line_nr
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Stashes buffer and cursor into the single reserved slot and starts a
    /// new job, e.g. to stream changed `$` settings before resuming.
    pub fn stash_buffer(&mut self) {
        self.stash = Some(JobStash {
            buffer: self.buffer.clone(),
            line_nr: self.current_line_nr,
        });
        self.job_new();
    }

    /// Restores the stashed buffer and cursor.
    pub fn unstash_buffer(&mut self) {
        let Some(stash) = self.stash.clone() else {
            warn!("{}: nothing stashed", self.name);
            return;
        };
        self.buffer = stash.buffer;
        self.current_line_nr = stash.line_nr;
        self.events.push(Event::LineNumberChange {
            line_nr: self.current_line_nr,
        });
        self.events.push(Event::BufsizeChange {
            lines: self.buffer.len(),
        });
    }

    /// Defines a `#n` substitution value.
    pub fn set_var(&mut self, key: &str, value: &str) {
        self.preprocessor
            .vars
            .insert(key.to_string(), Some(value.to_string()));
        self.events.push(Event::VarsChange {
            vars: self.preprocessor.vars.clone(),
        });
    }

    // ------------------------------------------------------------------
    // sender
    // ------------------------------------------------------------------

    fn stream(&mut self) {
        if self.streaming_src_end_reached || !self.streaming_enabled {
            return;
        }
        match self.target {
            StreamTarget::Firmware => {
                if self.incremental_streaming {
                    self.set_next_line(false);
                    if !self.streaming_src_end_reached {
                        self.send_current_line();
                    } else {
                        self.set_job_finished(true);
                    }
                } else {
                    self.fill_rx_buffer_until_full();
                }
            }
            StreamTarget::Simulator => {
                let mut simulated = Vec::new();
                loop {
                    self.set_next_line(true);
                    if self.streaming_src_end_reached {
                        break;
                    }
                    simulated.push(self.current_line.clone());
                }
                self.set_job_finished(true);
                self.events.push(Event::SimulationFinished { lines: simulated });
            }
        }
    }

    fn fill_rx_buffer_until_full(&mut self) {
        loop {
            if self.current_line_sent {
                self.set_next_line(false);
            }
            if !self.streaming_src_end_reached && self.rx_buf_can_receive_current_line() {
                self.send_current_line();
            } else {
                break;
            }
        }
    }

    /// Advances the cursor: stages the next buffer line through the
    /// send-time preprocessor passes, or marks the source end.
    fn set_next_line(&mut self, send_comments: bool) {
        if self.buffer.is_empty() {
            self.streaming_src_end_reached = true;
            return;
        }
        let progress = (100 * self.current_line_nr / self.buffer.len()) as u8;
        self.events.push(Event::ProgressPercent { percent: progress });

        if self.current_line_nr < self.buffer.len() {
            let line = self.buffer[self.current_line_nr].trim().to_string();
            self.preprocessor.set_line(&line);
            self.preprocessor.substitute_vars();
            self.preprocessor.parse_state();
            self.preprocessor.override_feed();
            self.preprocessor.scale_spindle();
            self.adopt_preprocessor_events();
            self.current_line = if send_comments {
                format!("{}{}", self.preprocessor.line, self.preprocessor.comment)
            } else {
                self.preprocessor.line.clone()
            };
            self.current_line_sent = false;
            self.current_line_nr += 1;
            self.preprocessor.done();
        } else {
            self.streaming_src_end_reached = true;
        }
    }

    /// Routes transform events into the engine queue. An undefined variable
    /// halts the job until the user resolves it and restarts.
    fn adopt_preprocessor_events(&mut self) {
        for event in self.preprocessor.take_events() {
            if let Event::PreprocessorVarUndefined { ref key } = event {
                error!("{}: halting job, undefined variable #{}", self.name, key);
                self.events.push(event);
                self.streaming_src_end_reached = true;
                self.job_halt();
                continue;
            }
            self.events.push(event);
        }
    }

    fn send_current_line(&mut self) {
        if self.error {
            error!("{}: firmware reported an error, not sending", self.name);
            self.streaming_src_end_reached = true;
            self.streaming_complete = true;
            return;
        }
        self.streaming_complete = false;
        // +1 for the newline, which occupies the firmware buffer too
        let bytes = self.current_line.len() + 1;
        let line_nr = self.current_line_nr - 1;
        self.rx_fifo.push_back(TxRecord {
            bytes,
            line: self.current_line.clone(),
            line_nr,
        });
        self.write_with_event(format!("{}\n", self.current_line));
        self.current_line_sent = true;
        self.events.push(Event::LineSent {
            line_nr,
            line: self.current_line.clone(),
        });
    }

    fn rx_buf_can_receive_current_line(&self) -> bool {
        let free = self.config.rx_buffer_size - self.rx_bytes_in_flight();
        free >= self.current_line.len() + 1
    }

    pub fn rx_bytes_in_flight(&self) -> usize {
        self.rx_fifo.iter().map(|record| record.bytes).sum()
    }

    fn rx_fill_percent(&self) -> u8 {
        (100 * self.rx_bytes_in_flight() / self.config.rx_buffer_size) as u8
    }

    /// Pops one in-flight record. `processed` distinguishes an `ok` (the
    /// command executes) from an `error` response (it does not).
    fn rx_fifo_pop(&mut self, processed: bool) {
        if let Some(record) = self.rx_fifo.pop_front() {
            if processed {
                self.events.push(Event::ProcessedCommand {
                    line_nr: record.line_nr,
                    line: record.line,
                });
            }
        }
        if self.streaming_src_end_reached && self.rx_fifo.is_empty() {
            self.set_job_finished(true);
            self.streaming_complete = true;
        }
    }

    fn set_job_finished(&mut self, finished: bool) {
        if finished && !self.job_finished {
            self.events.push(Event::JobCompleted);
        }
        self.job_finished = finished;
    }

    // ------------------------------------------------------------------
    // immediate commands and queries
    // ------------------------------------------------------------------

    /// Sends a single line, bypassing the job buffer. Refused while bytes
    /// are in flight or the machine is in Alarm/Hold; `$#` queries route
    /// through the hash-state request flag instead of being written.
    pub fn send_immediately(&mut self, line: &str) {
        let in_flight = self.rx_bytes_in_flight();
        if in_flight > 0 {
            error!(
                "{}: firmware buffer has {} unprocessed bytes, not sending {}",
                self.name, in_flight, line
            );
            return;
        }
        if let Some(mode) = &self.cmode {
            if mode.refuses_immediate() {
                error!("{}: machine is in {:?}, not sending {}", self.name, mode, line);
                return;
            }
        }
        if line.contains("$#") {
            self.hash_state_requested = true;
            return;
        }
        self.preprocessor.set_line(line);
        self.preprocessor.strip();
        self.preprocessor.tidy();
        self.preprocessor.parse_state();
        self.preprocessor.override_feed();
        self.adopt_preprocessor_events();
        let out = GrblCommand::GcodeLine(self.preprocessor.line.clone());
        self.write_with_event(format!("{}\n", out));
    }

    /// Requests the `$$` settings dump.
    pub fn request_settings(&mut self) {
        self.write_with_event(format!("{}\n", GrblCommand::SettingsRequest));
    }

    /// Immediately sends the kill-alarm command.
    pub fn kill_alarm(&mut self) {
        self.write_with_event(format!("{}\n", GrblCommand::KillAlarm));
    }

    /// Immediately sends the homing command.
    pub fn homing(&mut self) {
        self.write_with_event(format!("{}\n", GrblCommand::Home));
    }

    /// Immediately sends the feed hold real-time command.
    pub fn hold(&mut self) {
        self.write_with_event((RealtimeCommand::FeedHold.as_byte() as char).to_string());
    }

    /// Immediately sends the resume real-time command.
    pub fn resume(&mut self) {
        self.write_with_event((RealtimeCommand::CycleStart.as_byte() as char).to_string());
    }

    /// Immediately sends Ctrl-X and re-anchors the preprocessor position.
    pub fn soft_reset(&mut self) {
        self.write_raw(&(RealtimeCommand::SoftReset.as_byte() as char).to_string());
        self.update_preprocessor_position();
    }

    /// One poller iteration: `$#` if requested, else `$G` if requested,
    /// else the `?` status probe.
    pub fn poll_tick(&mut self) {
        if self.hash_state_requested {
            self.get_hash_state();
        } else if self.parser_state_requested {
            self.get_parser_state();
            self.parser_state_requested = false;
        } else {
            self.write_raw(&(RealtimeCommand::StatusQuery.as_byte() as char).to_string());
        }
    }

    fn get_parser_state(&mut self) {
        self.write_with_event(format!("{}\n", GrblCommand::ParserStateRequest));
    }

    fn get_hash_state(&mut self) {
        if matches!(self.cmode, Some(MachineState::Hold(_))) {
            self.hash_state_requested = false;
            info!("{}: $# not supported in hold, dropping request", self.name);
            return;
        }
        if !self.hash_state_sent {
            self.write_with_event(format!("{}\n", GrblCommand::HashStateRequest));
            self.hash_state_sent = true;
        }
    }

    // ------------------------------------------------------------------
    // mode switches
    // ------------------------------------------------------------------

    /// Toggles between incremental (one line in flight, required for `$`
    /// settings writes) and character-counting streaming. May be flipped
    /// mid-job.
    pub fn set_incremental_streaming(&mut self, incremental: bool) {
        self.incremental_streaming = incremental;
        if incremental {
            self.wait_empty_buffer = true;
        }
        debug!(
            "{}: incremental streaming set to {}",
            self.name, self.incremental_streaming
        );
    }

    pub fn set_target(&mut self, target: StreamTarget) {
        self.target = target;
    }

    pub fn set_feed_override(&mut self, enabled: bool) {
        self.preprocessor.do_feed_override = enabled;
    }

    pub fn request_feed(&mut self, feed: f64) {
        self.preprocessor.request_feed = Some(feed);
    }

    /// Keeps the preprocessor's position anchored to the machine position.
    pub fn update_preprocessor_position(&mut self) {
        self.preprocessor.set_position(self.cmpos.as_array());
    }

    // ------------------------------------------------------------------
    // transport writes
    // ------------------------------------------------------------------

    fn write_raw(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer
            .write_all(data.as_bytes())
            .and_then(|_| writer.flush())
        {
            warn!("{}: transport write failed: {}", self.name, e);
        }
    }

    fn write_with_event(&mut self, data: String) {
        self.events.push(Event::Write { line: data.clone() });
        self.write_raw(&data);
    }
}

fn default_parser_state() -> Vec<String> {
    ["0", "54", "17", "21", "90", "94", "0", "0", "5", "0", "99", "0"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_settings() -> HashMap<u32, Setting> {
    let mut settings = HashMap::new();
    settings.insert(
        130,
        Setting {
            val: "1000".into(),
            cmt: "width".into(),
        },
    );
    settings.insert(
        131,
        Setting {
            val: "1000".into(),
            cmt: "height".into(),
        },
    );
    settings
}

fn default_cs_offsets() -> HashMap<String, Position> {
    [
        "G54", "G55", "G56", "G57", "G58", "G59", "G28", "G30", "G92", "TLO", "PRB",
    ]
    .iter()
    .map(|key| (key.to_string(), Position::default()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Captures everything the engine writes to the transport.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn engine_with_config(config: StreamerConfig) -> (Streamer, Capture) {
        let capture = Capture::default();
        let writer: SharedWriter =
            Arc::new(Mutex::new(Box::new(capture.clone()) as Box<dyn Write + Send>));
        (Streamer::new("test", config, writer), capture)
    }

    fn engine() -> (Streamer, Capture) {
        engine_with_config(StreamerConfig::default())
    }

    fn written(capture: &Capture) -> String {
        String::from_utf8(capture.0.lock().unwrap().clone()).unwrap()
    }

    fn count<F: Fn(&Event) -> bool>(events: &[Event], f: F) -> usize {
        events.iter().filter(|e| f(e)).count()
    }

    #[test]
    fn test_character_counting_throughput() {
        // S1: three short lines fit the window at once; three oks finish
        let (mut engine, capture) = engine();
        engine.load_lines("G1X1\nG1X2\nG1X3");
        engine.job_run(None);
        assert_eq!(written(&capture), "G1X1\nG1X2\nG1X3\n");
        assert_eq!(engine.rx_bytes_in_flight(), 15);

        let mut events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::LineSent { .. })), 3);

        for _ in 0..3 {
            engine.handle_line("ok");
        }
        events = engine.take_events();
        assert_eq!(
            count(&events, |e| matches!(e, Event::ProcessedCommand { .. })),
            3
        );
        assert_eq!(count(&events, |e| matches!(e, Event::JobCompleted)), 1);
        assert!(engine.rx_fifo.is_empty());
        assert!(engine.job_finished);
    }

    #[test]
    fn test_rx_window_boundary() {
        // S2: a 10-byte window takes two 5-byte lines, then blocks
        let (mut engine, capture) = engine_with_config(StreamerConfig {
            rx_buffer_size: 10,
            ..StreamerConfig::default()
        });
        engine.load_lines("AAAA\nBBBB\nCCCC");
        engine.job_run(None);
        assert_eq!(written(&capture), "AAAA\nBBBB\n");
        assert_eq!(engine.rx_bytes_in_flight(), 10);

        engine.handle_line("ok");
        assert_eq!(written(&capture), "AAAA\nBBBB\nCCCC\n");
        assert_eq!(engine.rx_bytes_in_flight(), 10);

        engine.handle_line("ok");
        assert_eq!(engine.rx_bytes_in_flight(), 5);
        assert!(!engine.job_finished);

        engine.handle_line("ok");
        assert!(engine.job_finished);
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::JobCompleted)), 1);
    }

    #[test]
    fn test_rx_window_never_overflows() {
        let (mut engine, _capture) = engine_with_config(StreamerConfig {
            rx_buffer_size: 16,
            ..StreamerConfig::default()
        });
        engine.load_lines("G1X1Y1\nG1X2Y2\nG1X3Y3\nG1X4Y4");
        engine.job_run(None);
        assert!(engine.rx_bytes_in_flight() <= 16);
        for _ in 0..4 {
            engine.handle_line("ok");
            assert!(engine.rx_bytes_in_flight() <= 16);
        }
        assert!(engine.job_finished);
    }

    #[test]
    fn test_line_sent_precedes_processed_command() {
        let (mut engine, _capture) = engine();
        engine.load_lines("G1X1");
        engine.job_run(None);
        engine.handle_line("ok");
        let events = engine.take_events();
        let sent = events
            .iter()
            .position(|e| matches!(e, Event::LineSent { line_nr: 0, .. }));
        let processed = events
            .iter()
            .position(|e| matches!(e, Event::ProcessedCommand { line_nr: 0, .. }));
        assert!(sent.unwrap() < processed.unwrap());
    }

    #[test]
    fn test_incremental_streaming_one_in_flight() {
        let (mut engine, capture) = engine();
        engine.set_incremental_streaming(true);
        engine.load_lines("G1X1\nG1X2");
        engine.job_run(None);
        assert_eq!(written(&capture), "G1X1\n");
        assert_eq!(engine.rx_fifo.len(), 1);

        engine.handle_line("ok");
        assert_eq!(written(&capture), "G1X1\nG1X2\n");
        assert_eq!(engine.rx_fifo.len(), 1);

        engine.handle_line("ok");
        assert!(engine.job_finished);
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::JobCompleted)), 1);
    }

    #[test]
    fn test_error_recovery() {
        // S6: error identifies the FIFO front; no further sends until job_new
        let (mut engine, capture) = engine();
        engine.load_lines("G1X1\nXBAD\nG1X2");
        engine.job_run(None);
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::LineSent { .. })), 3);

        engine.handle_line("ok");
        engine.handle_line("error:20");
        let events = engine.take_events();
        let error = events
            .iter()
            .find(|e| matches!(e, Event::Error { .. }))
            .unwrap();
        match error {
            Event::Error { line, line_nr, raw } => {
                assert_eq!(line, "XBAD");
                assert_eq!(*line_nr, Some(1));
                assert_eq!(raw, "error:20");
            }
            _ => unreachable!(),
        }
        assert!(engine.error);

        // the remaining in-flight line still drains, then the job ends
        engine.handle_line("ok");
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::JobCompleted)), 1);
        let sent_before = written(&capture);

        // recovery: a new job streams again
        engine.job_new();
        assert!(!engine.error);
        engine.load_lines("G1X5");
        engine.job_run(None);
        assert_eq!(written(&capture), format!("{}G1X5\n", sent_before));
    }

    #[test]
    fn test_error_with_empty_fifo_reports_unknown() {
        let (mut engine, _capture) = engine();
        engine.handle_line("error: Bad number format");
        let events = engine.take_events();
        match events.iter().find(|e| matches!(e, Event::Error { .. })) {
            Some(Event::Error { line, line_nr, .. }) => {
                assert_eq!(line, "unknown");
                assert_eq!(*line_nr, None);
            }
            _ => panic!("no error event"),
        }
    }

    #[test]
    fn test_undefined_var_halts_job() {
        // S3: one defined, one undefined variable
        let (mut engine, capture) = engine();
        engine.load_lines("G1X#1Y#2");
        engine.set_var("1", "5");
        engine.job_run(None);
        let events = engine.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::PreprocessorVarUndefined { key } if key == "2")));
        assert!(!engine.streaming_enabled);
        assert!(engine.streaming_src_end_reached);
        // the emptied line was never written
        assert_eq!(written(&capture), "");
    }

    #[test]
    fn test_vars_registered_on_load() {
        let (mut engine, _capture) = engine();
        engine.load_lines("G1X#1Y#2");
        let events = engine.take_events();
        match events.iter().rev().find(|e| matches!(e, Event::VarsChange { .. })) {
            Some(Event::VarsChange { vars }) => {
                assert_eq!(vars.len(), 2);
                assert_eq!(vars.get("1"), Some(&None));
                assert_eq!(vars.get("2"), Some(&None));
            }
            _ => panic!("no vars_change event"),
        }
    }

    #[test]
    fn test_simulator_target_collects_lines() {
        let (mut engine, capture) = engine();
        engine.set_target(StreamTarget::Simulator);
        engine.load_lines("G1X1\nG1X2");
        engine.job_run(None);
        let events = engine.take_events();
        match events.iter().find(|e| matches!(e, Event::SimulationFinished { .. })) {
            Some(Event::SimulationFinished { lines }) => {
                assert_eq!(lines, &vec!["G1X1".to_string(), "G1X2".to_string()]);
            }
            _ => panic!("no simulation_finished event"),
        }
        assert_eq!(written(&capture), "");
        assert!(engine.job_finished);
    }

    #[test]
    fn test_job_run_empty_buffer_is_noop() {
        let (mut engine, capture) = engine();
        engine.job_run(None);
        assert_eq!(written(&capture), "");
        assert!(engine.job_finished);
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::LineSent { .. })), 0);
    }

    #[test]
    fn test_stash_unstash_round_trip() {
        let (mut engine, _capture) = engine();
        engine.load_lines("G1X1\nG1X2\nG1X3");
        engine.set_current_line_number(2);
        let buffer = engine.buffer.clone();

        engine.stash_buffer();
        assert_eq!(engine.buffer_size(), 0);
        assert_eq!(engine.current_line_number(), 0);

        engine.unstash_buffer();
        assert_eq!(engine.buffer, buffer);
        assert_eq!(engine.current_line_number(), 2);
    }

    #[test]
    fn test_send_immediately_refusals() {
        let (mut engine, capture) = engine();
        engine.load_lines("G1X1");
        engine.job_run(None);
        // bytes in flight: refused
        engine.send_immediately("G0X0");
        assert_eq!(written(&capture), "G1X1\n");
        engine.handle_line("ok");

        // alarm mode: refused
        engine.handle_line("ALARM:1");
        engine.send_immediately("G0X0");
        assert_eq!(written(&capture), "G1X1\n");

        engine.handle_line("<Idle|MPos:0,0,0>");
        engine.send_immediately("G0 X0");
        assert_eq!(written(&capture), "G1X1\nG0X0\n");
    }

    #[test]
    fn test_send_immediately_routes_hash_query() {
        let (mut engine, capture) = engine();
        engine.send_immediately("$#");
        assert_eq!(written(&capture), "");
        assert!(engine.hash_state_requested);
    }

    #[test]
    fn test_poll_tick_priority() {
        let (mut engine, capture) = engine();
        engine.poll_tick();
        assert_eq!(written(&capture), "?");

        engine.parser_state_requested = true;
        engine.poll_tick();
        assert_eq!(written(&capture), "?$G\n");
        assert!(!engine.parser_state_requested);

        engine.hash_state_requested = true;
        engine.poll_tick();
        assert_eq!(written(&capture), "?$G\n$#\n");
        // latched until the PRB line completes the batch
        engine.poll_tick();
        assert_eq!(written(&capture), "?$G\n$#\n");
    }

    #[test]
    fn test_hash_state_batch_and_probe() {
        let (mut engine, _capture) = engine();
        engine.hash_state_requested = true;
        engine.hash_state_sent = true;
        engine.handle_line("[G54:1.000,2.000,3.000]");
        engine.handle_line("[PRB:0.000,0.000,-5.000:1]");
        let events = engine.take_events();
        match events.iter().find(|e| matches!(e, Event::HashStateUpdate { .. })) {
            Some(Event::HashStateUpdate { offsets }) => {
                assert_eq!(offsets.get("G54"), Some(&Position::from([1.0, 2.0, 3.0])));
            }
            _ => panic!("no hash_stateupdate event"),
        }
        assert!(!engine.hash_state_requested);

        // without a pending request, PRB reports a probe result
        engine.handle_line("[PRB:0.000,0.000,-7.000:1]");
        let events = engine.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Probe { position } if position.z == -7.0)));
    }

    #[test]
    fn test_settings_download_completion() {
        let (mut engine, _capture) = engine();
        engine.handle_line("$130=200.000 (x max travel, mm)");
        let events = engine.take_events();
        assert_eq!(
            count(&events, |e| matches!(e, Event::SettingsDownloaded { .. })),
            0
        );
        engine.handle_line("$132=50.000 (z max travel, mm)");
        let events = engine.take_events();
        assert_eq!(
            count(&events, |e| matches!(e, Event::SettingsDownloaded { .. })),
            1
        );
    }

    #[test]
    fn test_boot_banner_resets_and_requests_state() {
        let (mut engine, capture) = engine();
        engine.load_lines("G1X1");
        engine.job_run(None);
        engine.handle_line("Grbl 1.1h ['$' for help]");
        assert!(engine.is_connected());
        assert!(engine.rx_fifo.is_empty());
        assert!(engine.hash_state_requested);
        assert!(engine.parser_state_requested);
        assert!(written(&capture).ends_with("$$\n"));
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::Boot)), 1);
    }

    #[test]
    fn test_state_update_only_on_change() {
        let (mut engine, _capture) = engine();
        engine.handle_line("<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000>");
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::StateUpdate { .. })), 1);
        engine.handle_line("<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000>");
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::StateUpdate { .. })), 0);
        engine.handle_line("<Run|MPos:1.000,0.000,0.000|WPos:1.000,0.000,0.000>");
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::StateUpdate { .. })), 1);
    }

    #[test]
    fn test_legacy_status_form() {
        let (mut engine, _capture) = engine();
        engine.handle_line("<Run,MPos:1.000,2.000,3.000,WPos:0.000,0.000,0.000>");
        let events = engine.take_events();
        match events.iter().find(|e| matches!(e, Event::StateUpdate { .. })) {
            Some(Event::StateUpdate { mode, mpos, .. }) => {
                assert_eq!(*mode, MachineState::Run);
                assert_eq!(*mpos, Position::from([1.0, 2.0, 3.0]));
            }
            _ => panic!("no stateupdate event"),
        }
    }

    #[test]
    fn test_standstill_watchdog() {
        let (mut engine, _capture) = engine();
        for _ in 0..12 {
            engine.handle_line("<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000>");
        }
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::Standstill)), 1);

        engine.handle_line("<Run|MPos:1.000,0.000,0.000|WPos:1.000,0.000,0.000>");
        let events = engine.take_events();
        assert_eq!(count(&events, |e| matches!(e, Event::Movement)), 1);
    }

    #[test]
    fn test_alarm_forces_mode() {
        let (mut engine, _capture) = engine();
        engine.handle_line("ALARM:2");
        let events = engine.take_events();
        assert!(events.iter().any(|e| matches!(e, Event::Alarm { .. })));
        assert!(matches!(
            engine.cmode,
            Some(MachineState::Alarm(Some(super::super::state::AlarmCode::SoftLimit)))
        ));
    }

    #[test]
    fn test_cursor_monotonic_within_job() {
        let (mut engine, _capture) = engine();
        engine.load_lines("G1X1\nG1X2\nG1X3");
        engine.job_run(None);
        let mut last = 0;
        for _ in 0..3 {
            assert!(engine.current_line_number() >= last);
            last = engine.current_line_number();
            engine.handle_line("ok");
        }
        assert_eq!(engine.current_line_number(), engine.buffer_size());
    }

    #[test]
    fn test_exact_fit_line_is_sent() {
        let (mut engine, capture) = engine_with_config(StreamerConfig {
            rx_buffer_size: 10,
            ..StreamerConfig::default()
        });
        // 9 bytes + newline exactly fills the window
        engine.load_lines("XXXXXXXXX");
        engine.job_run(None);
        assert_eq!(written(&capture), "XXXXXXXXX\n");
        assert_eq!(engine.rx_bytes_in_flight(), 10);
    }

    #[test]
    fn test_load_skips_empty_and_unsupported_lines() {
        let (mut engine, _capture) = engine();
        engine.load_lines("G0X0\n\n   \nT1\nM6\n(only a comment)\nG0X1");
        assert_eq!(engine.buffer, vec!["G0X0", "G0X1"]);
    }

    #[test]
    fn test_load_splits_multi_command_lines() {
        let (mut engine, _capture) = engine();
        engine.load_lines("G0X0G0X1");
        assert_eq!(engine.buffer, vec!["G0X0", "G0X1"]);
    }

    #[test]
    fn test_load_fractionizes_long_moves() {
        let (mut engine, _capture) = engine();
        engine.preprocessor.do_fractionize_lines = true;
        engine.load_lines("G1X5");
        assert!(engine.buffer.len() > 10);
        assert!(engine.buffer[0].starts_with(";_gerbil.line_begin"));
        assert!(engine.buffer.iter().any(|l| l == "G1X0.5"));
    }

    #[test]
    fn test_initial_state_push() {
        let (mut engine, _capture) = engine();
        engine.push_initial_state();
        let events = engine.take_events();
        assert!(events.iter().any(|e| matches!(e, Event::SettingsDownloaded { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::HashStateUpdate { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::GcodeParserStateUpdate { state } if state.len() == 12)));
    }
}
