//! Public façade: one [`GrblMachine`] per physically connected firmware.
//!
//! Thin orchestration over the engine: connect/disconnect, job control,
//! immediate sends, settings queries and poll control. Three background
//! activities run while connected — the framer's blocking reader, the
//! dispatcher consuming inbound lines, and the optional poller — and
//! `disconnect()` shuts all of them down in a defined order.
//!
//! # Example
//!
//! ```ignore
//! use grbl_stream::machines::grbl::{Event, GrblMachine};
//! use std::sync::Arc;
//!
//! let callback = Arc::new(|event: Event| println!("{}", event.tag()));
//! let mut machine = GrblMachine::new("mygrbl", callback);
//! machine.connect("/dev/ttyUSB0", 115_200).await?;   // "serial" feature
//! machine.poll_start().await;
//! machine.stream("G17 G90\nG1 X10 F600").await;
//! // … on_job_completed arrives through the callback
//! machine.disconnect().await;
//! ```

use super::event::{Event, EventCallback};
use super::interface::{FramerError, Interface, SharedWriter};
use super::poller::{run_poller, POLL_INTERVAL_MS};
use super::streamer::{Streamer, StreamerConfig};
use super::state::StreamTarget;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Inbound channel depth; the dispatcher consumes one line per turn.
const INBOUND_CHANNEL_SIZE: usize = 64;

/// Errors from the façade.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("job must be finished before loading a file")]
    JobRunning,
    #[error("read file: {0}")]
    ReadFile(#[from] io::Error),
    #[error("framer: {0}")]
    Framer(#[from] FramerError),
    #[cfg(feature = "serial")]
    #[error("port: {0}")]
    Port(#[from] super::port::PortError),
}

/// Host-side controller for one Grbl firmware instance.
pub struct GrblMachine {
    name: String,
    callback: EventCallback,
    engine: Arc<Mutex<Streamer>>,
    writer: SharedWriter,
    interface: Option<Interface>,
    inbound_tx: Option<mpsc::Sender<String>>,
    dispatcher: Option<JoinHandle<()>>,
    dispatch_do: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    poll_keep_alive: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl GrblMachine {
    /// Creates a disconnected controller and immediately pushes the default
    /// settings/hash/parser snapshots through the callback, so a UI is
    /// operational before the first connection.
    pub fn new(name: &str, callback: EventCallback) -> Self {
        Self::with_config(name, callback, StreamerConfig::default())
    }

    pub fn with_config(name: &str, callback: EventCallback, config: StreamerConfig) -> Self {
        let writer: SharedWriter =
            Arc::new(StdMutex::new(Box::new(io::sink()) as Box<dyn Write + Send>));
        let mut engine = Streamer::new(name, config, Arc::clone(&writer));
        engine.push_initial_state();
        for event in engine.take_events() {
            callback(event);
        }
        Self {
            name: name.to_string(),
            callback,
            engine: Arc::new(Mutex::new(engine)),
            writer,
            interface: None,
            inbound_tx: None,
            dispatcher: None,
            dispatch_do: Arc::new(AtomicBool::new(false)),
            poller: None,
            poll_keep_alive: Arc::new(AtomicBool::new(false)),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
        }
    }

    /// Poll interval for [`GrblMachine::poll_start`].
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    /// Connects over the serial port at `path` and issues a soft reset so
    /// the boot banner (re)arrives.
    #[cfg(feature = "serial")]
    pub async fn connect(&mut self, path: &str, baud: u32) -> Result<(), MachineError> {
        let (reader, writer) = super::port::open_split(path, baud)?;
        info!("{}: connected to {} at {} baud", self.name, path, baud);
        self.connect_transport(reader, writer).await
    }

    /// Connects over an arbitrary byte-duplex pair (a serial port split in
    /// two, a pty, or an in-memory transport in tests/simulations).
    pub async fn connect_transport(
        &mut self,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> Result<(), MachineError> {
        if self.interface.is_some() {
            warn!("{}: cannot start another interface", self.name);
            return Err(MachineError::AlreadyConnected);
        }

        *self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = writer;

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let interface = Interface::start(
            &format!("iface_{}", self.name),
            reader,
            Arc::clone(&self.writer),
            tx.clone(),
        );

        self.dispatch_do.store(true, Ordering::SeqCst);
        self.dispatcher = Some(spawn_dispatcher(
            Arc::clone(&self.engine),
            Arc::clone(&self.callback),
            Arc::clone(&self.dispatch_do),
            rx,
        ));
        self.inbound_tx = Some(tx);

        // kick the firmware so the boot banner initializes the engine
        interface.write("\u{18}")?;
        self.interface = Some(interface);
        self.with_engine(|engine| engine.update_preprocessor_position())
            .await;
        Ok(())
    }

    /// Controlled shutdown: stop the poller, stop and join the reader, wake
    /// the dispatcher with a sentinel line and join it, then release the
    /// transport.
    pub async fn disconnect(&mut self) {
        if self.interface.is_none() {
            return;
        }
        self.poll_stop().await;

        if let Some(interface) = &self.interface {
            interface.stop().await;
        }
        self.interface = None;

        debug!("{}: waiting for dispatcher to exit", self.name);
        self.dispatch_do.store(false, Ordering::SeqCst);
        if let Some(tx) = self.inbound_tx.take() {
            let _ = tx.send(String::new()).await;
        }
        if let Some(task) = self.dispatcher.take() {
            if let Err(e) = task.await {
                warn!("{}: dispatcher join: {}", self.name, e);
            }
        }

        *self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Box::new(io::sink());
        self.engine.lock().await.set_connected(false);
        info!("{}: disconnected", self.name);
        (self.callback)(Event::Disconnected);
    }

    pub async fn is_connected(&self) -> bool {
        self.engine.lock().await.is_connected()
    }

    /// Starts polling the firmware state. Callbacks with `on_stateupdate`
    /// arrive when the state changes.
    pub async fn poll_start(&mut self) {
        if self.interface.is_none() {
            return;
        }
        self.poll_keep_alive.store(true, Ordering::SeqCst);
        if self.poller.is_none() {
            self.poller = Some(tokio::spawn(run_poller(
                Arc::clone(&self.engine),
                Arc::clone(&self.callback),
                Arc::clone(&self.poll_keep_alive),
                self.poll_interval,
            )));
            debug!("{}: polling task started", self.name);
        } else {
            debug!("{}: polling task already running", self.name);
        }
    }

    /// Stops and joins the poller.
    pub async fn poll_stop(&mut self) {
        self.poll_keep_alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.poller.take() {
            debug!("{}: waiting for polling task to join", self.name);
            if let Err(e) = task.await {
                warn!("{}: poller join: {}", self.name, e);
            }
        }
    }

    /// Immediately sends Ctrl-X.
    pub async fn soft_reset(&self) {
        self.with_engine(|engine| engine.soft_reset()).await;
    }

    /// Alias for [`GrblMachine::soft_reset`].
    pub async fn abort(&self) {
        self.soft_reset().await;
    }

    /// Immediately sends the feed hold command.
    pub async fn hold(&self) {
        self.with_engine(|engine| engine.hold()).await;
    }

    /// Immediately sends the resume command.
    pub async fn resume(&self) {
        self.with_engine(|engine| engine.resume()).await;
    }

    /// Immediately sends the kill-alarm command.
    pub async fn kill_alarm(&self) {
        self.with_engine(|engine| engine.kill_alarm()).await;
    }

    /// Immediately sends the homing command.
    pub async fn homing(&self) {
        self.with_engine(|engine| engine.homing()).await;
    }

    /// Sends one line, bypassing the job buffer. See
    /// [`Streamer::send_immediately`] for the preconditions.
    pub async fn send_immediately(&self, line: &str) {
        self.with_engine(|engine| engine.send_immediately(line)).await;
    }

    /// Loads `lines` into the buffer and starts the job.
    pub async fn stream(&self, lines: &str) {
        self.with_engine(|engine| {
            engine.load_lines(lines);
            engine.job_run(None);
        })
        .await;
    }

    /// Appends `lines` to the buffer without starting the job.
    pub async fn write(&self, lines: &str) {
        self.with_engine(|engine| engine.load_lines(lines)).await;
    }

    /// Replaces the buffer with the contents of a G-code file. Only allowed
    /// once the previous job has finished.
    pub async fn load_file(&self, path: &Path) -> Result<(), MachineError> {
        let content = {
            let engine = self.engine.lock().await;
            if !engine.job_is_finished() {
                warn!("{}: job must be finished before loading a file", self.name);
                return Err(MachineError::JobRunning);
            }
            tokio::fs::read_to_string(path).await?
        };
        self.with_engine(|engine| {
            engine.job_new();
            engine.load_lines(&content);
        })
        .await;
        Ok(())
    }

    /// Starts or resumes streaming, optionally from a given buffer line.
    pub async fn job_run(&self, line_nr: Option<usize>) {
        self.with_engine(|engine| engine.job_run(line_nr)).await;
    }

    /// Pauses streaming; Grbl keeps executing what it already received.
    pub async fn job_halt(&self) {
        self.with_engine(|engine| engine.job_halt()).await;
    }

    /// Clears the buffer and job state.
    pub async fn job_new(&self) {
        self.with_engine(|engine| engine.job_new()).await;
    }

    /// Requests the `$$` settings dump; answers arrive as
    /// `on_settings_downloaded`.
    pub async fn request_settings(&self) {
        self.with_engine(|engine| engine.request_settings()).await;
    }

    /// Stashes buffer and cursor, then starts a new job.
    pub async fn stash_buffer(&self) {
        self.with_engine(|engine| engine.stash_buffer()).await;
    }

    /// Restores the stashed buffer and cursor.
    pub async fn unstash_buffer(&self) {
        self.with_engine(|engine| engine.unstash_buffer()).await;
    }

    /// Enables or disables dynamic feed override.
    pub async fn set_feed_override(&self, enabled: bool) {
        self.with_engine(|engine| engine.set_feed_override(enabled))
            .await;
    }

    /// Sets the feed used while override is enabled (mm/min).
    pub async fn request_feed(&self, feed: f64) {
        self.with_engine(|engine| engine.request_feed(feed)).await;
    }

    /// Switches between incremental and character-counting streaming.
    pub async fn set_incremental_streaming(&self, incremental: bool) {
        self.with_engine(|engine| engine.set_incremental_streaming(incremental))
            .await;
    }

    /// Routes the job to the firmware or the in-memory simulator.
    pub async fn set_target(&self, target: StreamTarget) {
        self.with_engine(|engine| engine.set_target(target)).await;
    }

    /// Defines a `#n` substitution value for the loaded G-code.
    pub async fn set_var(&self, key: &str, value: &str) {
        self.with_engine(|engine| engine.set_var(key, value)).await;
    }

    /// Runs `f` under the engine lock, then dispatches the queued events
    /// with the lock released.
    async fn with_engine<F: FnOnce(&mut Streamer)>(&self, f: F) {
        let events = {
            let mut engine = self.engine.lock().await;
            f(&mut engine);
            engine.take_events()
        };
        for event in events {
            (self.callback)(event);
        }
    }
}

impl Drop for GrblMachine {
    fn drop(&mut self) {
        // best-effort teardown signal; the async joins live in disconnect()
        self.poll_keep_alive.store(false, Ordering::SeqCst);
        self.dispatch_do.store(false, Ordering::SeqCst);
        if let Some(interface) = &self.interface {
            interface.request_stop();
        }
    }
}

/// The dispatcher task: one inbound line per turn, handlers run under the
/// engine lock, events dispatch after it is released.
fn spawn_dispatcher(
    engine: Arc<Mutex<Streamer>>,
    callback: EventCallback,
    dispatch_do: Arc<AtomicBool>,
    mut inbound: mpsc::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = inbound.recv().await {
            if !dispatch_do.load(Ordering::SeqCst) {
                break;
            }
            let events = {
                let mut engine = engine.lock().await;
                engine.handle_line(&line);
                engine.take_events()
            };
            for event in events {
                callback(event);
            }
        }
        debug!("dispatcher: stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (EventCallback, Arc<StdMutex<Vec<Event>>>) {
        let events: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: EventCallback = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (callback, events)
    }

    #[tokio::test]
    async fn test_new_pushes_initial_snapshots() {
        let (callback, events) = collector();
        let _machine = GrblMachine::new("test", callback);
        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::SettingsDownloaded { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::HashStateUpdate { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::GcodeParserStateUpdate { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let (callback, events) = collector();
        let mut machine = GrblMachine::new("test", callback);
        machine.disconnect().await;
        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::Disconnected)));
    }

    #[tokio::test]
    async fn test_simulator_job_without_transport() {
        let (callback, events) = collector();
        let machine = GrblMachine::new("test", callback);
        machine.set_target(StreamTarget::Simulator).await;
        machine.stream("G0 X1\nG0 X2").await;
        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::SimulationFinished { lines } if lines.len() == 2)));
        assert!(events.iter().any(|e| matches!(e, Event::JobCompleted)));
    }
}
