//! Serial line framer.
//!
//! Wraps a byte-oriented duplex channel: a blocking reader task accumulates
//! bytes and emits newline-delimited, trimmed lines into an inbound channel;
//! writes go through a shared writer handle. The framer never interprets
//! line content.
//!
//! # Example
//!
//! ```ignore
//! use grbl_stream::machines::grbl::Interface;
//! use tokio::sync::mpsc;
//!
//! let (reader, writer) = open_transport()?; // e.g. port::open_split()
//! let (tx, mut rx) = mpsc::channel(64);
//! let iface = Interface::start("iface_mygrbl", reader, writer, tx);
//! while let Some(line) = rx.recv().await { /* dispatch */ }
//! iface.stop().await;
//! ```

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Write half of the transport, shared between the framer, the streaming
/// engine and the poller.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Errors from framer writes.
#[derive(Debug, Error)]
pub enum FramerError {
    #[error("write: {0}")]
    Write(#[from] io::Error),
}

/// The line framer. Owns the reader task; `stop()` joins it before the
/// transport halves drop.
pub struct Interface {
    name: String,
    writer: SharedWriter,
    read_do: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Interface {
    /// Starts the reader task on `reader` and shares `writer` with the
    /// engine and poller. Each complete line is sent into `inbound`.
    pub fn start(
        name: &str,
        reader: Box<dyn Read + Send>,
        writer: SharedWriter,
        inbound: mpsc::Sender<String>,
    ) -> Self {
        let read_do = Arc::new(AtomicBool::new(true));
        let task = {
            let read_do = Arc::clone(&read_do);
            let name = name.to_string();
            tokio::task::spawn_blocking(move || read_loop(name, reader, read_do, inbound))
        };
        Self {
            name: name.to_string(),
            writer,
            read_do,
            reader_task: Mutex::new(Some(task)),
        }
    }

    /// Clone of the shared write half.
    pub fn writer(&self) -> SharedWriter {
        Arc::clone(&self.writer)
    }

    /// Writes `data` to the transport. Empty writes are no-ops. Returns the
    /// number of bytes written.
    pub fn write(&self, data: &str) -> Result<usize, FramerError> {
        if data.is_empty() {
            debug!("{}: nothing to write", self.name);
            return Ok(0);
        }
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data.as_bytes())?;
        writer.flush()?;
        Ok(data.len())
    }

    /// Signals the reader task to stop without waiting. Used on teardown
    /// paths that cannot await.
    pub fn request_stop(&self) {
        self.read_do.store(false, Ordering::SeqCst);
    }

    /// Stops the reader task and waits for it to finish.
    pub async fn stop(&self) {
        self.read_do.store(false, Ordering::SeqCst);
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            debug!("{}: waiting for reader task to join", self.name);
            if let Err(e) = task.await {
                warn!("{}: reader task join: {}", self.name, e);
            }
            debug!("{}: reader task joined", self.name);
        }
    }
}

/// Blocking read loop: accumulate bytes, emit one inbound message per
/// newline. Non-ASCII bytes are junk on a Grbl link and are dropped.
fn read_loop(
    name: String,
    mut reader: Box<dyn Read + Send>,
    read_do: Arc<AtomicBool>,
    inbound: mpsc::Sender<String>,
) {
    let mut pending = String::new();
    let mut buf = [0u8; 256];
    while read_do.load(Ordering::SeqCst) {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                // nothing available; re-check the keep-alive flag
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!("{}: read failed, reader exiting: {}", name, e);
                break;
            }
        };
        for &byte in &buf[..n] {
            if !byte.is_ascii() {
                debug!("{}: dropping non-ascii byte 0x{:02X}", name, byte);
                continue;
            }
            if byte == b'\n' {
                let line = pending.trim().to_string();
                pending.clear();
                if inbound.blocking_send(line).is_err() {
                    debug!("{}: inbound channel closed, reader exiting", name);
                    return;
                }
            } else {
                pending.push(byte as char);
            }
        }
    }
    debug!("{}: reader loop done", name);
}
