//! Shared test support: an in-memory byte duplex and a scripted firmware
//! that speaks Grbl's wire protocol well enough to exercise the engine.

use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use grbl_stream::machines::grbl::{Event, EventCallback};

/// Read half of an in-memory pipe. Polls with a short timeout so the
/// framer's keep-alive flag is observed.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(data) => self.pending = data,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "poll"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Write half of an in-memory pipe.
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn pipe() -> (Sender<Vec<u8>>, PipeReader) {
    let (tx, rx) = mpsc::channel();
    (
        tx,
        PipeReader {
            rx,
            pending: Vec::new(),
        },
    )
}

/// Maps one received G-code line to the firmware's reply lines.
pub type LineRule = Box<dyn Fn(&str) -> Vec<String> + Send>;

/// Replies `ok` to every line, like a firmware that accepts everything.
pub fn ok_firmware() -> LineRule {
    Box::new(|_| vec!["ok".to_string()])
}

/// Spawns a scripted firmware on its own thread and returns the host-side
/// transport halves for `connect_transport`.
///
/// The script handles the real-time bytes itself (`0x18` boots, `?`
/// reports an idle status) and applies `rule` to every complete line.
pub fn spawn_firmware(rule: LineRule) -> (Box<dyn Read + Send>, Box<dyn Write + Send>) {
    let (host_tx, fw_rx) = pipe(); // host -> firmware
    let (fw_tx, host_rx) = pipe(); // firmware -> host

    std::thread::spawn(move || {
        let mut fw_rx = fw_rx;
        let mut line = String::new();
        let mut buf = [0u8; 64];
        loop {
            let n = match fw_rx.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return,
            };
            for &byte in &buf[..n] {
                match byte {
                    0x18 => {
                        if fw_tx.send(b"\r\nGrbl 1.1h ['$' for help]\n".to_vec()).is_err() {
                            return;
                        }
                    }
                    b'?' => {
                        let status =
                            b"<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000>\n";
                        if fw_tx.send(status.to_vec()).is_err() {
                            return;
                        }
                    }
                    b'!' | b'~' => {}
                    b'\n' => {
                        let received = line.clone();
                        line.clear();
                        for reply in builtin_replies(&received)
                            .unwrap_or_else(|| rule(&received))
                        {
                            if fw_tx.send(format!("{}\n", reply).into_bytes()).is_err() {
                                return;
                            }
                        }
                    }
                    _ => line.push(byte as char),
                }
            }
        }
    });

    (
        Box::new(PipeReader {
            rx: host_rx.rx,
            pending: Vec::new(),
        }),
        Box::new(PipeWriter { tx: host_tx }),
    )
}

/// Replies for the `$` system queries every Grbl answers the same way; the
/// per-test rule only sees G-code lines.
fn builtin_replies(line: &str) -> Option<Vec<String>> {
    match line {
        "$#" => {
            let mut replies: Vec<String> = [
                "G54", "G55", "G56", "G57", "G58", "G59", "G28", "G30", "G92",
            ]
            .iter()
            .map(|key| format!("[{}:0.000,0.000,0.000]", key))
            .collect();
            replies.push("[TLO:0.000]".to_string());
            replies.push("[PRB:0.000,0.000,0.000:0]".to_string());
            replies.push("ok".to_string());
            Some(replies)
        }
        "$G" => Some(vec![
            "[GC:G0 G54 G17 G21 G90 G94 M5 M9 M0 T0 F0 S0]".to_string(),
            "ok".to_string(),
        ]),
        "$$" => Some(vec![
            "$130=200.000 (x max travel, mm)".to_string(),
            "$131=200.000 (y max travel, mm)".to_string(),
            "$132=200.000 (z max travel, mm)".to_string(),
            "ok".to_string(),
        ]),
        _ => None,
    }
}

/// Event sink shared between the machine callback and the test body.
pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn collector() -> (EventCallback, EventLog) {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (
        Arc::new(move |event: Event| {
            sink.lock().unwrap().push(event);
        }),
        events,
    )
}

/// Polls the event log until `pred` matches some event or ~2 s elapse.
pub async fn wait_for<F: Fn(&Event) -> bool>(events: &EventLog, pred: F) -> bool {
    for _ in 0..200 {
        if events.lock().unwrap().iter().any(&pred) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
