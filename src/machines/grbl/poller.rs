//! Status polling task.
//!
//! Async task that queries the firmware at a fixed interval: normally the
//! `?` real-time status probe, but a pending `$#` hash-state request or
//! `$G` parser-state request takes priority. The query decision and write
//! live in [`Streamer::poll_tick`]; this task owns the pacing and the
//! cooperative shutdown.
//!
//! # Example
//!
//! ```ignore
//! use grbl_stream::machines::grbl::{run_poller, POLL_INTERVAL_MS};
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let keep_alive = Arc::new(AtomicBool::new(true));
//! let task = tokio::spawn(run_poller(
//!     engine,
//!     callback,
//!     Arc::clone(&keep_alive),
//!     Duration::from_millis(POLL_INTERVAL_MS),
//! ));
//! // … later: keep_alive.store(false, Ordering::SeqCst); task.await;
//! ```

use super::event::EventCallback;
use super::streamer::Streamer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Default poll interval (200 ms; the Grbl wiki recommends no more than 5
/// status queries per second).
pub const POLL_INTERVAL_MS: u64 = 200;

/// Runs the poll loop until `keep_alive` is cleared. Events produced by the
/// poll queries are dispatched after the engine lock is released.
pub async fn run_poller(
    engine: Arc<Mutex<Streamer>>,
    callback: EventCallback,
    keep_alive: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while keep_alive.load(Ordering::SeqCst) {
        ticker.tick().await;
        if !keep_alive.load(Ordering::SeqCst) {
            break;
        }
        let events = {
            let mut engine = engine.lock().await;
            engine.poll_tick();
            engine.take_events()
        };
        for event in events {
            callback(event);
        }
    }
    debug!("poller: stopped");
}
