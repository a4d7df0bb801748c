//! Minimal binary: runs a short G-code program through the engine's
//! simulator target (no serial port) and prints every controller event as
//! JSON. Confirms the preprocessor, engine and event surface are wired
//! correctly.

use grbl_stream::machines::grbl::{
    SharedWriter, StreamTarget, Streamer, StreamerConfig,
};
use std::io;
use std::sync::{Arc, Mutex};

fn main() {
    tracing_subscriber::fmt::init();

    let writer: SharedWriter =
        Arc::new(Mutex::new(Box::new(io::sink()) as Box<dyn std::io::Write + Send>));
    let mut engine = Streamer::new(
        "demo",
        StreamerConfig {
            target: StreamTarget::Simulator,
            ..StreamerConfig::default()
        },
        writer,
    );
    engine.preprocessor.do_fractionize_lines = true;
    engine.preprocessor.do_fractionize_arcs = true;

    engine.load_lines("G17 G90\nG1 X5 F600\nG2 X10 Y0 I2.5 J0\nG1 X10.2");
    engine.job_run(None);

    for event in engine.take_events() {
        match serde_json::to_string(&event) {
            Ok(json) => println!("{:<28} {}", event.tag(), json),
            Err(e) => println!("{:<28} <unserializable: {}>", event.tag(), e),
        }
    }
}
