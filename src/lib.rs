//! grbl-stream: host-side streaming controller for the Grbl CNC firmware.
//!
//! Feeds preprocessed G-code to Grbl over a serial link while keeping the
//! firmware's 128-byte receive buffer bounded (character counting), mirrors
//! the firmware's modal and machine state, and reports progress, state
//! changes and errors through a single event callback — suitable for both
//! CLIs and GUIs.
//!
//! Entry point: [`machines::grbl::GrblMachine`].

pub mod machines;
