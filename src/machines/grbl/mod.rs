//! Grbl host controller module.
//!
//! **Public API:** [`GrblMachine`] — connect, disconnect, stream jobs,
//! immediate sends, settings queries, poll control. All externally visible
//! state changes arrive through a single [`Event`] callback. Use
//! [`list_ports`] (with the `serial` feature) to discover ports.
//!
//! The pieces underneath are public too, for embedders that want them
//! individually: the [`Preprocessor`], the [`Streamer`] engine, the
//! [`Interface`] line framer and the pure response [`parser`].

mod commands;
mod event;
mod interface;
mod machine;
pub mod parser;
mod poller;
mod preprocessor;
mod state;
mod streamer;

#[cfg(feature = "serial")]
mod port;

pub use commands::*;
pub use event::*;
pub use interface::*;
pub use machine::*;
pub use parser::{classify, GrblLine, ParseError, StatusReport};
pub use poller::*;
pub use preprocessor::*;
pub use state::*;
pub use streamer::*;

#[cfg(feature = "serial")]
pub use port::{list_ports, open_split, PortError, PortInfo};
