//! Serial transport backed by the `serialport` crate.
//!
//! Opens the device node and splits it into independent read/write halves
//! for the framer (the reader blocks with a short timeout so shutdown
//! flags are observed). Also provides port discovery for UIs.

#![cfg(feature = "serial")]

use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;

/// Read timeout on the port; bounds how long the reader task sleeps before
/// re-checking its keep-alive flag.
const READ_TIMEOUT_MS: u64 = 100;

/// Errors from the serial transport.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("split port: {0}")]
    Split(serialport::Error),
    #[error("enumerate ports: {0}")]
    Enumerate(serialport::Error),
}

/// One discovered serial port (device node and display title).
#[derive(Clone, Debug)]
pub struct PortInfo {
    pub name: String,
    pub title: String,
}

/// Lists serial ports likely to be CNC controllers.
pub fn list_ports() -> Result<Vec<PortInfo>, PortError> {
    let ports = serialport::available_ports().map_err(PortError::Enumerate)?;
    Ok(ports
        .iter()
        .map(|port| PortInfo {
            name: port.port_name.clone(),
            title: describe_port(port),
        })
        .collect())
}

fn describe_port(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "{} {} ({})",
            usb.manufacturer.as_deref().unwrap_or("USB"),
            usb.product.as_deref().unwrap_or("Serial Port"),
            port.port_name
        ),
        _ => port.port_name.clone(),
    }
}

/// Opens `path` at `baud` (8N1, no flow control; Grbl's settings) and
/// returns the transport halves for `GrblMachine::connect_transport`.
pub fn open_split(
    path: &str,
    baud: u32,
) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>), PortError> {
    let writer = serialport::new(path, baud)
        .timeout(Duration::from_millis(READ_TIMEOUT_MS))
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| PortError::Open {
            path: path.to_string(),
            source: e,
        })?;
    let reader = writer.try_clone().map_err(PortError::Split)?;
    Ok((Box::new(reader), Box::new(writer)))
}
