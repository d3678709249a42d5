//! Implementations of the serial ports
//!
//! - `serial_port` — real hardware through the `serialport` crate
//! - `virtual_port` — in-process null-modem pairs for development and tests

pub mod serial_port;
pub mod virtual_port;
