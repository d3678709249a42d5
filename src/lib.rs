//! Managed serial (COM) channel for device-polling servers
//!
//! One [`SerialChannel`] owns one serial port: configuration, opening,
//! paced buffered reads, chunked writes, lifecycle notifications and
//! deterministic release of the hardware handle. Framing, retry policy and
//! the polling loop itself belong to the caller.
//!
//! ## Architecture (Hexagonal / Ports & Adapters)
//!
//! - `domain/` - Pure domain types, no I/O dependencies
//! - `ports/` - Trait definitions for the serial hardware boundary
//! - `adapters/` - Implementations of ports (serialport, virtual null modem)
//! - `channel/` - The managed channel and its event surface

// Core domain (pure, no I/O)
pub mod domain;
pub mod ports;

// Adapters (external I/O)
pub mod adapters;

pub mod channel;

pub use channel::{ChannelEvent, SerialChannel};
pub use domain::{ChannelError, ChannelResult, ComConfig};
