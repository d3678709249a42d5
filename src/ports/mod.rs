//! Port traits (interfaces)
//!
//! These traits define the boundary between the channel and the serial
//! hardware. Adapters implement them to connect to real or virtual ports.

pub mod serial;

pub use serial::*;
