//! Serial hardware traits
//!
//! Split into three traits:
//! - `SerialOpener` — acquires a hardware handle for a set of link parameters
//! - `SerialConnection` — an open handle: bounded reads/writes, control lines,
//!   buffer discards and live parameter changes
//! - `ConnectionCloser` — a shareable view of one handle that can query and
//!   close it from another thread while a read or write is in flight

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{ChannelResult, LinkSettings};

/// Acquires serial handles. Shared between channels, so `Send + Sync`.
pub trait SerialOpener: Send + Sync {
    /// Open the port described by `settings`
    fn open(&self, settings: &LinkSettings) -> ChannelResult<Box<dyn SerialConnection>>;
}

/// An open serial handle.
/// Only requires `Send` (not `Sync`) — the channel keeps it behind a Mutex.
pub trait SerialConnection: Send {
    /// Bytes received and waiting in the input buffer
    fn bytes_to_read(&self) -> ChannelResult<usize>;

    /// Read up to `buffer.len()` bytes, blocking at most `timeout`.
    /// A timeout is not an error: it yields however many bytes arrived, possibly 0.
    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> ChannelResult<usize>;

    /// Write all of `data`, blocking at most `timeout`
    fn write_all(&mut self, data: &[u8], timeout: Duration) -> ChannelResult<()>;

    /// Drive the DTR (Data Terminal Ready) line
    fn set_dtr(&mut self, level: bool) -> ChannelResult<()>;

    /// Drive the RTS (Request To Send) line
    fn set_rts(&mut self, level: bool) -> ChannelResult<()>;

    /// Drop everything pending in the input buffer
    fn discard_in(&mut self) -> ChannelResult<()>;

    /// Drop everything pending in the output buffer
    fn discard_out(&mut self) -> ChannelResult<()>;

    /// Apply baud rate, data bits, stop bits and parity to the live handle
    fn apply(&mut self, settings: &LinkSettings) -> ChannelResult<()>;

    /// Close the handle. Calling it again is a no-op.
    fn close(&mut self) -> ChannelResult<()>;

    /// Whether the handle is still open
    fn is_open(&self) -> bool;

    /// A closer sharing this handle's open/closed state
    fn closer(&self) -> Arc<dyn ConnectionCloser>;
}

/// Closes a handle without owning it.
pub trait ConnectionCloser: Send + Sync {
    /// Close the handle. A read or write blocked on it fails promptly
    /// instead of running to its timeout. Calling it again is a no-op.
    fn close(&self);

    /// Queries the device where the platform allows it; never cached.
    fn is_open(&self) -> bool;
}
