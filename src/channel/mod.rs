//! SerialChannel: one managed serial (COM) link.
//!
//! Lifecycle: construct → `initialize` (once) → `open` → any number of
//! `read` / `write` / `settings` / `clear_buffer` → `close` (or drop).
//!
//! ## Concurrency
//!
//! The channel runs no threads of its own; an external polling loop drives it.
//! The hardware handle sits behind a mutex only so the type is memory-safe to
//! share; the channel gives no ordering guarantee between concurrent
//! `read`/`write`/`open`/`close` calls on the same instance. Callers that
//! share a channel must hold [`SerialChannel::sync_lock`] around any sequence
//! they need to be atomic. The channel itself never takes that lock.
//!
//! Disposal is the exception: it is guarded by a compare-and-swap, so any
//! number of concurrent `dispose`/`close` calls release the handle exactly once.
//! It closes the handle through its [`ConnectionCloser`] without waiting for
//! the I/O lock, so a read or write blocked in another thread fails promptly
//! instead of running to its timeout. `is_open` goes through the same closer
//! and never waits for in-flight I/O; `settings` and `clear_buffer` do.

pub mod events;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crossbeam_channel::Receiver;

use crate::adapters::serial_port::SerialPortOpener;
use crate::domain::{
    ChannelError, ChannelResult, ComConfig, CommunicateType, DataBits, LinkSettings, Parity,
    StopBits,
};
use crate::ports::{ConnectionCloser, SerialConnection, SerialOpener};

pub use events::ChannelEvent;
use events::EventHandlers;

/// Values fixed at `initialize` time
struct Runtime {
    config: ComConfig,
    read_buffer: Mutex<Vec<u8>>,
}

/// A managed serial channel bound to a single port.
pub struct SerialChannel {
    session_id: String,
    link: Mutex<LinkSettings>,
    runtime: OnceLock<Runtime>,
    connection: Mutex<Option<Box<dyn SerialConnection>>>,
    /// Closer of the handle in `connection`; only ever locked briefly
    closer: Mutex<Option<Arc<dyn ConnectionCloser>>>,
    disposed: AtomicBool,
    sync_lock: Arc<Mutex<()>>,
    events: EventHandlers,
    opener: Arc<dyn SerialOpener>,
}

impl SerialChannel {
    /// Channel on `port` at `baud` with 8 data bits, one stop bit, no parity.
    /// Does not touch the hardware.
    pub fn new(port: u32, baud: u32, opener: Arc<dyn SerialOpener>) -> Self {
        Self::from_settings(LinkSettings::new(port, baud), opener)
    }

    /// Channel with explicit link parameters.
    pub fn with_link(
        port: u32,
        baud: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
        opener: Arc<dyn SerialOpener>,
    ) -> Self {
        Self::from_settings(
            LinkSettings {
                port,
                baud_rate: baud,
                data_bits,
                stop_bits,
                parity,
            },
            opener,
        )
    }

    /// Channel on a hardware port through the `serialport` crate.
    pub fn native(port: u32, baud: u32) -> Self {
        Self::new(port, baud, Arc::new(SerialPortOpener))
    }

    pub fn from_settings(link: LinkSettings, opener: Arc<dyn SerialOpener>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            link: Mutex::new(link),
            runtime: OnceLock::new(),
            connection: Mutex::new(None),
            closer: Mutex::new(None),
            disposed: AtomicBool::new(false),
            sync_lock: Arc::new(Mutex::new(())),
            events: EventHandlers::new(),
            opener,
        }
    }

    // ------------------------------------------------------------------
    // Configuration & lifecycle
    // ------------------------------------------------------------------

    /// Apply the server's COM options and allocate the read buffer.
    ///
    /// Must run exactly once, before `open`. The read buffer is sized from
    /// `ComReadBufferSize` here and never resized afterwards.
    pub fn initialize(&self, config: &ComConfig) -> ChannelResult<()> {
        self.ensure_not_disposed()?;
        config.validate()?;

        let runtime = Runtime {
            config: config.clone(),
            read_buffer: Mutex::new(vec![0u8; config.com_read_buffer_size]),
        };
        self.runtime
            .set(runtime)
            .map_err(|_| ChannelError::AlreadyInitialized)?;

        log::debug!(
            "Initialized {} (read buffer {} bytes, write chunk {} bytes)",
            self.key(),
            config.com_read_buffer_size,
            config.com_write_buffer_size
        );
        Ok(())
    }

    /// Open the hardware port.
    ///
    /// Re-opening an open channel closes the stale handle first. On success
    /// DTR and RTS are raised, both buffers are discarded and the opened
    /// handlers fire. On failure the error handlers fire once with the
    /// failure message and the same error is returned; the channel is left
    /// without an open handle.
    pub fn open(&self) -> ChannelResult<()> {
        let result = self.try_open();
        let link = self.link_settings();

        match &result {
            Ok(()) => {
                log::info!(
                    "Opened {} at {} baud (session {})",
                    link.port_name(),
                    link.baud_rate,
                    self.session_id
                );
                self.events
                    .fire_opened(self, link.port, link.baud_rate, self.is_open());
            }
            Err(e) => {
                log::warn!("Open of {} failed: {e}", link.port_name());
                self.events
                    .fire_error(self, link.port, link.baud_rate, &e.to_string());
            }
        }
        result
    }

    fn try_open(&self) -> ChannelResult<()> {
        self.runtime()?;
        let link = self.link_settings();

        let mut slot = self.lock_connection();
        // Checked under the slot lock so a racing dispose either sees the new
        // handle or makes this open fail.
        self.ensure_not_disposed()?;

        self.lock_closer().take();
        if let Some(mut stale) = slot.take() {
            if stale.is_open() {
                log::debug!("Closing stale handle on {} before reopening", link.port_name());
                if let Err(e) = stale.close() {
                    log::warn!("Closing stale handle on {} failed: {e}", link.port_name());
                }
            }
        }

        let mut conn = self.opener.open(&link)?;
        conn.set_dtr(true)?;
        conn.set_rts(true)?;
        conn.discard_in()?;
        conn.discard_out()?;
        *self.lock_closer() = Some(conn.closer());
        *slot = Some(conn);
        Ok(())
    }

    /// Release the hardware handle and notify the closed handlers.
    ///
    /// Safe to call any number of times; the handlers fire on every call.
    pub fn close(&self) {
        self.dispose();
        let link = self.link_settings();
        log::info!("Closed {} (session {})", link.port_name(), self.session_id);
        self.events
            .fire_closed(self, link.port, link.baud_rate, !self.is_open());
    }

    /// Release the hardware handle and mark the channel disposed.
    ///
    /// Only the first call does any work; later or concurrent calls return
    /// immediately. Never fails.
    pub fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Interrupt any blocked read or write before waiting for the I/O lock.
        let closer = self.lock_closer().take();
        if let Some(closer) = closer {
            closer.close();
        }

        let conn = self.lock_connection().take();
        self.lock_closer().take();
        if let Some(mut conn) = conn {
            if let Err(e) = conn.close() {
                log::warn!("Releasing {} failed: {e}", self.key());
            }
        }
    }

    /// Change the baud rate. See [`SerialChannel::settings_full`].
    pub fn settings(&self, baud: u32) -> bool {
        let link = {
            let mut link = self.lock_link();
            link.baud_rate = baud;
            link.clone()
        };
        self.apply_link(&link);
        true
    }

    /// Change all link parameters without closing the port.
    ///
    /// Always returns `true`: that only means the change was issued. If the
    /// live handle rejects it a warning is logged and the stored parameters
    /// are used at the next `open`.
    pub fn settings_full(
        &self,
        baud: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
    ) -> bool {
        let link = {
            let mut link = self.lock_link();
            link.baud_rate = baud;
            link.data_bits = data_bits;
            link.stop_bits = stop_bits;
            link.parity = parity;
            link.clone()
        };
        self.apply_link(&link);
        true
    }

    fn apply_link(&self, link: &LinkSettings) {
        let mut slot = self.lock_connection();
        if let Some(conn) = slot.as_deref_mut().filter(|c| c.is_open()) {
            if let Err(e) = conn.apply(link) {
                log::warn!("Applying settings to {} failed: {e}", link.port_name());
            }
        }
    }

    /// Discard pending input and output. No-op when the port is closed.
    pub fn clear_buffer(&self) -> ChannelResult<()> {
        let mut slot = self.lock_connection();
        match slot.as_deref_mut() {
            Some(conn) if conn.is_open() => {
                conn.discard_in()?;
                conn.discard_out()
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Data transfer
    // ------------------------------------------------------------------

    /// Read whatever the port has, up to the read-buffer capacity.
    ///
    /// Sleeps for `ComLoopInterval` first to pace the polling loop. Returns a
    /// new vector sized to the bytes actually read, empty when nothing was
    /// pending.
    pub fn read(&self) -> ChannelResult<Vec<u8>> {
        let runtime = self.runtime()?;
        self.ensure_not_disposed()?;

        std::thread::sleep(runtime.config.loop_interval());

        let mut buffer = runtime
            .read_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let capacity = buffer.len();
        let n = self.internal_read(&mut buffer, 0, capacity)?;
        Ok(buffer[..n].to_vec())
    }

    /// `internal_read` over the whole of `buffer`.
    pub fn internal_read_all(&self, buffer: &mut [u8]) -> ChannelResult<usize> {
        let length = buffer.len();
        self.internal_read(buffer, 0, length)
    }

    /// Bounded read into `buffer[offset..offset + length]`.
    ///
    /// Returns 0 at once when nothing is pending; otherwise blocks up to
    /// `ComReadTimeout` and returns however many bytes arrived (at most
    /// `length`).
    pub fn internal_read(
        &self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> ChannelResult<usize> {
        check_range("Read buffer", buffer.len(), offset, length)?;
        let timeout = self.runtime()?.config.read_timeout();

        self.with_connection(|conn| {
            if conn.bytes_to_read()? == 0 {
                return Ok(0);
            }
            let n = conn.read(&mut buffer[offset..offset + length], timeout)?;
            log::debug!("COM RX: {n} bytes");
            Ok(n)
        })
    }

    /// Write `data`, split into chunks of at most `ComWriteBufferSize`.
    ///
    /// Chunks are written in order and partition `data` exactly. Returns the
    /// total number of bytes transmitted. Fails on the first chunk that fails;
    /// earlier chunks have already been sent by then.
    pub fn write(&self, data: &[u8]) -> ChannelResult<usize> {
        let chunk_size = self.runtime()?.config.com_write_buffer_size;
        if data.len() <= chunk_size {
            return self.internal_write(data, 0, data.len());
        }

        let mut sent = 0;
        let mut offset = 0;
        while offset < data.len() {
            let length = chunk_size.min(data.len() - offset);
            sent += self.internal_write(data, offset, length)?;
            offset += length;
        }
        Ok(sent)
    }

    /// `internal_write` of the whole of `data`.
    pub fn internal_write_all(&self, data: &[u8]) -> ChannelResult<usize> {
        self.internal_write(data, 0, data.len())
    }

    /// Bounded write of `data[offset..offset + length]`, blocking up to
    /// `ComWriteTimeout`. Returns `length`, the number of bytes transmitted.
    pub fn internal_write(&self, data: &[u8], offset: usize, length: usize) -> ChannelResult<usize> {
        check_range("Write data", data.len(), offset, length)?;
        let timeout = self.runtime()?.config.write_timeout();

        self.with_connection(|conn| {
            conn.write_all(&data[offset..offset + length], timeout)?;
            log::debug!("COM TX: {length} bytes");
            Ok(length)
        })
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribe to successful opens: `(channel, port, baud, is_open)`.
    pub fn on_opened<F>(&self, handler: F)
    where
        F: Fn(&SerialChannel, u32, u32, bool) + Send + Sync + 'static,
    {
        self.events.add_opened(Arc::new(handler));
    }

    /// Subscribe to closes: `(channel, port, baud, is_now_closed)`.
    pub fn on_closed<F>(&self, handler: F)
    where
        F: Fn(&SerialChannel, u32, u32, bool) + Send + Sync + 'static,
    {
        self.events.add_closed(Arc::new(handler));
    }

    /// Subscribe to open failures: `(channel, port, baud, message)`.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&SerialChannel, u32, u32, &str) + Send + Sync + 'static,
    {
        self.events.add_error(Arc::new(handler));
    }

    /// Forward every notification of this channel into a queue.
    pub fn event_receiver(&self) -> Receiver<ChannelEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();

        let opened_tx = tx.clone();
        self.on_opened(move |channel, port, baud, is_open| {
            let _ = opened_tx.send(ChannelEvent::Opened {
                session_id: channel.session_id().to_string(),
                port,
                baud,
                is_open,
            });
        });

        let closed_tx = tx.clone();
        self.on_closed(move |channel, port, baud, is_closed| {
            let _ = closed_tx.send(ChannelEvent::Closed {
                session_id: channel.session_id().to_string(),
                port,
                baud,
                is_closed,
            });
        });

        self.on_error(move |channel, port, baud, message| {
            let _ = tx.send(ChannelEvent::Error {
                session_id: channel.session_id().to_string(),
                port,
                baud,
                message: message.to_string(),
            });
        });

        rx
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn port(&self) -> u32 {
        self.lock_link().port
    }

    /// The hardware port name, e.g. `COM3`
    pub fn key(&self) -> String {
        self.lock_link().port_name()
    }

    pub fn baud_rate(&self) -> u32 {
        self.lock_link().baud_rate
    }

    pub fn data_bits(&self) -> DataBits {
        self.lock_link().data_bits
    }

    pub fn stop_bits(&self) -> StopBits {
        self.lock_link().stop_bits
    }

    pub fn parity(&self) -> Parity {
        self.lock_link().parity
    }

    pub fn link_settings(&self) -> LinkSettings {
        self.lock_link().clone()
    }

    /// Queries the handle; never cached. Does not wait for in-flight I/O.
    pub fn is_open(&self) -> bool {
        self.lock_closer()
            .as_ref()
            .is_some_and(|closer| closer.is_open())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Lock for callers that share this channel. The channel never takes it.
    pub fn sync_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.sync_lock)
    }

    pub fn communicate_type(&self) -> CommunicateType {
        CommunicateType::Com
    }

    /// Options applied at `initialize`, if it has run
    pub fn config(&self) -> Option<&ComConfig> {
        self.runtime.get().map(|runtime| &runtime.config)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn runtime(&self) -> ChannelResult<&Runtime> {
        self.runtime.get().ok_or(ChannelError::NotInitialized)
    }

    fn ensure_not_disposed(&self) -> ChannelResult<()> {
        if self.is_disposed() {
            Err(ChannelError::Disposed)
        } else {
            Ok(())
        }
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut dyn SerialConnection) -> ChannelResult<T>,
    ) -> ChannelResult<T> {
        self.ensure_not_disposed()?;
        if !self.is_open() {
            return Err(ChannelError::NotOpen(self.key()));
        }
        let mut slot = self.lock_connection();
        match slot.as_deref_mut() {
            Some(conn) if conn.is_open() => f(conn),
            _ => Err(ChannelError::NotOpen(self.key())),
        }
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Box<dyn SerialConnection>>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_closer(&self) -> MutexGuard<'_, Option<Arc<dyn ConnectionCloser>>> {
        self.closer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_link(&self) -> MutexGuard<'_, LinkSettings> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Validate `offset`/`length` against a buffer of `len` bytes.
fn check_range(what: &str, len: usize, offset: usize, length: usize) -> ChannelResult<()> {
    if len == 0 {
        return Err(ChannelError::InvalidArgument(format!("{what} is empty")));
    }
    if offset > len {
        return Err(ChannelError::InvalidArgument(format!(
            "Offset {offset} exceeds {what} length {len}"
        )));
    }
    match offset.checked_add(length) {
        Some(end) if end <= len => Ok(()),
        _ => Err(ChannelError::InvalidArgument(format!(
            "Offset {offset} + length {length} exceeds {what} length {len}"
        ))),
    }
}
