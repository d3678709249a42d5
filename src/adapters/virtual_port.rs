//! In-process virtual serial ports for development and testing without hardware.
//!
//! A `VirtualBus` holds named port pairs wired as a null modem: bytes written
//! to one end arrive in the input buffer of the other. Each port keeps
//! counters of what was done to it (opens, closes, discards, individual write
//! sizes) so callers can verify exactly what a channel asked of the hardware.
//!
//! Ports are exclusive like real COM ports: opening a port that is already
//! open fails with "port busy", opening an unknown name fails with
//! "no such port". `unplug` simulates the device disappearing under an open
//! handle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::domain::{port_to_string, ChannelError, ChannelResult, LinkSettings};
use crate::ports::{ConnectionCloser, SerialConnection, SerialOpener};

/// What a virtual port has been asked to do since it was created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortStats {
    pub opens: usize,
    pub closes: usize,
    pub discard_in: usize,
    pub discard_out: usize,
    /// Size of every individual write call, in order
    pub writes: Vec<usize>,
    pub dtr: bool,
    pub rts: bool,
    /// Link parameters last applied to the port
    pub link: Option<LinkSettings>,
}

#[derive(Default)]
struct PortState {
    open: bool,
    unplugged: bool,
    input: VecDeque<u8>,
    stats: PortStats,
}

struct VirtualPort {
    name: String,
    state: Mutex<PortState>,
    data_ready: Condvar,
}

impl VirtualPort {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(PortState::default()),
            data_ready: Condvar::new(),
        })
    }

    // A panicking test thread must not poison the bus for everyone else.
    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A registry of virtual null-modem port pairs.
#[derive(Default)]
pub struct VirtualBus {
    ports: Mutex<HashMap<String, (Arc<VirtualPort>, Arc<VirtualPort>)>>,
}

impl VirtualBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a null-modem pair between port numbers `a` and `b`.
    pub fn create_pair(&self, a: u32, b: u32) {
        self.create_named_pair(&port_to_string(a), &port_to_string(b));
    }

    /// Create a null-modem pair between two port names.
    pub fn create_named_pair(&self, a: &str, b: &str) {
        let port_a = VirtualPort::new(a.to_string());
        let port_b = VirtualPort::new(b.to_string());
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports.insert(a.to_string(), (Arc::clone(&port_a), Arc::clone(&port_b)));
        ports.insert(b.to_string(), (port_b, port_a));
        log::debug!("[VIRTUAL BUS] Created pair {a} <-> {b}");
    }

    /// Counters for a port number, if it exists
    pub fn stats(&self, port: u32) -> Option<PortStats> {
        self.stats_by_name(&port_to_string(port))
    }

    /// Counters for a port name, if it exists
    pub fn stats_by_name(&self, name: &str) -> Option<PortStats> {
        self.endpoints(name).map(|(local, _)| local.lock().stats.clone())
    }

    /// Push bytes into a port's input buffer as if its peer had sent them.
    pub fn inject(&self, port: u32, data: &[u8]) -> ChannelResult<()> {
        let name = port_to_string(port);
        let (local, _) = self
            .endpoints(&name)
            .ok_or_else(|| ChannelError::Serial(format!("Failed to open {name}: no such port")))?;
        local.lock().input.extend(data);
        local.data_ready.notify_all();
        Ok(())
    }

    /// Remove the device behind a port. Open handles report closed and
    /// their I/O fails; the port cannot be opened again.
    pub fn unplug(&self, port: u32) {
        if let Some((local, _)) = self.endpoints(&port_to_string(port)) {
            local.lock().unplugged = true;
            local.data_ready.notify_all();
            log::debug!("[VIRTUAL BUS] Unplugged {}", local.name);
        }
    }

    fn endpoints(&self, name: &str) -> Option<(Arc<VirtualPort>, Arc<VirtualPort>)> {
        let ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        ports
            .get(name)
            .map(|(local, peer)| (Arc::clone(local), Arc::clone(peer)))
    }
}

impl SerialOpener for VirtualBus {
    fn open(&self, settings: &LinkSettings) -> ChannelResult<Box<dyn SerialConnection>> {
        let name = settings.port_name();
        let (local, peer) = self
            .endpoints(&name)
            .ok_or_else(|| ChannelError::Serial(format!("Failed to open {name}: no such port")))?;

        {
            let mut state = local.lock();
            if state.unplugged {
                return Err(ChannelError::Serial(format!(
                    "Failed to open {name}: device removed"
                )));
            }
            if state.open {
                return Err(ChannelError::Serial(format!(
                    "Failed to open {name}: port busy"
                )));
            }
            state.open = true;
            state.stats.opens += 1;
            state.stats.link = Some(settings.clone());
        }
        log::debug!("[VIRTUAL BUS] Opened {name} at {} baud", settings.baud_rate);

        Ok(Box::new(VirtualConnection {
            closer: Arc::new(VirtualCloser {
                local,
                closed: AtomicBool::new(false),
            }),
            peer,
        }))
    }
}

/// Open/closed state of one virtual handle, shared with its connection.
pub struct VirtualCloser {
    local: Arc<VirtualPort>,
    closed: AtomicBool,
}

impl VirtualCloser {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ConnectionCloser for VirtualCloser {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.local.lock();
            state.open = false;
            state.stats.closes += 1;
        }
        // Wake any reader blocked on this port so it fails instead of hanging.
        self.local.data_ready.notify_all();
        log::debug!("[VIRTUAL BUS] Closed {}", self.local.name);
    }

    fn is_open(&self) -> bool {
        !self.is_closed() && !self.local.lock().unplugged
    }
}

/// An open end of a virtual null-modem pair.
pub struct VirtualConnection {
    closer: Arc<VirtualCloser>,
    peer: Arc<VirtualPort>,
}

impl VirtualConnection {
    fn local(&self) -> &VirtualPort {
        &self.closer.local
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.closer.is_closed() {
            return Err(ChannelError::NotOpen(self.local().name.clone()));
        }
        if self.local().lock().unplugged {
            return Err(self.removed());
        }
        Ok(())
    }

    fn removed(&self) -> ChannelError {
        ChannelError::Serial(format!("{}: device removed", self.local().name))
    }
}

impl SerialConnection for VirtualConnection {
    fn bytes_to_read(&self) -> ChannelResult<usize> {
        self.ensure_open()?;
        Ok(self.local().lock().input.len())
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> ChannelResult<usize> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let local = self.local();
        let mut state = local.lock();

        loop {
            if self.closer.is_closed() {
                return Err(ChannelError::Serial(format!(
                    "Read on {} failed: port closed",
                    local.name
                )));
            }
            if state.unplugged {
                return Err(self.removed());
            }
            if !state.input.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            state = local
                .data_ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }

        let n = buffer.len().min(state.input.len());
        for (slot, byte) in buffer.iter_mut().zip(state.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8], _timeout: Duration) -> ChannelResult<()> {
        self.ensure_open()?;
        self.local().lock().stats.writes.push(data.len());
        self.peer.lock().input.extend(data);
        self.peer.data_ready.notify_all();
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> ChannelResult<()> {
        self.ensure_open()?;
        self.local().lock().stats.dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> ChannelResult<()> {
        self.ensure_open()?;
        self.local().lock().stats.rts = level;
        Ok(())
    }

    fn discard_in(&mut self) -> ChannelResult<()> {
        self.ensure_open()?;
        let mut state = self.local().lock();
        state.input.clear();
        state.stats.discard_in += 1;
        Ok(())
    }

    fn discard_out(&mut self) -> ChannelResult<()> {
        // Writes are delivered immediately, so there is never pending output.
        self.ensure_open()?;
        self.local().lock().stats.discard_out += 1;
        Ok(())
    }

    fn apply(&mut self, settings: &LinkSettings) -> ChannelResult<()> {
        self.ensure_open()?;
        self.local().lock().stats.link = Some(settings.clone());
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.closer.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.closer.is_open()
    }

    fn closer(&self) -> Arc<dyn ConnectionCloser> {
        self.closer.clone()
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        self.closer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(bus: &VirtualBus, port: u32) -> Box<dyn SerialConnection> {
        bus.open(&LinkSettings::new(port, 9600)).unwrap()
    }

    #[test]
    fn bytes_cross_the_null_modem() {
        let bus = VirtualBus::new();
        bus.create_pair(3, 4);
        let mut a = open(&bus, 3);
        let mut b = open(&bus, 4);

        a.write_all(b"hello", Duration::ZERO).unwrap();
        assert_eq!(b.bytes_to_read().unwrap(), 5);

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(a.bytes_to_read().unwrap(), 0);
    }

    #[test]
    fn unknown_port_fails_to_open() {
        let bus = VirtualBus::new();
        let err = bus.open(&LinkSettings::new(9, 9600)).err().unwrap();
        assert!(err.to_string().contains("no such port"));
    }

    #[test]
    fn second_open_is_busy() {
        let bus = VirtualBus::new();
        bus.create_pair(1, 2);
        let _first = open(&bus, 1);
        let err = bus.open(&LinkSettings::new(1, 9600)).err().unwrap();
        assert!(err.to_string().contains("port busy"));
    }

    #[test]
    fn read_times_out_with_zero_bytes() {
        let bus = VirtualBus::new();
        bus.create_pair(1, 2);
        let mut a = open(&bus, 1);
        let mut buf = [0u8; 4];
        assert_eq!(a.read(&mut buf, Duration::from_millis(5)).unwrap(), 0);
    }

    #[test]
    fn read_returns_at_most_buffer_len() {
        let bus = VirtualBus::new();
        bus.create_pair(1, 2);
        let mut a = open(&bus, 1);
        bus.inject(1, &[1, 2, 3, 4, 5, 6]).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(a.read(&mut buf, Duration::ZERO).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(a.bytes_to_read().unwrap(), 2);
    }

    #[test]
    fn close_is_counted_once_and_port_can_reopen() {
        let bus = VirtualBus::new();
        bus.create_pair(1, 2);
        let mut a = open(&bus, 1);
        a.close().unwrap();
        a.close().unwrap();
        drop(a);
        assert_eq!(bus.stats(1).unwrap().closes, 1);

        let b = open(&bus, 1);
        assert!(b.is_open());
        assert_eq!(bus.stats(1).unwrap().opens, 2);
    }

    #[test]
    fn io_after_close_fails() {
        let bus = VirtualBus::new();
        bus.create_pair(1, 2);
        let mut a = open(&bus, 1);
        a.close().unwrap();
        assert!(!a.is_open());
        assert!(a.write_all(b"x", Duration::ZERO).is_err());
        assert!(a.bytes_to_read().is_err());
    }

    #[test]
    fn closer_wakes_blocked_reader() {
        let bus = VirtualBus::new();
        bus.create_pair(1, 2);
        let mut a = open(&bus, 1);
        let closer = a.closer();

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            let started = Instant::now();
            let result = a.read(&mut buf, Duration::from_secs(5));
            (result, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        closer.close();

        let (result, elapsed) = reader.join().unwrap();
        assert!(result.is_err());
        assert!(elapsed < Duration::from_secs(2), "reader waited {elapsed:?}");
        assert!(!closer.is_open());
        assert_eq!(bus.stats(1).unwrap().closes, 1);
    }

    #[test]
    fn unplug_closes_open_handle_and_blocks_reopen() {
        let bus = VirtualBus::new();
        bus.create_pair(1, 2);
        let mut a = open(&bus, 1);
        bus.unplug(1);

        assert!(!a.is_open());
        assert!(!a.closer().is_open());
        let mut buf = [0u8; 4];
        assert!(a.read(&mut buf, Duration::ZERO).is_err());
        drop(a);

        let err = bus.open(&LinkSettings::new(1, 9600)).err().unwrap();
        assert!(err.to_string().contains("device removed"));
    }
}
