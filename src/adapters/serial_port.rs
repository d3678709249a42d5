//! Serial port adapter using the `serialport` crate
//!
//! Implements `SerialOpener` and `SerialConnection` for real (or OS-level
//! virtual) COM ports. `serialport` exposes a single timeout per handle, so
//! the read and write timeouts are applied right before each call.

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::domain::{
    ChannelError, ChannelResult, DataBits, LinkSettings, Parity, SerialPortInfo, StopBits,
};
use crate::ports::{ConnectionCloser, SerialConnection, SerialOpener};

/// How long one blocking call waits before the closed flag is rechecked
const IO_SLICE: Duration = Duration::from_millis(50);

/// Zero-sized opener for hardware serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl SerialPortOpener {
    /// List available serial ports on the system
    pub fn list_ports() -> ChannelResult<Vec<SerialPortInfo>> {
        let ports = serialport::available_ports()
            .map_err(|e| ChannelError::Serial(format!("Failed to list ports: {e}")))?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let port_type = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => {
                        format!("USB ({:04X}:{:04X})", info.vid, info.pid)
                    }
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::Unknown => "Native".to_string(),
                };
                SerialPortInfo {
                    name: p.port_name,
                    port_type,
                }
            })
            .collect())
    }
}

impl SerialOpener for SerialPortOpener {
    fn open(&self, settings: &LinkSettings) -> ChannelResult<Box<dyn SerialConnection>> {
        let name = settings.port_name();
        let port = serialport::new(&name, settings.baud_rate)
            .data_bits(to_data_bits(settings.data_bits))
            .stop_bits(to_stop_bits(settings.stop_bits))
            .parity(to_parity(settings.parity))
            .open()
            .map_err(|e| ChannelError::Serial(format!("Failed to open {name}: {e}")))?;

        Ok(Box::new(SerialPortConnection::new(port, name)))
    }
}

fn to_data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn to_stop_bits(bits: StopBits) -> serialport::StopBits {
    match bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}

fn to_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn timed_read(
    port: &mut dyn serialport::SerialPort,
    buffer: &mut [u8],
    timeout: Duration,
) -> io::Result<usize> {
    port.set_timeout(timeout)?;
    io::Read::read(port, buffer)
}

// No flush: on POSIX it is tcdrain, which ignores the handle timeout.
fn timed_write(
    port: &mut dyn serialport::SerialPort,
    data: &[u8],
    timeout: Duration,
) -> io::Result<usize> {
    port.set_timeout(timeout)?;
    io::Write::write(port, data)
}

fn apply_link(
    port: &mut dyn serialport::SerialPort,
    settings: &LinkSettings,
) -> serialport::Result<()> {
    port.set_baud_rate(settings.baud_rate)?;
    port.set_data_bits(to_data_bits(settings.data_bits))?;
    port.set_stop_bits(to_stop_bits(settings.stop_bits))?;
    port.set_parity(to_parity(settings.parity))
}

fn is_retryable(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::Interrupted)
}

fn serial_err(name: &str, what: &str, e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Serial(format!("{what} on {name} failed: {e}"))
}

/// Read through `attempt` in slices of at most `IO_SLICE` until data arrives,
/// the deadline passes (`Ok(0)`) or `closed` turns true (`NotOpen`).
fn read_sliced(
    name: &str,
    buffer: &mut [u8],
    timeout: Duration,
    closed: impl Fn() -> bool,
    mut attempt: impl FnMut(&mut [u8], Duration) -> io::Result<usize>,
) -> ChannelResult<usize> {
    let deadline = Instant::now() + timeout;
    loop {
        if closed() {
            return Err(ChannelError::NotOpen(name.to_string()));
        }
        let slice = deadline.saturating_duration_since(Instant::now()).min(IO_SLICE);
        match attempt(buffer, slice) {
            Ok(n) => return Ok(n),
            Err(e) if is_retryable(e.kind()) => {
                if Instant::now() >= deadline {
                    return Ok(0);
                }
            }
            Err(e) => return Err(serial_err(name, "Read", e)),
        }
    }
}

/// Write all of `data` through `attempt` in slices of at most `IO_SLICE`.
/// Running past the deadline is an error, as is `closed` turning true.
fn write_sliced(
    name: &str,
    data: &[u8],
    timeout: Duration,
    closed: impl Fn() -> bool,
    mut attempt: impl FnMut(&[u8], Duration) -> io::Result<usize>,
) -> ChannelResult<()> {
    let deadline = Instant::now() + timeout;
    let mut written = 0;
    while written < data.len() {
        if closed() {
            return Err(ChannelError::NotOpen(name.to_string()));
        }
        let slice = deadline.saturating_duration_since(Instant::now()).min(IO_SLICE);
        match attempt(&data[written..], slice) {
            Ok(0) => return Err(serial_err(name, "Write", "device accepted no bytes")),
            Ok(n) => written += n,
            Err(e) if is_retryable(e.kind()) => {
                if Instant::now() >= deadline {
                    return Err(serial_err(
                        name,
                        "Write",
                        format!("timed out after {written} of {} bytes", data.len()),
                    ));
                }
            }
            Err(e) => return Err(serial_err(name, "Write", e)),
        }
    }
    Ok(())
}

/// Closes a hardware port from outside the thread doing I/O on it.
///
/// Holds a cloned handle used only to ask the driver whether the device is
/// still there.
pub struct SerialPortCloser {
    name: String,
    closed: AtomicBool,
    presence: Mutex<Option<Box<dyn serialport::SerialPort>>>,
}

impl SerialPortCloser {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ConnectionCloser for SerialPortCloser {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.presence.lock().unwrap_or_else(|e| e.into_inner()).take();
        log::debug!("Closing {}", self.name);
    }

    fn is_open(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let presence = self.presence.lock().unwrap_or_else(|e| e.into_inner());
        match presence.as_deref() {
            Some(port) => port.bytes_to_read().is_ok(),
            // No clone available on this platform; fall back to the flag.
            None => true,
        }
    }
}

/// An open hardware port. Dropping the inner handle closes it.
///
/// Blocking calls wait in slices of `IO_SLICE` so a close issued through the
/// closer is noticed within one slice.
pub struct SerialPortConnection {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    closer: Arc<SerialPortCloser>,
}

impl SerialPortConnection {
    fn new(port: Box<dyn serialport::SerialPort>, name: String) -> Self {
        let presence = match port.try_clone() {
            Ok(clone) => Some(clone),
            Err(e) => {
                log::debug!("Cannot clone handle of {name}: {e}");
                None
            }
        };
        let closer = Arc::new(SerialPortCloser {
            name: name.clone(),
            closed: AtomicBool::new(false),
            presence: Mutex::new(presence),
        });
        Self {
            port: Some(port),
            name,
            closer,
        }
    }

    fn port(&self) -> ChannelResult<&dyn serialport::SerialPort> {
        self.port
            .as_deref()
            .ok_or_else(|| ChannelError::NotOpen(self.name.clone()))
    }

    fn port_mut(&mut self) -> ChannelResult<&mut dyn serialport::SerialPort> {
        match self.port.as_deref_mut() {
            Some(port) => Ok(port),
            None => Err(ChannelError::NotOpen(self.name.clone())),
        }
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.closer.is_closed() || self.port.is_none() {
            Err(ChannelError::NotOpen(self.name.clone()))
        } else {
            Ok(())
        }
    }

    fn serial_err(&self, what: &str, e: impl std::fmt::Display) -> ChannelError {
        serial_err(&self.name, what, e)
    }
}

impl SerialConnection for SerialPortConnection {
    fn bytes_to_read(&self) -> ChannelResult<usize> {
        let pending = self
            .port()?
            .bytes_to_read()
            .map_err(|e| self.serial_err("Query pending bytes", e))?;
        Ok(pending as usize)
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> ChannelResult<usize> {
        self.ensure_open()?;
        let Self { port, name, closer } = self;
        let port = port
            .as_deref_mut()
            .ok_or_else(|| ChannelError::NotOpen(name.clone()))?;
        read_sliced(
            name,
            buffer,
            timeout,
            || closer.is_closed(),
            |buf, slice| timed_read(port, buf, slice),
        )
    }

    fn write_all(&mut self, data: &[u8], timeout: Duration) -> ChannelResult<()> {
        self.ensure_open()?;
        let Self { port, name, closer } = self;
        let port = port
            .as_deref_mut()
            .ok_or_else(|| ChannelError::NotOpen(name.clone()))?;
        write_sliced(
            name,
            data,
            timeout,
            || closer.is_closed(),
            |chunk, slice| timed_write(port, chunk, slice),
        )
    }

    fn set_dtr(&mut self, level: bool) -> ChannelResult<()> {
        let result = self.port_mut()?.write_data_terminal_ready(level);
        result.map_err(|e| self.serial_err("Set DTR", e))
    }

    fn set_rts(&mut self, level: bool) -> ChannelResult<()> {
        let result = self.port_mut()?.write_request_to_send(level);
        result.map_err(|e| self.serial_err("Set RTS", e))
    }

    fn discard_in(&mut self) -> ChannelResult<()> {
        let result = self.port()?.clear(serialport::ClearBuffer::Input);
        result.map_err(|e| self.serial_err("Discard input", e))
    }

    fn discard_out(&mut self) -> ChannelResult<()> {
        let result = self.port()?.clear(serialport::ClearBuffer::Output);
        result.map_err(|e| self.serial_err("Discard output", e))
    }

    fn apply(&mut self, settings: &LinkSettings) -> ChannelResult<()> {
        let result = apply_link(self.port_mut()?, settings);
        result.map_err(|e| self.serial_err("Apply settings", e))
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.closer.close();
        if self.port.take().is_some() {
            log::debug!("Released {}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some() && self.closer.is_open()
    }

    fn closer(&self) -> Arc<dyn ConnectionCloser> {
        self.closer.clone()
    }
}
