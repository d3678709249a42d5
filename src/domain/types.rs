//! Core domain types

use serde::{Deserialize, Serialize};

use super::{ChannelError, ChannelResult};

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    pub fn as_u8(&self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = ChannelError;

    fn try_from(bits: u8) -> ChannelResult<Self> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ChannelError::InvalidArgument(format!(
                "Data bits must be between 5 and 8, got {other}"
            ))),
        }
    }
}

/// Stop-bit mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

/// Parity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Which kind of transport a session drives.
///
/// Device-polling servers run serial and network sessions side by side and
/// dispatch on this tag; a `SerialChannel` always reports `Com`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommunicateType {
    Com,
    Net,
}

/// Hardware address plus link parameters of one serial channel.
///
/// Defaults to 8 data bits, one stop bit and no parity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Port number (e.g. 3 for `COM3`)
    pub port: u32,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl LinkSettings {
    pub fn new(port: u32, baud_rate: u32) -> Self {
        Self {
            port,
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }

    /// Platform port name for this port number
    pub fn port_name(&self) -> String {
        port_to_string(self.port)
    }
}

/// Information about a serial port found on the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortInfo {
    pub name: String,
    pub port_type: String,
}

#[cfg(windows)]
const PORT_PREFIX: &str = "COM";
#[cfg(not(windows))]
const PORT_PREFIX: &str = "/dev/ttyS";

/// Convert a port number into the platform port name.
pub fn port_to_string(port: u32) -> String {
    format!("{PORT_PREFIX}{port}")
}

/// Extract the port number from a port name by its trailing digits.
/// Names without trailing digits map to 0.
pub fn port_to_int(name: &str) -> u32 {
    let digits_start = name
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);

    match digits_start {
        Some(i) => name[i..].parse().unwrap_or(0),
        None => 0,
    }
}
