//! Transport abstraction for talking to the STM32 ROM bootloader.
//!
//! The protocol engine is transport-agnostic: everything it needs from the
//! link is captured by the [`Port`] trait. The bootloader speaks the same
//! command set over UART, I2C, SPI and USB DFU, but the framing details
//! differ per link, so a port describes itself with [`PortFlags`]:
//!
//! - byte-oriented links (UART) stream replies byte by byte, so
//!   variable-length replies can be read length-first;
//! - frame-oriented links deliver whole frames and need the resync dance
//!   when a reply length was guessed wrong;
//! - only some links carry the product-version/option bytes in the GVR
//!   reply, need the autobaud init byte, or tolerate read retries.
//!
//! Only the serial implementation ships here (see [`native`]); other
//! transports can be plugged in from the outside.

#[cfg(feature = "native")]
pub mod native;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Capability flags describing a transport.
///
/// These drive protocol decisions; see the module docs for the rationale
/// behind each one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFlags {
    /// Replies arrive as a byte stream (UART-like), so variable-length
    /// replies can be consumed length-prefix first.
    pub byte_oriented: bool,
    /// GVR returns three bytes (version plus two option bytes) instead of
    /// one.
    pub gvr_etx: bool,
    /// The link requires the one-shot autobaud init byte after reset.
    pub cmd_init: bool,
    /// Single-byte reads may be retried until a caller-supplied wall-clock
    /// deadline; without this flag a read timeout is final.
    pub retry: bool,
    /// Writes can fail because the link cannot tolerate I2C clock
    /// stretching; used for diagnostics only.
    pub stretch_write: bool,
}

/// Serial control lines the bootloader entry circuitry may be wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    /// Request To Send.
    Rts,
    /// Data Terminal Ready.
    Dtr,
    /// Line break. Transports without break support accept and ignore it.
    Brk,
}

/// Unified transport trait consumed by the protocol engine.
///
/// A [`crate::Session`] owns its port exclusively for its whole lifetime;
/// two sessions must never share one.
pub trait Port: Send {
    /// Capability flags of this transport.
    fn flags(&self) -> PortFlags;

    /// Read exactly `buf.len()` bytes under a single overall deadline.
    ///
    /// All-or-nothing: either the buffer is filled before the transport
    /// deadline or [`Error::Timeout`] is returned and any partial data is
    /// discarded.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes, blocking until the transport accepted them.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Drop any buffered, unread input.
    fn flush_input(&mut self) -> Result<()>;

    /// Drive a control line. Ports may treat [`ControlLine::Brk`] as a
    /// no-op.
    fn set_control(&mut self, line: ControlLine, level: bool) -> Result<()>;

    /// Port name/path for diagnostics (e.g. "/dev/ttyUSB0").
    fn name(&self) -> &str;

    /// Human-readable configuration summary.
    fn config_str(&self) -> String;

    /// Expected GET reply length for a given product version, if this
    /// transport knows it.
    ///
    /// Frame-oriented links use this to avoid the guess-and-resync path;
    /// byte streams never need it.
    fn get_reply_len(&self, _version: u8) -> Option<u8> {
        None
    }
}

/// Character framing of the serial link, e.g. `8e1`.
///
/// The STM32 ROM bootloader uses even parity on UART, so the default mode
/// is `8e1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialMode {
    /// Data bits (5-8).
    pub data_bits: u8,
    /// Parity.
    pub parity: Parity,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
}

impl Default for SerialMode {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: Parity::Even,
            stop_bits: 1,
        }
    }
}

impl FromStr for SerialMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 {
            return Err(Error::Protocol(format!("invalid serial mode {s:?}")));
        }
        let data_bits = match bytes[0] {
            b @ b'5'..=b'8' => b - b'0',
            _ => return Err(Error::Protocol(format!("invalid data bits in {s:?}"))),
        };
        let parity = match bytes[1] {
            b'n' | b'N' => Parity::None,
            b'e' | b'E' => Parity::Even,
            b'o' | b'O' => Parity::Odd,
            _ => return Err(Error::Protocol(format!("invalid parity in {s:?}"))),
        };
        let stop_bits = match bytes[2] {
            b @ (b'1' | b'2') => b - b'0',
            _ => return Err(Error::Protocol(format!("invalid stop bits in {s:?}"))),
        };
        Ok(Self {
            data_bits,
            parity,
            stop_bits,
        })
    }
}

impl fmt::Display for SerialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'n',
            Parity::Even => 'e',
            Parity::Odd => 'o',
        };
        write!(f, "{}{}{}", self.data_bits, parity, self.stop_bits)
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    None,
    /// Even parity (bootloader default on UART).
    #[default]
    Even,
    /// Odd parity.
    Odd,
}

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g. "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Character framing.
    pub mode: SerialMode,
    /// Per-read overall deadline.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            mode: SerialMode::default(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Set the character framing.
    #[must_use]
    pub fn with_mode(mut self, mode: SerialMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the per-read deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Information about an enumerated serial port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Product string (if available).
    pub product: Option<String>,
}
