//! # stmflash
//!
//! A host-side driver for the STM32 system-memory (ROM) bootloader
//! protocol, as documented in ST application notes AN3155 (USART),
//! AN3154 (CAN) and AN4221 (I2C).
//!
//! The crate discovers a connected STM32 over a byte-oriented link,
//! negotiates the subset of bootloader commands the device supports, and
//! then reads, writes, erases, CRC-checks, protects or starts flash
//! memory:
//!
//! - [`Session`] owns the link and implements the whole command set,
//!   including resynchronization after a framing mixup and the
//!   device-specific erase and reset quirks;
//! - [`port::Port`] is the transport seam: the serial implementation is
//!   built in (feature `native`, on by default), other links can be
//!   supplied from outside;
//! - [`device`] carries the static catalog mapping product IDs to memory
//!   maps and quirk flags.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stmflash::{Session, SerialConfig, UartPort};
//!
//! fn main() -> stmflash::Result<()> {
//!     let port = UartPort::open(&SerialConfig::new("/dev/ttyUSB0", 115_200))?;
//!     let mut session = Session::establish(port, true)?;
//!
//!     println!(
//!         "found {} (PID 0x{:03x})",
//!         session.device().name,
//!         session.product_id()
//!     );
//!
//!     let mut first_words = [0u8; 16];
//!     session.read_memory(session.device().fl_start, &mut first_words)?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Diagnostics are emitted through the `log` facade; install any logger
//! to surface them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod session;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::native::{list_ports, UartPort};
pub use {
    device::{catalog, find_device, Device, DeviceFlags},
    error::{Error, Result},
    port::{ControlLine, Port, PortFlags, PortInfo, SerialConfig, SerialMode},
    protocol::{CommandKind, CommandSet, MAX_CHUNK},
    session::{DeviceReset, Session, MASS_ERASE, MAX_PAGES},
};
