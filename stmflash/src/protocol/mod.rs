//! AN3155/AN3154/AN4221 bootloader protocol: constants, command
//! negotiation and frame builders.
//!
//! Every command exchange follows the same shape:
//!
//! ```text
//! +------+--------+          +-----------------+
//! | cmd  | cmd^FF |  ------> |    bootloader   |
//! +------+--------+          +-----------------+
//!                  <------ ACK (0x79) / NACK (0x1F) / BUSY (0x76)
//! ```
//!
//! followed by command-specific payloads. Multi-byte scalars travel
//! MSB-first and every sub-frame ends in an XOR checksum over its bytes.
//!
//! The builders here are pure functions over byte buffers; all I/O and
//! acknowledgement handling lives in [`crate::session`].

pub mod crc;
pub mod stubs;

use std::fmt;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

/// Positive acknowledgement.
pub const ACK: u8 = 0x79;
/// Negative acknowledgement.
pub const NACK: u8 = 0x1F;
/// Busy marker; the device is still working, keep waiting.
pub const BUSY: u8 = 0x76;
/// Autobaud init byte for UART links.
pub const INIT: u8 = 0x7F;

/// Sentinel for "no opcode negotiated"; also deliberately an invalid
/// command, used as-is by the resync sequence.
pub const CMD_UNSUPPORTED: u8 = 0xFF;

pub(crate) const CMD_GET: u8 = 0x00;
pub(crate) const CMD_GVR: u8 = 0x01;
pub(crate) const CMD_GID: u8 = 0x02;
pub(crate) const CMD_RM: u8 = 0x11;
pub(crate) const CMD_GO: u8 = 0x21;
pub(crate) const CMD_WM: u8 = 0x31;
pub(crate) const CMD_WM_NS: u8 = 0x32;
pub(crate) const CMD_ER: u8 = 0x43;
pub(crate) const CMD_EE: u8 = 0x44;
pub(crate) const CMD_EE_NS: u8 = 0x45;
pub(crate) const CMD_WP: u8 = 0x63;
pub(crate) const CMD_WP_NS: u8 = 0x64;
pub(crate) const CMD_UW: u8 = 0x73;
pub(crate) const CMD_UW_NS: u8 = 0x74;
pub(crate) const CMD_RP: u8 = 0x82;
pub(crate) const CMD_RP_NS: u8 = 0x83;
pub(crate) const CMD_UR: u8 = 0x92;
pub(crate) const CMD_UR_NS: u8 = 0x93;
pub(crate) const CMD_CRC: u8 = 0xA1;

/// Default GET reply length guess for frame-oriented transports that do
/// not publish a per-version table.
pub(crate) const GET_REPLY_GUESS: u8 = 17;

/// Wall clock for the resynchronization loop.
pub(crate) const RESYNC_TIMEOUT: Duration = Duration::from_secs(35);
/// Mass erase can take tens of seconds on large parts.
pub(crate) const MASS_ERASE_TIMEOUT: Duration = Duration::from_secs(35);
/// Per-page wait for page-range erases.
pub(crate) const PAGE_ERASE_TIMEOUT: Duration = Duration::from_secs(5);
/// Block write acknowledgement.
pub(crate) const BLOCK_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Write protect / unprotect acknowledgement.
pub(crate) const WRITE_PROT_TIMEOUT: Duration = Duration::from_secs(1);
/// Readout protect acknowledgement.
pub(crate) const READ_PROT_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum payload of a single read or write command.
pub const MAX_CHUNK: usize = 256;

/// Abstract command kinds negotiated through GET.
///
/// Several kinds exist in a legacy and a no-stretch flavour (the latter for
/// I2C masters that cannot tolerate clock stretching); a bootloader reports
/// at most one of each pair, and the no-stretch opcode is always the
/// numerically greater one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CommandKind {
    /// GET: bootloader version and supported commands.
    Get,
    /// GVR: version and read protection status.
    GetVersion,
    /// GID: product ID.
    GetId,
    /// Read up to 256 bytes of memory.
    ReadMemory,
    /// Jump to application code.
    Go,
    /// Write up to 256 bytes of memory.
    WriteMemory,
    /// Erase flash pages (legacy or extended).
    EraseMemory,
    /// Enable write protection.
    WriteProtect,
    /// Disable write protection.
    WriteUnprotect,
    /// Enable readout protection.
    ReadProtect,
    /// Disable readout protection.
    ReadUnprotect,
    /// Compute a flash CRC in the device.
    Crc,
}

impl CommandKind {
    const COUNT: usize = 12;

    /// Human-readable name used in errors and diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::GetVersion => "GET VERSION",
            Self::GetId => "GET ID",
            Self::ReadMemory => "READ",
            Self::Go => "GO",
            Self::WriteMemory => "WRITE",
            Self::EraseMemory => "ERASE",
            Self::WriteProtect => "WRITE PROTECT",
            Self::WriteUnprotect => "WRITE UNPROTECT",
            Self::ReadProtect => "READOUT PROTECT",
            Self::ReadUnprotect => "READOUT UNPROTECT",
            Self::Crc => "CRC",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The negotiated command map: kind to actual opcode byte, with
/// [`CMD_UNSUPPORTED`] marking absent commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    bytes: [u8; CommandKind::COUNT],
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandSet {
    /// An empty map with every kind unsupported.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes: [CMD_UNSUPPORTED; CommandKind::COUNT],
        }
    }

    /// The negotiated opcode for `kind`, if the bootloader reported one.
    #[must_use]
    pub fn opcode(&self, kind: CommandKind) -> Option<u8> {
        let raw = self.bytes[kind as usize];
        (raw != CMD_UNSUPPORTED).then_some(raw)
    }

    /// Whether `kind` was reported by the bootloader.
    #[must_use]
    pub fn supports(&self, kind: CommandKind) -> bool {
        self.opcode(kind).is_some()
    }

    /// Record an opcode byte from the GET reply.
    ///
    /// Returns the kind the byte was filed under, or `None` for an opcode
    /// this driver does not know. For dual legacy/no-stretch kinds the
    /// numerically greater opcode wins, since the no-stretch variant is the
    /// newer one.
    pub fn record(&mut self, raw: u8) -> Option<CommandKind> {
        let kind = match raw {
            CMD_GET => CommandKind::Get,
            CMD_GVR => CommandKind::GetVersion,
            CMD_GID => CommandKind::GetId,
            CMD_RM => CommandKind::ReadMemory,
            CMD_GO => CommandKind::Go,
            CMD_WM | CMD_WM_NS => CommandKind::WriteMemory,
            CMD_ER | CMD_EE | CMD_EE_NS => CommandKind::EraseMemory,
            CMD_WP | CMD_WP_NS => CommandKind::WriteProtect,
            CMD_UW | CMD_UW_NS => CommandKind::WriteUnprotect,
            CMD_RP | CMD_RP_NS => CommandKind::ReadProtect,
            CMD_UR | CMD_UR_NS => CommandKind::ReadUnprotect,
            CMD_CRC => CommandKind::Crc,
            _ => return None,
        };
        let slot = &mut self.bytes[kind as usize];
        if *slot == CMD_UNSUPPORTED || raw > *slot {
            *slot = raw;
        }
        Some(kind)
    }

    /// Whether the negotiated write opcode is the no-stretch variant.
    #[must_use]
    pub(crate) fn is_no_stretch(&self, kind: CommandKind) -> bool {
        matches!(
            self.bytes[kind as usize],
            CMD_WM_NS | CMD_EE_NS | CMD_WP_NS | CMD_UW_NS | CMD_RP_NS | CMD_UR_NS
        )
    }
}

/// A framed command: the opcode followed by its complement.
#[must_use]
pub fn command_frame(cmd: u8) -> [u8; 2] {
    [cmd, cmd ^ 0xFF]
}

/// A 5-byte address (or length) frame: big-endian word plus XOR checksum.
#[must_use]
pub fn address_frame(value: u32) -> [u8; 5] {
    let mut buf = [0u8; 5];
    BigEndian::write_u32(&mut buf[..4], value);
    buf[4] = buf[0] ^ buf[1] ^ buf[2] ^ buf[3];
    buf
}

/// The data frame of a WRITE command.
///
/// `data` is 1 to 256 bytes; the frame carries the count of payload bytes
/// minus one, the data padded with `0xFF` up to a multiple of four, and an
/// XOR checksum over everything before it.
#[must_use]
pub fn write_payload(data: &[u8]) -> Vec<u8> {
    debug_assert!(!data.is_empty() && data.len() <= MAX_CHUNK);

    let aligned_len = (data.len() + 3) & !3;
    let mut buf = Vec::with_capacity(aligned_len + 2);
    buf.push((aligned_len - 1) as u8);
    buf.extend_from_slice(data);
    buf.resize(aligned_len + 1, 0xFF);

    let checksum = buf.iter().fold(0, |cs, b| cs ^ b);
    buf.push(checksum);
    buf
}

/// Page list payload of a legacy (one-byte index) erase.
#[must_use]
pub fn erase_pages_legacy(first_page: u32, count: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + count as usize + 1);
    buf.push((count - 1) as u8);
    for page in first_page..first_page + count {
        buf.push(page as u8);
    }
    let checksum = buf.iter().fold(0, |cs, b| cs ^ b);
    buf.push(checksum);
    buf
}

/// Page list payload of an extended (two-byte index) erase.
#[must_use]
pub fn erase_pages_extended(first_page: u32, count: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + 2 * count as usize + 1);
    buf.extend_from_slice(&((count - 1) as u16).to_be_bytes());
    for page in first_page..first_page + count {
        buf.extend_from_slice(&(page as u16).to_be_bytes());
    }
    let checksum = buf.iter().fold(0, |cs, b| cs ^ b);
    buf.push(checksum);
    buf
}

/// Mass erase payload of an extended erase: the `0xFFFF` magic plus its
/// (zero) checksum.
#[must_use]
pub fn erase_mass_extended() -> [u8; 3] {
    [0xFF, 0xFF, 0x00]
}
