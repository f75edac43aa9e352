//! Bootloader session: link establishment and the negotiated command set.
//!
//! A [`Session`] is created by [`Session::establish`], which runs the
//! autobaud init (when the link needs it), queries GVR/GET/GID and looks
//! the reported product ID up in the device catalog. All subsequent
//! operations are synchronous request/response exchanges on the owned
//! port; there is no pipelining and no internal parallelism, and every
//! acknowledgement byte is consumed by exactly one framing primitive.
//!
//! Timeouts stand in for cancellation: when one trips, the session state
//! on the device side is unknown and the caller should tear the session
//! down and re-establish.

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};

use crate::device::{self, Device};
use crate::error::{Error, Result};
use crate::port::{Port, PortFlags};
use crate::protocol::{
    self, address_frame, command_frame, crc, erase_mass_extended, erase_pages_extended,
    erase_pages_legacy, stubs, write_payload, CommandKind, CommandSet, ACK, BUSY, INIT, MAX_CHUNK,
    NACK,
};

/// Page count requesting a whole-device erase.
///
/// Deliberately greater than twice [`MAX_PAGES`] so it can never alias a
/// real page count.
pub const MASS_ERASE: u32 = 0x0010_0000;

/// Highest page index addressable by the erase commands.
pub const MAX_PAGES: u32 = 0xFFFF;

/// Largest variable-length reply: a length byte plus up to 256 payload
/// bytes.
const MAX_REPLY: usize = 257;

/// Whether the device reset itself after acknowledging a command.
///
/// The bootloader performs a system reset on its own after acknowledging
/// readout protect and both unprotect commands; a caller tracking "reset
/// device at exit" must treat that reset as already done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceReset {
    /// The device reset itself; the session is gone.
    Auto,
    /// No automatic reset took place.
    None,
}

/// An established bootloader session.
///
/// Owns its transport exclusively; dropping the session closes it. Not
/// usable from multiple threads at once.
#[derive(Debug)]
pub struct Session<P: Port> {
    port: P,
    flags: PortFlags,
    bl_version: u8,
    version: u8,
    option1: u8,
    option2: u8,
    product_id: u16,
    cmds: CommandSet,
    device: &'static Device,
}

impl<P: Port> Session<P> {
    /// Establish a session over `port`.
    ///
    /// `send_init` controls whether the one-shot autobaud init byte is
    /// sent on links that want one; pass `false` when resuming a link
    /// that was initialized earlier (the baud rate must be unchanged).
    ///
    /// On any failure the port is dropped, which closes it.
    pub fn establish(mut port: P, send_init: bool) -> Result<Self> {
        let flags = port.flags();

        if flags.cmd_init && send_init {
            init_link(&mut port)?;
        }

        // Product version and, on links that carry them, the option bytes.
        send_command(&mut port, protocol::CMD_GVR)?;
        let mut gvr = [0u8; 3];
        let gvr_len = if flags.gvr_etx { 3 } else { 1 };
        port.read_exact(&mut gvr[..gvr_len])?;
        ack(&mut port)?;
        let version = gvr[0];

        // GET: bootloader version and supported opcodes.
        let mut buf = [0u8; MAX_REPLY];
        let guess = port
            .get_reply_len(version)
            .unwrap_or(protocol::GET_REPLY_GUESS);
        read_sized_reply(&mut port, protocol::CMD_GET, guess, &mut buf)?;
        let count = buf[0] as usize + 1;
        let bl_version = buf[1];

        let mut cmds = CommandSet::new();
        let mut unknown = Vec::new();
        for &raw in &buf[2..=count] {
            if cmds.record(raw).is_none() {
                unknown.push(raw);
            }
        }
        if !unknown.is_empty() {
            warn!("GET returned unknown commands: {}", hex_list(&unknown));
        }
        ack(&mut port)?;

        if !(cmds.supports(CommandKind::Get)
            && cmds.supports(CommandKind::GetVersion)
            && cmds.supports(CommandKind::GetId))
        {
            return Err(Error::Protocol(
                "bootloader did not return correct information from GET".into(),
            ));
        }

        // GID: the 12-bit product ID, MSB first.
        let gid = cmds
            .opcode(CommandKind::GetId)
            .unwrap_or(protocol::CMD_GID);
        read_sized_reply(&mut port, gid, 1, &mut buf)?;
        let count = buf[0] as usize + 1;
        if count < 2 {
            return Err(Error::Protocol(format!(
                "only {count} byte(s) sent in the PID, unknown/unsupported device"
            )));
        }
        let product_id = u16::from(buf[1]) << 8 | u16::from(buf[2]);
        if count > 2 {
            warn!(
                "bootloader returned {} extra byte(s) in the PID: {}",
                count - 2,
                hex_list(&buf[3..=count])
            );
        }
        ack(&mut port)?;

        let device = device::find_device(product_id)?;
        info!("device 0x{product_id:03x} ({})", device.name);

        Ok(Self {
            port,
            flags,
            bl_version,
            version,
            option1: if flags.gvr_etx { gvr[1] } else { 0 },
            option2: if flags.gvr_etx { gvr[2] } else { 0 },
            product_id,
            cmds,
            device,
        })
    }

    /// Bootloader version byte from the GET reply.
    #[must_use]
    pub fn bl_version(&self) -> u8 {
        self.bl_version
    }

    /// Product version byte from the GVR reply.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// GVR option bytes, when the link carries them.
    #[must_use]
    pub fn option_bytes(&self) -> Option<(u8, u8)> {
        self.flags.gvr_etx.then_some((self.option1, self.option2))
    }

    /// The 12-bit product ID reported by GID.
    #[must_use]
    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// The catalog record of the attached device.
    #[must_use]
    pub fn device(&self) -> &'static Device {
        self.device
    }

    /// The negotiated command map.
    #[must_use]
    pub fn commands(&self) -> &CommandSet {
        &self.cmds
    }

    /// Whether the bootloader reported support for `kind`.
    #[must_use]
    pub fn supports(&self, kind: CommandKind) -> bool {
        self.cmds.supports(kind)
    }

    /// Borrow the underlying transport.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Tear the session down and hand the transport back.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Read up to 256 bytes of memory starting at `address`.
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > MAX_CHUNK {
            return Err(Error::Protocol("read length limit is 256 bytes".into()));
        }
        let opcode = self
            .cmds
            .opcode(CommandKind::ReadMemory)
            .ok_or(Error::NoCommand("READ"))?;

        send_command(&mut self.port, opcode)?;
        self.port.write_all(&address_frame(address))?;
        ack(&mut self.port)?;

        // The byte count goes out framed like a command, complement and
        // acknowledgement included.
        send_command(&mut self.port, (data.len() - 1) as u8)?;
        self.port.read_exact(data)?;
        Ok(())
    }

    /// Write up to 256 bytes of memory starting at `address`.
    ///
    /// The address must be 32-bit aligned; the data is padded with `0xFF`
    /// to a multiple of four on the wire.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > MAX_CHUNK {
            return Err(Error::Protocol("write length limit is 256 bytes".into()));
        }
        if address % 4 != 0 {
            return Err(Error::Protocol(
                "write address must be 4-byte aligned".into(),
            ));
        }
        let opcode = self
            .cmds
            .opcode(CommandKind::WriteMemory)
            .ok_or(Error::NoCommand("WRITE"))?;

        send_command(&mut self.port, opcode)?;
        self.port.write_all(&address_frame(address))?;
        ack(&mut self.port)?;

        self.port.write_all(&write_payload(data))?;
        ack_with_timeout(&mut self.port, protocol::BLOCK_WRITE_TIMEOUT).map_err(|e| {
            if self.flags.stretch_write && !self.cmds.is_no_stretch(CommandKind::WriteMemory) {
                warn_stretching("write");
            }
            e
        })
    }

    /// Erase `pages` flash pages starting at `first_page`, or the whole
    /// device when `pages` is [`MASS_ERASE`].
    ///
    /// Devices whose bootloader lacks the mass-erase opcode degrade to a
    /// page-range erase over the full flash. Ranges larger than 512 pages
    /// are split into multiple commands.
    pub fn erase_memory(&mut self, first_page: u32, mut pages: u32) -> Result<()> {
        if pages == 0
            || first_page > MAX_PAGES
            || (pages != MASS_ERASE && first_page.saturating_add(pages) > MAX_PAGES)
        {
            debug!("erase request out of range, nothing to do");
            return Ok(());
        }
        if !self.cmds.supports(CommandKind::EraseMemory) {
            return Err(Error::NoCommand("ERASE"));
        }

        if pages == MASS_ERASE {
            if !self.device.flags.no_mass_erase {
                return self.mass_erase();
            }
            // Toggling readout protection would also wipe the flash, but
            // that hangs targets with a debug probe attached; erase
            // page-by-page instead.
            pages = self.device.page_ceil(self.device.fl_end);
            warn!(
                "mass erase is not available on {}, erasing all {pages} pages instead",
                self.device.name
            );
        }

        // Some devices (e.g. STM32L152) refuse more than 512 pages in one
        // command.
        let mut first = first_page;
        while pages > 0 {
            let batch = pages.min(512);
            self.erase_pages(first, batch)?;
            first += batch;
            pages -= batch;
        }
        Ok(())
    }

    /// Erase the entire flash.
    pub fn erase_all(&mut self) -> Result<()> {
        self.erase_memory(0, MASS_ERASE)
    }

    fn mass_erase(&mut self) -> Result<()> {
        let opcode = self
            .cmds
            .opcode(CommandKind::EraseMemory)
            .ok_or(Error::NoCommand("ERASE"))?;
        send_command(&mut self.port, opcode)?;

        if opcode == protocol::CMD_ER {
            // Legacy erase: mass erase is the 0xFF page count, framed like
            // a command.
            return send_command_with_timeout(
                &mut self.port,
                0xFF,
                protocol::MASS_ERASE_TIMEOUT,
            )
            .map_err(|e| {
                if self.flags.stretch_write {
                    warn_stretching("mass erase");
                }
                e
            });
        }

        self.port.write_all(&erase_mass_extended())?;
        ack_with_timeout(&mut self.port, protocol::MASS_ERASE_TIMEOUT).map_err(|e| {
            warn!("mass erase failed, try specifying the number of pages to be erased");
            if self.flags.stretch_write && !self.cmds.is_no_stretch(CommandKind::EraseMemory) {
                warn_stretching("mass erase");
            }
            e
        })
    }

    fn erase_pages(&mut self, first_page: u32, pages: u32) -> Result<()> {
        let opcode = self
            .cmds
            .opcode(CommandKind::EraseMemory)
            .ok_or(Error::NoCommand("ERASE"))?;
        send_command(&mut self.port, opcode)?;

        let legacy = opcode == protocol::CMD_ER;
        let payload = if legacy {
            erase_pages_legacy(first_page, pages)
        } else {
            erase_pages_extended(first_page, pages)
        };
        self.port.write_all(&payload)?;

        ack_with_timeout(&mut self.port, protocol::PAGE_ERASE_TIMEOUT * pages).map_err(|e| {
            if !legacy {
                warn!("page-by-page erase failed, check the maximum pages your device supports");
            }
            if self.flags.stretch_write && !self.cmds.is_no_stretch(CommandKind::EraseMemory) {
                warn_stretching("erase");
            }
            e
        })
    }

    /// Transfer execution to `address`.
    ///
    /// After the acknowledgement the device is running application code;
    /// the session should be considered closed.
    pub fn go(&mut self, address: u32) -> Result<()> {
        let opcode = self
            .cmds
            .opcode(CommandKind::Go)
            .ok_or(Error::NoCommand("GO"))?;
        send_command(&mut self.port, opcode)?;
        self.port.write_all(&address_frame(address))?;
        ack(&mut self.port)
    }

    /// Let the device compute the CRC of `length` bytes at `address`.
    ///
    /// Both must be 4-byte aligned. The compute phase is delimited by two
    /// consecutive ACKs before the 5-byte result, per AN3155.
    pub fn crc_memory(&mut self, address: u32, length: u32) -> Result<u32> {
        if address % 4 != 0 || length % 4 != 0 {
            return Err(Error::Protocol(
                "CRC address and length must be 4-byte aligned".into(),
            ));
        }
        let opcode = self
            .cmds
            .opcode(CommandKind::Crc)
            .ok_or(Error::NoCommand("CRC"))?;

        send_command(&mut self.port, opcode)?;
        self.port.write_all(&address_frame(address))?;
        ack(&mut self.port)?;
        self.port.write_all(&address_frame(length))?;
        ack(&mut self.port)?;
        ack(&mut self.port)?;

        let mut reply = [0u8; 5];
        self.port.read_exact(&mut reply)?;
        if reply[4] != reply[0] ^ reply[1] ^ reply[2] ^ reply[3] {
            return Err(Error::Protocol("CRC reply checksum mismatch".into()));
        }
        Ok(BigEndian::read_u32(&reply[..4]))
    }

    /// Compute the CRC of `length` bytes at `address`, preferring the
    /// device's CRC command and falling back to reading the memory and
    /// folding it on the host.
    pub fn compute_crc(&mut self, address: u32, length: u32) -> Result<u32> {
        if address % 4 != 0 || length % 4 != 0 {
            return Err(Error::Protocol(
                "CRC address and length must be 4-byte aligned".into(),
            ));
        }
        if self.cmds.supports(CommandKind::Crc) {
            return self.crc_memory(address, length);
        }

        let mut crc = crc::CRC_INIT;
        let mut addr = address;
        let mut remaining = length;
        let mut buf = [0u8; MAX_CHUNK];
        while remaining > 0 {
            let len = remaining.min(MAX_CHUNK as u32) as usize;
            self.read_memory(addr, &mut buf[..len]).map_err(|e| {
                warn!("failed to read memory at 0x{addr:08x}, target read-protected?");
                e
            })?;
            crc = crc::update(crc, &buf[..len]);
            addr += len as u32;
            remaining -= len as u32;
            trace!("CRC progress: 0x{addr:08x}");
        }
        Ok(crc)
    }

    /// Enable write protection.
    pub fn write_protect(&mut self) -> Result<DeviceReset> {
        self.protection_command(
            CommandKind::WriteProtect,
            protocol::WRITE_PROT_TIMEOUT,
            "WRITE PROTECT",
        )?;
        Ok(DeviceReset::None)
    }

    /// Disable write protection for the whole flash. The device resets
    /// itself after the acknowledgement.
    pub fn write_unprotect(&mut self) -> Result<DeviceReset> {
        self.protection_command(
            CommandKind::WriteUnprotect,
            protocol::WRITE_PROT_TIMEOUT,
            "WRITE UNPROTECT",
        )?;
        Ok(DeviceReset::Auto)
    }

    /// Enable readout protection. The device resets itself after the
    /// acknowledgement.
    pub fn readout_protect(&mut self) -> Result<DeviceReset> {
        self.protection_command(
            CommandKind::ReadProtect,
            protocol::READ_PROT_TIMEOUT,
            "READOUT PROTECT",
        )?;
        Ok(DeviceReset::Auto)
    }

    /// Disable readout protection. The device mass-erases the flash while
    /// doing so, hence the long timeout, and resets itself after the
    /// acknowledgement.
    pub fn readout_unprotect(&mut self) -> Result<DeviceReset> {
        self.protection_command(
            CommandKind::ReadUnprotect,
            protocol::MASS_ERASE_TIMEOUT,
            "READOUT UNPROTECT",
        )?;
        Ok(DeviceReset::Auto)
    }

    fn protection_command(
        &mut self,
        kind: CommandKind,
        timeout: Duration,
        what: &'static str,
    ) -> Result<()> {
        let opcode = self.cmds.opcode(kind).ok_or(Error::NoCommand(kind.name()))?;
        send_command(&mut self.port, opcode)?;
        match ack_with_timeout(&mut self.port, timeout) {
            Ok(()) => Ok(()),
            Err(Error::Nack(_)) => Err(Error::Nack(format!("failed to {what}"))),
            Err(e) => {
                if self.flags.stretch_write && !self.cmds.is_no_stretch(kind) {
                    warn_stretching(what);
                }
                Err(e)
            }
        }
    }

    /// Reset the device by injecting a small code stub into RAM and
    /// jumping to it.
    ///
    /// The stub is chosen by the device's quirks: option-byte reload on
    /// OBL_LAUNCH parts, PEMPTY toggle on parts with the flash empty-check
    /// flag, plain AIRCR reset otherwise.
    pub fn reset_device(&mut self) -> Result<()> {
        let stub = if self.device.flags.obl_launch {
            stubs::OBL_LAUNCH
        } else if self.device.flags.pempty {
            stubs::PEMPTY_LAUNCH
        } else {
            stubs::RESET
        };
        self.run_raw_code(self.device.ram_start, stub)
    }

    /// Stage `code` at `target_address` behind an (SP, entry) header and
    /// jump to it.
    fn run_raw_code(&mut self, target_address: u32, code: &[u8]) -> Result<()> {
        if target_address % 4 != 0 {
            return Err(Error::Protocol(
                "code address must be 4-byte aligned".into(),
            ));
        }

        let mut image = Vec::with_capacity(8 + code.len());
        image.extend_from_slice(&stubs::STAGING_SP.to_le_bytes());
        // Entry address with bit 0 set: execute in Thumb state.
        image.extend_from_slice(&(target_address + 8 + 1).to_le_bytes());
        image.extend_from_slice(code);

        debug!(
            "staging {} bytes of code at 0x{target_address:08x}",
            image.len()
        );
        let mut address = target_address;
        for chunk in image.chunks(MAX_CHUNK) {
            self.write_memory(address, chunk)?;
            address += chunk.len() as u32;
        }

        self.go(target_address)
    }
}

/// Read one acknowledgement byte, waiting out BUSY markers.
///
/// A nonzero `timeout` is honoured only on transports with the retry
/// capability: read timeouts then keep the wait alive until the wall-clock
/// deadline. Everything else fails immediately.
fn ack_with_timeout<P: Port>(port: &mut P, timeout: Duration) -> Result<()> {
    let deadline = (!timeout.is_zero() && port.flags().retry)
        .then(|| Instant::now() + timeout);

    loop {
        let mut byte = [0u8; 1];
        match port.read_exact(&mut byte) {
            Ok(()) => match byte[0] {
                ACK => return Ok(()),
                NACK => {
                    debug!("received NACK");
                    return Err(Error::Nack("device replied NACK".into()));
                }
                BUSY => trace!("device busy, keep waiting"),
                other => {
                    warn!("got byte 0x{other:02x} instead of ACK");
                    return Err(Error::Protocol(format!(
                        "got byte 0x{other:02x} instead of ACK"
                    )));
                }
            },
            Err(e) if e.is_timeout() && deadline.is_some_and(|d| Instant::now() < d) => {}
            Err(e) => {
                warn!("failed to read ACK byte: {e}");
                return Err(Error::Protocol("failed to read ACK byte".into()));
            }
        }
    }
}

fn ack<P: Port>(port: &mut P) -> Result<()> {
    ack_with_timeout(port, Duration::ZERO)
}

/// Send a framed command and consume its acknowledgement.
fn send_command_with_timeout<P: Port>(port: &mut P, cmd: u8, timeout: Duration) -> Result<()> {
    port.write_all(&command_frame(cmd)).map_err(|e| {
        warn!("failed to send command 0x{cmd:02x}: {e}");
        Error::Protocol(format!("failed to send command 0x{cmd:02x}"))
    })?;
    match ack_with_timeout(port, timeout) {
        Ok(()) => Ok(()),
        Err(Error::Nack(_)) => {
            warn!("got NACK from device on command 0x{cmd:02x}");
            Err(Error::Protocol(format!(
                "command 0x{cmd:02x} was not acknowledged"
            )))
        }
        Err(e) => {
            warn!("unexpected reply from device on command 0x{cmd:02x}");
            Err(e)
        }
    }
}

fn send_command<P: Port>(port: &mut P, cmd: u8) -> Result<()> {
    send_command_with_timeout(port, cmd, Duration::ZERO)
}

/// Realign host and device after a framing mixup: keep sending an invalid
/// command until the device NACKs it.
fn resync<P: Port>(port: &mut P) -> Result<()> {
    debug!("resynchronizing");
    let frame = command_frame(protocol::CMD_UNSUPPORTED);
    let deadline = Instant::now() + protocol::RESYNC_TIMEOUT;

    while Instant::now() < deadline {
        if port.write_all(&frame).is_err() {
            thread::sleep(Duration::from_millis(500));
            continue;
        }
        let mut byte = [0u8; 1];
        if matches!(port.read_exact(&mut byte), Ok(())) && byte[0] == NACK {
            return Ok(());
        }
    }
    Err(Error::Protocol("resynchronization failed".into()))
}

/// Send `cmd` and collect its variable-length reply.
///
/// On return `buf[0]` holds the length byte L and `buf[1..=L+1]` the
/// payload. Byte-oriented links read the length prefix first; frame
/// links read `guess + 2` bytes in one go and recover through
/// [`resync`] when the guess was wrong (the extra trailing byte on frame
/// links is the ACK, which arrives inside the frame there).
fn read_sized_reply<P: Port>(
    port: &mut P,
    cmd: u8,
    guess: u8,
    buf: &mut [u8; MAX_REPLY],
) -> Result<()> {
    send_command(port, cmd)?;

    if port.flags().byte_oriented {
        port.read_exact(&mut buf[..1])?;
        let len = buf[0] as usize;
        port.read_exact(&mut buf[1..len + 2])?;
        return Ok(());
    }

    let guess = guess as usize;
    match port.read_exact(&mut buf[..guess + 2]) {
        Ok(()) if buf[0] as usize == guess => return Ok(()),
        Ok(()) => {}
        Err(_) => {
            // The frame was a different size than guessed; realign and
            // fetch just the length byte.
            resync(port)?;
            send_command(port, cmd)?;
            port.read_exact(&mut buf[..1])?;
        }
    }

    warn!("re-sync (len = {})", buf[0]);
    resync(port)?;

    let len = buf[0] as usize;
    send_command(port, cmd)?;
    port.read_exact(&mut buf[..len + 2])?;
    Ok(())
}

/// Send the autobaud init byte and sort out the three possible outcomes.
fn init_link<P: Port>(port: &mut P) -> Result<()> {
    port.write_all(&[INIT])?;

    let mut byte = [0u8; 1];
    match port.read_exact(&mut byte) {
        Ok(()) if byte[0] == ACK => return Ok(()),
        Ok(()) if byte[0] == NACK => {
            // Likely a leftover session; the commands will tell.
            warn!("the interface was not closed properly, continuing anyway");
            return Ok(());
        }
        Ok(()) => return Err(Error::Protocol("failed to init device".into())),
        Err(e) if e.is_timeout() => {}
        Err(e) => return Err(e),
    }

    // No reply at all: a previous init byte may have been swallowed as the
    // first byte of a command. A second one must then be NACKed.
    debug!("no reply to the init byte, probing with a second one");
    port.write_all(&[INIT])?;
    match port.read_exact(&mut byte) {
        Ok(()) if byte[0] == NACK => Ok(()),
        _ => Err(Error::Protocol("failed to init device".into())),
    }
}

fn warn_stretching(what: &str) {
    warn!(
        "this {what} error can be caused by an I2C controller that does not \
         accept clock stretching, which the bootloader requires"
    );
}

fn hex_list(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("0x{b:02x}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::ControlLine;
    use std::collections::VecDeque;

    /// A transport replaying a scripted byte stream and recording writes.
    #[derive(Debug)]
    struct ScriptPort {
        flags: PortFlags,
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        /// Read-call indices that time out instead of delivering bytes.
        timeout_reads: VecDeque<usize>,
        reads: usize,
    }

    impl ScriptPort {
        fn uart(rx: &[u8]) -> Self {
            Self {
                flags: PortFlags {
                    byte_oriented: true,
                    gvr_etx: true,
                    cmd_init: true,
                    retry: true,
                    stretch_write: false,
                },
                rx: rx.iter().copied().collect(),
                tx: Vec::new(),
                timeout_reads: VecDeque::new(),
                reads: 0,
            }
        }

        fn framed(rx: &[u8]) -> Self {
            Self {
                flags: PortFlags::default(),
                rx: rx.iter().copied().collect(),
                tx: Vec::new(),
                timeout_reads: VecDeque::new(),
                reads: 0,
            }
        }

        fn timeout_at(mut self, read_index: usize) -> Self {
            self.timeout_reads.push_back(read_index);
            self
        }
    }

    impl Port for ScriptPort {
        fn flags(&self) -> PortFlags {
            self.flags
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            let index = self.reads;
            self.reads += 1;
            if self.timeout_reads.front() == Some(&index) {
                self.timeout_reads.pop_front();
                return Err(Error::Timeout("scripted timeout".into()));
            }
            for slot in buf.iter_mut() {
                *slot = self
                    .rx
                    .pop_front()
                    .ok_or_else(|| Error::Timeout("script exhausted".into()))?;
            }
            Ok(())
        }

        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.tx.extend_from_slice(buf);
            Ok(())
        }

        fn flush_input(&mut self) -> Result<()> {
            Ok(())
        }

        fn set_control(&mut self, _line: ControlLine, _level: bool) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "script"
        }

        fn config_str(&self) -> String {
            "scripted port".into()
        }
    }

    /// Establishment byte script for a UART-style port: init ACK, GVR,
    /// GET reporting `opcodes`, GID reporting `pid`, then `extra`.
    fn uart_script(opcodes: &[u8], pid: [u8; 2], extra: &[u8]) -> Vec<u8> {
        let mut rx = vec![ACK]; // init
        rx.extend_from_slice(&[ACK, 0x22, 0x00, 0x00, ACK]); // GVR
        rx.push(ACK); // GET command ack
        rx.push(opcodes.len() as u8); // length byte
        rx.push(0x22); // bootloader version
        rx.extend_from_slice(opcodes);
        rx.push(ACK);
        rx.push(ACK); // GID command ack
        rx.push(0x01);
        rx.extend_from_slice(&pid);
        rx.push(ACK);
        rx.extend_from_slice(extra);
        rx
    }

    const BASIC_CMDS: &[u8] = &[
        0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92,
    ];

    fn uart_session(opcodes: &[u8], pid: [u8; 2], extra: &[u8]) -> Session<ScriptPort> {
        Session::establish(ScriptPort::uart(&uart_script(opcodes, pid, extra)), true).unwrap()
    }

    /// Wire traffic of the establishment phase alone.
    const ESTABLISH_TX: &[u8] = &[INIT, 0x01, 0xFE, 0x00, 0xFF, 0x02, 0xFD];

    #[test]
    fn establish_negotiates_session() {
        let session = uart_session(BASIC_CMDS, [0x04, 0x10], &[]);

        assert_eq!(session.bl_version(), 0x22);
        assert_eq!(session.version(), 0x22);
        assert_eq!(session.option_bytes(), Some((0x00, 0x00)));
        assert_eq!(session.product_id(), 0x410);
        assert_eq!(session.device().name, "STM32F10xxx Medium-density");
        assert_eq!(
            session.commands().opcode(CommandKind::WriteMemory),
            Some(0x31)
        );
        assert_eq!(
            session.commands().opcode(CommandKind::EraseMemory),
            Some(0x43)
        );
        assert!(!session.supports(CommandKind::Crc));

        assert_eq!(session.port().tx, ESTABLISH_TX);
    }

    #[test]
    fn establish_fails_on_unknown_pid() {
        let script = uart_script(BASIC_CMDS, [0x0F, 0xFF], &[]);
        let err = Session::establish(ScriptPort::uart(&script), true).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(0xFFF)));
    }

    #[test]
    fn establish_requires_mandatory_commands() {
        // GET reply without GID among the opcodes.
        let script = uart_script(&[0x00, 0x01, 0x11, 0x21], [0x04, 0x10], &[]);
        let err = Session::establish(ScriptPort::uart(&script), true).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn establish_survives_stale_link_nack() {
        // A NACK to the init byte means a half-open previous session; the
        // handshake continues regardless.
        let mut script = uart_script(BASIC_CMDS, [0x04, 0x10], &[]);
        script[0] = NACK;
        let session = Session::establish(ScriptPort::uart(&script), true).unwrap();
        assert_eq!(session.product_id(), 0x410);
    }

    #[test]
    fn establish_recovers_init_timeout_with_second_byte() {
        // No reply to the first init byte; a second one goes out and its
        // NACK counts as success.
        let mut rx = uart_script(BASIC_CMDS, [0x04, 0x10], &[]);
        rx[0] = NACK; // answers the probe byte, not the first init
        let port = ScriptPort::uart(&rx).timeout_at(0);
        let session = Session::establish(port, true).unwrap();
        assert_eq!(session.product_id(), 0x410);
        assert_eq!(&session.port().tx[..2], &[INIT, INIT]);
    }

    #[test]
    fn dual_opcodes_latch_to_no_stretch_variant() {
        let session = uart_session(
            &[0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x32, 0x43, 0x44],
            [0x04, 0x10],
            &[],
        );
        assert_eq!(
            session.commands().opcode(CommandKind::WriteMemory),
            Some(0x32)
        );
        assert_eq!(
            session.commands().opcode(CommandKind::EraseMemory),
            Some(0x44)
        );
    }

    #[test]
    fn read_memory_frames() {
        let mut session = uart_session(
            BASIC_CMDS,
            [0x04, 0x10],
            &[ACK, ACK, ACK, 0xCA, 0xFE, 0xBA, 0xBE],
        );
        let mut data = [0u8; 4];
        session.read_memory(0x0800_0000, &mut data).unwrap();
        assert_eq!(data, [0xCA, 0xFE, 0xBA, 0xBE]);

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(
            tx,
            &[
                0x11, 0xEE, // READ command
                0x08, 0x00, 0x00, 0x00, 0x08, // address + checksum
                0x03, 0xFC, // byte count, framed
            ]
        );
    }

    #[test]
    fn read_memory_rejects_oversize() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[]);
        let mut data = [0u8; 257];
        assert!(session.read_memory(0x0800_0000, &mut data).is_err());
        // Nothing reached the wire.
        assert_eq!(session.port().tx.len(), ESTABLISH_TX.len());
    }

    #[test]
    fn write_memory_frames() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[ACK, ACK, ACK]);
        session
            .write_memory(0x0800_0000, &[0xDE, 0xAD, 0xBE, 0xEF])
            .unwrap();

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(
            tx,
            &[
                0x31, 0xCE, // WRITE command
                0x08, 0x00, 0x00, 0x00, 0x08, // address + checksum
                0x03, 0xDE, 0xAD, 0xBE, 0xEF, 0x21, // payload frame
            ]
        );
    }

    #[test]
    fn write_memory_rejects_unaligned_address_before_wire() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[]);
        let err = session
            .write_memory(0x0800_0001, &[0x01, 0x02, 0x03, 0x04])
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(session.port().tx.len(), ESTABLISH_TX.len());
    }

    #[test]
    fn write_memory_pads_unaligned_length() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[ACK, ACK, ACK]);
        session.write_memory(0x0800_0000, &[0x01, 0x02, 0x03]).unwrap();

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(&tx[7..], &[0x03, 0x01, 0x02, 0x03, 0xFF, 0xFC]);
    }

    #[test]
    fn legacy_mass_erase() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[ACK, ACK]);
        session.erase_all().unwrap();

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(tx, &[0x43, 0xBC, 0xFF, 0x00]);
    }

    #[test]
    fn extended_mass_erase() {
        let opcodes = &[0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92];
        let mut session = uart_session(opcodes, [0x04, 0x10], &[ACK, ACK]);
        session.erase_all().unwrap();

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(tx, &[0x44, 0xBB, 0xFF, 0xFF, 0x00]);
    }

    #[test]
    fn mass_erase_degrades_without_the_opcode() {
        // STM32L1 (PID 0x416): no mass erase, 256-byte pages, 128 KiB
        // flash, so a full erase is exactly one 512-page range command.
        let opcodes = &[0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92];
        let mut session = uart_session(opcodes, [0x04, 0x16], &[ACK, ACK]);
        session.erase_all().unwrap();

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(&tx[..2], &[0x44, 0xBB]);
        let payload = &tx[2..];
        // (pages - 1) as two bytes MSB first, then 512 two-byte indices
        // and the checksum. No mass-erase magic anywhere.
        assert_eq!(payload.len(), 2 + 2 * 512 + 1);
        assert_eq!(&payload[..2], &[0x01, 0xFF]);
        assert_eq!(&payload[2..6], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&payload[payload.len() - 3..payload.len() - 1], &[0x01, 0xFF]);
        let checksum = payload[..payload.len() - 1].iter().fold(0, |cs, b| cs ^ b);
        assert_eq!(payload[payload.len() - 1], checksum);
    }

    #[test]
    fn page_range_erase_legacy() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[ACK, ACK]);
        session.erase_memory(2, 2).unwrap();

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(tx, &[0x43, 0xBC, 0x01, 0x02, 0x03, 0x00]);
    }

    #[test]
    fn erase_out_of_range_is_a_no_op() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[]);
        session.erase_memory(0, 0).unwrap();
        session.erase_memory(0x1_0000, 4).unwrap();
        session.erase_memory(0xFFF0, 0x100).unwrap();
        assert_eq!(session.port().tx.len(), ESTABLISH_TX.len());
    }

    #[test]
    fn go_frames_address() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[ACK, ACK]);
        session.go(0x0800_0000).unwrap();

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(tx, &[0x21, 0xDE, 0x08, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn device_crc_uses_double_ack_and_checks_reply() {
        let opcodes = &[0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0xA1];
        let reply = [ACK, ACK, ACK, ACK, 0xC7, 0x04, 0xDD, 0x7B, 0xC7 ^ 0x04 ^ 0xDD ^ 0x7B];
        let mut session = uart_session(opcodes, [0x04, 0x10], &reply);
        let crc = session.compute_crc(0x0800_0000, 4).unwrap();
        assert_eq!(crc, 0xC704_DD7B);

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(
            tx,
            &[
                0xA1, 0x5E, // CRC command
                0x08, 0x00, 0x00, 0x00, 0x08, // address
                0x00, 0x00, 0x00, 0x04, 0x04, // length
            ]
        );
    }

    #[test]
    fn device_crc_rejects_corrupt_reply() {
        let opcodes = &[0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0xA1];
        let reply = [ACK, ACK, ACK, ACK, 0xC7, 0x04, 0xDD, 0x7B, 0x00];
        let mut session = uart_session(opcodes, [0x04, 0x10], &reply);
        let err = session.compute_crc(0x0800_0000, 4).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn crc_falls_back_to_host_computation() {
        // No CRC opcode in the GET reply; the driver reads the memory and
        // folds it locally. One zero word must come out as the well-known
        // CRC-32/MPEG-2 value.
        let reply = [ACK, ACK, ACK, 0x00, 0x00, 0x00, 0x00];
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &reply);
        let crc = session.compute_crc(0x0800_0000, 4).unwrap();
        assert_eq!(crc, 0xC704_DD7B);

        // The READ command went out, not the CRC command.
        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(tx[0], 0x11);
    }

    #[test]
    fn crc_requires_alignment() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[]);
        assert!(session.compute_crc(0x0800_0002, 4).is_err());
        assert!(session.compute_crc(0x0800_0000, 6).is_err());
        assert_eq!(session.port().tx.len(), ESTABLISH_TX.len());
    }

    #[test]
    fn unprotect_reports_auto_reset() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[ACK, ACK]);
        assert_eq!(session.write_unprotect().unwrap(), DeviceReset::Auto);

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        assert_eq!(tx, &[0x73, 0x8C]);
    }

    #[test]
    fn protect_nack_is_user_visible() {
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &[ACK, NACK]);
        let err = session.readout_protect().unwrap_err();
        assert!(matches!(err, Error::Nack(_)));
    }

    #[test]
    fn missing_command_is_reported_as_such() {
        // GET reply without the protection opcodes.
        let opcodes = &[0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43];
        let mut session = uart_session(opcodes, [0x04, 0x10], &[]);
        assert!(matches!(
            session.write_unprotect(),
            Err(Error::NoCommand(_))
        ));
        assert_eq!(session.port().tx.len(), ESTABLISH_TX.len());
    }

    #[test]
    fn reset_device_stages_stub_and_jumps() {
        // Plain AIRCR reset on an F1: 8-byte header + 16-byte stub written
        // in one chunk at ram_start, then GO.
        let reply = [ACK, ACK, ACK, ACK, ACK];
        let mut session = uart_session(BASIC_CMDS, [0x04, 0x10], &reply);
        session.reset_device().unwrap();

        let ram_start = session.device().ram_start;
        assert_eq!(ram_start, 0x2000_0200);

        let tx = &session.port().tx[ESTABLISH_TX.len()..];
        // WRITE command, address, then the 24-byte image.
        assert_eq!(&tx[..2], &[0x31, 0xCE]);
        assert_eq!(&tx[2..7], &[0x20, 0x00, 0x02, 0x00, 0x22]);
        assert_eq!(tx[7], 23); // image length - 1
        assert_eq!(&tx[8..12], &stubs::STAGING_SP.to_le_bytes());
        assert_eq!(&tx[12..16], &(ram_start + 8 + 1).to_le_bytes());
        assert_eq!(&tx[16..32], stubs::RESET);
        // GO to the staging address.
        let go = &tx[33..];
        assert_eq!(go, &[0x21, 0xDE, 0x20, 0x00, 0x02, 0x00, 0x22]);
    }

    #[test]
    fn sized_reply_resyncs_on_wrong_guess() {
        // Frame-oriented port, guessed length 7, actual length 5. The
        // driver must resync with the invalid command, re-issue the
        // original one and re-read with the discovered length. No data
        // reads happen inside the resync loop, only the one-byte NACK.
        let rx = [
            ACK, // command ack
            0x05, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, // wrong-size read
            NACK, // resync
            ACK,  // re-sent command ack
            0x05, 0x31, 0x00, 0x01, 0x02, 0x11, ACK, // final read, ACK in-frame
        ];
        let mut port = ScriptPort::framed(&rx);
        let mut buf = [0u8; MAX_REPLY];
        read_sized_reply(&mut port, 0x00, 7, &mut buf).unwrap();

        assert_eq!(buf[0], 0x05);
        assert_eq!(&buf[1..7], &[0x31, 0x00, 0x01, 0x02, 0x11, ACK]);
        assert_eq!(
            port.tx,
            &[
                0x00, 0xFF, // original command
                0xFF, 0x00, // resync probe
                0x00, 0xFF, // command again
            ]
        );
    }

    #[test]
    fn sized_reply_recovers_from_short_frame() {
        // The read itself fails (frame shorter than the guess): resync,
        // fetch the length byte alone, resync again, then the full frame.
        let rx = [
            ACK, // command ack
            NACK, // first resync
            ACK,  // command ack
            0x03, // length byte
            NACK, // second resync
            ACK,  // command ack
            0x03, 0x31, 0x00, 0x01, ACK, // final read
        ];
        // Read call 1 is the guessed 9-byte frame read; it times out.
        let mut port = ScriptPort::framed(&rx).timeout_at(1);
        let mut buf = [0u8; MAX_REPLY];
        read_sized_reply(&mut port, 0x02, 7, &mut buf).unwrap();
        assert_eq!(buf[0], 0x03);
        assert_eq!(
            port.tx,
            &[
                0x02, 0xFD, // command
                0xFF, 0x00, // resync
                0x02, 0xFD, // command
                0xFF, 0x00, // resync
                0x02, 0xFD, // command
            ]
        );
    }

    #[test]
    fn busy_bytes_extend_the_ack_wait() {
        let mut port = ScriptPort::uart(&[BUSY, BUSY, ACK]);
        assert!(ack(&mut port).is_ok());

        let mut port = ScriptPort::uart(&[BUSY, NACK]);
        assert!(matches!(ack(&mut port), Err(Error::Nack(_))));
    }

    #[test]
    fn unexpected_ack_byte_is_a_protocol_error() {
        let mut port = ScriptPort::uart(&[0x42]);
        assert!(matches!(ack(&mut port), Err(Error::Protocol(_))));
    }
}
