//! stmflash CLI - flash STM32 devices through their ROM bootloader.
//!
//! ## Features
//!
//! - Identify a connected device and print its memory map
//! - Read and write raw binary images, with optional verification
//! - Erase flash by page range or whole device
//! - CRC-check flash content (in the device where supported)
//! - Toggle write/readout protection
//! - Jump to application code or reset the device when done

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use stmflash::{
    list_ports, ControlLine, DeviceReset, Port, SerialConfig, SerialMode, Session, UartPort,
    MASS_ERASE, MAX_CHUNK,
};

/// stmflash - talk to the STM32 ROM bootloader over a serial port.
///
/// The device must be booted into the system bootloader (BOOT0 high, or
/// use --enter if the board wires DTR/RTS to BOOT0/NRST).
#[derive(Parser)]
#[command(name = "stmflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (e.g. /dev/ttyUSB0, COM3).
    #[arg(short, long, global = true, env = "STMFLASH_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(
        short,
        long,
        global = true,
        default_value_t = 115_200,
        env = "STMFLASH_BAUD"
    )]
    baud: u32,

    /// Serial mode: data bits, parity, stop bits.
    #[arg(short, long, global = true, default_value = "8e1")]
    mode: String,

    /// Resume the connection: skip the autobaud init byte. The baud rate
    /// must be the one used at the first init.
    #[arg(short = 'c', long, global = true)]
    no_init: bool,

    /// Pulse DTR/RTS before connecting, for boards that wire them to
    /// BOOT0/NRST.
    #[arg(long, global = true)]
    enter: bool,

    /// Start execution at the given address when done; a bare -g means
    /// the flash start.
    #[arg(
        short = 'g',
        long = "go",
        global = true,
        value_name = "ADDR",
        value_parser = parse_num,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "0"
    )]
    execute: Option<u32>,

    /// Reset the device when done.
    #[arg(short = 'R', long, global = true)]
    reset: bool,

    /// Verbose output (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Identify the connected device and print its memory map.
    Info,

    /// Read device memory into a raw binary file.
    Read {
        /// Output file.
        file: PathBuf,

        /// Address span `ADDR[:LENGTH]` to read (default: whole flash).
        #[arg(short = 'S', long, value_name = "ADDR[:LEN]")]
        span: Option<AddressSpan>,
    },

    /// Write a raw binary file into device memory.
    Write {
        /// Input file.
        file: PathBuf,

        /// Address span `ADDR[:LENGTH]` to write (default: flash start).
        #[arg(short = 'S', long, value_name = "ADDR[:LEN]")]
        span: Option<AddressSpan>,

        /// Read each chunk back and compare.
        #[arg(long)]
        verify: bool,

        /// Skip the erase before writing.
        #[arg(long)]
        no_erase: bool,

        /// Retry failed verifications up to this many times.
        #[arg(short = 'n', long, default_value_t = 10)]
        retry: u32,
    },

    /// Erase flash memory.
    Erase {
        /// Address span `ADDR[:LENGTH]` to erase (default: whole device).
        #[arg(short = 'S', long, value_name = "ADDR[:LEN]")]
        span: Option<AddressSpan>,

        /// First page to erase.
        #[arg(short = 's', long, default_value_t = 0)]
        start_page: u32,

        /// Number of pages to erase.
        #[arg(short = 'e', long)]
        pages: Option<u32>,
    },

    /// CRC-check a span of memory (default: whole flash).
    Crc {
        /// Address span `ADDR[:LENGTH]` to check.
        #[arg(short = 'S', long, value_name = "ADDR[:LEN]")]
        span: Option<AddressSpan>,
    },

    /// Jump to application code.
    Go {
        /// Target address (default: flash start).
        #[arg(value_parser = parse_num)]
        address: Option<u32>,
    },

    /// Enable flash write protection.
    WriteProtect,

    /// Disable flash write protection.
    WriteUnprotect,

    /// Enable flash readout protection.
    ReadProtect,

    /// Disable flash readout protection. The device mass-erases the
    /// flash while doing so.
    ReadUnprotect,

    /// List available serial ports.
    ListPorts,
}

/// `ADDR[:LENGTH]` command-line argument.
#[derive(Debug, Clone, Copy)]
struct AddressSpan {
    start: u32,
    length: Option<u32>,
}

impl FromStr for AddressSpan {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, len) = match s.split_once(':') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };
        let start = parse_num(addr)?;
        let length = len.map(parse_num).transpose()?;
        if length == Some(0) {
            return Err("length must not be zero".into());
        }
        Ok(Self { start, length })
    }
}

fn parse_num(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .format_timestamp(None)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("{} {e:#}", style("error:").red().bold());
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if matches!(cli.command, Commands::ListPorts) {
        return cmd_list_ports();
    }

    let mut session = connect(cli)?;
    // Protection commands make the device reset itself; track that so the
    // -R / -g epilogue does not pile a second reset on top.
    let mut auto_reset = DeviceReset::None;

    match &cli.command {
        Commands::Info => cmd_info(cli, &session),
        Commands::Read { file, span } => cmd_read(&mut session, file, span.as_ref()),
        Commands::Write {
            file,
            span,
            verify,
            no_erase,
            retry,
        } => cmd_write(&mut session, file, span.as_ref(), *verify, *no_erase, *retry),
        Commands::Erase {
            span,
            start_page,
            pages,
        } => cmd_erase(&mut session, span.as_ref(), *start_page, *pages),
        Commands::Crc { span } => cmd_crc(&mut session, span.as_ref()),
        Commands::Go { address } => {
            let target = address.unwrap_or(session.device().fl_start);
            eprintln!("Starting execution at 0x{target:08x}...");
            session.go(target)?;
            // GO hands the chip to the application; nothing more to do.
            return Ok(());
        }
        Commands::WriteProtect => {
            eprintln!("Write-protecting flash");
            auto_reset = session.write_protect().context("failed to write-protect")?;
            eprintln!("Done.");
            Ok(())
        }
        Commands::WriteUnprotect => {
            eprintln!("Write-unprotecting flash");
            auto_reset = session
                .write_unprotect()
                .context("failed to write-unprotect")?;
            eprintln!("Done.");
            Ok(())
        }
        Commands::ReadProtect => {
            eprintln!("Read-protecting flash");
            auto_reset = session.readout_protect().context("failed to read-protect")?;
            eprintln!("Done.");
            Ok(())
        }
        Commands::ReadUnprotect => {
            eprintln!("Read-unprotecting flash (this mass-erases the device)");
            auto_reset = session
                .readout_unprotect()
                .context("failed to read-unprotect")?;
            eprintln!("Done.");
            Ok(())
        }
        Commands::ListPorts => unreachable!("handled above"),
    }?;

    finish(cli, session, auto_reset)
}

/// Open the serial port, optionally pulse the boot-entry lines, and
/// establish the bootloader session.
fn connect(cli: &Cli) -> Result<Session<UartPort>> {
    let Some(name) = cli.port.as_deref() else {
        bail!("no serial port given; use --port or STMFLASH_PORT (see list-ports)");
    };
    let mode: SerialMode = cli
        .mode
        .parse()
        .with_context(|| format!("invalid serial mode {:?}", cli.mode))?;
    let config = SerialConfig::new(name, cli.baud).with_mode(mode);

    let mut port =
        UartPort::open(&config).with_context(|| format!("failed to open port {name}"))?;
    debug!("interface: {}", port.config_str());

    if cli.enter {
        enter_bootloader(&mut port)?;
    }
    port.flush_input()?;

    Session::establish(port, !cli.no_init).context("bootloader handshake failed")
}

/// Pulse DTR/RTS for boards that wire them to BOOT0 and NRST.
fn enter_bootloader(port: &mut UartPort) -> Result<()> {
    debug!("pulsing DTR/RTS to enter the bootloader");
    port.set_control(ControlLine::Dtr, true)?;
    port.set_control(ControlLine::Rts, true)?;
    thread::sleep(Duration::from_millis(100));
    port.set_control(ControlLine::Dtr, false)?;
    port.set_control(ControlLine::Rts, false)?;
    thread::sleep(Duration::from_millis(100));
    Ok(())
}

/// Run the `-g` / `-R` epilogue, honouring a reset the device already
/// performed on its own.
fn finish(cli: &Cli, mut session: Session<UartPort>, auto_reset: DeviceReset) -> Result<()> {
    if auto_reset == DeviceReset::Auto {
        debug!("device reset itself, skipping exit actions");
        return Ok(());
    }

    if let Some(address) = cli.execute {
        let target = if address == 0 {
            session.device().fl_start
        } else {
            address
        };
        eprintln!("Starting execution at 0x{target:08x}...");
        session.go(target).context("failed to start execution")?;
        return Ok(());
    }

    if cli.reset {
        eprintln!("Resetting device...");
        session.reset_device().context("reset failed")?;
    }
    Ok(())
}

fn cmd_list_ports() -> Result<()> {
    let ports = list_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        eprintln!("No serial ports found.");
        return Ok(());
    }
    for info in ports {
        match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  [{vid:04x}:{pid:04x}] {}",
                info.name,
                info.product.as_deref().unwrap_or("")
            ),
            _ => println!("{}", info.name),
        }
    }
    Ok(())
}

fn cmd_info(cli: &Cli, session: &Session<UartPort>) -> Result<()> {
    let dev = session.device();

    println!("Interface    : serial, {} {}", cli.baud, cli.mode);
    println!("Version      : 0x{:02x}", session.bl_version());
    if let Some((option1, option2)) = session.option_bytes() {
        println!("Option 1     : 0x{option1:02x}");
        println!("Option 2     : 0x{option2:02x}");
    }
    println!(
        "Device ID    : 0x{:04x} ({})",
        session.product_id(),
        dev.name
    );
    println!(
        "- RAM        : up to {}KiB ({}b reserved by bootloader)",
        (dev.ram_end - 0x2000_0000) / 1024,
        dev.ram_start - 0x2000_0000
    );
    println!(
        "- Flash      : up to {}KiB (size first sector: {}x{})",
        dev.flash_size() / 1024,
        dev.fl_pps,
        dev.page_sizes[0]
    );
    println!("- Option RAM : {}b", dev.opt_end - dev.opt_start + 1);
    println!(
        "- System RAM : {}KiB",
        (dev.mem_end - dev.mem_start) / 1024
    );
    Ok(())
}

fn cmd_read(
    session: &mut Session<UartPort>,
    file: &Path,
    span: Option<&AddressSpan>,
) -> Result<()> {
    let plan = resolve_span(session, span, 0, None)?;

    let total = (plan.end - plan.start) as u64;
    let bar = progress_bar(total, "reading");

    let mut out = Vec::with_capacity(total as usize);
    let mut addr = plan.start;
    let mut buf = [0u8; MAX_CHUNK];
    while addr < plan.end {
        let len = ((plan.end - addr) as usize).min(MAX_CHUNK);
        session
            .read_memory(addr, &mut buf[..len])
            .with_context(|| {
                format!("failed to read memory at 0x{addr:08x}, target read-protected?")
            })?;
        out.extend_from_slice(&buf[..len]);
        addr += len as u32;
        bar.set_position(u64::from(addr - plan.start));
    }
    bar.finish_and_clear();

    fs::write(file, &out).with_context(|| format!("failed to write {}", file.display()))?;
    eprintln!(
        "{} Read {} bytes from 0x{:08x} into {}",
        style("✓").green(),
        out.len(),
        plan.start,
        file.display()
    );
    Ok(())
}

fn cmd_write(
    session: &mut Session<UartPort>,
    file: &Path,
    span: Option<&AddressSpan>,
    verify: bool,
    no_erase: bool,
    retry: u32,
) -> Result<()> {
    let data = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    if data.is_empty() {
        bail!("{} is empty", file.display());
    }

    let plan = resolve_span(session, span, 0, None)?;
    if data.len() as u64 > u64::from(plan.end - plan.start) {
        bail!(
            "image is {} bytes but only {} fit below 0x{:08x}",
            data.len(),
            plan.end - plan.start,
            plan.end
        );
    }
    let end = plan.end;

    if plan.erase && !no_erase && plan.num_pages > 0 {
        eprintln!("Erasing memory");
        session
            .erase_memory(plan.first_page, plan.num_pages)
            .context("failed to erase memory")?;
    }

    let bar = progress_bar(u64::from(end - plan.start), if verify {
        "writing+verifying"
    } else {
        "writing"
    });

    let mut addr = plan.start;
    let mut offset = 0usize;
    let mut compare = [0u8; MAX_CHUNK];
    while addr < end && offset < data.len() {
        let len = ((end - addr) as usize)
            .min(MAX_CHUNK)
            .min(data.len() - offset);
        let chunk = &data[offset..offset + len];

        let mut failed = 0;
        loop {
            session
                .write_memory(addr, chunk)
                .with_context(|| format!("failed to write memory at 0x{addr:08x}"))?;

            if !verify {
                break;
            }
            session
                .read_memory(addr, &mut compare[..len])
                .with_context(|| format!("failed to read back memory at 0x{addr:08x}"))?;
            match chunk.iter().zip(&compare[..len]).position(|(a, b)| a != b) {
                None => break,
                Some(bad) if failed < retry => {
                    failed += 1;
                    debug!(
                        "verify mismatch at 0x{:08x} (attempt {failed}/{retry})",
                        addr + bad as u32
                    );
                }
                Some(bad) => bail!(
                    "failed to verify at 0x{:08x}: expected 0x{:02x}, found 0x{:02x}",
                    addr + bad as u32,
                    chunk[bad],
                    compare[bad]
                ),
            }
        }

        addr += len as u32;
        offset += len;
        bar.set_position(u64::from(addr - plan.start));
    }
    bar.finish_and_clear();

    eprintln!(
        "{} Wrote {}{} bytes at 0x{:08x}",
        style("✓").green(),
        if verify { "and verified " } else { "" },
        offset,
        plan.start
    );
    Ok(())
}

fn cmd_erase(
    session: &mut Session<UartPort>,
    span: Option<&AddressSpan>,
    start_page: u32,
    pages: Option<u32>,
) -> Result<()> {
    if span.is_some() && (start_page != 0 || pages.is_some()) {
        bail!("--span and --start-page/--pages are mutually exclusive");
    }
    let plan = resolve_span(session, span, start_page, pages)?;
    let dev = session.device();

    if plan.num_pages != MASS_ERASE
        && (plan.start != dev.page_to_addr(plan.first_page)
            || plan.end != dev.page_to_addr(plan.first_page + plan.num_pages))
    {
        bail!("erase start and length must be page aligned");
    }

    eprintln!("Erasing flash");
    session
        .erase_memory(plan.first_page, plan.num_pages)
        .context("failed to erase memory")?;
    eprintln!("{} Done.", style("✓").green());
    Ok(())
}

fn cmd_crc(session: &mut Session<UartPort>, span: Option<&AddressSpan>) -> Result<()> {
    let plan = resolve_span(session, span, 0, None)?;
    let crc = session
        .compute_crc(plan.start, plan.end - plan.start)
        .context("failed to compute CRC")?;
    println!(
        "CRC(0x{:08x}-0x{:08x}) = 0x{crc:08x}",
        plan.start, plan.end
    );
    Ok(())
}

/// A resolved address range plus its page span.
struct Plan {
    start: u32,
    end: u32,
    first_page: u32,
    /// Page count, or [`MASS_ERASE`] for the whole device.
    num_pages: u32,
    /// Whether an erase makes sense for this range (flash only).
    erase: bool,
}

/// Turn a user-specified span (or page range) into concrete addresses and
/// pages against the device's memory map.
fn resolve_span(
    session: &Session<UartPort>,
    span: Option<&AddressSpan>,
    start_page: u32,
    pages: Option<u32>,
) -> Result<Plan> {
    let dev = session.device();

    if let Some(span) = span {
        let start = span.start;
        let mut erase = true;
        let mut end = if dev.in_flash(start) {
            dev.fl_end
        } else {
            erase = false;
            if dev.in_ram(start) {
                dev.ram_end
            } else if dev.in_option_bytes(start) {
                dev.opt_end + 1
            } else if dev.in_sysmem(start) {
                dev.mem_end
            } else {
                // Unknown territory; take the caller at their word.
                start
                    .checked_add(span.length.unwrap_or(4))
                    .context("span overflows the address space")?
            }
        };
        if let Some(length) = span.length {
            end = end.min(
                start
                    .checked_add(length)
                    .context("span overflows the address space")?,
            );
        }

        let first_page = dev.page_floor(start);
        let num_pages = if first_page == 0 && end == dev.fl_end {
            MASS_ERASE
        } else {
            dev.page_ceil(end) - first_page
        };
        return Ok(Plan {
            start,
            end,
            first_page,
            num_pages,
            erase,
        });
    }

    if start_page == 0 && pages.is_none() {
        // No range given: the whole flash.
        return Ok(Plan {
            start: dev.fl_start,
            end: dev.fl_end,
            first_page: 0,
            num_pages: MASS_ERASE,
            erase: true,
        });
    }

    let first_page = start_page;
    let start = dev.page_to_addr(first_page);
    if start > dev.fl_end {
        bail!("address range exceeds flash size");
    }
    let (end, mut num_pages) = match pages {
        Some(n) => (dev.page_to_addr(first_page + n).min(dev.fl_end), n),
        None => (dev.fl_end, dev.page_ceil(dev.fl_end) - first_page),
    };
    if first_page == 0 && end == dev.fl_end {
        num_pages = MASS_ERASE;
    }
    Ok(Plan {
        start,
        end,
        first_page,
        num_pages,
        erase: true,
    })
}

fn progress_bar(total: u64, message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(template) = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
    {
        bar.set_style(template.progress_chars("#>-"));
    }
    bar.set_message(message);
    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    bar
}
