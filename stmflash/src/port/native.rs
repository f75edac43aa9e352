//! Native serial port implementation using the `serialport` crate.
//!
//! This is the UART transport: byte-oriented, autobaud init required,
//! three-byte GVR reply, reads retried against a wall clock. Clock
//! stretching does not exist on UART, so the stretch flag stays clear.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::trace;
use serialport::ClearBuffer;

use crate::error::{Error, Result};
use crate::port::{ControlLine, Parity, Port, PortFlags, PortInfo, SerialConfig};

/// Serial transport for the UART bootloader.
pub struct UartPort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timeout: Duration,
    config_summary: String,
}

impl UartPort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let data_bits = match config.mode.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let parity = match config.mode.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let stop_bits = match config.mode.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        };

        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Self {
            port,
            name: config.port_name.clone(),
            timeout: config.timeout,
            config_summary: format!(
                "serial {}: {} {}",
                config.port_name, config.baud_rate, config.mode
            ),
        })
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }
}

impl Port for UartPort {
    fn flags(&self) -> PortFlags {
        PortFlags {
            byte_oriented: true,
            gvr_etx: true,
            cmd_init: true,
            retry: true,
            stretch_write: false,
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        // One overall deadline for the whole buffer; short reads from the
        // OS are accumulated until it expires.
        let deadline = Instant::now() + self.timeout;
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {}
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "read of {} bytes stalled at {filled}",
                    buf.len()
                )));
            }
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_control(&mut self, line: ControlLine, level: bool) -> Result<()> {
        trace!("set {line:?} to {level}");
        match line {
            ControlLine::Rts => self.port.write_request_to_send(level)?,
            ControlLine::Dtr => self.port.write_data_terminal_ready(level)?,
            // Break is not wired up on this transport.
            ControlLine::Brk => {}
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config_str(&self) -> String {
        self.config_summary.clone()
    }
}

/// List all available serial ports.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(Error::Serial)?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let (vid, pid, product) = match &p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    (Some(info.vid), Some(info.pid), info.product.clone())
                }
                _ => (None, None, None),
            };
            PortInfo {
                name: p.port_name,
                vid,
                pid,
                product,
            }
        })
        .collect())
}
