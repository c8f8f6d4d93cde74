//! Serial and TCP stream drivers.
//!
//! The Modbus clients talk to the outside world through the [`SerialLine`] and [`TcpLink`]
//! traits so tests can substitute in-memory doubles for real hardware.

use crate::error::Error;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Serial parity setting. SunSpec devices use 8-N-1 or 8-E-1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
}

/// A byte stream over a serial line.
pub trait SerialLine: Send {
    /// Read up to `buf.len()` bytes. Returns `Ok(0)` when the read deadline expires with no data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Discard any unread received bytes.
    fn flush_input(&mut self) -> Result<(), Error>;

    /// Update the shared read/write deadline.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
}

/// A [`SerialLine`] over a real serial port, opened 8-N-1 or 8-E-1.
pub struct SerialPortLine {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPortLine {
    /// Open `name` at `baudrate` with the given parity and shared read/write timeout.
    pub fn open(
        name: &str,
        baudrate: u32,
        parity: Parity,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let parity = match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
        };

        let port = serialport::new(name, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(parity)
            .timeout(timeout)
            .open()
            .map_err(std::io::Error::from)?;

        Ok(Self { port })
    }
}

impl SerialLine for SerialPortLine {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.port.write_all(buf)?;

        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), Error> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(std::io::Error::from)?;

        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port
            .set_timeout(timeout)
            .map_err(std::io::Error::from)?;

        Ok(())
    }
}

/// A blocking stream socket.
pub trait TcpLink: Send {
    /// Send the whole buffer.
    fn send_all(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Receive up to `buf.len()` bytes. `Ok(0)` means the peer closed the connection.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

/// A [`TcpLink`] over a real TCP connection with connect and per-call send/recv timeouts.
pub struct TcpStreamLink {
    stream: TcpStream,
}

impl TcpStreamLink {
    /// Connect to `host:port`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, Error> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no address for {}:{}", host, port),
                ))
            })?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;

        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        Ok(Self { stream })
    }
}

impl TcpLink for TcpStreamLink {
    fn send_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.stream.write_all(buf)?;

        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.stream.read(buf)?)
    }
}
