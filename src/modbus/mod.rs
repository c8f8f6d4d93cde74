//! Modbus transports.
//!
//! Three interchangeable backends implement [`ModbusTransport`]: [`rtu`] for serial lines,
//! [`tcp`] for Modbus TCP, and [`mbmap`] for an in-memory register map loaded from an XML
//! document. All three present reads and writes in register units; the RTU and TCP clients split
//! requests larger than [`REQ_COUNT_MAX`] registers across multiple PDUs and concatenate the
//! responses in order.

pub mod mbmap;
pub mod rtu;
pub mod tcp;

use crate::error::Error;

/// Maximum register count of a single Modbus read or write PDU.
pub const REQ_COUNT_MAX: u16 = 125;

/// The Modbus function codes used by SunSpec devices.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03).
    ReadHolding = 3,
    /// Read Input Registers (0x04).
    ReadInput = 4,
    /// Write Multiple Registers (0x10).
    WriteMultiple = 16,
}

/// A hook invoked with a formatted hex dump of every request and response frame.
pub type TraceFn = Box<dyn FnMut(&str) + Send>;

/// One Modbus backend: a register-oriented read/write interface to a single slave.
///
/// `read` returns exactly `2 * count` bytes. Splitting across PDUs is atomic only per PDU; there
/// is no rollback when a later chunk of a split operation fails.
pub trait ModbusTransport {
    /// Read `count` registers starting at `addr`.
    fn read(&mut self, addr: u16, count: u16, func: FunctionCode) -> Result<Vec<u8>, Error>;

    /// Write register data starting at `addr`. `data` must be an even number of bytes.
    fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error>;

    /// Open a session for a burst of requests. Only meaningful for TCP, where it keeps one
    /// connection alive across a whole scan; a no-op elsewhere.
    fn connect(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Close the session opened by [`connect`](Self::connect).
    fn disconnect(&mut self) {}

    /// Release the transport. RTU devices deregister from the shared port client here.
    fn close(&mut self) {}
}

pub(crate) fn trace_frame(trace: &mut Option<TraceFn>, prefix: &str, frame: &[u8]) {
    if let Some(trace) = trace {
        let mut s = prefix.to_string();

        for byte in frame {
            s.push_str(&format!("{:02X}", byte));
        }

        trace(&s);
    }

    log::trace!("{} {} bytes", prefix, frame.len());
}
