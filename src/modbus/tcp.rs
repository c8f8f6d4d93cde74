//! Modbus TCP client.
//!
//! Requests are framed with an MBAP header: `tid(2) proto(2)=0 len(2) unit(1)` followed by the
//! same function bodies RTU uses. This client runs one request in flight at a time so the
//! transaction id is always 0.
//!
//! Connections are lazy and short-lived by default: a read or write with no open session
//! connects, performs the operation and disconnects again. A scan brackets its burst of requests
//! in a single session via [`ModbusTransport::connect`]/[`disconnect`](ModbusTransport::disconnect).

use crate::error::{Error, ProtocolError};
use crate::io::{TcpLink, TcpStreamLink};
use crate::modbus::{FunctionCode, ModbusTransport, REQ_COUNT_MAX, TraceFn, trace_frame};
use std::time::Duration;

/// Default Modbus TCP port.
pub const PORT_DEFAULT: u16 = 502;

/// Default connect/send/recv timeout.
pub const TIMEOUT_DEFAULT: Duration = Duration::from_secs(2);

const MBAP_LEN: usize = 6;
const RESP_MIN_LEN: usize = 3;

/// A Modbus TCP connection to one unit.
pub struct TcpTransport {
    slave_id: u8,
    host: String,
    port: u16,
    timeout: Duration,
    link: Option<Box<dyn TcpLink>>,
    trace: Option<TraceFn>,
    max_count: u16,
}

impl TcpTransport {
    /// Create a transport for `slave_id` at `host:port`. No connection is made until the first
    /// request or an explicit [`connect`](ModbusTransport::connect).
    pub fn new(slave_id: u8, host: &str, port: u16, timeout: Option<Duration>) -> Self {
        Self {
            slave_id,
            host: host.to_string(),
            port,
            timeout: timeout.unwrap_or(TIMEOUT_DEFAULT),
            link: None,
            trace: None,
            max_count: REQ_COUNT_MAX,
        }
    }

    /// Build a transport over an existing link. Used by tests to substitute an in-memory double.
    pub fn with_link(slave_id: u8, link: Box<dyn TcpLink>) -> Self {
        Self {
            slave_id,
            host: String::new(),
            port: PORT_DEFAULT,
            timeout: TIMEOUT_DEFAULT,
            link: Some(link),
            trace: None,
            max_count: REQ_COUNT_MAX,
        }
    }

    /// Install a hook that receives a hex dump of every frame.
    pub fn set_trace(&mut self, trace: Option<TraceFn>) {
        self.trace = trace;
    }

    fn read_chunked(
        &mut self,
        addr: u16,
        count: u16,
        func: FunctionCode,
    ) -> Result<Vec<u8>, Error> {
        let mut resp = Vec::with_capacity(usize::from(count) * 2);
        let mut offset = 0u16;
        let mut remaining = count;

        while remaining > 0 {
            let chunk = remaining.min(self.max_count);

            resp.extend_from_slice(&self.read_pdu(addr + offset, chunk, func)?);

            remaining -= chunk;
            offset += chunk;
        }

        Ok(resp)
    }

    fn write_chunked(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        let count = (data.len() / 2) as u16;
        let mut offset = 0u16;
        let mut remaining = count;

        while remaining > 0 {
            let chunk = remaining.min(self.max_count);
            let bytes = &data[usize::from(offset) * 2..usize::from(offset + chunk) * 2];

            self.write_pdu(addr + offset, bytes)?;

            remaining -= chunk;
            offset += chunk;
        }

        Ok(())
    }

    fn read_pdu(&mut self, addr: u16, count: u16, func: FunctionCode) -> Result<Vec<u8>, Error> {
        // tid 0, proto 0, len = unit + fn + addr + count
        let mut req = vec![0u8, 0, 0, 0, 0, 6, self.slave_id, func as u8];

        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&count.to_be_bytes());

        let prefix = format!("{}:{}:{} ->", self.host, self.port, self.slave_id);

        trace_frame(&mut self.trace, &prefix, &req);

        let link = self.link()?;

        link.send_all(&req)?;

        let resp = receive_frame(link)?;

        let prefix = format!("{}:{}:{} <--", self.host, self.port, self.slave_id);

        trace_frame(&mut self.trace, &prefix, &resp);

        let body = &resp[MBAP_LEN..];

        if body[1] & 0x80 != 0 {
            return Err(Error::ModbusException(body[2]));
        }

        let data = &body[3..];

        if data.len() != usize::from(body[2]) {
            return Err(ProtocolError::MbapLength {
                expected: usize::from(body[2]),
                received: data.len(),
            }
            .into());
        }

        Ok(data.to_vec())
    }

    fn write_pdu(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        let count = (data.len() / 2) as u16;
        let len = 7 + data.len();

        let mut req = vec![0u8, 0, 0, 0];

        req.extend_from_slice(&(len as u16).to_be_bytes());
        req.push(self.slave_id);
        req.push(FunctionCode::WriteMultiple as u8);
        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&count.to_be_bytes());
        req.push(data.len() as u8);
        req.extend_from_slice(data);

        let prefix = format!("{}:{}:{} ->", self.host, self.port, self.slave_id);

        trace_frame(&mut self.trace, &prefix, &req);

        let link = self.link()?;

        link.send_all(&req)?;

        let resp = receive_frame(link)?;

        let prefix = format!("{}:{}:{} <--", self.host, self.port, self.slave_id);

        trace_frame(&mut self.trace, &prefix, &resp);

        let body = &resp[MBAP_LEN..];

        if body[1] & 0x80 != 0 {
            return Err(Error::ModbusException(body[2]));
        }

        Ok(())
    }

    fn link(&mut self) -> Result<&mut Box<dyn TcpLink>, Error> {
        self.link.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no open session",
            ))
        })
    }
}

/// Read one MBAP-framed response: exactly 6 header bytes, then the announced remainder.
fn receive_frame(link: &mut Box<dyn TcpLink>) -> Result<Vec<u8>, Error> {
    let mut resp = vec![0u8; MBAP_LEN];

    recv_exact(link, &mut resp)?;

    let announced = usize::from(u16::from_be_bytes([resp[4], resp[5]]));

    if announced < RESP_MIN_LEN {
        return Err(ProtocolError::MbapLength {
            expected: RESP_MIN_LEN,
            received: announced,
        }
        .into());
    }

    let mut body = vec![0u8; announced];

    recv_exact(link, &mut body)?;

    resp.append(&mut body);

    Ok(resp)
}

fn recv_exact(link: &mut Box<dyn TcpLink>, buf: &mut [u8]) -> Result<(), Error> {
    let mut filled = 0;

    while filled < buf.len() {
        let n = link.recv(&mut buf[filled..])?;

        if n == 0 {
            return Err(ProtocolError::Truncated.into());
        }

        filled += n;
    }

    Ok(())
}

impl ModbusTransport for TcpTransport {
    fn read(&mut self, addr: u16, count: u16, func: FunctionCode) -> Result<Vec<u8>, Error> {
        let local = self.link.is_none();

        if local {
            self.connect()?;
        }

        let result = self.read_chunked(addr, count, func);

        if local {
            self.disconnect();
        }

        result
    }

    fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        let local = self.link.is_none();

        if local {
            self.connect()?;
        }

        let result = self.write_chunked(addr, data);

        if local {
            self.disconnect();
        }

        result
    }

    fn connect(&mut self) -> Result<(), Error> {
        self.disconnect();

        let link = TcpStreamLink::connect(&self.host, self.port, self.timeout)?;

        self.link = Some(Box::new(link));

        Ok(())
    }

    fn disconnect(&mut self) {
        self.link = None;
    }

    fn close(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeSocket {
        in_buf: Vec<u8>,
        out_buf: Arc<Mutex<Vec<u8>>>,
    }

    impl TcpLink for FakeSocket {
        fn send_all(&mut self, buf: &[u8]) -> Result<(), Error> {
            self.out_buf.lock().unwrap().extend_from_slice(buf);

            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            let n = buf.len().min(self.in_buf.len());

            buf[..n].copy_from_slice(&self.in_buf[..n]);
            self.in_buf.drain(..n);

            Ok(n)
        }
    }

    fn transport(in_buf: &[u8]) -> (TcpTransport, Arc<Mutex<Vec<u8>>>) {
        let out_buf = Arc::new(Mutex::new(Vec::new()));
        let link = Box::new(FakeSocket {
            in_buf: in_buf.to_vec(),
            out_buf: Arc::clone(&out_buf),
        });

        (TcpTransport::with_link(1, link), out_buf)
    }

    #[test]
    fn read_frame() {
        let (mut transport, out) =
            transport(b"\x00\x00\x00\x00\x00\x07\x01\x03\x04\x53\x75\x6E\x53");

        let data = transport.read(40000, 2, FunctionCode::ReadHolding).unwrap();

        assert_eq!(data, b"SunS");
        assert_eq!(
            *out.lock().unwrap(),
            b"\x00\x00\x00\x00\x00\x06\x01\x03\x9C\x40\x00\x02"
        );
    }

    #[test]
    fn write_frame() {
        let (mut transport, out) = transport(b"\x00\x00\x00\x00\x00\x06\x01\x10\x9C\x40\x00\x02");

        transport.write(40000, b"ABCD").unwrap();

        assert_eq!(
            *out.lock().unwrap(),
            b"\x00\x00\x00\x00\x00\x0B\x01\x10\x9C\x40\x00\x02\x04\x41\x42\x43\x44"
        );
    }

    #[test]
    fn exception_response() {
        let (mut transport, _out) = transport(b"\x00\x00\x00\x00\x00\x03\x01\x83\x02");

        let result = transport.read(40000, 2, FunctionCode::ReadHolding);

        assert!(matches!(result, Err(Error::ModbusException(2))));
    }

    #[test]
    fn truncated_frame() {
        let (mut transport, _out) = transport(b"\x00\x00\x00\x00\x00\x07\x01\x03\x04\x53");

        let result = transport.read(40000, 2, FunctionCode::ReadHolding);

        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::Truncated))
        ));
    }

    #[test]
    fn byte_count_disagrees_with_header() {
        // Header announces 7 bytes but the byte count field claims 6
        let (mut transport, _out) =
            transport(b"\x00\x00\x00\x00\x00\x07\x01\x03\x06\x53\x75\x6E\x53");

        let result = transport.read(40000, 2, FunctionCode::ReadHolding);

        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::MbapLength { .. }))
        ));
    }
}
