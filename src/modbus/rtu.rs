//! Modbus RTU client over a shared serial port.
//!
//! An RS-485 line carries every slave on the bus, so one serial port must be shared by all
//! logical devices addressed through it. Ports are pooled in an [`RtuRegistry`] keyed by port
//! name; each [`RtuTransport`] registers its slave id with the shared [`RtuClient`] and the port
//! is closed and dropped from the registry when the last slave deregisters.
//!
//! Requests are strictly synchronous per port. The registry does not serialise concurrent
//! requests; callers must ensure single-writer discipline per port.

use crate::error::{Error, ProtocolError};
use crate::io::{Parity, SerialLine, SerialPortLine};
use crate::modbus::{FunctionCode, ModbusTransport, REQ_COUNT_MAX, TraceFn, trace_frame};
use crc::{CRC_16_MODBUS, Crc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

/// CRC-16/MODBUS: poly `0xA001` (reflected), init `0xFFFF`, low byte first on the wire.
const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Default RTU baud rate.
pub const BAUDRATE_DEFAULT: u32 = 9600;

/// Default shared read/write timeout for a freshly opened port.
pub const TIMEOUT_DEFAULT: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A pool of open RTU ports keyed by port name.
///
/// Pass a registry into device constructors to keep tests hermetic or to run parallel clients;
/// [`RtuRegistry::global`] provides the conventional process-wide default.
#[derive(Default)]
pub struct RtuRegistry {
    ports: Mutex<HashMap<String, Arc<Mutex<RtuClient>>>>,
}

impl RtuRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry.
    pub fn global() -> Arc<RtuRegistry> {
        static GLOBAL: LazyLock<Arc<RtuRegistry>> =
            LazyLock::new(|| Arc::new(RtuRegistry::new()));

        Arc::clone(&GLOBAL)
    }

    /// Fetch the shared client for `name`, opening the port if this is its first use.
    ///
    /// An already-open port must have been opened with the same baud rate and parity; a mismatch
    /// is an error since the physical line can only have one configuration.
    pub fn open(
        &self,
        name: &str,
        baudrate: Option<u32>,
        parity: Option<Parity>,
    ) -> Result<Arc<Mutex<RtuClient>>, Error> {
        let mut ports = lock(&self.ports);

        if let Some(client) = ports.get(name) {
            {
                let client = lock(client);

                if baudrate.is_some_and(|b| b != client.baudrate) {
                    return Err(config_error("modbus client baudrate mismatch"));
                }

                if parity.is_some_and(|p| p != client.parity) {
                    return Err(config_error("modbus client parity mismatch"));
                }
            }

            return Ok(Arc::clone(client));
        }

        let client = RtuClient::open(
            name,
            baudrate.unwrap_or(BAUDRATE_DEFAULT),
            parity.unwrap_or_default(),
        )?;

        let client = Arc::new(Mutex::new(client));

        ports.insert(name.to_string(), Arc::clone(&client));

        Ok(client)
    }

    /// Insert a client built over a caller-supplied line, e.g. an in-memory double.
    pub fn attach(&self, client: RtuClient) -> Arc<Mutex<RtuClient>> {
        let name = client.name.clone();
        let client = Arc::new(Mutex::new(client));

        lock(&self.ports).insert(name, Arc::clone(&client));

        client
    }

    /// Whether a port of this name is currently open.
    pub fn is_open(&self, name: &str) -> bool {
        lock(&self.ports).contains_key(name)
    }

    fn remove(&self, name: &str) {
        lock(&self.ports).remove(name);
    }
}

fn config_error(message: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        message,
    ))
}

/// One open RTU port, shared by every slave addressed through it.
pub struct RtuClient {
    name: String,
    baudrate: u32,
    parity: Parity,
    serial: Option<Box<dyn SerialLine>>,
    slaves: HashSet<u8>,
}

impl RtuClient {
    /// Open the serial port `name` at 8-N-1 or 8-E-1.
    pub fn open(name: &str, baudrate: u32, parity: Parity) -> Result<Self, Error> {
        let line = SerialPortLine::open(name, baudrate, parity, TIMEOUT_DEFAULT)?;

        Ok(Self::with_line(name, baudrate, parity, Box::new(line)))
    }

    /// Build a client over an existing line. Used by tests to substitute an in-memory double.
    pub fn with_line(
        name: &str,
        baudrate: u32,
        parity: Parity,
        line: Box<dyn SerialLine>,
    ) -> Self {
        Self {
            name: name.to_string(),
            baudrate,
            parity,
            serial: Some(line),
            slaves: HashSet::new(),
        }
    }

    /// Update the shared read/write deadline.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        match self.serial.as_mut() {
            Some(serial) => serial.set_timeout(timeout),
            None => Ok(()),
        }
    }

    fn add_slave(&mut self, slave_id: u8) {
        self.slaves.insert(slave_id);
    }

    fn remove_slave(&mut self, slave_id: u8) -> bool {
        self.slaves.remove(&slave_id);

        self.slaves.is_empty()
    }

    fn close(&mut self) {
        self.serial = None;
    }

    /// Read `count` registers from `slave_id`, splitting into ≤`max_count`-register PDUs.
    pub fn read(
        &mut self,
        slave_id: u8,
        addr: u16,
        count: u16,
        func: FunctionCode,
        trace: &mut Option<TraceFn>,
        max_count: u16,
    ) -> Result<Vec<u8>, Error> {
        let mut resp = Vec::with_capacity(usize::from(count) * 2);
        let mut offset = 0u16;
        let mut remaining = count;

        while remaining > 0 {
            let chunk = remaining.min(max_count);

            resp.extend_from_slice(&self.read_pdu(slave_id, addr + offset, chunk, func, trace)?);

            remaining -= chunk;
            offset += chunk;
        }

        Ok(resp)
    }

    /// Write register data to `slave_id`, splitting into ≤`max_count`-register PDUs.
    pub fn write(
        &mut self,
        slave_id: u8,
        addr: u16,
        data: &[u8],
        trace: &mut Option<TraceFn>,
        max_count: u16,
    ) -> Result<(), Error> {
        let count = (data.len() / 2) as u16;
        let mut offset = 0u16;
        let mut remaining = count;

        while remaining > 0 {
            let chunk = remaining.min(max_count);
            let bytes =
                &data[usize::from(offset) * 2..usize::from(offset + chunk) * 2];

            self.write_pdu(slave_id, addr + offset, bytes, trace)?;

            remaining -= chunk;
            offset += chunk;
        }

        Ok(())
    }

    fn read_pdu(
        &mut self,
        slave_id: u8,
        addr: u16,
        count: u16,
        func: FunctionCode,
        trace: &mut Option<TraceFn>,
    ) -> Result<Vec<u8>, Error> {
        let mut req = vec![slave_id, func as u8];

        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&count.to_be_bytes());
        req.extend_from_slice(&MODBUS_CRC.checksum(&req).to_le_bytes());

        trace_frame(trace, &format!("{}:{} ->", self.name, slave_id), &req);

        let serial = self.serial()?;

        serial.flush_input()?;
        serial.write_all(&req)?;

        // A normal response runs slave|fn|bytecount|data|crc; the byte count arrives in the
        // fifth-from-front position only after 5 bytes are in
        let (resp, except_code) = receive_frame(serial, |resp| usize::from(resp[2]) + 5)?;

        trace_frame(trace, &format!("{}:{} <--", self.name, slave_id), &resp);

        check_crc(&resp)?;

        if let Some(code) = except_code {
            return Err(Error::ModbusException(code));
        }

        Ok(resp[3..resp.len() - 2].to_vec())
    }

    fn write_pdu(
        &mut self,
        slave_id: u8,
        addr: u16,
        data: &[u8],
        trace: &mut Option<TraceFn>,
    ) -> Result<(), Error> {
        let count = (data.len() / 2) as u16;

        let mut req = vec![slave_id, FunctionCode::WriteMultiple as u8];

        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&count.to_be_bytes());
        req.push(data.len() as u8);
        req.extend_from_slice(data);
        req.extend_from_slice(&MODBUS_CRC.checksum(&req).to_le_bytes());

        trace_frame(trace, &format!("{}:{} ->", self.name, slave_id), &req);

        let serial = self.serial()?;

        serial.flush_input()?;
        serial.write_all(&req)?;

        // Write response is fixed length: slave|fn|addr|count|crc
        let (resp, except_code) = receive_frame(serial, |_| 8)?;

        trace_frame(trace, &format!("{}:{} <--", self.name, slave_id), &resp);

        check_crc(&resp)?;

        if let Some(code) = except_code {
            return Err(Error::ModbusException(code));
        }

        let echo_ok = resp[0] == slave_id
            && resp[1] == FunctionCode::WriteMultiple as u8
            && resp[2..4] == addr.to_be_bytes()
            && resp[4..6] == count.to_be_bytes();

        if !echo_ok {
            return Err(ProtocolError::ResponseMismatch.into());
        }

        Ok(())
    }

    fn serial(&mut self) -> Result<&mut Box<dyn SerialLine>, Error> {
        let name = &self.name;

        self.serial.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("client serial port not open: {}", name),
            ))
        })
    }
}

/// Read one response frame: 5 bytes first to tell exception from normal, then the remainder
/// determined by `normal_len`. A zero-byte read before the deadline is a timeout.
fn receive_frame(
    serial: &mut Box<dyn SerialLine>,
    normal_len: impl Fn(&[u8]) -> usize,
) -> Result<(Vec<u8>, Option<u8>), Error> {
    let mut resp: Vec<u8> = Vec::new();
    let mut remaining = 5usize;
    let mut len_found = false;
    let mut except_code = None;

    while remaining > 0 {
        let mut buf = vec![0u8; remaining];
        let n = serial.read(&mut buf)?;

        if n == 0 {
            return Err(Error::Timeout);
        }

        resp.extend_from_slice(&buf[..n]);
        remaining -= n;

        if !len_found && resp.len() >= 5 {
            if resp[1] & 0x80 == 0 {
                remaining = normal_len(&resp).saturating_sub(resp.len());
                len_found = true;
            } else {
                // Exception frame is exactly 5 bytes: slave|fn|code|crc
                except_code = Some(resp[2]);
            }
        }
    }

    Ok((resp, except_code))
}

fn check_crc(resp: &[u8]) -> Result<(), Error> {
    let split = resp.len() - 2;
    let received = u16::from_le_bytes([resp[split], resp[split + 1]]);
    let expected = MODBUS_CRC.checksum(&resp[..split]);

    if expected != received {
        return Err(ProtocolError::Crc { expected, received }.into());
    }

    Ok(())
}

/// One logical slave on a shared RTU port.
pub struct RtuTransport {
    slave_id: u8,
    name: String,
    client: Arc<Mutex<RtuClient>>,
    registry: Arc<RtuRegistry>,
    trace: Option<TraceFn>,
    max_count: u16,
    closed: bool,
}

impl RtuTransport {
    /// Attach to `slave_id` on the port `name`, opening the port through `registry` if needed.
    pub fn new(
        slave_id: u8,
        name: &str,
        baudrate: Option<u32>,
        parity: Option<Parity>,
        timeout: Option<Duration>,
        registry: Arc<RtuRegistry>,
    ) -> Result<Self, Error> {
        let client = registry.open(name, baudrate, parity)?;

        {
            let mut client = lock(&client);

            client.add_slave(slave_id);

            if let Some(timeout) = timeout {
                client.set_timeout(timeout)?;
            }
        }

        Ok(Self {
            slave_id,
            name: name.to_string(),
            client,
            registry,
            trace: None,
            max_count: REQ_COUNT_MAX,
            closed: false,
        })
    }

    /// Install a hook that receives a hex dump of every frame.
    pub fn set_trace(&mut self, trace: Option<TraceFn>) {
        self.trace = trace;
    }
}

impl ModbusTransport for RtuTransport {
    fn read(&mut self, addr: u16, count: u16, func: FunctionCode) -> Result<Vec<u8>, Error> {
        lock(&self.client).read(
            self.slave_id,
            addr,
            count,
            func,
            &mut self.trace,
            self.max_count,
        )
    }

    fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        lock(&self.client).write(self.slave_id, addr, data, &mut self.trace, self.max_count)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;

        let last = {
            let mut client = lock(&self.client);
            let last = client.remove_slave(self.slave_id);

            if last {
                client.close();
            }

            last
        };

        if last {
            self.registry.remove(&self.name);
        }
    }
}

impl Drop for RtuTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory serial double: reads drain a scripted receive buffer, writes accumulate into a
    /// buffer shared with the test.
    struct FakeSerial {
        in_buf: Vec<u8>,
        out_buf: Arc<Mutex<Vec<u8>>>,
    }

    impl SerialLine for FakeSerial {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            let n = buf.len().min(self.in_buf.len());

            buf[..n].copy_from_slice(&self.in_buf[..n]);
            self.in_buf.drain(..n);

            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
            self.out_buf.lock().unwrap().extend_from_slice(buf);

            Ok(())
        }

        fn flush_input(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
            Ok(())
        }
    }

    fn client(in_buf: &[u8]) -> (RtuClient, Arc<Mutex<Vec<u8>>>) {
        let out_buf = Arc::new(Mutex::new(Vec::new()));
        let line = Box::new(FakeSerial {
            in_buf: in_buf.to_vec(),
            out_buf: Arc::clone(&out_buf),
        });

        (
            RtuClient::with_line("fake", BAUDRATE_DEFAULT, Parity::None, line),
            out_buf,
        )
    }

    #[test]
    fn read_frame() {
        let (mut client, out) = client(b"\x01\x03\x04\x53\x75\x6E\x53\x96\xF0");

        let data = client
            .read(1, 40000, 2, FunctionCode::ReadHolding, &mut None, REQ_COUNT_MAX)
            .unwrap();

        assert_eq!(data, b"SunS");
        assert_eq!(*out.lock().unwrap(), b"\x01\x03\x9C\x40\x00\x02\xEB\x8F");
    }

    #[test]
    fn write_frame() {
        let (mut client, out) = client(b"\x01\x10\x9C\x40\x00\x02\x6E\x4C");

        client
            .write(1, 40000, b"ABCD", &mut None, REQ_COUNT_MAX)
            .unwrap();

        assert_eq!(
            *out.lock().unwrap(),
            b"\x01\x10\x9C\x40\x00\x02\x04\x41\x42\x43\x44\x8B\xB2"
        );
    }

    #[test]
    fn crc_mismatch() {
        let (mut client, _out) = client(b"\x01\x03\x04\x53\x75\x6E\x53\x96\xF1");

        let result = client.read(1, 40000, 2, FunctionCode::ReadHolding, &mut None, REQ_COUNT_MAX);

        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::Crc { .. }))
        ));
    }

    #[test]
    fn exception_response() {
        let mut frame = vec![0x01, 0x83, 0x02];

        frame.extend_from_slice(&MODBUS_CRC.checksum(&frame).to_le_bytes());

        let (mut client, _out) = client(&frame);

        let result = client.read(1, 40000, 2, FunctionCode::ReadHolding, &mut None, REQ_COUNT_MAX);

        assert!(matches!(result, Err(Error::ModbusException(2))));
    }

    #[test]
    fn empty_read_is_timeout() {
        let (mut client, _out) = client(b"");

        let result = client.read(1, 40000, 2, FunctionCode::ReadHolding, &mut None, REQ_COUNT_MAX);

        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn large_read_splits_into_pdus() {
        // 200 registers must go out as 125 + 75
        let mut script = Vec::new();

        for count in [125u16, 75] {
            let byte_count = (count * 2) as u8;
            let mut frame = vec![0x01, 0x03, byte_count];

            frame.extend(std::iter::repeat_n(0xab, usize::from(byte_count)));
            frame.extend_from_slice(&MODBUS_CRC.checksum(&frame).to_le_bytes());
            script.extend_from_slice(&frame);
        }

        let (mut client, out) = client(&script);

        let data = client
            .read(1, 40000, 200, FunctionCode::ReadHolding, &mut None, REQ_COUNT_MAX)
            .unwrap();

        assert_eq!(data.len(), 400);

        let requests = out.lock().unwrap();

        // Two 8-byte read requests covering [40000, 40125) and [40125, 40200)
        assert_eq!(requests.len(), 16);
        assert_eq!(&requests[2..6], &[0x9C, 0x40, 0x00, 0x7D]);
        assert_eq!(&requests[10..14], &[0x9C, 0xBD, 0x00, 0x4B]);
    }

    #[test]
    fn port_closes_when_last_slave_deregisters() {
        let registry = Arc::new(RtuRegistry::new());
        let (client, _out) = client(b"");

        registry.attach(client);

        let mut first =
            RtuTransport::new(1, "fake", None, None, None, Arc::clone(&registry)).unwrap();
        let mut second =
            RtuTransport::new(2, "fake", None, None, None, Arc::clone(&registry)).unwrap();

        first.close();

        assert!(registry.is_open("fake"));

        second.close();

        assert!(!registry.is_open("fake"));
    }

    #[test]
    fn reopen_with_mismatched_settings_fails() {
        let registry = Arc::new(RtuRegistry::new());
        let (client, _out) = client(b"");

        registry.attach(client);

        assert!(registry.open("fake", Some(BAUDRATE_DEFAULT), None).is_ok());
        assert!(registry.open("fake", Some(19200), None).is_err());
        assert!(registry.open("fake", None, Some(Parity::Even)).is_err());
    }

    #[test]
    fn trace_hook_sees_hex_dump() {
        let dumps: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dumps);

        let mut trace: Option<TraceFn> = Some(Box::new(move |s: &str| {
            sink.lock().unwrap().push(s.to_string());
        }));

        let (mut client, _out) = client(b"\x01\x03\x04\x53\x75\x6E\x53\x96\xF0");

        client
            .read(1, 40000, 2, FunctionCode::ReadHolding, &mut trace, REQ_COUNT_MAX)
            .unwrap();

        let dumps = dumps.lock().unwrap();

        assert_eq!(dumps[0], "fake:1 ->01039C400002EB8F");
        assert_eq!(dumps[1], "fake:1 <--01030453756E5396F0");
    }
}
