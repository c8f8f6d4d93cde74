//! Utilities to drive simulated devices as part of the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use sunspec::PathList;
use sunspec::client::ClientDevice;
use sunspec::error::Error;
use sunspec::modbus::mbmap::MappedTransport;
use sunspec::modbus::{FunctionCode, ModbusTransport};
use sunspec::smdx::ModelRegistry;

/// The directory of SMDX, map and snapshot fixtures.
pub fn data_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
}

pub fn data_pathlist() -> PathList {
    PathList::from_paths([data_dir()])
}

/// A model registry resolving definitions from the fixture directory only.
pub fn registry() -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(data_pathlist()))
}

/// A client over a register map fixture.
pub fn mapped_device(map_file: &str) -> ClientDevice {
    let pathlist = data_pathlist();
    let transport = MappedTransport::new(map_file, Some(&pathlist)).expect("load map fixture");

    ClientDevice::with_transport(Box::new(transport), registry())
}

/// A client over a register map fixture whose transport traffic is recorded.
pub fn recording_mapped_device(map_file: &str) -> (ClientDevice, IoLog) {
    let pathlist = data_pathlist();
    let transport = MappedTransport::new(map_file, Some(&pathlist)).expect("load map fixture");

    let log = IoLog::default();
    let recording = RecordingTransport {
        inner: Box::new(transport),
        log: log.clone(),
    };

    (
        ClientDevice::with_transport(Box::new(recording), registry()),
        log,
    )
}

/// Shared record of the reads and writes a [`RecordingTransport`] has seen.
#[derive(Clone, Default)]
pub struct IoLog {
    pub reads: Arc<Mutex<Vec<(u16, u16)>>>,
    pub writes: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
}

impl IoLog {
    pub fn reads(&self) -> Vec<(u16, u16)> {
        self.reads.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.reads.lock().unwrap().clear();
        self.writes.lock().unwrap().clear();
    }
}

/// Wraps another transport, logging each operation before forwarding it.
pub struct RecordingTransport {
    inner: Box<dyn ModbusTransport>,
    log: IoLog,
}

impl ModbusTransport for RecordingTransport {
    fn read(&mut self, addr: u16, count: u16, func: FunctionCode) -> Result<Vec<u8>, Error> {
        self.log.reads.lock().unwrap().push((addr, count));

        self.inner.read(addr, count, func)
    }

    fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        self.log.writes.lock().unwrap().push((addr, data.to_vec()));

        self.inner.write(addr, data)
    }

    fn connect(&mut self) -> Result<(), Error> {
        self.inner.connect()
    }

    fn disconnect(&mut self) {
        self.inner.disconnect();
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
