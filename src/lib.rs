//! A pure Rust SunSpec Modbus client.
//!
//! A SunSpec-compliant power-equipment device (inverter, meter, string combiner, …) advertises a
//! chain of self-describing "models" in its Modbus register map. Each model is a contiguous
//! register range whose layout is defined by an SMDX model-definition document. This crate
//!
//! - locates the SunSpec register region on a device,
//! - walks the model chain,
//! - loads the matching model definitions,
//! - binds each model's logical points to concrete register offsets, and
//! - provides typed, scale-factor-aware read/write access to the device's live registers or to a
//!   static register map file.
//!
//! Three interchangeable Modbus transports are provided: RTU over a serial line, TCP, and an
//! in-memory register map loaded from an mbmap XML document for offline use and testing.
//!
//! # Examples
//!
//! ```no_run
//! use sunspec::client::ClientDevice;
//!
//! # fn main() -> Result<(), sunspec::error::Error> {
//! let mut device = ClientDevice::tcp(1, "10.0.0.5", 502, None)?;
//!
//! device.scan()?;
//! device.read_points()?;
//!
//! let common = device.model("common").expect("device has no common model");
//!
//! println!("manufacturer: {:?}", common.point("Mn").and_then(|p| p.value()));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod data;
pub mod device;
pub mod error;
pub mod io;
pub mod modbus;
pub mod pathlist;
pub mod pics;
pub mod smdx;

/// Re-export of the register codec crate.
pub use sunspec_wire as wire;

pub use client::ClientDevice;
pub use device::{Block, Device, Model, Point};
pub use error::Error;
pub use pathlist::PathList;
pub use smdx::{ModelRegistry, ModelType};

/// Default base address of the SunSpec register region.
pub const BASE_ADDR_DEFAULT: u16 = 40000;

/// Base addresses probed during device discovery, in order.
pub const BASE_ADDR_CANDIDATES: [u16; 3] = [40000, 0, 50000];

/// The well-known `SunS` signature held in the two registers at the base address.
pub const SUNS_SIGNATURE: [u8; 4] = *b"SunS";

/// Model id marking the end of the model chain.
pub const END_MODEL_ID: u16 = 0xffff;
