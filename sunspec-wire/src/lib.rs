//! Register-level codec for the SunSpec information model.
//!
//! SunSpec devices expose their data as big-endian 16-bit Modbus registers. This crate knows how
//! to turn raw register bytes into typed values and back for each of the scalar point types
//! defined by the SunSpec Information Model Specification, including the per-type "unimplemented"
//! sentinel patterns a device uses to mark a point it does not populate.
//!
//! This crate is used internally by [`sunspec`](https://crates.io/crates/sunspec) but has no
//! dependency on any transport so it can be used standalone.

#![deny(missing_docs)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

mod codec;
mod error;
mod kind;
mod value;

pub use codec::{decode, encode, is_implemented, sentinel, value_from_str};
pub use error::WireError;
pub use kind::PointKind;
pub use value::Value;
