//! SunSpec client error types.

use crate::modbus::FunctionCode;

/// A SunSpec client error.
#[derive(Debug)]
pub enum Error {
    /// No data arrived on the transport before the deadline.
    Timeout,
    /// A Modbus frame failed validation.
    Protocol(ProtocolError),
    /// The server answered with a Modbus exception PDU carrying this code (1..11).
    ModbusException(u8),
    /// An SMDX, PICS or SDX document failed to parse or validate.
    Schema(SchemaError),
    /// A point's scale-factor reference could not be resolved.
    Resolution {
        /// The referencing point id.
        point: String,
        /// The unresolved scale-factor reference.
        sf: String,
        /// The model id the point belongs to.
        model: u16,
    },
    /// The path resolver found no file of the given name in any location.
    NotFound(String),
    /// The scan progress callback requested cancellation.
    ScanAborted,
    /// A register map file is invalid, or a mapped request fell outside it.
    Map(MapError),
    /// An error occurred encoding or decoding a point value.
    Wire(sunspec_wire::WireError),
    /// An I/O error from the underlying serial line, socket or filesystem.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Timeout => f.write_str("timeout"),
            Error::Protocol(e) => write!(f, "protocol: {}", e),
            Error::ModbusException(code) => write!(f, "modbus exception {}", code),
            Error::Schema(e) => write!(f, "schema: {}", e),
            Error::Resolution { point, sf, model } => write!(
                f,
                "unable to resolve scale factor '{}' for point '{}' in model {}",
                sf, point, model
            ),
            Error::NotFound(name) => write!(f, "file not found in path list: {}", name),
            Error::ScanAborted => f.write_str("device scan terminated"),
            Error::Map(e) => write!(f, "map: {}", e),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::Io(e) => write!(f, "io: {}", e),
        }
    }
}

/// Modbus frame validation error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The CRC-16 of a received RTU frame does not match its payload.
    Crc {
        /// The CRC computed over the received payload.
        expected: u16,
        /// The CRC carried by the frame.
        received: u16,
    },
    /// A write response did not echo the request's slave/function/address/count fields.
    ResponseMismatch,
    /// A device answered the base-address probe without the `SunS` signature.
    Signature,
    /// The stream ended inside a frame.
    Truncated,
    /// The MBAP header length field disagrees with the bytes that followed.
    MbapLength {
        /// Length announced by the header.
        expected: usize,
        /// Bytes actually received.
        received: usize,
    },
}

impl core::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolError::Crc { expected, received } => {
                write!(f, "CRC error: computed {:#06x}, received {:#06x}", expected, received)
            }
            ProtocolError::ResponseMismatch => f.write_str("response does not match request"),
            ProtocolError::Signature => {
                f.write_str("device responded - not a SunSpec register map")
            }
            ProtocolError::Truncated => f.write_str("frame truncated"),
            ProtocolError::MbapLength { expected, received } => write!(
                f,
                "MBAP length mismatch: header announced {}, received {}",
                expected, received
            ),
        }
    }
}

/// SMDX/PICS/SDX document parse or validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The document is not well-formed XML.
    Xml(String),
    /// The document root is not the expected element.
    UnexpectedRoot(String),
    /// An element appeared where it is not allowed.
    UnexpectedElement {
        /// Offending element name.
        element: String,
        /// The element it appeared in.
        parent: String,
    },
    /// A required attribute is missing or malformed.
    Attribute {
        /// Element name.
        element: &'static str,
        /// Attribute name.
        attribute: &'static str,
        /// The raw value, if one was present.
        value: Option<String>,
    },
    /// A model declared more than one fixed block.
    DuplicateFixedBlock,
    /// A model declared more than one repeating block.
    DuplicateRepeatingBlock,
    /// A block declared a type other than `fixed` or `repeating`.
    InvalidBlockType(String),
    /// Two points in one block share an id.
    DuplicatePoint(String),
    /// A point is missing its register offset.
    MissingOffset(String),
    /// A point is missing its type.
    MissingType(String),
    /// A string point is missing its mandatory `len` attribute.
    MissingStringLen(String),
    /// A point declared a type name this crate does not know.
    UnknownPointType {
        /// Point id.
        point: String,
        /// The unrecognised type name.
        name: String,
    },
}

impl core::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchemaError::Xml(e) => write!(f, "malformed XML: {}", e),
            SchemaError::UnexpectedRoot(root) => write!(f, "unexpected root element '{}'", root),
            SchemaError::UnexpectedElement { element, parent } => {
                write!(f, "unexpected '{}' element in '{}' element", element, parent)
            }
            SchemaError::Attribute {
                element,
                attribute,
                value,
            } => match value {
                Some(value) => write!(
                    f,
                    "bad '{}' attribute on '{}' element: '{}'",
                    attribute, element, value
                ),
                None => write!(f, "missing '{}' attribute on '{}' element", attribute, element),
            },
            SchemaError::DuplicateFixedBlock => f.write_str("duplicate fixed block definition"),
            SchemaError::DuplicateRepeatingBlock => {
                f.write_str("duplicate repeating block definition")
            }
            SchemaError::InvalidBlockType(t) => write!(f, "invalid block type '{}'", t),
            SchemaError::DuplicatePoint(id) => write!(f, "duplicate point definition: {}", id),
            SchemaError::MissingOffset(id) => {
                write!(f, "missing offset attribute for point: {}", id)
            }
            SchemaError::MissingType(id) => write!(f, "missing type attribute for point: {}", id),
            SchemaError::MissingStringLen(id) => {
                write!(f, "missing len attribute for string point: {}", id)
            }
            SchemaError::UnknownPointType { point, name } => {
                write!(f, "unknown point type '{}' for point: {}", name, point)
            }
        }
    }
}

/// Register map error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The map declared a function other than `holding` or `input`.
    UnsupportedFunction(String),
    /// Register offsets must be strictly ascending with no overlap.
    Overlap {
        /// Offset of the offending `regs` element.
        offset: u16,
        /// First offset past the previous run.
        previous_end: u16,
    },
    /// Hex string content must be a multiple of 4 hex digits.
    HexLength(u16),
    /// A `regs` element declared an unrecognised type.
    UnknownRegType {
        /// Offset of the offending element.
        offset: u16,
        /// The unrecognised type name.
        name: String,
    },
    /// A `regs` element's content could not be parsed as its declared type.
    BadRegValue {
        /// Offset of the offending element.
        offset: u16,
        /// The content text.
        text: String,
    },
    /// The request's function code disagrees with the map's declared function.
    FunctionMismatch {
        /// Function the request was tagged with.
        requested: FunctionCode,
        /// Function the map serves.
        map: FunctionCode,
    },
    /// A read touched a register outside every mapped run.
    ReadRange {
        /// Request start address.
        addr: u16,
        /// Request register count.
        count: u16,
    },
    /// A write touched a register outside every mapped run.
    WriteRange {
        /// Request start address.
        addr: u16,
        /// Request register count.
        count: u16,
    },
    /// Write data must be an even number of bytes.
    OddDataLength(usize),
    /// The map document failed to parse.
    Document(String),
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::UnsupportedFunction(func) => write!(f, "unsupported function '{}'", func),
            MapError::Overlap {
                offset,
                previous_end,
            } => write!(
                f,
                "register offsets must be ascending with no overlap: {} overlaps run ending at {}",
                offset, previous_end
            ),
            MapError::HexLength(offset) => write!(
                f,
                "hex string content length must be a multiple of 4 at offset {}",
                offset
            ),
            MapError::UnknownRegType { offset, name } => {
                write!(f, "unknown regs type '{}' at offset {}", name, offset)
            }
            MapError::BadRegValue { offset, text } => {
                write!(f, "bad regs value '{}' at offset {}", text, offset)
            }
            MapError::FunctionMismatch { requested, map } => write!(
                f,
                "function mismatch: request {:?}, map {:?}",
                requested, map
            ),
            MapError::ReadRange { addr, count } => {
                write!(f, "read of {} registers at {} outside mapped runs", count, addr)
            }
            MapError::WriteRange { addr, count } => {
                write!(f, "write of {} registers at {} outside mapped runs", count, addr)
            }
            MapError::OddDataLength(len) => {
                write!(f, "write data length {} is not an even number of bytes", len)
            }
            MapError::Document(e) => write!(f, "invalid map document: {}", e),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<SchemaError> for Error {
    fn from(e: SchemaError) -> Self {
        Self::Schema(e)
    }
}

impl From<MapError> for Error {
    fn from(e: MapError) -> Self {
        Self::Map(e)
    }
}

impl From<sunspec_wire::WireError> for Error {
    fn from(e: sunspec_wire::WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        // A read that yields no bytes before the configured deadline surfaces as `Timeout`, not
        // as a generic I/O failure.
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}

impl From<roxmltree::Error> for SchemaError {
    fn from(e: roxmltree::Error) -> Self {
        Self::Xml(e.to_string())
    }
}
