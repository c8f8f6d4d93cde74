//! The SunSpec scalar point types.

/// A SunSpec scalar point type.
///
/// Defined in the SunSpec Information Model Specification. Every point in a model definition
/// carries one of these type tags; the tag fixes the register width, the big-endian wire layout
/// and the "unimplemented" sentinel pattern.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PointKind {
    /// Signed 16-bit integer. Unimplemented: `0x8000`.
    Int16,
    /// Unsigned 16-bit integer. Unimplemented: `0xFFFF`.
    Uint16,
    /// Repeating-block instance count, laid out as `uint16`.
    Count,
    /// 16-bit accumulator. Value 0 means uninitialised/unimplemented.
    Acc16,
    /// 16-bit enumerated value. Unimplemented: `0xFFFF`.
    Enum16,
    /// 16-bit bit field. Unimplemented: `0xFFFF`.
    Bitfield16,
    /// Alignment padding register. Never exposed as a point.
    Pad,
    /// Signed 32-bit integer. Unimplemented: `0x8000_0000`.
    Int32,
    /// Unsigned 32-bit integer. Unimplemented: `0xFFFF_FFFF`.
    Uint32,
    /// 32-bit accumulator. Value 0 means uninitialised/unimplemented.
    Acc32,
    /// 32-bit enumerated value. Unimplemented: `0xFFFF_FFFF`.
    Enum32,
    /// 32-bit bit field. Unimplemented: `0xFFFF_FFFF`.
    Bitfield32,
    /// IPv4 address as an unsigned 32-bit integer. Unimplemented: 0.
    Ipaddr,
    /// Signed 64-bit integer. Unimplemented: `0x8000_0000_0000_0000`.
    Int64,
    /// Unsigned 64-bit integer. Unimplemented: all ones.
    Uint64,
    /// 64-bit accumulator. Value 0 means uninitialised/unimplemented.
    Acc64,
    /// IPv6 address, 8 registers. Unimplemented: all zeroes.
    Ipv6addr,
    /// IEEE-754 single-precision float. NaN means unimplemented.
    Float32,
    /// Fixed-width character string, NUL padded. Unimplemented: leading NUL.
    String,
    /// Scale factor: a signed base-10 exponent applied to a sibling point. Unimplemented:
    /// `0x8000`.
    Sunssf,
    /// EUI-48 address packed into 4 registers with two leading zero bytes. Unimplemented:
    /// `FF:FF:FF:FF:FF:FF`.
    Eui48,
}

impl PointKind {
    /// Look up a point kind from its SMDX type name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int16" => Some(Self::Int16),
            "uint16" => Some(Self::Uint16),
            "count" => Some(Self::Count),
            "acc16" => Some(Self::Acc16),
            "enum16" => Some(Self::Enum16),
            "bitfield16" => Some(Self::Bitfield16),
            "pad" => Some(Self::Pad),
            "int32" => Some(Self::Int32),
            "uint32" => Some(Self::Uint32),
            "acc32" => Some(Self::Acc32),
            "enum32" => Some(Self::Enum32),
            "bitfield32" => Some(Self::Bitfield32),
            "ipaddr" => Some(Self::Ipaddr),
            "int64" => Some(Self::Int64),
            "uint64" => Some(Self::Uint64),
            "acc64" => Some(Self::Acc64),
            "ipv6addr" => Some(Self::Ipv6addr),
            "float32" => Some(Self::Float32),
            "string" => Some(Self::String),
            "sunssf" => Some(Self::Sunssf),
            "eui48" => Some(Self::Eui48),
            _ => None,
        }
    }

    /// The SMDX type name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Count => "count",
            Self::Acc16 => "acc16",
            Self::Enum16 => "enum16",
            Self::Bitfield16 => "bitfield16",
            Self::Pad => "pad",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Acc32 => "acc32",
            Self::Enum32 => "enum32",
            Self::Bitfield32 => "bitfield32",
            Self::Ipaddr => "ipaddr",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Acc64 => "acc64",
            Self::Ipv6addr => "ipv6addr",
            Self::Float32 => "float32",
            Self::String => "string",
            Self::Sunssf => "sunssf",
            Self::Eui48 => "eui48",
        }
    }

    /// Register width of the type, or `None` for `string` whose width comes from the model
    /// definition.
    pub fn registers(&self) -> Option<u16> {
        match self {
            Self::Int16
            | Self::Uint16
            | Self::Count
            | Self::Acc16
            | Self::Enum16
            | Self::Bitfield16
            | Self::Pad
            | Self::Sunssf => Some(1),
            Self::Int32
            | Self::Uint32
            | Self::Acc32
            | Self::Enum32
            | Self::Bitfield32
            | Self::Ipaddr
            | Self::Float32 => Some(2),
            Self::Int64 | Self::Uint64 | Self::Acc64 | Self::Eui48 => Some(4),
            Self::Ipv6addr => Some(8),
            Self::String => None,
        }
    }

    /// `true` for `sunssf` points.
    pub fn is_scale_factor(&self) -> bool {
        matches!(self, Self::Sunssf)
    }

    /// `true` for `pad` points.
    pub fn is_pad(&self) -> bool {
        matches!(self, Self::Pad)
    }
}

impl core::fmt::Display for PointKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
