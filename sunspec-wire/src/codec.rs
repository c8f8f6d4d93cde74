//! Encode/decode between typed values and big-endian register bytes.

use crate::{PointKind, Value, WireError};

const EUI48_UNIMPL: &str = "FF:FF:FF:FF:FF:FF";

fn expect_len(data: &[u8], expected: usize) -> Result<(), WireError> {
    if data.len() != expected {
        return Err(WireError::BufferLength {
            expected,
            got: data.len(),
        });
    }

    Ok(())
}

/// Decode `regs` registers worth of big-endian bytes into a typed value.
///
/// Returns `Ok(None)` exactly when the bit pattern is the type's "unimplemented" sentinel. For
/// fixed-width types `regs` must match the type's register width; for `string` it is the
/// declared width from the model definition.
pub fn decode(kind: PointKind, data: &[u8], regs: u16) -> Result<Option<Value>, WireError> {
    let width = kind.registers().unwrap_or(regs);

    expect_len(data, usize::from(width) * 2)?;

    let value = match kind {
        PointKind::Int16 | PointKind::Sunssf | PointKind::Pad => {
            let v = i16::from_be_bytes([data[0], data[1]]);

            (v != i16::MIN).then(|| Value::Integer(v.into()))
        }
        PointKind::Uint16 | PointKind::Count | PointKind::Enum16 | PointKind::Bitfield16 => {
            let v = u16::from_be_bytes([data[0], data[1]]);

            (v != u16::MAX).then(|| Value::Unsigned(v.into()))
        }
        PointKind::Acc16 => {
            let v = u16::from_be_bytes([data[0], data[1]]);

            (v != 0).then(|| Value::Unsigned(v.into()))
        }
        PointKind::Int32 => {
            let v = i32::from_be_bytes(data.try_into().unwrap());

            (v != i32::MIN).then(|| Value::Integer(v.into()))
        }
        PointKind::Uint32 | PointKind::Enum32 | PointKind::Bitfield32 => {
            let v = u32::from_be_bytes(data.try_into().unwrap());

            (v != u32::MAX).then(|| Value::Unsigned(v.into()))
        }
        PointKind::Acc32 | PointKind::Ipaddr => {
            let v = u32::from_be_bytes(data.try_into().unwrap());

            (v != 0).then(|| Value::Unsigned(v.into()))
        }
        PointKind::Int64 => {
            let v = i64::from_be_bytes(data.try_into().unwrap());

            (v != i64::MIN).then(|| Value::Integer(v))
        }
        PointKind::Uint64 => {
            let v = u64::from_be_bytes(data.try_into().unwrap());

            (v != u64::MAX).then(|| Value::Unsigned(v))
        }
        PointKind::Acc64 => {
            let v = u64::from_be_bytes(data.try_into().unwrap());

            (v != 0).then(|| Value::Unsigned(v))
        }
        PointKind::Float32 => {
            let v = f32::from_be_bytes(data.try_into().unwrap());

            (!v.is_nan()).then(|| Value::Float(v.into()))
        }
        PointKind::String => decode_string(data),
        PointKind::Ipv6addr => {
            if data.iter().all(|b| *b == 0) {
                None
            } else {
                let mut groups = data
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes(c.try_into().unwrap()));

                Some(Value::String(format!(
                    "{:08X}:{:08X}:{:08X}:{:08X}",
                    groups.next().unwrap(),
                    groups.next().unwrap(),
                    groups.next().unwrap(),
                    groups.next().unwrap(),
                )))
            }
        }
        PointKind::Eui48 => {
            // First two of the 8 wire bytes are padding
            let s = format!(
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                data[2], data[3], data[4], data[5], data[6], data[7]
            );

            (s != EUI48_UNIMPL).then(|| Value::String(s))
        }
    };

    Ok(value)
}

/// The first byte is preserved as-is; trailing NULs are only stripped from the remainder, so a
/// string deliberately starting with NUL round-trips.
fn decode_string(data: &[u8]) -> Option<Value> {
    let mut end = data.len();

    while end > 1 && data[end - 1] == 0 {
        end -= 1;
    }

    let bytes = &data[..end];

    if bytes.is_empty() || bytes[0] == 0 {
        return None;
    }

    Some(Value::String(
        String::from_utf8_lossy(bytes).into_owned(),
    ))
}

/// Encode a typed value into `regs` registers worth of big-endian bytes.
pub fn encode(kind: PointKind, value: &Value, regs: u16) -> Result<Vec<u8>, WireError> {
    match kind {
        PointKind::Int16 | PointKind::Sunssf | PointKind::Pad => {
            let v = signed(value)?;

            i16::try_from(v)
                .map(|v| v.to_be_bytes().to_vec())
                .map_err(|_| WireError::OutOfRange)
        }
        PointKind::Uint16
        | PointKind::Count
        | PointKind::Acc16
        | PointKind::Enum16
        | PointKind::Bitfield16 => {
            let v = unsigned(value)?;

            u16::try_from(v)
                .map(|v| v.to_be_bytes().to_vec())
                .map_err(|_| WireError::OutOfRange)
        }
        PointKind::Int32 => {
            let v = signed(value)?;

            i32::try_from(v)
                .map(|v| v.to_be_bytes().to_vec())
                .map_err(|_| WireError::OutOfRange)
        }
        PointKind::Uint32
        | PointKind::Acc32
        | PointKind::Enum32
        | PointKind::Bitfield32
        | PointKind::Ipaddr => {
            let v = unsigned(value)?;

            u32::try_from(v)
                .map(|v| v.to_be_bytes().to_vec())
                .map_err(|_| WireError::OutOfRange)
        }
        PointKind::Int64 => Ok(signed(value)?.to_be_bytes().to_vec()),
        PointKind::Uint64 | PointKind::Acc64 => Ok(unsigned(value)?.to_be_bytes().to_vec()),
        PointKind::Float32 => {
            let v = value.as_f64().ok_or(WireError::ValueKind)?;

            Ok((v as f32).to_be_bytes().to_vec())
        }
        PointKind::String => {
            let s = value.as_str().ok_or(WireError::ValueKind)?;
            let width = usize::from(regs) * 2;

            let mut out = s.as_bytes().to_vec();

            out.resize(width, 0);

            Ok(out)
        }
        PointKind::Ipv6addr => {
            let s = value.as_str().ok_or(WireError::ValueKind)?;

            let mut out = Vec::with_capacity(16);

            for group in s.split(':') {
                let v = u32::from_str_radix(group, 16).map_err(|_| WireError::Parse)?;

                out.extend_from_slice(&v.to_be_bytes());
            }

            if out.len() != 16 {
                return Err(WireError::Parse);
            }

            Ok(out)
        }
        PointKind::Eui48 => {
            let s = value.as_str().ok_or(WireError::ValueKind)?;

            let mut out = vec![0u8, 0u8];

            for octet in s.split(':') {
                out.push(u8::from_str_radix(octet, 16).map_err(|_| WireError::Parse)?);
            }

            if out.len() != 8 {
                return Err(WireError::Parse);
            }

            Ok(out)
        }
    }
}

fn signed(value: &Value) -> Result<i64, WireError> {
    match value {
        Value::Integer(v) => Ok(*v),
        Value::Unsigned(v) => i64::try_from(*v).map_err(|_| WireError::OutOfRange),
        Value::Float(_) | Value::String(_) => Err(WireError::ValueKind),
    }
}

fn unsigned(value: &Value) -> Result<u64, WireError> {
    match value {
        Value::Unsigned(v) => Ok(*v),
        Value::Integer(v) => u64::try_from(*v).map_err(|_| WireError::OutOfRange),
        Value::Float(_) | Value::String(_) => Err(WireError::ValueKind),
    }
}

/// The "unimplemented" sentinel bit pattern for a type, as `regs` registers of wire bytes.
///
/// Writing this pattern back is what keeps unimplemented points round-trip stable.
pub fn sentinel(kind: PointKind, regs: u16) -> Vec<u8> {
    let width = usize::from(kind.registers().unwrap_or(regs)) * 2;

    match kind {
        PointKind::Int16 | PointKind::Sunssf | PointKind::Pad => vec![0x80, 0x00],
        PointKind::Uint16 | PointKind::Count | PointKind::Enum16 | PointKind::Bitfield16 => {
            vec![0xff, 0xff]
        }
        PointKind::Int32 => vec![0x80, 0x00, 0x00, 0x00],
        PointKind::Uint32 | PointKind::Enum32 | PointKind::Bitfield32 => vec![0xff; 4],
        PointKind::Int64 => vec![0x80, 0, 0, 0, 0, 0, 0, 0],
        PointKind::Uint64 => vec![0xff; 8],
        PointKind::Float32 => vec![0x7f, 0xc0, 0x00, 0x00],
        PointKind::Eui48 => vec![0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
        // Accumulators, ipaddr, ipv6addr and strings are all-zero when unimplemented
        PointKind::Acc16
        | PointKind::Acc32
        | PointKind::Acc64
        | PointKind::Ipaddr
        | PointKind::Ipv6addr
        | PointKind::String => vec![0; width],
    }
}

/// `false` exactly when `value` equals the type's "unimplemented" sentinel.
///
/// Accumulator types use 0 for "uninitialised" which conflates a reset counter with an
/// unimplemented point; that convention is preserved here.
pub fn is_implemented(kind: PointKind, value: &Value) -> bool {
    match kind {
        PointKind::Int16 | PointKind::Sunssf | PointKind::Pad => {
            value.as_i64() != Some(i64::from(i16::MIN))
        }
        PointKind::Uint16 | PointKind::Count | PointKind::Enum16 | PointKind::Bitfield16 => {
            value.as_i64() != Some(i64::from(u16::MAX))
        }
        PointKind::Acc16 | PointKind::Acc32 | PointKind::Acc64 | PointKind::Ipaddr => {
            value.as_i64() != Some(0)
        }
        PointKind::Int32 => value.as_i64() != Some(i64::from(i32::MIN)),
        PointKind::Uint32 | PointKind::Enum32 | PointKind::Bitfield32 => {
            value.as_i64() != Some(i64::from(u32::MAX))
        }
        PointKind::Int64 => value.as_i64() != Some(i64::MIN),
        PointKind::Uint64 => !matches!(value, Value::Unsigned(v) if *v == u64::MAX),
        PointKind::Float32 => matches!(value.as_f64(), Some(v) if !v.is_nan()),
        PointKind::String | PointKind::Ipv6addr => {
            matches!(value.as_str(), Some(s) if !s.is_empty() && !s.starts_with('\0'))
        }
        PointKind::Eui48 => value.as_str() != Some(EUI48_UNIMPL),
    }
}

/// Coerce a string into the type's value space, e.g. `"42"` → `42` for `int16`.
///
/// Used when loading snapshot documents and when assigning string input through the typed value
/// accessor. Integer types accept a `0x` prefix.
pub fn value_from_str(kind: PointKind, s: &str) -> Result<Value, WireError> {
    match kind {
        PointKind::Int16 | PointKind::Sunssf | PointKind::Pad | PointKind::Int32 | PointKind::Int64 => {
            parse_i64(s).map(Value::Integer)
        }
        PointKind::Uint16
        | PointKind::Count
        | PointKind::Acc16
        | PointKind::Enum16
        | PointKind::Bitfield16
        | PointKind::Uint32
        | PointKind::Acc32
        | PointKind::Enum32
        | PointKind::Bitfield32
        | PointKind::Ipaddr
        | PointKind::Uint64
        | PointKind::Acc64 => parse_u64(s).map(Value::Unsigned),
        PointKind::Float32 => s.trim().parse::<f64>().map(Value::Float).map_err(|_| WireError::Parse),
        PointKind::String | PointKind::Ipv6addr | PointKind::Eui48 => {
            Ok(Value::String(s.to_string()))
        }
    }
}

fn parse_i64(s: &str) -> Result<i64, WireError> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).map_err(|_| WireError::Parse)
    } else {
        s.parse().map_err(|_| WireError::Parse)
    }
}

fn parse_u64(s: &str) -> Result<u64, WireError> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| WireError::Parse)
    } else {
        s.parse().map_err(|_| WireError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int16_negative() {
        let bytes = encode(PointKind::Int16, &Value::Integer(-2), 1).unwrap();

        assert_eq!(bytes, vec![0xff, 0xfe]);
        assert_eq!(
            decode(PointKind::Int16, &bytes, 1).unwrap(),
            Some(Value::Integer(-2))
        );
    }

    #[test]
    fn uint16_sentinel() {
        assert_eq!(decode(PointKind::Uint16, &[0xff, 0xff], 1).unwrap(), None);
    }

    #[test]
    fn acc32_zero_is_unimplemented() {
        assert_eq!(decode(PointKind::Acc32, &[0, 0, 0, 0], 2).unwrap(), None);
        assert!(!is_implemented(PointKind::Acc32, &Value::Unsigned(0)));
    }

    #[test]
    fn float32_nan_is_unimplemented() {
        assert_eq!(
            decode(PointKind::Float32, &sentinel(PointKind::Float32, 2), 2).unwrap(),
            None
        );
    }

    #[test]
    fn string_preserves_first_byte_strips_trailing_nuls() {
        let decoded = decode(PointKind::String, b"ab\0\0\0\0\0\0", 4).unwrap();

        assert_eq!(decoded, Some(Value::String("ab".to_string())));

        // A leading NUL marks the whole string unimplemented
        assert_eq!(decode(PointKind::String, b"\0bcd", 2).unwrap(), None);
    }

    #[test]
    fn string_pads_to_width() {
        let bytes = encode(PointKind::String, &Value::from("abc"), 4).unwrap();

        assert_eq!(bytes, b"abc\0\0\0\0\0");
    }

    #[test]
    fn eui48_two_leading_pad_bytes() {
        let bytes = encode(
            PointKind::Eui48,
            &Value::from("01:23:45:67:89:AB"),
            4,
        )
        .unwrap();

        assert_eq!(bytes, vec![0, 0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab]);
        assert_eq!(
            decode(PointKind::Eui48, &bytes, 4).unwrap(),
            Some(Value::String("01:23:45:67:89:AB".to_string()))
        );
    }

    #[test]
    fn ipv6addr_four_hex_groups() {
        let mut raw = vec![0x20, 0x01, 0x0d, 0xb8];

        raw.resize(15, 0);
        raw.push(1);

        assert_eq!(
            decode(PointKind::Ipv6addr, &raw, 8).unwrap(),
            Some(Value::String(
                "20010DB8:00000000:00000000:00000001".to_string()
            ))
        );
    }

    #[test]
    fn coercion() {
        assert_eq!(
            value_from_str(PointKind::Int16, "42").unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            value_from_str(PointKind::Uint32, "0x10").unwrap(),
            Value::Unsigned(16)
        );
        assert!(value_from_str(PointKind::Int16, "forty-two").is_err());
    }

    #[test]
    fn wrong_buffer_length() {
        assert_eq!(
            decode(PointKind::Int32, &[0, 1], 2),
            Err(WireError::BufferLength {
                expected: 4,
                got: 2
            })
        );
    }
}
