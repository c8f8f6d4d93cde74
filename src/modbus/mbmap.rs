//! File-backed Modbus register map.
//!
//! An mbmap XML document describes the register contents of a simulated device: a `mbmap` root
//! with `addr` (base address, default 40000) and `func` (`holding` or `input`, default
//! `holding`) attributes and a sequence of `regs` children. Each `regs` element carries
//! `offset`, `len`, `type` and `access` attributes and encodes its value in its text content.
//! Offsets must be strictly ascending with no overlap; contiguous entries are merged into
//! register runs internally.
//!
//! [`MappedTransport`] serves Modbus reads and writes from such a map, which is how the test
//! suite and offline tools exercise the whole client stack without hardware. Note that a request
//! whose function code disagrees with the map's declared function fails with
//! [`MapError::FunctionMismatch`]: callers must tag reads with the correct op.

use crate::error::{Error, MapError};
use crate::modbus::{FunctionCode, ModbusTransport};
use crate::pathlist::PathList;

/// Default base address of a register map.
pub const BASE_ADDR_DEFAULT: u16 = 40000;

/// Access declared on a run of registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RegAccess {
    /// Read-only.
    #[default]
    R,
    /// Read/write.
    Rw,
}

/// A contiguous run of mapped registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusMapRegs {
    /// Register offset of the run, relative to the map base address.
    pub offset: u16,
    /// Register count.
    pub count: u16,
    /// Register bytes, big-endian, `2 * count` long.
    pub data: Vec<u8>,
    /// Declared access.
    pub access: RegAccess,
}

impl ModbusMapRegs {
    /// Compare two runs, ignoring `access` which the XML form does not persist.
    fn diff(&self, other: &ModbusMapRegs) -> Option<String> {
        if self.offset != other.offset {
            return Some(format!("offset mismatch: {} {}", self.offset, other.offset));
        }

        if self.count != other.count {
            return Some(format!(
                "count mismatch for offset {}: {} {}",
                self.offset, self.count, other.count
            ));
        }

        if self.data != other.data {
            for (i, (a, b)) in self.data.iter().zip(other.data.iter()).enumerate() {
                if a != b {
                    return Some(format!(
                        "data mismatch at offset {}",
                        usize::from(self.offset) + i / 2
                    ));
                }
            }
        }

        None
    }
}

/// An in-memory Modbus register map.
#[derive(Debug, Clone)]
pub struct ModbusMap {
    func: FunctionCode,
    base_addr: u16,
    regs: Vec<ModbusMapRegs>,
}

impl ModbusMap {
    /// Create an empty map.
    pub fn new(func: FunctionCode, base_addr: u16) -> Self {
        Self {
            func,
            base_addr,
            regs: Vec::new(),
        }
    }

    /// The function code the map serves.
    pub fn func(&self) -> FunctionCode {
        self.func
    }

    /// The map's base address.
    pub fn base_addr(&self) -> u16 {
        self.base_addr
    }

    /// The merged register runs.
    pub fn regs(&self) -> &[ModbusMapRegs] {
        &self.regs
    }

    /// Load a map document found through the path list (or the plain filesystem when no path
    /// list is given).
    pub fn from_xml(filename: &str, pathlist: Option<&PathList>) -> Result<Self, Error> {
        let data = match pathlist {
            Some(pathlist) => pathlist.read(filename)?,
            None => std::fs::read(filename)?,
        };

        let text = String::from_utf8_lossy(&data);

        Self::from_xml_str(&text)
    }

    /// Parse a map document.
    pub fn from_xml_str(xml: &str) -> Result<Self, Error> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| MapError::Document(e.to_string()))?;
        let root = doc.root_element();

        if root.tag_name().name() != "mbmap" {
            return Err(MapError::Document(format!(
                "unexpected root element '{}'",
                root.tag_name().name()
            ))
            .into());
        }

        let func = match root.attribute("func").unwrap_or("holding") {
            "holding" => FunctionCode::ReadHolding,
            "input" => FunctionCode::ReadInput,
            other => return Err(MapError::UnsupportedFunction(other.to_string()).into()),
        };

        let base_addr = match root.attribute("addr") {
            Some(addr) => addr
                .parse()
                .map_err(|_| MapError::Document(format!("bad addr attribute '{}'", addr)))?,
            None => BASE_ADDR_DEFAULT,
        };

        let mut map = Self::new(func, base_addr);
        let mut next_offset = 0u16;

        for regs in root.children().filter(|n| n.is_element()) {
            if regs.tag_name().name() != "regs" {
                return Err(MapError::Document(format!(
                    "unexpected element '{}'",
                    regs.tag_name().name()
                ))
                .into());
            }

            let offset = match regs.attribute("offset") {
                Some(offset) => offset.parse().map_err(|_| {
                    MapError::Document(format!("bad offset attribute '{}'", offset))
                })?,
                None => next_offset,
            };

            let declared_len: u16 = match regs.attribute("len") {
                Some(len) => len
                    .parse()
                    .map_err(|_| MapError::Document(format!("bad len attribute '{}'", len)))?,
                None => 0,
            };

            let rtype = regs.attribute("type").unwrap_or("hexstr");
            let access = match regs.attribute("access").unwrap_or("r") {
                "rw" => RegAccess::Rw,
                _ => RegAccess::R,
            };
            let text = regs.text().unwrap_or("");

            let (data, count) = encode_regs(rtype, text, declared_len, offset)?;

            map.push(offset, count, data, access)?;

            next_offset = offset + count;
        }

        Ok(map)
    }

    /// Serialise the map back to its XML form. Only merged runs are emitted, as hex strings.
    pub fn to_xml(&self) -> String {
        let func = match self.func {
            FunctionCode::ReadInput => "input",
            _ => "holding",
        };

        let mut out = format!("<mbmap addr=\"{}\" func=\"{}\">\n", self.base_addr, func);

        for regs in &self.regs {
            let mut hex = String::with_capacity(regs.data.len() * 2);

            for byte in &regs.data {
                hex.push_str(&format!("{:02x}", byte));
            }

            out.push_str(&format!(
                "  <regs offset=\"{}\" len=\"{}\">{}</regs>\n",
                regs.offset, regs.count, hex
            ));
        }

        out.push_str("</mbmap>\n");

        out
    }

    /// Append a zero-filled run at `offset`.
    pub fn regs_add(&mut self, offset: u16, count: u16, access: RegAccess) -> Result<(), Error> {
        self.push(offset, count, vec![0; usize::from(count) * 2], access)
    }

    fn push(
        &mut self,
        offset: u16,
        count: u16,
        data: Vec<u8>,
        access: RegAccess,
    ) -> Result<(), Error> {
        let previous_end = self
            .regs
            .last()
            .map(|last| last.offset + last.count)
            .unwrap_or(0);

        if offset < previous_end && !self.regs.is_empty() {
            return Err(MapError::Overlap {
                offset,
                previous_end,
            }
            .into());
        }

        match self.regs.last_mut() {
            // Contiguous entries merge into the previous run
            Some(last) if offset == previous_end => {
                last.count += count;
                last.data.extend_from_slice(&data);
            }
            _ => self.regs.push(ModbusMapRegs {
                offset,
                count,
                data,
                access,
            }),
        }

        Ok(())
    }

    /// Read `count` registers at absolute address `addr`. Every requested register must lie in a
    /// mapped run.
    pub fn read(&self, addr: u16, count: u16, func: FunctionCode) -> Result<Vec<u8>, Error> {
        if func != self.func {
            return Err(MapError::FunctionMismatch {
                requested: func,
                map: self.func,
            }
            .into());
        }

        let mut data = Vec::with_capacity(usize::from(count) * 2);
        let mut offset = addr.wrapping_sub(self.base_addr);
        let mut remaining = count;

        if addr < self.base_addr {
            return Err(MapError::ReadRange { addr, count }.into());
        }

        for regs in &self.regs {
            if remaining == 0 {
                break;
            }

            let regs_end = regs.offset + regs.count;

            if offset >= regs.offset && offset < regs_end {
                let chunk = (regs_end - offset).min(remaining);
                let start = usize::from(offset - regs.offset) * 2;
                let end = start + usize::from(chunk) * 2;

                data.extend_from_slice(&regs.data[start..end]);

                offset += chunk;
                remaining -= chunk;
            }
        }

        if data.len() != usize::from(count) * 2 {
            return Err(MapError::ReadRange { addr, count }.into());
        }

        Ok(data)
    }

    /// Write register bytes at absolute address `addr`. Every touched register must lie in a
    /// mapped run.
    pub fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        if data.len() % 2 != 0 {
            return Err(MapError::OddDataLength(data.len()).into());
        }

        let count = (data.len() / 2) as u16;

        if addr < self.base_addr {
            return Err(MapError::WriteRange { addr, count }.into());
        }

        let mut offset = addr - self.base_addr;
        let mut data_offset = 0usize;
        let mut remaining = count;

        for regs in &mut self.regs {
            if remaining == 0 {
                break;
            }

            let regs_end = regs.offset + regs.count;

            if offset >= regs.offset && offset < regs_end {
                let chunk = (regs_end - offset).min(remaining);
                let start = usize::from(offset - regs.offset) * 2;
                let end = start + usize::from(chunk) * 2;

                regs.data[start..end]
                    .copy_from_slice(&data[data_offset..data_offset + usize::from(chunk) * 2]);

                offset += chunk;
                data_offset += usize::from(chunk) * 2;
                remaining -= chunk;
            }
        }

        if remaining > 0 {
            return Err(MapError::WriteRange { addr, count }.into());
        }

        Ok(())
    }

    /// Deep comparison. Returns a diagnostic string on the first mismatch, `None` on equality.
    pub fn diff(&self, other: &ModbusMap) -> Option<String> {
        if self.base_addr != other.base_addr {
            return Some(format!(
                "base address mismatch: {} {}",
                self.base_addr, other.base_addr
            ));
        }

        if self.func != other.func {
            return Some(format!(
                "function mismatch: {:?} {:?}",
                self.func, other.func
            ));
        }

        if self.regs.len() != other.regs.len() {
            return Some("register run count mismatch".to_string());
        }

        self.regs
            .iter()
            .zip(other.regs.iter())
            .find_map(|(a, b)| a.diff(b))
    }
}

/// Encode one `regs` element's text into register bytes. Returns the bytes and register count.
fn encode_regs(
    rtype: &str,
    text: &str,
    declared_len: u16,
    offset: u16,
) -> Result<(Vec<u8>, u16), Error> {
    let bad = |text: &str| MapError::BadRegValue {
        offset,
        text: text.to_string(),
    };

    let numeric_text = if text.is_empty() { "0" } else { text };

    match rtype {
        "s16" => {
            let v = parse_i64(numeric_text).ok_or_else(|| bad(text))?;
            let v = i16::try_from(v).map_err(|_| bad(text))?;

            Ok((v.to_be_bytes().to_vec(), 1))
        }
        "u16" => {
            let v = parse_u64(numeric_text).ok_or_else(|| bad(text))?;
            let v = u16::try_from(v).map_err(|_| bad(text))?;

            Ok((v.to_be_bytes().to_vec(), 1))
        }
        "s32" => {
            let v = parse_i64(numeric_text).ok_or_else(|| bad(text))?;
            let v = i32::try_from(v).map_err(|_| bad(text))?;

            Ok((v.to_be_bytes().to_vec(), 2))
        }
        "u32" => {
            let v = parse_u64(numeric_text).ok_or_else(|| bad(text))?;
            let v = u32::try_from(v).map_err(|_| bad(text))?;

            Ok((v.to_be_bytes().to_vec(), 2))
        }
        "s64" => {
            let v = parse_i64(numeric_text).ok_or_else(|| bad(text))?;

            Ok((v.to_be_bytes().to_vec(), 4))
        }
        "u64" => {
            let v = parse_u64(numeric_text).ok_or_else(|| bad(text))?;

            Ok((v.to_be_bytes().to_vec(), 4))
        }
        "f32" => {
            let v: f32 = numeric_text.parse().map_err(|_| bad(text))?;

            Ok((v.to_be_bytes().to_vec(), 2))
        }
        "f64" => {
            let v: f64 = numeric_text.parse().map_err(|_| bad(text))?;

            Ok((v.to_be_bytes().to_vec(), 4))
        }
        "string" => {
            let count = if declared_len == 0 {
                (text.len() as u16).div_ceil(2)
            } else {
                declared_len
            };

            let mut data = text.as_bytes().to_vec();

            data.truncate(usize::from(count) * 2);
            data.resize(usize::from(count) * 2, 0);

            Ok((data, count))
        }
        "hexstr" => {
            let text: String = text.chars().filter(|c| !c.is_whitespace()).collect();

            if text.len() % 4 != 0 {
                return Err(MapError::HexLength(offset).into());
            }

            let count = if declared_len == 0 {
                (text.len() / 4) as u16
            } else {
                declared_len
            };

            let mut data = Vec::with_capacity(usize::from(count) * 2);

            for pair in text.as_bytes().chunks(2) {
                let pair = std::str::from_utf8(pair).map_err(|_| bad(&text))?;

                data.push(u8::from_str_radix(pair, 16).map_err(|_| bad(&text))?);
            }

            data.resize(usize::from(count) * 2, 0);

            Ok((data, count))
        }
        other => Err(MapError::UnknownRegType {
            offset,
            name: other.to_string(),
        }
        .into()),
    }
}

fn parse_i64(s: &str) -> Option<i64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// A Modbus backend that reads and writes an in-memory [`ModbusMap`].
pub struct MappedTransport {
    map: ModbusMap,
}

impl MappedTransport {
    /// Load the map file `filename` through the path list.
    pub fn new(filename: &str, pathlist: Option<&PathList>) -> Result<Self, Error> {
        Ok(Self {
            map: ModbusMap::from_xml(filename, pathlist)?,
        })
    }

    /// Serve an already-built map.
    pub fn from_map(map: ModbusMap) -> Self {
        Self { map }
    }

    /// The backing map.
    pub fn map(&self) -> &ModbusMap {
        &self.map
    }
}

impl ModbusTransport for MappedTransport {
    fn read(&mut self, addr: u16, count: u16, func: FunctionCode) -> Result<Vec<u8>, Error> {
        self.map.read(addr, count, func)
    }

    fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), Error> {
        self.map.write(addr, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = r#"
<mbmap addr="40000" func="holding">
  <regs offset="0" type="string" len="2">SunS</regs>
  <regs offset="2" type="u16">1</regs>
  <regs offset="3" type="u16">66</regs>
  <regs offset="4" type="hexstr">00010002</regs>
</mbmap>
"#;

    #[test]
    fn contiguous_entries_merge_into_one_run() {
        let map = ModbusMap::from_xml_str(MAP).unwrap();

        assert_eq!(map.regs().len(), 1);
        assert_eq!(map.regs()[0].offset, 0);
        assert_eq!(map.regs()[0].count, 6);
    }

    #[test]
    fn gap_starts_a_new_run() {
        let xml = r#"
<mbmap addr="40000">
  <regs offset="0" type="u16">1</regs>
  <regs offset="10" type="u16">2</regs>
</mbmap>
"#;

        let map = ModbusMap::from_xml_str(xml).unwrap();

        assert_eq!(map.regs().len(), 2);
        assert_eq!(map.regs()[1].offset, 10);
    }

    #[test]
    fn overlap_is_rejected() {
        let xml = r#"
<mbmap addr="40000">
  <regs offset="0" type="u32">1</regs>
  <regs offset="1" type="u16">2</regs>
</mbmap>
"#;

        let result = ModbusMap::from_xml_str(xml);

        assert!(matches!(
            result,
            Err(Error::Map(MapError::Overlap { .. }))
        ));
    }

    #[test]
    fn read_outside_runs_fails() {
        let map = ModbusMap::from_xml_str(MAP).unwrap();

        assert!(map.read(40000, 2, FunctionCode::ReadHolding).is_ok());
        assert!(matches!(
            map.read(40004, 4, FunctionCode::ReadHolding),
            Err(Error::Map(MapError::ReadRange { .. }))
        ));
    }

    #[test]
    fn function_mismatch_is_rejected() {
        let map = ModbusMap::from_xml_str(MAP).unwrap();

        assert!(matches!(
            map.read(40000, 2, FunctionCode::ReadInput),
            Err(Error::Map(MapError::FunctionMismatch { .. }))
        ));
    }

    #[test]
    fn missing_func_defaults_to_holding() {
        let map = ModbusMap::from_xml_str("<mbmap addr=\"0\"><regs type=\"u16\">7</regs></mbmap>")
            .unwrap();

        assert_eq!(map.func(), FunctionCode::ReadHolding);
        assert_eq!(map.read(0, 1, FunctionCode::ReadHolding).unwrap(), [0, 7]);
    }

    #[test]
    fn write_updates_registers() {
        let mut map = ModbusMap::from_xml_str(MAP).unwrap();

        map.write(40002, &[0x12, 0x34]).unwrap();

        assert_eq!(
            map.read(40002, 1, FunctionCode::ReadHolding).unwrap(),
            [0x12, 0x34]
        );

        assert!(matches!(
            map.write(40006, &[0, 0]),
            Err(Error::Map(MapError::WriteRange { .. }))
        ));
    }

    #[test]
    fn xml_roundtrip() {
        let map = ModbusMap::from_xml_str(MAP).unwrap();
        let reparsed = ModbusMap::from_xml_str(&map.to_xml()).unwrap();

        assert_eq!(map.diff(&reparsed), None);
    }

    #[test]
    fn bad_hex_length() {
        let xml = "<mbmap><regs type=\"hexstr\">123</regs></mbmap>";

        assert!(matches!(
            ModbusMap::from_xml_str(xml),
            Err(Error::Map(MapError::HexLength(_)))
        ));
    }
}
