//! Different spellings of the same register map must normalise to the same runs, and a map must
//! survive an XML round trip.

mod util;

use pretty_assertions::assert_eq;
use sunspec::error::{Error, MapError};
use sunspec::modbus::FunctionCode;
use sunspec::modbus::mbmap::ModbusMap;
use util::data_pathlist;

fn load(filename: &str) -> ModbusMap {
    let pathlist = data_pathlist();

    ModbusMap::from_xml(filename, Some(&pathlist)).unwrap()
}

#[test]
fn variant_spellings_are_equivalent() {
    let base = load("mbmap_test_device_3.xml");

    for variant in [
        "mbmap_test_device_3_a.xml",
        "mbmap_test_device_3_b.xml",
        "mbmap_test_device_3_c.xml",
    ] {
        let map = load(variant);

        assert_eq!(base.diff(&map), None, "variant {}", variant);
    }
}

#[test]
fn xml_roundtrip() {
    for filename in ["mbmap_test_device_1.xml", "mbmap_test_device_3.xml"] {
        let map = load(filename);
        let reparsed = ModbusMap::from_xml_str(&map.to_xml()).unwrap();

        assert_eq!(map.diff(&reparsed), None, "map {}", filename);
    }
}

#[test]
fn contiguous_entries_merge_into_a_single_run() {
    let map = load("mbmap_test_device_1.xml");

    assert_eq!(map.regs().len(), 1);
    assert_eq!(map.regs()[0].offset, 0);
    assert_eq!(map.regs()[0].count, 261);
}

#[test]
fn reads_outside_the_map_fail() {
    let map = load("mbmap_test_device_3.xml");

    assert!(map.read(40000, 25, FunctionCode::ReadHolding).is_ok());
    assert!(matches!(
        map.read(40000, 26, FunctionCode::ReadHolding),
        Err(Error::Map(MapError::ReadRange { .. }))
    ));
    assert!(matches!(
        map.read(39999, 1, FunctionCode::ReadHolding),
        Err(Error::Map(MapError::ReadRange { .. }))
    ));
}

#[test]
fn function_mismatch_fails() {
    let map = load("mbmap_test_device_3_c.xml");

    // func attribute omitted: the map defaults to holding and rejects input-tagged reads
    assert_eq!(map.func(), FunctionCode::ReadHolding);
    assert!(matches!(
        map.read(40000, 2, FunctionCode::ReadInput),
        Err(Error::Map(MapError::FunctionMismatch { .. }))
    ));
}
