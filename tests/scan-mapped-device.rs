//! Scan and read a simulated device end to end, then check the tree against its snapshot.

mod util;

use pretty_assertions::assert_eq;
use sunspec::Device;
use sunspec_wire::Value;
use util::{data_pathlist, mapped_device, recording_mapped_device, registry};

#[test]
fn signature_probe_finds_base_40000() {
    let mut client = mapped_device("mbmap_test_device_1.xml");

    client.scan().unwrap();

    assert_eq!(client.device().base_addr(), Some(40000));
    assert_eq!(client.device().models()[0].id(), 1);
}

#[test]
fn chain_terminates_at_end_marker() {
    let mut client = mapped_device("mbmap_test_device_1.xml");

    client.scan().unwrap();

    let ids: Vec<u16> = client.device().models().iter().map(|m| m.id()).collect();

    assert_eq!(ids, [1, 63001]);
}

#[test]
fn common_model_values() {
    let mut client = mapped_device("mbmap_test_device_1.xml");

    client.scan().unwrap();
    client.read_points().unwrap();

    let common = client.model("common").unwrap();

    assert_eq!(
        common.model_type().unwrap().label.as_deref(),
        Some("Common")
    );

    for (id, expected) in [
        ("Mn", "SunSpecTest"),
        ("Md", "TestDevice-1"),
        ("Opt", "opt_a_b_c"),
        ("Vr", "1.2.3"),
        ("SN", "sn-123456789"),
    ] {
        assert_eq!(
            common.point(id).unwrap().value(),
            Some(Value::from(expected)),
            "point {}",
            id
        );
    }

    assert_eq!(
        common.point("DA").unwrap().value(),
        Some(Value::Unsigned(1))
    );
}

#[test]
fn scan_and_read_matches_snapshot() {
    let mut client = mapped_device("mbmap_test_device_1.xml");

    client.scan().unwrap();
    client.read_points().unwrap();

    let registry = registry();
    let pathlist = data_pathlist();
    let snapshot = Device::from_pics("pics_test_device_1.xml", Some(&pathlist), &registry).unwrap();

    assert_eq!(snapshot.diff(client.device()), None);
}

#[test]
fn model_63001_reads_are_partitioned() {
    let (mut client, log) = recording_mapped_device("mbmap_test_device_1.xml");

    client.scan().unwrap();

    let model = client.device().models_by_id(63001)[0];

    assert_eq!(model.read_blocks(), &[40072, 40186]);

    log.clear();
    client.read_named("model_63001").unwrap();

    // Two reads covering [40072, 40260) exactly once, both under the 125-register limit
    assert_eq!(log.reads(), [(40072, 114), (40186, 74)]);
}

#[test]
fn unimplemented_points_read_as_absent() {
    let mut client = mapped_device("mbmap_test_device_1.xml");

    client.scan().unwrap();
    client.read_points().unwrap();

    let model = &client.device().models_by_id(63001)[0];

    for id in [
        "int16_u",
        "uint16_u",
        "acc16_u",
        "enum16_u",
        "bitfield16_u",
        "int32_u",
        "uint32_u",
        "acc32_u",
        "enum32_u",
        "bitfield32_u",
        "ipaddr_u",
        "int64_u",
        "acc64_u",
        "ipv6addr",
        "ipv6addr_u",
        "float32_u",
        "string_u",
    ] {
        let point = model.point(id).unwrap();

        assert!(!point.is_implemented(), "point {} must be absent", id);
        assert_eq!(point.value(), None, "point {}", id);
    }
}
