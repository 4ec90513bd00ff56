//! Integration tests for the battery device
//!
//! These tests drive the device the way the VMM does:
//! - property updates from the host
//! - guest register reads through the MMIO window
//! - ACPI table generation

use std::sync::{Arc, Mutex};

use vbattery::acpi::{self, Element, Value, BST_PACKAGE};
use vbattery::*;

#[derive(Default)]
struct CountingSink {
    count: Mutex<usize>,
}

impl AcpiEventSink for CountingSink {
    fn send_event(&self, status: AcpiEventStatus) {
        assert_eq!(status, AcpiEventStatus::BATTERY_STATUS);
        *self.count.lock().unwrap() += 1;
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The guest evaluates `_BST` element by element; register references are
/// read through the field, i.e. the MMIO window.
fn guest_bst(battery: &Battery) -> Vec<u64> {
    BST_PACKAGE
        .iter()
        .map(|element| match *element {
            Element::Reg(index) => battery.read(index as u64 * REGISTER_WIDTH, 4),
            Element::Int(v) => v,
            Element::Str(_) => unreachable!("_BST has no strings"),
        })
        .collect()
}

#[test]
fn test_charge_now_visible_in_status_package() {
    init_logging();
    let sink = Arc::new(CountingSink::default());
    let mut battery = Battery::new(BatteryConfig::default(), sink.clone());
    battery.realize();

    let table = battery.build_acpi();

    battery.set_property("charge_now", 3000).unwrap();
    assert_eq!(guest_bst(&battery)[2], 3000);
    assert_eq!(BST_PACKAGE[2].resolve(battery.registers()), Value::Int(3000));

    // the table did not need regenerating
    assert_eq!(battery.build_acpi(), table);
    assert_eq!(*sink.count.lock().unwrap(), 1);
}

#[test]
fn test_status_package_tracks_state_changes() {
    init_logging();
    let sink = Arc::new(CountingSink::default());
    let mut battery = Battery::new(BatteryConfig::default(), sink.clone());
    battery.realize();

    battery
        .set_property("state", BatteryState::CHARGING.bits())
        .unwrap();
    battery.set_property("current_now", 750).unwrap();
    battery.set_property("voltage_now", 12600).unwrap();

    assert_eq!(guest_bst(&battery), vec![2, 750, 1500, 12600]);
    assert_eq!(battery.registers().state(), BatteryState::CHARGING);
    assert_eq!(*sink.count.lock().unwrap(), 3);
}

#[test]
fn test_configured_defaults_reach_registers() {
    init_logging();
    let config = BatteryConfig {
        voltage_min_design: 7400,
        charge_full_design: 6000,
        cycle_count: 12,
        ..BatteryConfig::default()
    };
    let battery = Battery::new(config, Arc::new(CountingSink::default()));

    assert_eq!(battery.read(0x30, 4), 7400);
    assert_eq!(battery.read(0x34, 4), 6000);
    assert_eq!(battery.read(0x3C, 4), 12);
    assert_eq!(battery.read(0x20, 4), UNKNOWN as u64);
}

#[test]
fn test_table_places_region_at_configured_base() {
    init_logging();
    let config = BatteryConfig {
        mmio_base: 0xFED0_0000,
        ..BatteryConfig::default()
    };
    let battery = Battery::new(config, Arc::new(CountingSink::default()));
    let table = battery.build_acpi();

    let mut region = b"CBAT\x00\x0C".to_vec();
    region.extend_from_slice(&0xFED0_0000u32.to_le_bytes());
    assert!(table.windows(region.len()).any(|w| w == region.as_slice()));
    assert_eq!(table, acpi::build_ssdt(&acpi::TableLayout::fixed(0xFED0_0000)));
}
