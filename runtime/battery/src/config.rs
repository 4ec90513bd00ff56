//! Battery construction-time configuration

use serde::Deserialize;

/// Default base of the register window.
pub const DEFAULT_MMIO_BASE: u64 = 0x4040;

/// Register defaults applied when the device is created.
///
/// Voltages are in mV, currents in mA and charges in mAh.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub mmio_base: u64,
    pub state: u32,
    pub voltage_now: u32,
    pub current_now: u32,
    pub charge_now: u32,
    pub voltage_min_design: u32,
    pub charge_full_design: u32,
    pub charge_full: u32,
    pub cycle_count: u32,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            mmio_base: DEFAULT_MMIO_BASE,
            state: 0,
            voltage_now: 12000,
            current_now: 0,
            charge_now: 1500,
            voltage_min_design: 10800,
            charge_full_design: 5000,
            charge_full: 4800,
            cycle_count: 0,
        }
    }
}
