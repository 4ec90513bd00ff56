//! Register File - fixed bank of 32-bit battery telemetry registers
//!
//! Registers sit 4 bytes apart starting at offset 0. Indices without a
//! defined role are reserved and read as [`UNKNOWN`] until written.

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::config::BatteryConfig;

pub const R_STATE: usize = 0;
pub const R_VOLTAGE_NOW: usize = 1;
pub const R_CURRENT_NOW: usize = 2;
pub const R_CHARGE_NOW: usize = 3;
pub const R_VOLTAGE_MIN_DESIGN: usize = 12;
pub const R_CHARGE_FULL_DESIGN: usize = 13;
pub const R_CHARGE_FULL: usize = 14;
pub const R_CYCLE_COUNT: usize = 15;

/// Highest valid register index.
pub const R_MAX: usize = 15;

pub const REGISTER_COUNT: usize = R_MAX + 1;

/// Width of one register in bytes.
pub const REGISTER_WIDTH: u64 = 4;

/// Length of the register window in bytes.
pub const MMIO_LEN: u64 = REGISTER_COUNT as u64 * REGISTER_WIDTH;

/// Value reported for reserved registers and out-of-range reads.
pub const UNKNOWN: u32 = 0xFFFF_FFFF;

// Field names carry the index as two decimal digits.
const_assert!(R_MAX < 100);

bitflags! {
    /// Contents of the state register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BatteryState: u32 {
        const DISCHARGING = 1 << 0;
        const CHARGING = 1 << 1;
    }
}

/// What a register measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    State,
    Voltage,
    Current,
    Charge,
    Capacity,
    CycleCount,
    Unknown,
}

/// One named register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub name: &'static str,
    pub offset: u64,
    pub role: Role,
    pub value: u32,
}

const RESERVED: (&str, Role) = ("reserved", Role::Unknown);

const LAYOUT: [(&str, Role); REGISTER_COUNT] = [
    ("state", Role::State),
    ("voltage_now", Role::Voltage),
    ("current_now", Role::Current),
    ("charge_now", Role::Charge),
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    ("voltage_min_design", Role::Voltage),
    ("charge_full_design", Role::Capacity),
    ("charge_full", Role::Capacity),
    ("cycle_count", Role::CycleCount),
];

/// How a register may be reached through the property table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Named entry of the property table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterProperty {
    pub name: &'static str,
    pub index: usize,
    pub access: Access,
}

const fn prop(name: &'static str, index: usize, access: Access) -> RegisterProperty {
    RegisterProperty {
        name,
        index,
        access,
    }
}

/// Properties the host may query and update at runtime.
///
/// Design values are fixed once the device is constructed.
pub const PROPERTIES: &[RegisterProperty] = &[
    prop("state", R_STATE, Access::ReadWrite),
    prop("voltage_now", R_VOLTAGE_NOW, Access::ReadWrite),
    prop("current_now", R_CURRENT_NOW, Access::ReadWrite),
    prop("charge_now", R_CHARGE_NOW, Access::ReadWrite),
    prop("voltage_min_design", R_VOLTAGE_MIN_DESIGN, Access::ReadOnly),
    prop("charge_full_design", R_CHARGE_FULL_DESIGN, Access::ReadOnly),
    prop("charge_full", R_CHARGE_FULL, Access::ReadWrite),
    prop("cycle_count", R_CYCLE_COUNT, Access::ReadWrite),
];

/// Look up a property by name.
pub fn find_property(name: &str) -> Option<&'static RegisterProperty> {
    PROPERTIES.iter().find(|p| p.name == name)
}

/// The register bank owned by one battery device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    regs: [Register; REGISTER_COUNT],
}

impl RegisterFile {
    /// Create a register file with named registers zeroed and reserved
    /// registers set to [`UNKNOWN`].
    pub fn new() -> Self {
        let regs = core::array::from_fn(|i| {
            let (name, role) = LAYOUT[i];
            Register {
                name,
                offset: i as u64 * REGISTER_WIDTH,
                role,
                value: if role == Role::Unknown { UNKNOWN } else { 0 },
            }
        });
        Self { regs }
    }

    /// Create a register file seeded with configured defaults.
    pub fn with_config(config: &BatteryConfig) -> Self {
        let mut file = Self::new();
        file.regs[R_STATE].value = config.state;
        file.regs[R_VOLTAGE_NOW].value = config.voltage_now;
        file.regs[R_CURRENT_NOW].value = config.current_now;
        file.regs[R_CHARGE_NOW].value = config.charge_now;
        file.regs[R_VOLTAGE_MIN_DESIGN].value = config.voltage_min_design;
        file.regs[R_CHARGE_FULL_DESIGN].value = config.charge_full_design;
        file.regs[R_CHARGE_FULL].value = config.charge_full;
        file.regs[R_CYCLE_COUNT].value = config.cycle_count;
        file
    }

    /// Read a register, or [`UNKNOWN`] past [`R_MAX`].
    pub fn get(&self, index: usize) -> u32 {
        self.regs.get(index).map_or(UNKNOWN, |r| r.value)
    }

    /// Store a value. Returns `false` (and stores nothing) past [`R_MAX`].
    pub fn set(&mut self, index: usize, value: u32) -> bool {
        match self.regs.get_mut(index) {
            Some(reg) => {
                log::trace!("battery register {} ({}) <- {:#x}", index, reg.name, value);
                reg.value = value;
                true
            }
            None => {
                log::debug!("ignoring write to battery register {} (max {})", index, R_MAX);
                false
            }
        }
    }

    /// Current battery state flags; unknown bits are dropped.
    pub fn state(&self) -> BatteryState {
        BatteryState::from_bits_truncate(self.get(R_STATE))
    }

    /// Registers in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.regs.iter()
    }

    /// Serialize the bank as little-endian words, the layout the guest sees.
    pub fn to_le_bytes(&self) -> [u8; MMIO_LEN as usize] {
        let mut out = [0u8; MMIO_LEN as usize];
        for (chunk, reg) in out.chunks_exact_mut(4).zip(self.regs.iter()) {
            chunk.copy_from_slice(&reg.value.to_le_bytes());
        }
        out
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}
