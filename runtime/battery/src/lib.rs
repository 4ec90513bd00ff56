//! Virtual Battery - laptop power subsystem for guest firmware
//!
//! # Purpose
//! Emulates an AC adapter and a control method battery. The battery state
//! lives in a small register file that the guest reads through ACPI fields;
//! the host updates it through named properties.
//!
//! # Integration Points
//! - Depends on: `aml-build` (AML emission)
//! - Provides to: the VMM (MMIO dispatch, ACPI table assembly), `acpi-shmem`
//! - Notifications: raises [`AcpiEventStatus::BATTERY_STATUS`] on the
//!   [`AcpiEventSink`] handed over at construction
//!
//! # Architecture
//! [`RegisterFile`] owns the values, [`acpi`] turns the register layout into
//! AML, and [`Battery`] ties both to the device life-cycle: register updates
//! only notify the guest once the device has been realized.
//!
//! # Testing Strategy
//! - Unit tests: register bounds, field naming, AML shapes
//! - Integration tests: property updates observed through the status package

use std::sync::Arc;

use thiserror::Error;

pub mod acpi;
mod config;
mod event;
mod registers;

pub use config::{BatteryConfig, DEFAULT_MMIO_BASE};
pub use event::{AcpiEventSink, AcpiEventStatus, BATTERY_GPE, NOTIFY_STATUS_CHANGED};
pub use registers::{
    find_property, Access, BatteryState, Register, RegisterFile, RegisterProperty, Role,
    MMIO_LEN, PROPERTIES, REGISTER_COUNT, REGISTER_WIDTH, R_CHARGE_FULL, R_CHARGE_FULL_DESIGN,
    R_CHARGE_NOW, R_CURRENT_NOW, R_CYCLE_COUNT, R_MAX, R_STATE, R_VOLTAGE_MIN_DESIGN,
    R_VOLTAGE_NOW, UNKNOWN,
};

/// Error types for battery property access
#[derive(Debug, Error)]
pub enum BatteryError {
    #[error("Unknown battery property: {0}")]
    UnknownProperty(String),

    #[error("Battery property {0} is read-only")]
    ReadOnlyProperty(&'static str),
}

pub type Result<T> = core::result::Result<T, BatteryError>;

/// Battery device with its register window.
pub struct Battery {
    config: BatteryConfig,
    regs: RegisterFile,
    sink: Arc<dyn AcpiEventSink>,
    realized: bool,
}

impl Battery {
    /// Create an unrealized battery seeded from `config`.
    ///
    /// `sink` is the device that delivers GPEs to the guest.
    pub fn new(config: BatteryConfig, sink: Arc<dyn AcpiEventSink>) -> Self {
        let regs = RegisterFile::with_config(&config);
        Self {
            config,
            regs,
            sink,
            realized: false,
        }
    }

    /// Finish setup. From now on register updates notify the guest.
    pub fn realize(&mut self) {
        log::info!(
            "battery realized: registers at {:#x}..{:#x}",
            self.config.mmio_base,
            self.config.mmio_base + MMIO_LEN
        );
        self.realized = true;
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub fn mmio_base(&self) -> u64 {
        self.config.mmio_base
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    /// Read register `index`; see [`RegisterFile::get`].
    pub fn get(&self, index: usize) -> u32 {
        self.regs.get(index)
    }

    /// Store register `index` and notify the guest if realized.
    pub fn set(&mut self, index: usize, value: u32) {
        if self.regs.set(index, value) && self.realized {
            self.sink.send_event(AcpiEventStatus::BATTERY_STATUS);
        }
    }

    /// Read a register by property name.
    pub fn property(&self, name: &str) -> Result<u32> {
        let prop = find_property(name).ok_or_else(|| BatteryError::UnknownProperty(name.into()))?;
        Ok(self.regs.get(prop.index))
    }

    /// Update a register by property name.
    pub fn set_property(&mut self, name: &str, value: u32) -> Result<()> {
        let prop = find_property(name).ok_or_else(|| BatteryError::UnknownProperty(name.into()))?;
        if prop.access == Access::ReadOnly {
            return Err(BatteryError::ReadOnlyProperty(prop.name));
        }
        self.set(prop.index, value);
        Ok(())
    }

    fn decode(offset: u64, size: u32) -> Option<usize> {
        if size as u64 != REGISTER_WIDTH || offset % REGISTER_WIDTH != 0 || offset >= MMIO_LEN {
            return None;
        }
        Some((offset / REGISTER_WIDTH) as usize)
    }

    /// MMIO read relative to [`Battery::mmio_base`].
    pub fn read(&self, offset: u64, size: u32) -> u64 {
        match Self::decode(offset, size) {
            Some(index) => {
                let value = self.regs.get(index);
                log::trace!("battery mmio read {:#x}/{} -> {:#x}", offset, size, value);
                value as u64
            }
            None => {
                log::warn!("battery mmio read at bad offset {:#x}/{}", offset, size);
                UNKNOWN as u64
            }
        }
    }

    /// MMIO write relative to [`Battery::mmio_base`].
    pub fn write(&mut self, offset: u64, size: u32, value: u64) {
        match Self::decode(offset, size) {
            Some(index) => {
                log::trace!("battery mmio write {:#x}/{} <- {:#x}", offset, size, value);
                self.set(index, value as u32);
            }
            None => log::warn!("battery mmio write at bad offset {:#x}/{}", offset, size),
        }
    }

    /// SSDT describing this battery behind its fixed register window.
    pub fn build_acpi(&self) -> Vec<u8> {
        acpi::build_ssdt(&acpi::TableLayout::fixed(self.config.mmio_base))
    }
}
