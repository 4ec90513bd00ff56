//! Shared memory owned by the helper

use std::fs::File;
use std::ops::Range;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use anyhow::{Context, Result};
use memmap2::{MmapMut, MmapOptions};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use vbattery::{BatteryConfig, BatteryState, RegisterFile, REGISTER_WIDTH, R_CHARGE_NOW, R_STATE, UNKNOWN};

/// Byte range of register `index`, if it is addressable at all.
fn register_range(index: usize) -> Option<Range<usize>> {
    let width = REGISTER_WIDTH as usize;
    let start = index.checked_mul(width)?;
    Some(start..start.checked_add(width)?)
}

pub struct SharedRegion {
    fd: OwnedFd,
    map: MmapMut,
}

impl SharedRegion {
    /// Create an anonymous memory file of `size` bytes and map it.
    pub fn create(size: u64) -> Result<Self> {
        let fd = memfd_create(c"acpi-shmem", MemFdCreateFlag::MFD_CLOEXEC)
            .context("Failed to create memfd")?;
        let file = File::from(fd);
        file.set_len(size).context("Failed to size shared memory")?;

        // SAFETY: the mapping is shared with the VMM, which only treats it as bytes.
        let map = unsafe { MmapOptions::new().len(size as usize).map_mut(&file) }
            .context("Failed to map shared memory")?;

        Ok(Self {
            fd: OwnedFd::from(file),
            map,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Write the register block at offset 0. Truncated if the region is smaller.
    pub fn seed(&mut self, config: &BatteryConfig) {
        let regs = RegisterFile::with_config(config).to_le_bytes();
        let n = regs.len().min(self.map.len());
        self.map[..n].copy_from_slice(&regs[..n]);
        log::debug!("seeded {} bytes of battery registers", n);
    }

    pub fn register(&self, index: usize) -> u32 {
        match register_range(index).and_then(|r| self.map.get(r)) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => UNKNOWN,
        }
    }

    pub fn set_register(&mut self, index: usize, value: u32) -> bool {
        match register_range(index).and_then(|r| self.map.get_mut(r)) {
            Some(b) => {
                b.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Drain `step` mAh from the battery. Returns the remaining charge.
    pub fn discharge(&mut self, step: u32) -> u32 {
        let charge = self.register(R_CHARGE_NOW).saturating_sub(step);
        self.set_register(R_CHARGE_NOW, charge);
        let state = if charge > 0 { BatteryState::DISCHARGING } else { BatteryState::empty() };
        self.set_register(R_STATE, state.bits());
        charge
    }
}

impl AsFd for SharedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbattery::{R_CYCLE_COUNT, R_MAX};

    #[test]
    fn test_seed_writes_register_block() {
        let mut region = SharedRegion::create(0x1000).unwrap();
        region.seed(&BatteryConfig::default());
        assert_eq!(region.register(R_CHARGE_NOW), 1500);
        assert_eq!(region.register(5), UNKNOWN);
        assert_eq!(region.register(R_CYCLE_COUNT), 0);
    }

    #[test]
    fn test_small_region_is_truncated() {
        let mut region = SharedRegion::create(8).unwrap();
        region.seed(&BatteryConfig::default());
        assert_eq!(region.len(), 8);
        assert_eq!(region.register(1), 12000);
        assert_eq!(region.register(R_MAX), UNKNOWN);
        assert!(!region.set_register(R_CHARGE_NOW, 1));
    }

    #[test]
    fn test_huge_index_is_unknown() {
        let mut region = SharedRegion::create(0x40).unwrap();
        region.seed(&BatteryConfig::default());
        for index in [usize::MAX, usize::MAX / 4, usize::MAX / 4 + 1] {
            assert_eq!(region.register(index), UNKNOWN);
            assert!(!region.set_register(index, 1));
        }
    }

    #[test]
    fn test_discharge_stops_at_empty() {
        let mut region = SharedRegion::create(0x40).unwrap();
        region.seed(&BatteryConfig {
            charge_now: 15,
            ..BatteryConfig::default()
        });
        assert_eq!(region.discharge(10), 5);
        assert_eq!(region.register(R_STATE), BatteryState::DISCHARGING.bits());
        assert_eq!(region.discharge(10), 0);
        assert_eq!(region.register(R_STATE), 0);
    }
}
