//! Address binding between the firmware-chosen address and the VM memory map

use crate::table::PatchLocation;

/// Size of the address channel in bytes.
pub const ADDR_LEN: usize = 8;

/// The VM address space, as far as this device needs it.
pub trait GuestMemory {
    /// Overlay `size` bytes at `host` onto guest physical address `gpa`.
    fn map(&mut self, gpa: u64, host: *mut u8, size: u64);

    /// Move an existing overlay.
    fn relocate(&mut self, from: u64, to: u64);

    /// Remove the overlay at `gpa`.
    fn unmap(&mut self, gpa: u64);
}

/// What to do with the overlay after the address changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapAction {
    None,
    Map(u64),
    Relocate { from: u64, to: u64 },
    Unmap(u64),
}

/// Transition from the current mapping to `addr` (0 means unmapped).
pub fn transition(mapped_at: Option<u64>, addr: u64) -> RemapAction {
    match (mapped_at, addr) {
        (Some(from), 0) => RemapAction::Unmap(from),
        (Some(from), to) => RemapAction::Relocate { from, to },
        (None, 0) => RemapAction::None,
        (None, to) => RemapAction::Map(to),
    }
}

/// Address channel contents plus the resulting mapping state.
#[derive(Debug, Clone, Default)]
pub struct AddressBinding {
    addr: [u8; ADDR_LEN],
    mapped_at: Option<u64>,
    patch: Option<PatchLocation>,
}

impl AddressBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last address written to the channel.
    pub fn address(&self) -> u64 {
        u64::from_le_bytes(self.addr)
    }

    /// Where the overlay currently is, if anywhere.
    pub fn mapped_at(&self) -> Option<u64> {
        self.mapped_at
    }

    pub fn patch_location(&self) -> Option<PatchLocation> {
        self.patch
    }

    pub fn set_patch_location(&mut self, patch: PatchLocation) {
        self.patch = Some(patch);
    }

    /// Read the channel. Returns the number of bytes copied.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        let Some(src) = self.addr.get(offset..) else {
            return 0;
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Store `data` at `offset` in the channel and recompute the mapping.
    ///
    /// Bytes past the end of the channel are dropped.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> RemapAction {
        if let Some(dst) = self.addr.get_mut(offset..) {
            let n = dst.len().min(data.len());
            dst[..n].copy_from_slice(&data[..n]);
        }
        self.remap()
    }

    /// Apply the transition for the current channel contents.
    pub fn remap(&mut self) -> RemapAction {
        let action = transition(self.mapped_at, self.address());
        self.mapped_at = match action {
            RemapAction::Map(to) | RemapAction::Relocate { to, .. } => Some(to),
            RemapAction::Unmap(_) => None,
            RemapAction::None => self.mapped_at,
        };
        action
    }

    /// Zero the channel and drop any mapping.
    pub fn reset(&mut self) -> RemapAction {
        self.addr = [0; ADDR_LEN];
        self.remap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(addr: u64) -> AddressBinding {
        let mut binding = AddressBinding::new();
        binding.write(0, &addr.to_le_bytes());
        binding
    }

    #[test]
    fn test_transition_table() {
        assert_eq!(transition(Some(0x1000), 0), RemapAction::Unmap(0x1000));
        assert_eq!(
            transition(Some(0x1000), 0x2000),
            RemapAction::Relocate { from: 0x1000, to: 0x2000 }
        );
        assert_eq!(transition(None, 0), RemapAction::None);
        assert_eq!(transition(None, 0x2000), RemapAction::Map(0x2000));
    }

    #[test]
    fn test_binding_follows_writes() {
        let mut binding = AddressBinding::new();
        assert_eq!(binding.mapped_at(), None);

        assert_eq!(binding.write(0, &0x8000u64.to_le_bytes()), RemapAction::Map(0x8000));
        assert_eq!(binding.mapped_at(), Some(0x8000));

        assert_eq!(
            binding.write(0, &0x9000u64.to_le_bytes()),
            RemapAction::Relocate { from: 0x8000, to: 0x9000 }
        );
        assert_eq!(binding.mapped_at(), Some(0x9000));

        assert_eq!(binding.write(0, &[0; 8]), RemapAction::Unmap(0x9000));
        assert_eq!(binding.mapped_at(), None);
        assert_eq!(binding.write(0, &[0; 8]), RemapAction::None);
    }

    #[test]
    fn test_partial_write_updates_high_half() {
        let mut binding = mapped(0x1000);
        binding.write(4, &1u32.to_le_bytes());
        assert_eq!(binding.address(), 0x1_0000_1000);
        assert_eq!(binding.mapped_at(), Some(0x1_0000_1000));
    }

    #[test]
    fn test_read_returns_last_written() {
        let binding = mapped(0xDEAD_B000);
        let mut buf = [0u8; 8];
        assert_eq!(binding.read(0, &mut buf), 8);
        assert_eq!(u64::from_le_bytes(buf), 0xDEAD_B000);
        assert_eq!(binding.read(8, &mut buf), 0);
        assert_eq!(binding.read(6, &mut buf), 2);
    }

    #[test]
    fn test_reset_always_unmaps() {
        let mut binding = mapped(0x4000);
        assert_eq!(binding.reset(), RemapAction::Unmap(0x4000));
        assert_eq!(binding.mapped_at(), None);
        assert_eq!(binding.address(), 0);

        let mut idle = AddressBinding::new();
        assert_eq!(idle.reset(), RemapAction::None);
        assert_eq!(idle.mapped_at(), None);
    }
}
