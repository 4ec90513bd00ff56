//! SSDT for the shared memory device and its two-pass address patch
//!
//! The first pass emits `Name(BPTR, 0)` plus the battery AML, whose register
//! region is based at `BPTR`, and records where the dword lives. Once the
//! firmware loader has placed the shared memory blob, the second pass writes
//! the real address there and hands the same address to the address channel.

use aml_build::{self as aml, SdtHeader, CHECKSUM_OFFSET, SDT_HEADER_LEN};
use vbattery::acpi::{self as battery_acpi, RegionBase, TableLayout, DEFAULT_PREFIX};
use vbattery::MMIO_LEN;

use crate::linker::{BiosLinker, Placement, Zone};
use crate::remap::{AddressBinding, RemapAction};
use crate::{Result, ADDR_FILE, MEM_FILE, PATCH_NAME};

/// Firmware config file holding the concatenated ACPI tables.
pub const TABLE_FILE: &str = "etc/acpi/tables";

/// OEM table id of the generated SSDT.
pub const SSDT_TABLE_ID: &str = "VMBoard";

/// A value inside the table that is resolved after generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchLocation {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

/// Append-only table buffer with its pending patch locations.
#[derive(Debug, Clone, Default)]
pub struct TableBlob {
    data: Vec<u8>,
    patches: Vec<PatchLocation>,
}

impl TableBlob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn append(&mut self, table: &[u8]) {
        self.data.extend_from_slice(table);
    }

    pub fn record(&mut self, patch: PatchLocation) {
        assert!(
            self.patches.iter().all(|p| p.name != patch.name),
            "patch location {} recorded twice",
            patch.name
        );
        self.patches.push(patch);
    }

    pub fn patches(&self) -> &[PatchLocation] {
        &self.patches
    }

    pub fn patch(&self, name: &str) -> Option<PatchLocation> {
        self.patches.iter().find(|p| p.name == name).copied()
    }

    /// Bytes currently stored at `patch`.
    pub fn read_patch(&self, patch: PatchLocation) -> &[u8] {
        &self.data[patch.offset..patch.offset + patch.width]
    }
}

/// Builds the device SSDT and resolves its address pointer.
#[derive(Debug, Clone, Copy)]
pub struct TablePatcher {
    mem_size: u64,
    battery: bool,
}

impl TablePatcher {
    /// The battery AML is left out when the register block does not fit in
    /// `mem_size`, since its region would reach past the shared memory.
    pub fn new(mem_size: u64, battery: bool) -> Self {
        let fits = mem_size >= MMIO_LEN;
        if battery && !fits {
            log::warn!(
                "shared memory of {:#x} bytes cannot hold the {:#x} byte register block, omitting battery AML",
                mem_size,
                MMIO_LEN
            );
        }
        Self {
            mem_size,
            battery: battery && fits,
        }
    }

    /// Whether the battery AML is emitted.
    pub fn battery(&self) -> bool {
        self.battery
    }

    fn body(&self) -> (Vec<u8>, usize) {
        let mut body = Vec::new();
        let offset = aml::append_named_dword(&mut body, PATCH_NAME);
        if self.battery {
            body.extend(battery_acpi::build(&TableLayout {
                region_base: RegionBase::Named(PATCH_NAME),
                prefix: DEFAULT_PREFIX,
                adapter_uid: 1,
                battery_uids: &[0],
            }));
        }
        (body, offset)
    }

    /// First pass: append the SSDT to `table`, size `file_blob` to the
    /// shared memory and queue the loader commands.
    ///
    /// The pointer holds the binding's current address until the loader runs.
    pub fn add_table(
        &self,
        binding: &mut AddressBinding,
        table: &mut TableBlob,
        file_blob: &mut Vec<u8>,
        linker: &mut BiosLinker,
    ) -> PatchLocation {
        file_blob.resize(self.mem_size as usize, 0);
        linker.alloc(MEM_FILE, core::mem::size_of::<u64>() as u32, Zone::High);

        let (mut body, dword) = self.body();
        let placeholder = u32::try_from(binding.address()).unwrap_or_else(|_| {
            log::warn!(
                "{:#x} does not fit in {}, leaving it zero until placement",
                binding.address(),
                PATCH_NAME
            );
            0
        });
        body[dword..dword + 4].copy_from_slice(&placeholder.to_le_bytes());

        let start = table.len();
        let ssdt = SdtHeader::new(b"SSDT", 1, SSDT_TABLE_ID).build(&body);
        let patch = PatchLocation {
            name: PATCH_NAME,
            offset: start + SDT_HEADER_LEN + dword,
            width: 4,
        };
        table.record(patch);
        binding.set_patch_location(patch);
        table.append(&ssdt);

        linker.add_pointer(TABLE_FILE, patch.offset, patch.width as u8, MEM_FILE, 0);
        linker.write_pointer(ADDR_FILE, 0, core::mem::size_of::<u64>() as u8, MEM_FILE, 0);
        linker.add_checksum(TABLE_FILE, start, ssdt.len(), start + CHECKSUM_OFFSET);

        log::debug!(
            "acpi-shmem SSDT: {} bytes at {:#x}, {} at {:#x}",
            ssdt.len(),
            start,
            PATCH_NAME,
            patch.offset
        );
        patch
    }

    /// Second pass: run the loader commands against the final `placement`.
    ///
    /// Returns the mapping changes caused by writes to the address channel.
    pub fn apply_placement(
        &self,
        binding: &mut AddressBinding,
        table: &mut TableBlob,
        linker: &BiosLinker,
        placement: &Placement,
    ) -> Result<Vec<RemapAction>> {
        let writes = linker.patch(TABLE_FILE, table.as_mut_bytes(), placement)?;
        let actions = writes
            .into_iter()
            .filter(|w| w.file == ADDR_FILE)
            .map(|w| binding.write(w.offset as usize, &w.bytes))
            .collect();
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn first_pass(battery: bool, prefix: &[u8]) -> (TablePatcher, AddressBinding, TableBlob, BiosLinker, PatchLocation) {
        let patcher = TablePatcher::new(0x1000, battery);
        let mut binding = AddressBinding::new();
        let mut table = TableBlob::new();
        table.append(prefix);
        let mut blob = Vec::new();
        let mut linker = BiosLinker::new();
        let patch = patcher.add_table(&mut binding, &mut table, &mut blob, &mut linker);
        assert_eq!(blob.len(), 0x1000);
        (patcher, binding, table, linker, patch)
    }

    #[test]
    fn test_placeholder_is_zero_and_recorded() {
        let (_, binding, table, linker, patch) = first_pass(true, &[]);
        assert_eq!(table.read_patch(patch), &[0, 0, 0, 0]);
        assert_eq!(table.patch(PATCH_NAME), Some(patch));
        assert_eq!(binding.patch_location(), Some(patch));
        assert_eq!(&table.as_bytes()[..4], b"SSDT");
        assert_eq!(aml::checksum(table.as_bytes()), 0);
        assert_eq!(linker.commands().len(), 4);
    }

    #[test]
    fn test_offset_accounts_for_earlier_tables() {
        let (_, _, table, _, patch) = first_pass(false, &[0x55; 100]);
        // Name(BPTR, DWordConst) = 08 'BPTR' 0C <dword>
        assert_eq!(patch.offset, 100 + SDT_HEADER_LEN + 6);
        assert_eq!(&table.as_bytes()[patch.offset - 6..patch.offset], &[0x08, b'B', b'P', b'T', b'R', 0x0C]);
    }

    #[test]
    fn test_battery_toggle() {
        let (_, _, with, _, _) = first_pass(true, &[]);
        let (_, _, without, _, _) = first_pass(false, &[]);
        assert!(contains(with.as_bytes(), b"CBAT"));
        assert!(!contains(without.as_bytes(), b"CBAT"));
        assert!(contains(without.as_bytes(), b"BPTR"));
    }

    #[test]
    fn test_second_pass_writes_final_address() {
        for addr in [0u64, 1, 0x1000, 0xDEAD_B000, 0xFFFF_FFFF] {
            let (patcher, mut binding, mut table, linker, patch) = first_pass(true, &[0xAA; 7]);
            let mut placement = Placement::new();
            placement.place(MEM_FILE, addr);

            let actions = patcher
                .apply_placement(&mut binding, &mut table, &linker, &placement)
                .unwrap();

            assert_eq!(table.read_patch(patch), &(addr as u32).to_le_bytes());
            assert_eq!(aml::checksum(&table.as_bytes()[7..]), 0);
            assert_eq!(binding.address(), addr);
            let expected = if addr == 0 { RemapAction::None } else { RemapAction::Map(addr) };
            assert_eq!(actions, vec![expected]);
        }
    }

    #[test]
    fn test_small_region_omits_battery() {
        for (size, battery) in [(8, false), (MMIO_LEN - 1, false), (MMIO_LEN, true)] {
            let patcher = TablePatcher::new(size, true);
            assert_eq!(patcher.battery(), battery, "size {:#x}", size);

            let mut binding = AddressBinding::new();
            let mut table = TableBlob::new();
            let mut blob = Vec::new();
            let mut linker = BiosLinker::new();
            patcher.add_table(&mut binding, &mut table, &mut blob, &mut linker);
            assert_eq!(blob.len() as u64, size);
            assert_eq!(contains(table.as_bytes(), b"CBAT"), battery);
            assert!(contains(table.as_bytes(), b"BPTR"));
        }
    }

    #[test]
    fn test_high_address_leaves_placeholder_zero() {
        let patcher = TablePatcher::new(0x1000, true);
        let mut binding = AddressBinding::new();
        binding.write(0, &0x1_0000_1000u64.to_le_bytes());
        assert_eq!(binding.address(), 0x1_0000_1000);

        let mut table = TableBlob::new();
        let mut blob = Vec::new();
        let mut linker = BiosLinker::new();
        let patch = patcher.add_table(&mut binding, &mut table, &mut blob, &mut linker);
        assert_eq!(table.read_patch(patch), &[0, 0, 0, 0]);
        assert_eq!(aml::checksum(table.as_bytes()), 0);
    }

    #[test]
    #[should_panic(expected = "recorded twice")]
    fn test_single_patch_per_name() {
        let mut table = TableBlob::new();
        let patch = PatchLocation {
            name: PATCH_NAME,
            offset: 0,
            width: 4,
        };
        table.record(patch);
        table.record(patch);
    }
}
