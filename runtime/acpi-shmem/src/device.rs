//! Shared memory device life-cycle
//!
//! `realize` claims the per-VM slot, checks the configuration, runs the
//! helper handshake and maps the memory. Nothing is left behind when any of
//! those steps fail: the slot is released and every descriptor closed.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use serde::Deserialize;
use vbattery::{AcpiEventSink, BatteryConfig, REGISTER_WIDTH, UNKNOWN};

use crate::channel::{HelperChannel, UnixHelperChannel};
use crate::events::{Doorbell, IrqBridge};
use crate::handshake::Handshake;
use crate::linker::{BiosLinker, Placement};
use crate::notifier::EventNotifier;
use crate::remap::{AddressBinding, GuestMemory, RemapAction};
use crate::table::{PatchLocation, TableBlob, TablePatcher};
use crate::{Result, ShmemError, MEM_FILE, TYPE_ACPI_SHMEM};

/// Construction-time properties.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Unix socket the helper listens on.
    pub chardev: Option<PathBuf>,
    /// Emit the battery AML next to the address pointer.
    pub battery: bool,
    /// Register defaults the helper seeds the shared memory with. Only the
    /// helper reads this; the device takes the values from shared memory.
    pub battery_regs: BatteryConfig,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        Self {
            chardev: None,
            battery: true,
            battery_regs: BatteryConfig::default(),
        }
    }
}

/// Per-VM handle allowing a single active device.
#[derive(Debug, Clone, Default)]
pub struct ShmemSlot {
    active: Arc<AtomicBool>,
}

impl ShmemSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<SlotClaim> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ShmemError::AlreadyActive)?;
        Ok(SlotClaim {
            active: self.active.clone(),
        })
    }
}

/// Releases the slot when dropped.
#[derive(Debug)]
struct SlotClaim {
    active: Arc<AtomicBool>,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

/// The shared memory device.
pub struct AcpiShmem<M: GuestMemory> {
    config: ShmemConfig,
    size: u64,
    region: MmapMut,
    _mem: OwnedFd,
    irq: IrqBridge,
    doorbell: Doorbell,
    binding: AddressBinding,
    patcher: TablePatcher,
    memory: M,
    _claim: SlotClaim,
}

impl<M: GuestMemory> AcpiShmem<M> {
    /// Activate the device, connecting to the helper named by `chardev`.
    ///
    /// `sink` receives the battery status events raised by the helper.
    pub fn realize(
        config: ShmemConfig,
        slot: &ShmemSlot,
        memory: M,
        sink: Arc<dyn AcpiEventSink>,
    ) -> Result<Self> {
        let claim = slot.claim()?;
        let path = config.chardev.clone().ok_or(ShmemError::MissingChardev)?;
        let mut channel = UnixHelperChannel::connect(&path)?;
        Self::activate(config, claim, &mut channel, memory, sink)
    }

    /// Activate the device over an already open control channel.
    pub fn realize_with_channel<C: HelperChannel>(
        config: ShmemConfig,
        slot: &ShmemSlot,
        channel: &mut C,
        memory: M,
        sink: Arc<dyn AcpiEventSink>,
    ) -> Result<Self> {
        let claim = slot.claim()?;
        Self::activate(config, claim, channel, memory, sink)
    }

    fn activate<C: HelperChannel>(
        config: ShmemConfig,
        claim: SlotClaim,
        channel: &mut C,
        memory: M,
        sink: Arc<dyn AcpiEventSink>,
    ) -> Result<Self> {
        let handle = Handshake::new(channel).run()?;

        // SAFETY: the helper shares this memory on purpose and may change it
        // at any time; it is only ever accessed as plain bytes.
        let region = unsafe {
            MmapOptions::new()
                .len(handle.size as usize)
                .map_mut(&handle.mem)
        }
        .map_err(ShmemError::Map)?;

        let irq = EventNotifier::from_fd(handle.irq).map_err(ShmemError::Notifier)?;
        let doorbell = EventNotifier::from_fd(handle.doorbell).map_err(ShmemError::Notifier)?;

        log::info!(
            "{} realized: {:#x} bytes of shared memory, battery {}",
            TYPE_ACPI_SHMEM,
            handle.size,
            if config.battery { "on" } else { "off" }
        );

        Ok(Self {
            patcher: TablePatcher::new(handle.size, config.battery),
            config,
            size: handle.size,
            region,
            _mem: handle.mem,
            irq: IrqBridge::new(irq, sink),
            doorbell: Doorbell::new(doorbell),
            binding: AddressBinding::new(),
            memory,
            _claim: claim,
        })
    }

    pub fn config(&self) -> &ShmemConfig {
        &self.config
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn binding(&self) -> &AddressBinding {
        &self.binding
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Descriptor to poll for helper interrupts; call [`Self::handle_irq`]
    /// when it is readable.
    pub fn irq_fd(&self) -> BorrowedFd<'_> {
        self.irq.as_fd()
    }

    pub fn handle_irq(&self) -> bool {
        self.irq.handle()
    }

    /// Guest write inside the mapped window. Returns whether it rang the doorbell.
    pub fn mmio_write(&self, offset: u64, size: u32) -> bool {
        self.doorbell.mmio_write(offset, size)
    }

    /// Battery register `index` as currently stored in shared memory.
    pub fn register(&self, index: usize) -> u32 {
        let width = REGISTER_WIDTH as usize;
        let bytes = index
            .checked_mul(width)
            .and_then(|start| Some(start..start.checked_add(width)?))
            .and_then(|range| self.region.get(range));
        match bytes {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => UNKNOWN,
        }
    }

    /// Build-time patch, first pass.
    pub fn add_table(
        &mut self,
        table: &mut TableBlob,
        file_blob: &mut Vec<u8>,
        linker: &mut BiosLinker,
    ) -> PatchLocation {
        self.patcher.add_table(&mut self.binding, table, file_blob, linker)
    }

    /// Build-time patch, second pass, once the loader fixed `placement`.
    pub fn apply_placement(
        &mut self,
        table: &mut TableBlob,
        linker: &BiosLinker,
        placement: &Placement,
    ) -> Result<()> {
        let actions = self
            .patcher
            .apply_placement(&mut self.binding, table, linker, placement)?;
        for action in actions {
            self.apply(action);
        }
        Ok(())
    }

    /// Read from the read-only shared memory file.
    pub fn read_mem_file(&self, offset: usize, buf: &mut [u8]) -> usize {
        let Some(src) = self.region.get(offset..) else {
            return 0;
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }

    pub fn read_addr_file(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.binding.read(offset, buf)
    }

    /// Firmware wrote the address file.
    pub fn write_addr_file(&mut self, offset: usize, data: &[u8]) -> RemapAction {
        let action = self.binding.write(offset, data);
        self.apply(action);
        action
    }

    /// System reset: forget the address and drop the mapping.
    pub fn reset(&mut self) -> RemapAction {
        let action = self.binding.reset();
        self.apply(action);
        action
    }

    fn apply(&mut self, action: RemapAction) {
        match action {
            RemapAction::None => {}
            RemapAction::Map(gpa) => {
                log::info!("mapping {} at {:#x}", MEM_FILE, gpa);
                self.memory.map(gpa, self.region.as_mut_ptr(), self.size);
            }
            RemapAction::Relocate { from, to } => {
                log::info!("moving {} from {:#x} to {:#x}", MEM_FILE, from, to);
                self.memory.relocate(from, to);
            }
            RemapAction::Unmap(gpa) => {
                log::info!("unmapping {} from {:#x}", MEM_FILE, gpa);
                self.memory.unmap(gpa);
            }
        }
    }
}

impl<M: GuestMemory> Drop for AcpiShmem<M> {
    fn drop(&mut self) {
        // the guest must not keep a view of memory that is about to be unmapped
        if let Some(gpa) = self.binding.mapped_at() {
            self.memory.unmap(gpa);
        }
    }
}
