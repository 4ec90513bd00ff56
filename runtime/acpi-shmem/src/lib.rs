//! ACPI Shared Memory - battery registers living in helper-owned memory
//!
//! # Purpose
//! Exposes a block of memory owned by an external helper process to the
//! guest, together with the battery AML that reads its registers from it.
//! The helper can interrupt the guest and the guest can ring the helper.
//!
//! # Integration Points
//! - Depends on: `aml-build` (SSDT), `vbattery` (power subsystem AML,
//!   [`AcpiEventSink`](vbattery::AcpiEventSink))
//! - Provides to: the VMM (activation, reset hook, firmware config files,
//!   MMIO routing) through [`AcpiShmem`]
//! - Helper protocol: three one-byte messages on a Unix socket, each carrying
//!   one descriptor: memory, interrupt, doorbell
//!
//! # Architecture
//! - [`handshake`]: descriptor acquisition with fail-closed cleanup
//! - [`table`] + [`linker`]: SSDT generation and the two-pass pointer patch
//! - [`remap`]: address channel and mapping transitions
//! - [`events`]: interrupt and doorbell bridges over [`EventNotifier`]
//! - [`device`]: life-cycle tying everything to one instance per VM
//!
//! # Testing Strategy
//! - Unit tests: state transitions, linker patching, channel parsing
//! - Integration tests: full activation against an in-process helper built
//!   from real memfd/eventfd descriptors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod channel;
pub mod device;
pub mod events;
pub mod handshake;
pub mod linker;
pub mod notifier;
pub mod remap;
pub mod table;

pub use channel::{HelperChannel, UnixHelperChannel};
pub use device::{AcpiShmem, ShmemConfig, ShmemSlot};
pub use events::{Doorbell, IrqBridge};
pub use handshake::{Handshake, HandshakeState, SharedMemoryHandle};
pub use linker::{BiosLinker, LinkerCommand, Placement, Zone};
pub use notifier::EventNotifier;
pub use remap::{AddressBinding, GuestMemory, RemapAction};
pub use table::{PatchLocation, TableBlob, TablePatcher};

/// Device type name.
pub const TYPE_ACPI_SHMEM: &str = "acpi-shmem";

/// Firmware config file exposing the shared memory read-only.
pub const MEM_FILE: &str = "etc/acpi_shmem";

/// Firmware config file holding the guest address of the shared memory.
pub const ADDR_FILE: &str = "etc/acpi_shmem_addr";

/// Smallest accepted shared memory size.
pub const MIN_SIZE: u64 = 8;

/// Largest accepted shared memory size.
pub const MAX_SIZE: u64 = 0x0FFF_FFFF;

/// Name of the AML integer that carries the shared memory address.
pub const PATCH_NAME: &str = "BPTR";

/// Broad class of a [`ShmemError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device was set up wrongly. Nothing was exchanged with the helper.
    Configuration,
    /// The helper misbehaved. Descriptors received so far have been closed.
    Protocol,
}

/// Error types for device activation and table patching
#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("at most one {} device is permitted", TYPE_ACPI_SHMEM)]
    AlreadyActive,

    #[error("you must specify a 'chardev'")]
    MissingChardev,

    #[error("can't connect to helper at {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read from helper failed: {0}")]
    Read(#[source] io::Error),

    #[error("helper shutdown early")]
    HelperClosed,

    #[error("no msgfd found in chardev")]
    MissingDescriptor,

    #[error("can't stat shared memory: {0}")]
    Stat(#[source] io::Error),

    #[error("bad size of shared memory: {0}")]
    BadSize(u64),

    #[error("can't map shared memory: {0}")]
    Map(#[source] io::Error),

    #[error("can't use event descriptor: {0}")]
    Notifier(#[source] io::Error),

    #[error("linker file {0} has not been placed")]
    Unplaced(String),

    #[error("{value:#x} does not fit in a {size} byte pointer")]
    PointerOverflow { value: u64, size: u8 },
}

impl ShmemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShmemError::AlreadyActive
            | ShmemError::MissingChardev
            | ShmemError::Connect { .. }
            | ShmemError::Unplaced(_)
            | ShmemError::PointerOverflow { .. } => ErrorKind::Configuration,
            _ => ErrorKind::Protocol,
        }
    }
}

pub type Result<T> = core::result::Result<T, ShmemError>;
