//! BIOS Linker - instructions for the firmware loader
//!
//! Tables reference memory whose guest address is chosen by firmware. The
//! table builder records where such pointers live; the loader allocates the
//! files, then patches pointers and checksums. [`BiosLinker::patch`] performs
//! the loader side once a [`Placement`] is known.

use std::collections::BTreeMap;

use aml_build as aml;

use crate::{Result, ShmemError};

/// Firmware memory zone for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Anywhere below 4 GiB.
    High = 1,
    /// The 0xF0000 segment.
    FSeg = 2,
}

/// One loader instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkerCommand {
    Allocate {
        file: String,
        align: u32,
        zone: Zone,
    },
    /// Store the address of `src_file` + `src_offset` into `dest_file`.
    AddPointer {
        dest_file: String,
        dest_offset: u32,
        size: u8,
        src_file: String,
        src_offset: u32,
    },
    /// Write the address of `src_file` + `src_offset` back to the host
    /// through the writable `dest_file`.
    WritePointer {
        dest_file: String,
        dest_offset: u32,
        size: u8,
        src_file: String,
        src_offset: u32,
    },
    AddChecksum {
        file: String,
        start: u32,
        length: u32,
        offset: u32,
    },
}

/// A host-bound write produced by a [`LinkerCommand::WritePointer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerWrite {
    pub file: String,
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Guest addresses chosen by the loader for each allocated file.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    addrs: BTreeMap<String, u64>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn place(&mut self, file: &str, addr: u64) {
        self.addrs.insert(file.into(), addr);
    }

    pub fn address(&self, file: &str) -> Result<u64> {
        self.addrs
            .get(file)
            .copied()
            .ok_or_else(|| ShmemError::Unplaced(file.into()))
    }
}

/// Ordered list of loader instructions.
#[derive(Debug, Clone, Default)]
pub struct BiosLinker {
    commands: Vec<LinkerCommand>,
}

fn pointer_bytes(value: u64, size: u8) -> Result<Vec<u8>> {
    assert!(matches!(size, 1 | 2 | 4 | 8), "bad pointer size {}", size);
    if size < 8 && value >> (size as u32 * 8) != 0 {
        return Err(ShmemError::PointerOverflow { value, size });
    }
    Ok(value.to_le_bytes()[..size as usize].to_vec())
}

impl BiosLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[LinkerCommand] {
        &self.commands
    }

    pub fn alloc(&mut self, file: &str, align: u32, zone: Zone) {
        assert!(align.is_power_of_two(), "alignment {} is not a power of two", align);
        self.commands.push(LinkerCommand::Allocate {
            file: file.into(),
            align,
            zone,
        });
    }

    pub fn add_pointer(
        &mut self,
        dest_file: &str,
        dest_offset: usize,
        size: u8,
        src_file: &str,
        src_offset: u32,
    ) {
        self.commands.push(LinkerCommand::AddPointer {
            dest_file: dest_file.into(),
            dest_offset: dest_offset as u32,
            size,
            src_file: src_file.into(),
            src_offset,
        });
    }

    pub fn write_pointer(
        &mut self,
        dest_file: &str,
        dest_offset: u32,
        size: u8,
        src_file: &str,
        src_offset: u32,
    ) {
        self.commands.push(LinkerCommand::WritePointer {
            dest_file: dest_file.into(),
            dest_offset,
            size,
            src_file: src_file.into(),
            src_offset,
        });
    }

    pub fn add_checksum(&mut self, file: &str, start: usize, length: usize, offset: usize) {
        self.commands.push(LinkerCommand::AddChecksum {
            file: file.into(),
            start: start as u32,
            length: length as u32,
            offset: offset as u32,
        });
    }

    /// Apply every command that targets `file` to its contents `data`.
    ///
    /// Pointers are overwritten with their final value, then checksums are
    /// recomputed. Write-pointer commands are returned for the caller to
    /// deliver, since their destination is host-side.
    pub fn patch(&self, file: &str, data: &mut [u8], placement: &Placement) -> Result<Vec<PointerWrite>> {
        let mut writes = Vec::new();

        for cmd in &self.commands {
            match cmd {
                LinkerCommand::AddPointer {
                    dest_file,
                    dest_offset,
                    size,
                    src_file,
                    src_offset,
                } if dest_file == file => {
                    let value = placement.address(src_file)? + *src_offset as u64;
                    let bytes = pointer_bytes(value, *size)?;
                    let start = *dest_offset as usize;
                    data[start..start + bytes.len()].copy_from_slice(&bytes);
                    log::debug!("linker: {}+{:#x} -> {:#x}", file, start, value);
                }
                LinkerCommand::WritePointer {
                    dest_file,
                    dest_offset,
                    size,
                    src_file,
                    src_offset,
                } => {
                    let value = placement.address(src_file)? + *src_offset as u64;
                    writes.push(PointerWrite {
                        file: dest_file.clone(),
                        offset: *dest_offset,
                        bytes: pointer_bytes(value, *size)?,
                    });
                }
                _ => {}
            }
        }

        for cmd in &self.commands {
            if let LinkerCommand::AddChecksum {
                file: target,
                start,
                length,
                offset,
            } = cmd
            {
                if target != file {
                    continue;
                }
                let (start, end) = (*start as usize, (*start + *length) as usize);
                data[*offset as usize] = 0;
                let sum = aml::checksum(&data[start..end]);
                data[*offset as usize] = sum;
            }
        }

        Ok(writes)
    }
}
