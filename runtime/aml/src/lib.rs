//! AML Build - ACPI Machine Language emitter
//!
//! # Purpose
//! Emits the small subset of AML byte-code needed to describe a control
//! method battery and an AC adapter inside a secondary system description
//! table (SSDT).
//!
//! # Integration Points
//! - Depends on: nothing (pure byte manipulation)
//! - Provides to: `vbattery` (table generator), `acpi-shmem` (SSDT + patch slot)
//!
//! # Architecture
//! Every constructor returns an owned `Vec<u8>` holding one complete AML term.
//! Containers (scope, device, method, package, field) take already encoded
//! children and prepend their opcode and PkgLength.
//!
//! Contract violations (malformed name segments, oversized packages, bad
//! local indices) are programming errors and panic.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

mod sdt;

pub use sdt::{checksum, finalize, SdtHeader, CHECKSUM_OFFSET, SDT_HEADER_LEN};

const ZERO_OP: u8 = 0x00;
const ONE_OP: u8 = 0x01;
const NAME_OP: u8 = 0x08;
const BYTE_PREFIX: u8 = 0x0A;
const WORD_PREFIX: u8 = 0x0B;
const DWORD_PREFIX: u8 = 0x0C;
const STRING_PREFIX: u8 = 0x0D;
const QWORD_PREFIX: u8 = 0x0E;
const SCOPE_OP: u8 = 0x10;
const PACKAGE_OP: u8 = 0x12;
const METHOD_OP: u8 = 0x14;
const DUAL_NAME_PREFIX: u8 = 0x2E;
const MULTI_NAME_PREFIX: u8 = 0x2F;
const EXT_OP_PREFIX: u8 = 0x5B;
const ROOT_CHAR: u8 = b'\\';
const PARENT_PREFIX_CHAR: u8 = b'^';
const NULL_NAME: u8 = 0x00;
const LOCAL0_OP: u8 = 0x60;
const SHIFT_RIGHT_OP: u8 = 0x7A;
const AND_OP: u8 = 0x7B;
const NOTIFY_OP: u8 = 0x86;
const RETURN_OP: u8 = 0xA4;

const OP_REGION_OP: u8 = 0x80;
const FIELD_OP: u8 = 0x81;
const DEVICE_OP: u8 = 0x82;

/// Encode an ACPI PkgLength.
///
/// With `include_self` the encoded value also counts the PkgLength bytes,
/// which is what every package-style opcode expects. Named fields encode a
/// bit count and pass `false`.
pub fn pkg_length(length: usize, include_self: bool) -> Vec<u8> {
    let length_bytes = if length + 1 < (1 << 6) {
        1
    } else if length + 2 < (1 << 12) {
        2
    } else if length + 3 < (1 << 20) {
        3
    } else {
        4
    };

    let length = if include_self { length + length_bytes } else { length };
    assert!(length < (1 << 28), "AML package length {:#x} too large", length);

    if length_bytes == 1 {
        return vec![length as u8];
    }

    let mut out = Vec::with_capacity(length_bytes);
    out.push((((length_bytes - 1) as u8) << 6) | (length & 0x0F) as u8);
    let mut rest = length >> 4;
    for _ in 1..length_bytes {
        out.push(rest as u8);
        rest >>= 8;
    }
    out
}

/// Pad a 1-4 character name to a 4 byte NameSeg.
pub fn name_seg(name: &str) -> [u8; 4] {
    let bytes = name.as_bytes();
    assert!(
        !bytes.is_empty() && bytes.len() <= 4,
        "AML name segment {:?} must have 1 to 4 characters",
        name
    );
    assert!(
        bytes[0].is_ascii_uppercase() || bytes[0] == b'_',
        "AML name segment {:?} must start with A-Z or '_'",
        name
    );
    assert!(
        bytes
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == b'_'),
        "AML name segment {:?} contains invalid characters",
        name
    );

    let mut seg = [b'_'; 4];
    seg[..bytes.len()].copy_from_slice(bytes);
    seg
}

/// Encode a NameString such as `BAT0`, `\_SB.AC` or `^PCI0.SBRG`.
pub fn name_string(path: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = path;

    if let Some(stripped) = rest.strip_prefix('\\') {
        out.push(ROOT_CHAR);
        rest = stripped;
    } else {
        while let Some(stripped) = rest.strip_prefix('^') {
            out.push(PARENT_PREFIX_CHAR);
            rest = stripped;
        }
    }

    let segs: Vec<[u8; 4]> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split('.').map(name_seg).collect()
    };

    match segs.len() {
        0 => out.push(NULL_NAME),
        1 => {}
        2 => out.push(DUAL_NAME_PREFIX),
        n => {
            assert!(n <= 0xFF, "AML name path {:?} too deep", path);
            out.push(MULTI_NAME_PREFIX);
            out.push(n as u8);
        }
    }
    for seg in &segs {
        out.extend_from_slice(seg);
    }
    out
}

/// Reference to a named object, usable wherever a term is expected.
pub fn name_ref(path: &str) -> Vec<u8> {
    name_string(path)
}

/// Smallest integer encoding for `value`.
pub fn integer(value: u64) -> Vec<u8> {
    match value {
        0 => vec![ZERO_OP],
        1 => vec![ONE_OP],
        v if v <= u8::MAX as u64 => vec![BYTE_PREFIX, v as u8],
        v if v <= u16::MAX as u64 => {
            let mut out = vec![WORD_PREFIX];
            out.extend_from_slice(&(v as u16).to_le_bytes());
            out
        }
        v if v <= u32::MAX as u64 => dword(v as u32),
        v => {
            let mut out = vec![QWORD_PREFIX];
            out.extend_from_slice(&v.to_le_bytes());
            out
        }
    }
}

/// DWordConst, regardless of the magnitude of `value`.
pub fn dword(value: u32) -> Vec<u8> {
    let mut out = vec![DWORD_PREFIX];
    out.extend_from_slice(&value.to_le_bytes());
    out
}

/// Null terminated ASCII string constant.
pub fn string(value: &str) -> Vec<u8> {
    assert!(value.is_ascii(), "AML string {:?} must be ASCII", value);
    let mut out = Vec::with_capacity(value.len() + 2);
    out.push(STRING_PREFIX);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    out
}

/// Compress a 7 character PNP id (`PNP0C0A`) into its EISA DWord form.
pub fn eisa_id_to_u32(id: &str) -> u32 {
    let bytes = id.as_bytes();
    assert_eq!(bytes.len(), 7, "EISA id {:?} must have 7 characters", id);
    assert!(
        bytes[..3].iter().all(u8::is_ascii_uppercase),
        "EISA id {:?} must start with three letters",
        id
    );

    let hex = |b: u8| -> u32 {
        (b as char)
            .to_digit(16)
            .unwrap_or_else(|| panic!("EISA id {:?} has a non-hex product code", id))
    };

    let id = ((bytes[0] - 0x40) as u32) << 26
        | ((bytes[1] - 0x40) as u32) << 21
        | ((bytes[2] - 0x40) as u32) << 16
        | hex(bytes[3]) << 12
        | hex(bytes[4]) << 8
        | hex(bytes[5]) << 4
        | hex(bytes[6]);
    id.swap_bytes()
}

/// EISA id as a DWordConst term.
pub fn eisa_id(id: &str) -> Vec<u8> {
    dword(eisa_id_to_u32(id))
}

/// `Package (N) { ... }`
pub fn package(elements: &[Vec<u8>]) -> Vec<u8> {
    assert!(elements.len() <= 0xFF, "AML package too large");
    let mut payload = vec![elements.len() as u8];
    for el in elements {
        payload.extend_from_slice(el);
    }
    wrap(&[PACKAGE_OP], &payload)
}

/// `Name (NAME, value)`
pub fn name_decl(name: &str, value: &[u8]) -> Vec<u8> {
    let mut out = vec![NAME_OP];
    out.extend_from_slice(&name_string(name));
    out.extend_from_slice(value);
    out
}

/// Append `Name (NAME, 0x00000000)` with a forced DWord encoding.
///
/// Returns the offset of the DWord payload inside `buf`, so the value can be
/// patched once it is known.
pub fn append_named_dword(buf: &mut Vec<u8>, name: &str) -> usize {
    buf.push(NAME_OP);
    buf.extend_from_slice(&name_string(name));
    buf.push(DWORD_PREFIX);
    let offset = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    offset
}

/// `Scope (PATH) { body }`
pub fn scope(path: &str, body: &[u8]) -> Vec<u8> {
    let mut payload = name_string(path);
    payload.extend_from_slice(body);
    wrap(&[SCOPE_OP], &payload)
}

/// `Device (PATH) { body }`
pub fn device(path: &str, body: &[u8]) -> Vec<u8> {
    let mut payload = name_string(path);
    payload.extend_from_slice(body);
    wrap(&[EXT_OP_PREFIX, DEVICE_OP], &payload)
}

/// `Method (PATH, argc, Serialized|NotSerialized) { body }`
pub fn method(path: &str, argc: u8, serialized: bool, body: &[u8]) -> Vec<u8> {
    assert!(argc <= 7, "AML methods take at most 7 arguments");
    let mut payload = name_string(path);
    payload.push(argc | ((serialized as u8) << 3));
    payload.extend_from_slice(body);
    wrap(&[METHOD_OP], &payload)
}

/// `Return (term)`
pub fn ret(term: &[u8]) -> Vec<u8> {
    let mut out = vec![RETURN_OP];
    out.extend_from_slice(term);
    out
}

/// `Notify (object, value)`
pub fn notify(object: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = vec![NOTIFY_OP];
    out.extend_from_slice(object);
    out.extend_from_slice(value);
    out
}

/// `LocalN`
pub fn local(index: u8) -> Vec<u8> {
    assert!(index <= 7, "AML has only Local0..Local7");
    vec![LOCAL0_OP + index]
}

/// `ShiftRight (value, count, target)`
pub fn shift_right(value: &[u8], count: &[u8], target: Option<&[u8]>) -> Vec<u8> {
    binary(SHIFT_RIGHT_OP, value, count, target)
}

/// `And (lhs, rhs, target)`
pub fn and(lhs: &[u8], rhs: &[u8], target: Option<&[u8]>) -> Vec<u8> {
    binary(AND_OP, lhs, rhs, target)
}

fn binary(op: u8, lhs: &[u8], rhs: &[u8], target: Option<&[u8]>) -> Vec<u8> {
    let mut out = vec![op];
    out.extend_from_slice(lhs);
    out.extend_from_slice(rhs);
    match target {
        Some(target) => out.extend_from_slice(target),
        None => out.push(NULL_NAME),
    }
    out
}

/// Address space of an operation region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSpace {
    SystemMemory = 0x00,
    SystemIo = 0x01,
}

/// `OperationRegion (NAME, space, offset, length)`
///
/// `offset` is a full term so the base can be a named object that is patched
/// after the table is placed.
pub fn operation_region(name: &str, space: RegionSpace, offset: &[u8], length: u32) -> Vec<u8> {
    let mut out = vec![EXT_OP_PREFIX, OP_REGION_OP];
    out.extend_from_slice(&name_string(name));
    out.push(space as u8);
    out.extend_from_slice(offset);
    out.extend_from_slice(&integer(length as u64));
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    Any = 0,
    Byte = 1,
    Word = 2,
    DWord = 3,
    QWord = 4,
    Buffer = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLock {
    NoLock = 0,
    Lock = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate {
    Preserve = 0,
    WriteAsOnes = 1,
    WriteAsZeros = 2,
}

/// One entry of a field list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedField {
    pub name: [u8; 4],
    pub bits: u32,
}

impl NamedField {
    pub fn new(name: &str, bits: u32) -> Self {
        Self {
            name: name_seg(name),
            bits,
        }
    }
}

/// `Field (REGION, access, lock, update) { NAME, bits, ... }`
pub fn field(
    region: &str,
    access: FieldAccess,
    lock: FieldLock,
    update: FieldUpdate,
    fields: &[NamedField],
) -> Vec<u8> {
    let mut payload = name_string(region);
    payload.push(access as u8 | (lock as u8) << 4 | (update as u8) << 5);
    for f in fields {
        payload.extend_from_slice(&f.name);
        payload.extend_from_slice(&pkg_length(f.bits as usize, false));
    }
    wrap(&[EXT_OP_PREFIX, FIELD_OP], &payload)
}

fn wrap(opcode: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(opcode.len() + payload.len() + 4);
    out.extend_from_slice(opcode);
    out.extend_from_slice(&pkg_length(payload.len(), true));
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkg_length_single_byte() {
        assert_eq!(pkg_length(0x20, false), vec![0x20]);
        assert_eq!(pkg_length(0x3D, true), vec![0x3E]);
    }

    #[test]
    fn test_pkg_length_multi_byte() {
        // 0x3F payload bytes plus two length bytes
        assert_eq!(pkg_length(0x3F, true), vec![0x41, 0x04]);
        assert_eq!(pkg_length(0x40, false), vec![0x40, 0x04]);
        assert_eq!(pkg_length(0x0FFD, true), vec![0x4F, 0xFF]);
        assert_eq!(pkg_length(0x1000, false), vec![0x80, 0x00, 0x01]);
    }

    #[test]
    fn test_name_seg_padding() {
        assert_eq!(&name_seg("AC"), b"AC__");
        assert_eq!(&name_seg("_SB"), b"_SB_");
        assert_eq!(&name_seg("BR07"), b"BR07");
    }

    #[test]
    #[should_panic]
    fn test_name_seg_too_long() {
        name_seg("BATT0");
    }

    #[test]
    #[should_panic]
    fn test_name_seg_lowercase() {
        name_seg("bat0");
    }

    #[test]
    fn test_name_string_prefixes() {
        assert_eq!(name_string("BAT0"), b"BAT0".to_vec());
        assert_eq!(name_string("\\_SB"), b"\\_SB_".to_vec());

        let dual = name_string("\\_SB.AC");
        assert_eq!(dual[0], b'\\');
        assert_eq!(dual[1], 0x2E);
        assert_eq!(&dual[2..], b"_SB_AC__");

        let multi = name_string("\\_SB.PCI0.BAT0");
        assert_eq!(&multi[..3], &[b'\\', 0x2F, 3]);
        assert_eq!(multi.len(), 3 + 12);

        assert_eq!(name_string("^^BAT0"), b"^^BAT0".to_vec());
        assert_eq!(name_string("\\"), vec![b'\\', 0x00]);
    }

    #[test]
    fn test_integer_encodings() {
        assert_eq!(integer(0), vec![0x00]);
        assert_eq!(integer(1), vec![0x01]);
        assert_eq!(integer(0x1F), vec![0x0A, 0x1F]);
        assert_eq!(integer(0x1234), vec![0x0B, 0x34, 0x12]);
        assert_eq!(integer(0xFFFF_FFFF), vec![0x0C, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(integer(0x1_0000_0000)[0], 0x0E);
        assert_eq!(dword(0), vec![0x0C, 0, 0, 0, 0]);
    }

    #[test]
    fn test_string_is_null_terminated() {
        assert_eq!(string("QEMU"), vec![0x0D, b'Q', b'E', b'M', b'U', 0x00]);
    }

    #[test]
    fn test_eisa_id_known_values() {
        assert_eq!(eisa_id_to_u32("PNP0A03"), 0x030A_D041);
        assert_eq!(eisa_id_to_u32("PNP0C0A"), 0x0A0C_D041);
        assert_eq!(eisa_id("PNP0C0A"), vec![0x0C, 0x41, 0xD0, 0x0C, 0x0A]);
    }

    #[test]
    fn test_append_named_dword_reports_payload_offset() {
        let mut buf = vec![0xAA; 3];
        let offset = append_named_dword(&mut buf, "BPTR");
        assert_eq!(offset, 3 + 1 + 4 + 1);
        assert_eq!(&buf[3..8], &[0x08, b'B', b'P', b'T', b'R']);
        assert_eq!(buf[8], 0x0C);
        assert_eq!(&buf[offset..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_method_flags() {
        let m = method("_STA", 0, false, &ret(&integer(0x0F)));
        // MethodOp, PkgLength, NameSeg, flags, ReturnOp, BytePrefix, 0x0F
        assert_eq!(m, vec![0x14, 0x09, b'_', b'S', b'T', b'A', 0x00, 0xA4, 0x0A, 0x0F]);

        let serialized = method("FOO", 2, true, &[]);
        assert_eq!(serialized[6], 0x0A);
    }

    #[test]
    fn test_package_counts_elements() {
        let pkg = package(&[integer(1), string("X")]);
        assert_eq!(pkg[0], 0x12);
        assert_eq!(pkg[1] as usize, pkg.len() - 1);
        assert_eq!(pkg[2], 2);
    }

    #[test]
    fn test_device_uses_extended_opcode() {
        let dev = device("AC", &name_decl("_UID", &integer(1)));
        assert_eq!(&dev[..2], &[0x5B, 0x82]);
        assert_eq!(dev[2] as usize, dev.len() - 2);
        assert_eq!(&dev[3..7], b"AC__");
    }

    #[test]
    fn test_field_list_encoding() {
        let f = field(
            "CBAT",
            FieldAccess::DWord,
            FieldLock::NoLock,
            FieldUpdate::Preserve,
            &[NamedField::new("BR00", 32), NamedField::new("BR01", 32)],
        );
        assert_eq!(&f[..2], &[0x5B, 0x81]);
        assert_eq!(&f[3..7], b"CBAT");
        assert_eq!(f[7], 0x03);
        assert_eq!(&f[8..13], &[b'B', b'R', b'0', b'0', 32]);
        assert_eq!(&f[13..18], &[b'B', b'R', b'0', b'1', 32]);
    }

    #[test]
    fn test_operation_region_with_named_base() {
        let r = operation_region("CBAT", RegionSpace::SystemMemory, &name_ref("BPTR"), 0x40);
        assert_eq!(
            r,
            vec![0x5B, 0x80, b'C', b'B', b'A', b'T', 0x00, b'B', b'P', b'T', b'R', 0x0A, 0x40]
        );
    }

    #[test]
    fn test_notify_and_arithmetic() {
        let n = notify(&name_ref("\\_SB.AC"), &integer(0x80));
        assert_eq!(n[0], 0x86);
        assert_eq!(&n[n.len() - 2..], &[0x0A, 0x80]);

        let s = shift_right(&name_ref("BR00"), &integer(1), Some(&local(0)));
        assert_eq!(s, vec![0x7A, b'B', b'R', b'0', b'0', 0x01, 0x60]);

        let a = and(&local(0), &integer(1), None);
        assert_eq!(a, vec![0x7B, 0x60, 0x01, 0x00]);
    }
}
