//! ACPI Table Generator - AML description of the battery and AC adapter
//!
//! Produces, inside `\_SB`:
//! - an operation region covering the register window
//! - one 32-bit field per register, named `<prefix><index>`
//! - the AC adapter (`ACPI0003`) and one control method battery (`PNP0C0A`)
//!   per unit
//!
//! plus a `\_GPE._E07` handler notifying all of them. Battery status packages
//! reference register fields by name, so the guest always sees the current
//! register contents without regenerating the table.

use aml_build::{self as aml, FieldAccess, FieldLock, FieldUpdate, NamedField, RegionSpace};

use crate::event::{BATTERY_GPE, NOTIFY_STATUS_CHANGED};
use crate::registers::{
    RegisterFile, MMIO_LEN, REGISTER_COUNT, R_CHARGE_FULL, R_CHARGE_FULL_DESIGN, R_CHARGE_NOW,
    R_CURRENT_NOW, R_MAX, R_STATE, R_VOLTAGE_MIN_DESIGN, R_VOLTAGE_NOW, UNKNOWN,
};

/// Operation region holding the register window.
pub const REGION_NAME: &str = "CBAT";

/// Default two character prefix of register field names.
pub const DEFAULT_PREFIX: &str = "BR";

pub const AC_ADAPTER_NAME: &str = "AC";
pub const AC_ADAPTER_HID: &str = "ACPI0003";
pub const BATTERY_HID: &str = "PNP0C0A";

pub const BATTERY_MODEL: &str = "Virtual Battery";
pub const BATTERY_SERIAL: &str = "00000";
pub const BATTERY_TECHNOLOGY: &str = "LI-ION";
pub const BATTERY_MANUFACTURER: &str = "QEMU";

pub const AC_PSR_OFFLINE: u64 = 0x0;
pub const AC_PSR_ONLINE: u64 = 0x1;

/// `_STA`: present, enabled, shown in UI, functioning.
pub const STA_PRESENT: u64 = 0x0F;
/// `_STA` for a battery: bay bits plus "battery present".
pub const STA_BATTERY_PRESENT: u64 = 0x1F;

const POWER_UNIT_MA: u64 = 0x01;
const TECHNOLOGY_RECHARGEABLE: u64 = 0x01;
const GRANULARITY_MAH: u64 = 0x01;

/// Build the 4 character field name for a register.
///
/// `prefix` must be exactly two name characters and `index` below 100; both
/// are structural limits of the generated table.
pub fn field_name(prefix: &str, index: usize) -> [u8; 4] {
    assert_eq!(prefix.len(), 2, "register prefix {:?} must be 2 characters", prefix);
    assert!(index < 100, "register index {} does not fit in two digits", index);

    // name_seg rejects prefixes that are not valid AML name characters.
    aml::name_seg(&format!("{}{:02}", prefix, index))
}

/// Split a field name back into its prefix and register index.
pub fn parse_field_name(name: &[u8; 4]) -> Option<([u8; 2], usize)> {
    if !name[2].is_ascii_digit() || !name[3].is_ascii_digit() {
        return None;
    }
    let index = (name[2] - b'0') as usize * 10 + (name[3] - b'0') as usize;
    Some(([name[0], name[1]], index))
}

fn field_str(prefix: &str, index: usize) -> String {
    String::from_utf8_lossy(&field_name(prefix, index)).into_owned()
}

/// Element of a package returned by a battery method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    Int(u64),
    Str(&'static str),
    /// Live reference to the register field with this index.
    Reg(usize),
}

/// Resolved value of an [`Element`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Int(u64),
    Str(&'static str),
}

impl Element {
    fn encode(&self, prefix: &str) -> Vec<u8> {
        match *self {
            Element::Int(v) => aml::integer(v),
            Element::Str(s) => aml::string(s),
            Element::Reg(index) => aml::name_ref(&field_str(prefix, index)),
        }
    }

    /// Value the guest observes when evaluating this element now.
    pub fn resolve(&self, regs: &RegisterFile) -> Value {
        match *self {
            Element::Int(v) => Value::Int(v),
            Element::Str(s) => Value::Str(s),
            Element::Reg(index) => Value::Int(regs.get(index) as u64),
        }
    }
}

/// `_BIF`: static battery information (ACPI 6.2, 10.2.2.1).
pub const BIF_PACKAGE: [Element; 13] = [
    Element::Int(POWER_UNIT_MA),
    Element::Reg(R_CHARGE_FULL_DESIGN),
    Element::Reg(R_CHARGE_FULL),
    Element::Int(TECHNOLOGY_RECHARGEABLE),
    Element::Reg(R_VOLTAGE_MIN_DESIGN),
    // design capacity of warning / low
    Element::Int(UNKNOWN as u64),
    Element::Int(UNKNOWN as u64),
    Element::Int(GRANULARITY_MAH),
    Element::Int(GRANULARITY_MAH),
    Element::Str(BATTERY_MODEL),
    Element::Str(BATTERY_SERIAL),
    Element::Str(BATTERY_TECHNOLOGY),
    Element::Str(BATTERY_MANUFACTURER),
];

/// `_BST`: present battery status (ACPI 6.2, 10.2.2.6).
pub const BST_PACKAGE: [Element; 4] = [
    Element::Reg(R_STATE),
    Element::Reg(R_CURRENT_NOW),
    Element::Reg(R_CHARGE_NOW),
    Element::Reg(R_VOLTAGE_NOW),
];

/// Where the register window lives in guest physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionBase<'a> {
    /// Fixed address known when the table is generated.
    Fixed(u64),
    /// Address stored in a named integer, patched after table placement.
    Named(&'a str),
}

/// Inputs of the table generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout<'a> {
    pub region_base: RegionBase<'a>,
    pub prefix: &'a str,
    pub adapter_uid: u32,
    pub battery_uids: &'a [u8],
}

impl TableLayout<'static> {
    /// Single battery behind a register window at a fixed address.
    pub fn fixed(base: u64) -> Self {
        Self {
            region_base: RegionBase::Fixed(base),
            prefix: DEFAULT_PREFIX,
            adapter_uid: 1,
            battery_uids: &[0],
        }
    }
}

/// Operation region plus one DWord field per register.
pub fn register_fields(prefix: &str, base: RegionBase<'_>) -> Vec<u8> {
    let offset = match base {
        RegionBase::Fixed(addr) => aml::integer(addr),
        RegionBase::Named(name) => aml::name_ref(name),
    };
    let mut out = aml::operation_region(REGION_NAME, RegionSpace::SystemMemory, &offset, MMIO_LEN as u32);

    let fields: Vec<NamedField> = (0..=R_MAX)
        .map(|i| NamedField {
            name: field_name(prefix, i),
            bits: 32,
        })
        .collect();
    debug_assert_eq!(fields.len(), REGISTER_COUNT);

    out.extend(aml::field(
        REGION_NAME,
        FieldAccess::DWord,
        FieldLock::NoLock,
        FieldUpdate::Preserve,
        &fields,
    ));
    out
}

fn power_consumer_list() -> Vec<u8> {
    aml::name_decl("_PCL", &aml::package(&[aml::name_ref("\\_SB")]))
}

/// External power supply device (ACPI 6.2, 10.3).
pub fn ac_adapter(uid: u32) -> Vec<u8> {
    let mut body = aml::name_decl("_HID", &aml::string(AC_ADAPTER_HID));
    body.extend(aml::name_decl("_UID", &aml::integer(uid as u64)));
    body.extend(power_consumer_list());
    body.extend(aml::method("_STA", 0, false, &aml::ret(&aml::integer(STA_PRESENT))));

    // TODO: derive _PSR from the charging bits of every battery once the
    // multi-battery aggregation rule is settled; until then report offline.
    body.extend(aml::method("_PSR", 0, false, &aml::ret(&aml::integer(AC_PSR_OFFLINE))));

    aml::device(AC_ADAPTER_NAME, &body)
}

/// Device name of battery unit `uid`.
pub fn battery_name(uid: u8) -> String {
    assert!(uid < 10, "battery unit {} does not fit in a 4 character name", uid);
    format!("BAT{}", uid)
}

fn encode_package(prefix: &str, elements: &[Element]) -> Vec<u8> {
    let encoded: Vec<Vec<u8>> = elements.iter().map(|e| e.encode(prefix)).collect();
    aml::package(&encoded)
}

/// Control method battery (ACPI 6.2, 10.2).
pub fn battery(uid: u8, prefix: &str) -> Vec<u8> {
    let mut body = aml::name_decl("_HID", &aml::eisa_id(BATTERY_HID));
    body.extend(aml::name_decl("_UID", &aml::integer(uid as u64)));
    body.extend(power_consumer_list());
    body.extend(aml::method(
        "_STA",
        0,
        false,
        &aml::ret(&aml::integer(STA_BATTERY_PRESENT)),
    ));
    body.extend(aml::method(
        "_BIF",
        0,
        false,
        &aml::ret(&encode_package(prefix, &BIF_PACKAGE)),
    ));
    body.extend(aml::method(
        "_BST",
        0,
        false,
        &aml::ret(&encode_package(prefix, &BST_PACKAGE)),
    ));
    aml::device(&battery_name(uid), &body)
}

/// `\_GPE._E07`: notify the adapter and every battery of a status change.
pub fn gpe_handler(battery_uids: &[u8]) -> Vec<u8> {
    let code = aml::integer(NOTIFY_STATUS_CHANGED as u64);
    let mut body = aml::notify(&aml::name_ref("\\_SB.AC"), &code);
    for &uid in battery_uids {
        let path = format!("\\_SB.{}", battery_name(uid));
        body.extend(aml::notify(&aml::name_ref(&path), &code));
    }
    aml::method(&format!("\\_GPE._E{:02X}", BATTERY_GPE), 0, false, &body)
}

/// AML for the whole power subsystem, ready to be placed in a definition block.
pub fn build(layout: &TableLayout<'_>) -> Vec<u8> {
    let mut sb = register_fields(layout.prefix, layout.region_base);
    sb.extend(ac_adapter(layout.adapter_uid));
    for &uid in layout.battery_uids {
        sb.extend(battery(uid, layout.prefix));
    }

    let mut out = aml::scope("\\_SB", &sb);
    out.extend(gpe_handler(layout.battery_uids));
    log::debug!(
        "generated power subsystem AML: {} bytes, {} batteries",
        out.len(),
        layout.battery_uids.len()
    );
    out
}

/// Complete SSDT describing the power subsystem.
pub fn build_ssdt(layout: &TableLayout<'_>) -> Vec<u8> {
    aml::SdtHeader::new(b"SSDT", 1, "VMBattry").build(&build(layout))
}
