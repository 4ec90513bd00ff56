//! ACPI event delivery toward the guest

use bitflags::bitflags;

bitflags! {
    /// General purpose event status bits. Bit `n` is handled by `\_GPE._Enn`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AcpiEventStatus: u32 {
        /// Battery or AC adapter status changed (`\_GPE._E07`).
        const BATTERY_STATUS = 1 << 7;
    }
}

/// GPE number wired to [`AcpiEventStatus::BATTERY_STATUS`].
pub const BATTERY_GPE: u8 = 7;

/// `Notify` code for "status changed" on battery and power source devices.
pub const NOTIFY_STATUS_CHANGED: u8 = 0x80;

/// The ACPI-capable device that raises GPEs for the guest.
///
/// Handed to devices at construction time.
pub trait AcpiEventSink: Send + Sync {
    fn send_event(&self, status: AcpiEventStatus);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_status_matches_gpe_bit() {
        assert_eq!(AcpiEventStatus::BATTERY_STATUS.bits(), 1 << BATTERY_GPE);
    }
}
