//! Event Bridge - helper interrupt to guest GPE, guest write to helper doorbell

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

use vbattery::{AcpiEventSink, AcpiEventStatus};

use crate::notifier::EventNotifier;

/// Offset of the doorbell register inside the shared window.
pub const DOORBELL_OFFSET: u64 = 0;

/// Access width that rings the doorbell.
pub const DOORBELL_WIDTH: u32 = 4;

/// Forwards helper interrupts to the guest as battery status events.
pub struct IrqBridge {
    irq: EventNotifier,
    sink: Arc<dyn AcpiEventSink>,
}

impl IrqBridge {
    pub fn new(irq: EventNotifier, sink: Arc<dyn AcpiEventSink>) -> Self {
        Self { irq, sink }
    }

    /// Run when the interrupt descriptor becomes readable.
    ///
    /// Returns whether a signal was pending. The guest is notified either way.
    pub fn handle(&self) -> bool {
        let pending = self.irq.test_and_clear();
        log::trace!("helper interrupt (pending: {})", pending);
        self.sink.send_event(AcpiEventStatus::BATTERY_STATUS);
        pending
    }
}

impl AsFd for IrqBridge {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.irq.as_fd()
    }
}

/// Guest-to-helper signal path.
pub struct Doorbell {
    notifier: EventNotifier,
}

impl Doorbell {
    pub fn new(notifier: EventNotifier) -> Self {
        Self { notifier }
    }

    /// Whether a guest write of `size` bytes at `offset` rings the doorbell.
    pub fn matches(offset: u64, size: u32) -> bool {
        offset == DOORBELL_OFFSET && size == DOORBELL_WIDTH
    }

    /// Guest write into the shared window. Any data value rings.
    ///
    /// Returns `true` if the write hit the doorbell.
    pub fn mmio_write(&self, offset: u64, size: u32) -> bool {
        if !Self::matches(offset, size) {
            return false;
        }
        if let Err(e) = self.notifier.set() {
            log::warn!("can't ring helper doorbell: {}", e);
        }
        true
    }
}
