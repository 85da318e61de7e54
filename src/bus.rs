//! Address bus and device registration.
//!
//! Devices register a disjoint `[start, end]` range at construction time;
//! the bus dispatches each read/write to whichever device's range contains
//! the address, translating to a device-relative offset.

use std::any::Any;
use std::collections::HashSet;

use log::warn;

use crate::error::{AddressRange, PeripheralError};

/// A memory-mapped peripheral, addressed bus-relative (`offset = addr - start`).
pub trait BusDevice: Any + Send {
    fn read(&mut self, offset: u16) -> u8;
    fn write(&mut self, offset: u16, value: u8);
    fn name(&self) -> &str;

    /// Whether this device currently wants its interrupt line asserted.
    /// Devices with no interrupt source (the video controller, which is
    /// polled via its status register) simply leave this at the default.
    fn irq_pending(&self) -> bool {
        false
    }

    /// Which shared-line source this device asserts, if any.
    fn irq_source(&self) -> Option<IrqSource> {
        None
    }

    /// Downcast hook for host-side backdoors (injecting a keypress, swapping
    /// a disk image) that don't fit the uniform register read/write ABI.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Named interrupt asserters. The shared line is "asserted" while any
/// asserter holds it — modeled as a set of sources rather than a single
/// unowned boolean, so clearing one source can't clobber another's hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqSource {
    Ps2,
    Video,
    Via,
}

/// The shared, pull-down interrupt line.
#[derive(Default)]
pub struct Interrupt {
    asserters: HashSet<IrqSource>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert(&mut self, source: IrqSource) {
        self.asserters.insert(source);
    }

    pub fn clear(&mut self, source: IrqSource) {
        self.asserters.remove(&source);
    }

    pub fn is_asserted(&self) -> bool {
        !self.asserters.is_empty()
    }

    pub fn asserted_by(&self, source: IrqSource) -> bool {
        self.asserters.contains(&source)
    }
}

struct DeviceEntry {
    range: AddressRange,
    device: Box<dyn BusDevice>,
}

fn ranges_overlap(a: AddressRange, b: AddressRange) -> bool {
    a.start <= b.end && b.start <= a.end
}

/// The shared address bus: owns all devices, dispatches reads/writes, and
/// carries the shared interrupt line.
pub struct Bus {
    devices: Vec<DeviceEntry>,
    irq: Interrupt,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            irq: Interrupt::new(),
        }
    }

    /// Register a device on `[start, end]` inclusive. Fails if the range
    /// overlaps any already-registered device.
    pub fn add_device(
        &mut self,
        start: u16,
        end: u16,
        device: Box<dyn BusDevice>,
    ) -> Result<(), PeripheralError> {
        let new = AddressRange::new(start, end);
        if let Some(existing) = self
            .devices
            .iter()
            .map(|e| e.range)
            .find(|&r| ranges_overlap(r, new))
        {
            return Err(PeripheralError::AddressRangeOverlap { new, existing });
        }
        self.devices.push(DeviceEntry { range: new, device });
        Ok(())
    }

    fn find_mut(&mut self, addr: u16) -> Option<&mut DeviceEntry> {
        self.devices
            .iter_mut()
            .find(|e| e.range.start <= addr && addr <= e.range.end)
    }

    /// Reach directly into the device registered at `start` for host-side
    /// interaction the register ABI has no room for (e.g. injecting a PS/2
    /// keypress). Returns `None` if no device is registered there or it is
    /// not a `T`.
    pub fn device_mut<T: 'static>(&mut self, start: u16) -> Option<&mut T> {
        self.devices
            .iter_mut()
            .find(|e| e.range.start == start)
            .and_then(|e| e.device.as_any_mut().downcast_mut::<T>())
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        match self.find_mut(addr) {
            Some(entry) => {
                let offset = addr - entry.range.start;
                entry.device.read(offset)
            }
            None => {
                warn!("bus read from unmapped address 0x{addr:04X}");
                0xFF
            }
        }
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        match self.find_mut(addr) {
            Some(entry) => {
                let offset = addr - entry.range.start;
                entry.device.write(offset, value);
            }
            None => {
                warn!("bus write to unmapped address 0x{addr:04X} dropped");
            }
        }
    }

    pub fn assert_irq(&mut self, source: IrqSource) {
        self.irq.assert(source);
    }

    pub fn clear_irq(&mut self, source: IrqSource) {
        self.irq.clear(source);
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq.is_asserted()
    }

    /// Refresh the shared interrupt line from every registered device's
    /// local IFR summary bit. Call this after driving the bus (e.g. once
    /// per CPU instruction boundary) rather than on every single write.
    pub fn poll_interrupts(&mut self) {
        for entry in &self.devices {
            if let Some(source) = entry.device.irq_source() {
                if entry.device.irq_pending() {
                    self.irq.assert(source);
                } else {
                    self.irq.clear(source);
                }
            }
        }
    }
}
