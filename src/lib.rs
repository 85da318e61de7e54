//! Peripheral device simulation core for an 8-bit retro computer emulator.
//!
//! Wires together the address bus, the peripheral controller (a VIA-class
//! parallel port with bit-banged SPI and I2C masters), and the devices it
//! drives: an SD card over SPI, an RTC over I2C, a video controller, and a
//! PS/2 host interface. None of this crate schedules CPU cycles or decodes
//! 65C02 opcodes — it only exposes the bus-visible behavior of the
//! peripherals themselves, without owning a video backend or windowing
//! system.

pub mod bus;
pub mod config;
pub mod diskimage;
pub mod error;
pub mod i2c;
pub mod ps2;
pub mod rtc;
pub mod sdcard;
pub mod spi;
pub mod via;
pub mod video;

pub mod prelude {
    pub use crate::bus::{Bus, BusDevice, Interrupt, IrqSource};
    pub use crate::config::{MountOptions, SystemConfig};
    pub use crate::diskimage::{BlockStore, FileBlockStore, MemBlockStore};
    pub use crate::error::PeripheralError;
    pub use crate::ps2::Ps2Controller;
    pub use crate::rtc::Rtc;
    pub use crate::sdcard::SdCard;
    pub use crate::via::Via;
    pub use crate::video::VideoController;
}

use prelude::*;

/// Memory map: the three register-file devices sit in disjoint 16-byte
/// windows, with the peripheral controller's SPI/I2C masters driving the
/// SD card and RTC as bus-invisible targets behind it.
pub const VIDEO_RANGE: (u16, u16) = (0x4000, 0x400F);
pub const PS2_RANGE: (u16, u16) = (0x4020, 0x402F);
pub const VIA_RANGE: (u16, u16) = (0x4070, 0x407F);

/// The SPI slot the SD card is wired into on the peripheral controller.
pub const SD_CARD_SPI_SLOT: usize = 0;

/// Owns the bus and every peripheral registered on it, and knows how to
/// fold each device's local interrupt flag onto the bus's shared line.
pub struct System {
    pub bus: Bus,
}

impl System {
    /// Build a system with an SD card (if a disk image is provided), an
    /// RTC, a video controller, and a PS/2 host interface, all wired at
    /// their fixed bus addresses.
    pub fn new(config: SystemConfig, sd_image: Option<MountOptions>) -> Result<Self, PeripheralError> {
        let mut bus = Bus::new();
        let mut via = Via::new();

        if let Some(mount) = sd_image {
            let store = FileBlockStore::mount(&mount)?;
            via.register_spi(SD_CARD_SPI_SLOT, Box::new(SdCard::new(Box::new(store))));
        }
        via.register_i2c(Box::new(Rtc::new(config.rtc_offset_ms)));

        bus.add_device(VIA_RANGE.0, VIA_RANGE.1, Box::new(via))?;
        bus.add_device(VIDEO_RANGE.0, VIDEO_RANGE.1, Box::new(VideoController::new()))?;
        bus.add_device(PS2_RANGE.0, PS2_RANGE.1, Box::new(Ps2Controller::new()))?;

        Ok(Self { bus })
    }

    /// A system with no SD card mounted — the card slot is simply absent
    /// rather than backed by a zero-length image.
    pub fn without_sd_card(config: SystemConfig) -> Self {
        Self::new(config, None).expect("fixed address ranges never overlap")
    }

    /// Refresh the shared interrupt line from the peripheral controller's
    /// and PS/2 interface's local IFR summary bits. A driving loop calls
    /// this once per instruction boundary, not on every register access.
    pub fn poll_interrupts(&mut self) {
        self.bus.poll_interrupts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_disjoint_device_ranges() {
        let mut system = System::without_sd_card(SystemConfig::default());
        system.bus.write(VIDEO_RANGE.0 + 1, 0x00); // MODE register
        system.bus.write(PS2_RANGE.0, 0x00); // read-only, dropped
        system.bus.write(VIA_RANGE.0 + 3, 0x00); // DDRA
        assert_eq!(system.bus.read(VIDEO_RANGE.0), 0x04); // STATUS: ready
    }

    #[test]
    fn poll_interrupts_leaves_line_clear_with_nothing_pending() {
        let mut system = System::without_sd_card(SystemConfig::default());
        system.poll_interrupts();
        assert!(!system.bus.irq_asserted());
    }
}
