//! Peripheral controller: a VIA-class two-port parallel interface used as
//! a bit-bang master for SPI and I2C. Register offsets are matched and
//! every write recomputes derived state (chip-select, clock edges)
//! immediately rather than waiting for an explicit "commit" step.
//!
//! **Open-drain modeling.** A line's effective level is derived purely
//! from its direction-register bit: `ddr = 1` means driven low, `ddr = 0`
//! means released (reads high via the implied pull-up). The stored
//! data-register bit is readback-only state; it does not affect the line
//! level. This is why `write_ddr_a` — not `write_port_a` — is where
//! SCL/SDA edges actually happen.

use std::collections::HashMap;

use log::{debug, warn};

use crate::bus::BusDevice;
use crate::i2c::I2cTarget;
use crate::spi::SpiTarget;

const SPI_SLOTS: usize = 6;

/// I2C master protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum I2cState {
    Idle,
    Address,
    DataWrite,
    DataRead,
}

struct SpiState {
    selected: Option<usize>,
}

struct I2cMasterState {
    state: I2cState,
    bit_counter: u8,
    shift_reg: u8,
    active_target: Option<u8>,
    staged_read_byte: u8,
    slave_ack: bool,
}

impl I2cMasterState {
    fn new() -> Self {
        Self {
            state: I2cState::Idle,
            bit_counter: 0,
            shift_reg: 0,
            active_target: None,
            staged_read_byte: 0,
            slave_ack: false,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// The peripheral controller register file plus its SPI/I2C master logic.
pub struct Via {
    port_a: u8,
    port_b: u8,
    ddr_a: u8,
    ddr_b: u8,
    timers: [u8; 6],
    shift: u8,
    acr: u8,
    pcr: u8,
    ifr: u8,
    ier: u8,

    spi: SpiState,
    spi_targets: [Option<Box<dyn SpiTarget>>; SPI_SLOTS],

    i2c: I2cMasterState,
    i2c_targets: HashMap<u8, Box<dyn I2cTarget>>,
}

impl Default for Via {
    fn default() -> Self {
        Self::new()
    }
}

impl Via {
    pub fn new() -> Self {
        Self {
            port_a: 0x00,
            port_b: 0x00,
            ddr_a: 0x00,
            ddr_b: 0x00,
            timers: [0xFF; 6],
            shift: 0x00,
            acr: 0x00,
            pcr: 0x00,
            ifr: 0x00,
            ier: 0x00,
            spi: SpiState { selected: None },
            spi_targets: Default::default(),
            i2c: I2cMasterState::new(),
            i2c_targets: HashMap::new(),
        }
    }

    // ---- registration -------------------------------------------------

    /// Register an SPI target in slot `slot` (0..6). Idempotent.
    pub fn register_spi(&mut self, slot: usize, target: Box<dyn SpiTarget>) {
        assert!(slot < SPI_SLOTS, "SPI slot out of range");
        self.spi_targets[slot] = Some(target);
    }

    /// Unregister the SPI target in `slot`, deselecting and resetting it.
    pub fn unregister_spi(&mut self, slot: usize) {
        if let Some(mut target) = self.spi_targets[slot].take() {
            target.deselect();
            target.reset();
        }
        if self.spi.selected == Some(slot) {
            self.spi.selected = None;
        }
    }

    /// Register an I2C target, keyed by its own reported address. Idempotent.
    pub fn register_i2c(&mut self, target: Box<dyn I2cTarget>) {
        self.i2c_targets.insert(target.address(), target);
    }

    /// Unregister the I2C target at `address`, resetting it.
    pub fn unregister_i2c(&mut self, address: u8) {
        if let Some(mut target) = self.i2c_targets.remove(&address) {
            target.reset();
        }
        if self.i2c.active_target == Some(address) {
            self.i2c.clear();
        }
    }

    // ---- port A / SPI chip select --------------------------------------

    fn read_port_a(&mut self) -> u8 {
        let mut value = self.port_a;
        if self.ddr_a & 0x80 == 0 {
            let sda_bit = self.i2c_sda_read_bit();
            value = (value & !0x80) | (sda_bit << 7);
        }
        value
    }

    fn write_port_a(&mut self, value: u8) {
        self.port_a = value;
        self.evaluate_chip_select();
        // ddrA is unchanged here, so this is a no-op: line levels are
        // derived purely from ddrA, never from the portA data register.
        self.evaluate_i2c_edges(self.ddr_a, self.ddr_a);
    }

    fn evaluate_chip_select(&mut self) {
        let cs_bits = self.port_a & 0x3F;
        let mut clear_count = 0u32;
        let mut candidate = None;
        for i in 0..SPI_SLOTS as u8 {
            if (cs_bits >> i) & 1 == 0 {
                clear_count += 1;
                candidate = Some(i as usize);
            }
        }
        let new_selected = if clear_count == 1 { candidate } else { None };
        if clear_count > 1 {
            warn!("SPI chip-select: {clear_count} lines active-low simultaneously, treating as no selection");
        }
        if new_selected != self.spi.selected {
            if let Some(old) = self.spi.selected {
                if let Some(target) = self.spi_targets[old].as_mut() {
                    target.deselect();
                }
            }
            if let Some(new) = new_selected {
                if let Some(target) = self.spi_targets[new].as_mut() {
                    debug!("SPI select slot {new}");
                    target.select();
                }
            }
            self.spi.selected = new_selected;
        }
    }

    // ---- port B / SPI master --------------------------------------------

    fn read_port_b(&self) -> u8 {
        if self.spi.selected.is_none() {
            self.port_b | 0x02
        } else {
            self.port_b
        }
    }

    fn write_port_b(&mut self, value: u8) {
        let old = self.port_b;
        let new = (old & !self.ddr_b) | (value & self.ddr_b);
        self.port_b = new;

        let old_sck = (old >> 2) & 1;
        let new_sck = (new >> 2) & 1;
        if old_sck == 0 && new_sck == 1 {
            let mosi = new & 1;
            if let Some(idx) = self.spi.selected {
                if let Some(target) = self.spi_targets[idx].as_mut() {
                    let miso = target.transfer(mosi) & 1;
                    self.port_b = (self.port_b & !0x02) | (miso << 1);
                }
            }
        } else if old_sck == 1 && new_sck == 0 {
            if let Some(idx) = self.spi.selected {
                if let Some(target) = self.spi_targets[idx].as_mut() {
                    target.on_sck_falling();
                }
            }
        }
    }

    // ---- DDR A / I2C master -----------------------------------------------

    fn write_ddr_a(&mut self, value: u8) {
        let old = self.ddr_a;
        self.ddr_a = value;
        self.evaluate_i2c_edges(old, value);
    }

    fn active_target_mut(&mut self) -> Option<&mut Box<dyn I2cTarget>> {
        let addr = self.i2c.active_target?;
        self.i2c_targets.get_mut(&addr)
    }

    fn evaluate_i2c_edges(&mut self, old_ddr_a: u8, new_ddr_a: u8) {
        let old_scl = old_ddr_a & 0x40 == 0;
        let new_scl = new_ddr_a & 0x40 == 0;
        let old_sda = old_ddr_a & 0x80 == 0;
        let new_sda = new_ddr_a & 0x80 == 0;

        if old_scl && new_scl {
            if old_sda && !new_sda {
                self.i2c_start();
            } else if !old_sda && new_sda && self.i2c.bit_counter != 8 {
                self.i2c_stop();
            }
        } else if !old_scl && new_scl {
            self.i2c_scl_rising(new_sda);
        } else if old_scl && !new_scl {
            self.i2c_scl_falling();
        }
    }

    fn i2c_start(&mut self) {
        debug!("I2C START (repeated={})", self.i2c.state != I2cState::Idle);
        self.i2c.bit_counter = 0;
        self.i2c.shift_reg = 0;
        self.i2c.state = I2cState::Address;
    }

    fn i2c_stop(&mut self) {
        debug!("I2C STOP");
        if let Some(target) = self.active_target_mut() {
            target.stop();
        }
        self.i2c.clear();
    }

    fn i2c_scl_rising(&mut self, sda_high: bool) {
        if self.i2c.state == I2cState::Idle {
            return;
        }
        let sda_bit = u8::from(sda_high);
        if self.i2c.bit_counter < 8 {
            if self.i2c.state != I2cState::DataRead {
                self.i2c.shift_reg = (self.i2c.shift_reg << 1) | sda_bit;
            }
            self.i2c.bit_counter += 1;
            if self.i2c.bit_counter == 8 {
                self.i2c_handle_byte_complete();
            }
        } else if self.i2c.bit_counter == 8 {
            if self.i2c.state == I2cState::DataRead {
                let master_ack = sda_bit == 0;
                if master_ack {
                    if let Some(target) = self.active_target_mut() {
                        self.i2c.staged_read_byte = target.read_byte(true);
                    }
                }
            }
            self.i2c.bit_counter = 9;
        }
    }

    fn i2c_scl_falling(&mut self) {
        if self.i2c.bit_counter == 9 {
            self.i2c.bit_counter = 0;
        }
    }

    fn i2c_handle_byte_complete(&mut self) {
        match self.i2c.state {
            I2cState::Address => {
                let byte = self.i2c.shift_reg;
                let addr7 = byte >> 1;
                let is_read = byte & 1 != 0;
                if let Some(target) = self.i2c_targets.get_mut(&addr7) {
                    let acked = target.start(is_read);
                    self.i2c.slave_ack = acked;
                    if acked {
                        self.i2c.active_target = Some(addr7);
                        if is_read {
                            self.i2c.state = I2cState::DataRead;
                            self.i2c.staged_read_byte = target.read_byte(true);
                        } else {
                            self.i2c.state = I2cState::DataWrite;
                        }
                    } else {
                        self.i2c.active_target = None;
                    }
                } else {
                    warn!("I2C address 0x{addr7:02X} matched no registered target, NACK");
                    self.i2c.slave_ack = false;
                    self.i2c.active_target = None;
                    // stays in Address state until STOP clears it
                }
            }
            I2cState::DataWrite => {
                let byte = self.i2c.shift_reg;
                if let Some(target) = self.active_target_mut() {
                    self.i2c.slave_ack = target.write_byte(byte);
                } else {
                    self.i2c.slave_ack = false;
                }
            }
            I2cState::DataRead | I2cState::Idle => {}
        }
    }

    /// SDA value the master samples on a port A read with ddrA bit7 = 0.
    fn i2c_sda_read_bit(&self) -> u8 {
        if self.i2c.state != I2cState::Idle && matches!(self.i2c.bit_counter, 8 | 9) {
            u8::from(!self.i2c.slave_ack)
        } else if self.i2c.state == I2cState::DataRead && self.i2c.bit_counter <= 7 {
            let idx = self.i2c.bit_counter;
            (self.i2c.staged_read_byte >> (7 - idx)) & 1
        } else {
            1
        }
    }

    // ---- IFR / IER -------------------------------------------------------

    fn read_ifr(&self) -> u8 {
        let base = self.ifr & 0x7F;
        if base != 0 {
            base | 0x80
        } else {
            base
        }
    }

    fn write_ifr(&mut self, value: u8) {
        self.ifr &= !value;
    }

    fn read_ier(&self) -> u8 {
        self.ier | 0x80
    }

    fn write_ier(&mut self, value: u8) {
        if value & 0x80 != 0 {
            self.ier |= value & 0x7F;
        } else {
            self.ier &= !(value & 0x7F);
        }
    }

    pub fn reset(&mut self) {
        self.port_a = 0x00;
        self.port_b = 0x00;
        self.ddr_a = 0x00;
        self.ddr_b = 0x00;
        self.timers = [0xFF; 6];
        self.shift = 0x00;
        self.acr = 0x00;
        self.pcr = 0x00;
        self.ifr = 0x00;
        self.ier = 0x00;

        for slot in self.spi_targets.iter_mut().flatten() {
            slot.deselect();
            slot.reset();
        }
        self.spi.selected = None;

        for target in self.i2c_targets.values_mut() {
            target.reset();
        }
        self.i2c.clear();
    }

    /// Whether the IFR summary bit (bit 7) is set — any enabled flag pending.
    pub fn irq_pending(&self) -> bool {
        self.read_ifr() & 0x80 != 0
    }
}

impl BusDevice for Via {
    fn read(&mut self, offset: u16) -> u8 {
        match offset {
            0 => self.read_port_b(),
            1 | 15 => self.read_port_a(),
            2 => self.ddr_b,
            3 => self.ddr_a,
            4..=9 => self.timers[(offset - 4) as usize],
            10 => self.shift,
            11 => self.acr,
            12 => self.pcr,
            13 => self.read_ifr(),
            14 => self.read_ier(),
            _ => {
                warn!("VIA read from out-of-range offset {offset}");
                0xFF
            }
        }
    }

    fn write(&mut self, offset: u16, value: u8) {
        match offset {
            0 => self.write_port_b(value),
            1 | 15 => self.write_port_a(value),
            2 => self.ddr_b = value,
            3 => self.write_ddr_a(value),
            4..=9 => self.timers[(offset - 4) as usize] = value,
            10 => self.shift = value,
            11 => self.acr = value,
            12 => self.pcr = value,
            13 => self.write_ifr(value),
            14 => self.write_ier(value),
            _ => warn!("VIA write to out-of-range offset {offset} dropped"),
        }
    }

    fn name(&self) -> &str {
        "peripheral-controller"
    }

    fn irq_pending(&self) -> bool {
        Via::irq_pending(self)
    }

    fn irq_source(&self) -> Option<crate::bus::IrqSource> {
        Some(crate::bus::IrqSource::Via)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
