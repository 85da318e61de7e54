//! PS/2 host interface.
//!
//! Register file laid out the same way as [`crate::via::Via`] — a data
//! register plus the same IFR/IER pair and bit-7 summary convention —
//! generalized to a single read-only data byte fed by a scan-code FIFO
//! instead of a parallel port. The FIFO's paced interrupt delivery runs on
//! a background thread rather than asserting immediately, since a real
//! PS/2 link clocks one bit at a time rather than delivering a byte
//! instantaneously.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::bus::BusDevice;

const REG_DATA: u16 = 0x0;
const REG_IFR: u16 = 13;
const REG_IER: u16 = 14;

const CA1_DATA_PENDING: u8 = 0x01;

const SHIFT_MAKE: u8 = 0x12;
const SHIFT_BREAK: [u8; 2] = [0xF0, 0x12];
const CAPS_LOCK_MAKE: u8 = 0x58;

const LETTER_CODES: [u8; 26] = [
    0x1C, 0x32, 0x21, 0x23, 0x24, 0x2B, 0x34, 0x33, 0x43, 0x3B, 0x42, 0x4B, 0x3A, 0x31, 0x44, 0x4D,
    0x15, 0x2D, 0x1B, 0x2C, 0x3C, 0x2A, 0x1D, 0x22, 0x35, 0x1A,
];

const DIGIT_CODES: [u8; 10] = [0x45, 0x16, 0x1E, 0x26, 0x25, 0x2E, 0x36, 0x3D, 0x3E, 0x46];

/// Set-2 scan code and whether it requires the shift modifier held.
fn key_for_ascii(ch: u8) -> Option<(u8, bool)> {
    match ch {
        b'a'..=b'z' => Some((LETTER_CODES[(ch - b'a') as usize], false)),
        b'A'..=b'Z' => Some((LETTER_CODES[(ch - b'A') as usize], true)),
        b'0'..=b'9' => Some((DIGIT_CODES[(ch - b'0') as usize], false)),
        b' ' => Some((0x29, false)),
        b'\n' => Some((0x5A, false)),
        b'\t' => Some((0x0D, false)),
        0x08 => Some((0x66, false)),
        0x1B => Some((0x76, false)),
        b'!' => Some((0x16, true)),
        b'@' => Some((0x1E, true)),
        b'#' => Some((0x26, true)),
        b'$' => Some((0x25, true)),
        b'%' => Some((0x2E, true)),
        b'^' => Some((0x36, true)),
        b'&' => Some((0x3D, true)),
        b'*' => Some((0x3E, true)),
        b'(' => Some((0x46, true)),
        b')' => Some((0x45, true)),
        b'-' => Some((0x4E, false)),
        b'_' => Some((0x4E, true)),
        b'=' => Some((0x55, false)),
        b'+' => Some((0x55, true)),
        b',' => Some((0x41, false)),
        b'<' => Some((0x41, true)),
        b'.' => Some((0x49, false)),
        b'>' => Some((0x49, true)),
        b'/' => Some((0x4A, false)),
        b'?' => Some((0x4A, true)),
        b';' => Some((0x4C, false)),
        b':' => Some((0x4C, true)),
        b'\'' => Some((0x52, false)),
        b'"' => Some((0x52, true)),
        b'[' => Some((0x54, false)),
        b'{' => Some((0x54, true)),
        b']' => Some((0x5B, false)),
        b'}' => Some((0x5B, true)),
        b'\\' => Some((0x5D, false)),
        b'|' => Some((0x5D, true)),
        b'`' => Some((0x0E, false)),
        b'~' => Some((0x0E, true)),
        _ => None,
    }
}

#[derive(Default)]
struct Shared {
    queue: VecDeque<u8>,
    ifr: u8,
}

pub struct Ps2Controller {
    shared: Arc<Mutex<Shared>>,
    ier: u8,
    pacing: Arc<AtomicBool>,
}

impl Ps2Controller {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            ier: 0,
            pacing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a raw Set-2 scan code byte (make or break).
    pub fn enqueue_byte(&mut self, byte: u8) {
        let was_empty = {
            let mut shared = self.shared.lock().unwrap();
            let was_empty = shared.queue.is_empty();
            shared.queue.push_back(byte);
            was_empty
        };
        if was_empty {
            self.schedule_paced_assert();
        }
    }

    /// Make+break sequence for one ASCII character, with shift framing for
    /// uppercase letters and shifted punctuation.
    pub fn inject_ascii(&mut self, ch: u8) {
        match key_for_ascii(ch) {
            Some((code, shift)) => {
                if shift {
                    self.enqueue_byte(SHIFT_MAKE);
                }
                self.enqueue_byte(code);
                self.enqueue_byte(0xF0);
                self.enqueue_byte(code);
                if shift {
                    self.enqueue_byte(SHIFT_BREAK[0]);
                    self.enqueue_byte(SHIFT_BREAK[1]);
                }
            }
            None => warn!("no PS/2 scan code mapping for ascii byte {ch:#04x}"),
        }
    }

    /// Caps Lock toggles on make alone; the host never sees a break code.
    pub fn press_caps_lock(&mut self) {
        self.enqueue_byte(CAPS_LOCK_MAKE);
    }

    fn schedule_paced_assert(&self) {
        self.pacing.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let cancel = Arc::clone(&self.pacing);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(1));
            if cancel.swap(false, Ordering::SeqCst) {
                let mut shared = shared.lock().unwrap();
                if !shared.queue.is_empty() {
                    shared.ifr |= CA1_DATA_PENDING;
                }
            }
        });
    }

    fn read_data(&mut self) -> u8 {
        let (byte, more_pending) = {
            let mut shared = self.shared.lock().unwrap();
            let byte = shared.queue.pop_front().unwrap_or(0x00);
            shared.ifr &= !CA1_DATA_PENDING;
            (byte, !shared.queue.is_empty())
        };
        if more_pending {
            self.schedule_paced_assert();
        }
        byte
    }

    fn read_ifr(&self) -> u8 {
        let shared = self.shared.lock().unwrap();
        let base = shared.ifr & 0x7F;
        if base != 0 {
            base | 0x80
        } else {
            base
        }
    }

    /// Whether the IFR summary bit (bit 7) is set.
    pub fn irq_pending(&self) -> bool {
        self.read_ifr() & 0x80 != 0
    }

    fn write_ifr(&mut self, value: u8) {
        let mut shared = self.shared.lock().unwrap();
        shared.ifr &= !value;
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
        self.pacing.store(false, Ordering::SeqCst);
        let mut shared = self.shared.lock().unwrap();
        shared.queue.clear();
        shared.ifr = 0;
        drop(shared);
        self.ier = 0;
    }
}

impl Default for Ps2Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl BusDevice for Ps2Controller {
    fn read(&mut self, offset: u16) -> u8 {
        match offset {
            REG_DATA => self.read_data(),
            REG_IFR => self.read_ifr(),
            REG_IER => self.read_ier(),
            _ => 0x00,
        }
    }

    fn write(&mut self, offset: u16, value: u8) {
        match offset {
            REG_DATA => warn!("ignored write of {value:#04x} to read-only PS/2 data register"),
            REG_IFR => self.write_ifr(value),
            REG_IER => self.write_ier(value),
            _ => {}
        }
    }

    fn name(&self) -> &str {
        "ps2-host-interface"
    }

    fn irq_pending(&self) -> bool {
        Ps2Controller::irq_pending(self)
    }

    fn irq_source(&self) -> Option<crate::bus::IrqSource> {
        Some(crate::bus::IrqSource::Ps2)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
