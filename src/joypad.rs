// FF00 - P1/JOYP - Joypad (R/W)
//
// The eight keys form a 2x4 matrix. The low nibble of `matrix` carries
// the direction lines and the high nibble the button lines, 1 meaning
// released. A program picks a row by writing a 0 into select bit 4
// (directions) or bit 5 (buttons), then reads the four lines on bits
// 0-3. Only the two select bits are writable.
use super::irq::{SharedIrq, Source};
use super::memory::Memory;
use bincode::{Decode, Encode};

const SELECT_DIRECTIONS: u8 = 0b0001_0000;
const SELECT_BUTTONS: u8 = 0b0010_0000;

#[rustfmt::skip]
#[derive(Clone, Copy)]
pub enum JoypadKey {
    Right  = 0b0000_0001,
    Left   = 0b0000_0010,
    Up     = 0b0000_0100,
    Down   = 0b0000_1000,
    A      = 0b0001_0000,
    B      = 0b0010_0000,
    Select = 0b0100_0000,
    Start  = 0b1000_0000,
}

pub struct Joypad {
    irq: SharedIrq,
    matrix: u8,
    select: u8,
}

#[derive(Decode, Encode)]
pub struct JoypadState {
    matrix: u8,
    select: u8,
}

impl Joypad {
    pub fn power_up(irq: SharedIrq) -> Self {
        Self { irq, matrix: 0xff, select: SELECT_DIRECTIONS | SELECT_BUTTONS }
    }

    // Presses or releases one key. A press pulls its matrix line low and
    // raises the joypad interrupt; a release lets the line float back up.
    pub fn set_key(&mut self, key: JoypadKey, pressed: bool) {
        if pressed {
            self.matrix &= !(key as u8);
            self.irq.borrow_mut().raise(Source::Joypad);
        } else {
            self.matrix |= key as u8;
        }
    }

    pub fn snapshot(&self) -> JoypadState {
        JoypadState { matrix: self.matrix, select: self.select }
    }

    pub fn restore(&mut self, s: &JoypadState) {
        self.matrix = s.matrix;
        self.select = s.select;
    }
}

impl Memory for Joypad {
    fn get(&self, a: u16) -> u8 {
        debug_assert_eq!(a, 0xff00);
        // Each selected row pulls its lines onto bits 0-3; with both
        // rows deselected the lines float high. Selecting both rows
        // wire-ANDs them, as the matrix does electrically.
        let mut lines = 0x0f;
        if self.select & SELECT_DIRECTIONS == 0x00 {
            lines &= self.matrix & 0x0f;
        }
        if self.select & SELECT_BUTTONS == 0x00 {
            lines &= self.matrix >> 4;
        }
        self.select | lines
    }

    fn set(&mut self, a: u16, v: u8) {
        debug_assert_eq!(a, 0xff00);
        self.select = v & (SELECT_DIRECTIONS | SELECT_BUTTONS);
    }
}
