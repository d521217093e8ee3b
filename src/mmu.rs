// Single entry point for the 16 bit address space. Every memory reference
// of the CPU passes through here and is routed to the cartridge, video
// RAM, work RAM, OAM, the I/O registers, high RAM or the interrupt
// enable byte, with the echo area and the boot overlay resolved on the
// way.
use super::cartridge::{self, Cartridge};
use super::error::{Error, Result};
use super::irq::{Irq, SharedIrq, Source};
use super::joypad::Joypad;
use super::memory::Memory;
use super::ppu::Ppu;
use super::timer::Timer;
use bincode::{Decode, Encode};
use std::cell::RefCell;
use std::rc::Rc;

pub struct Mmu {
    pub cartridge: Box<dyn Cartridge>,
    pub ppu: Ppu,
    pub joypad: Joypad,
    pub timer: Timer,
    pub irq: SharedIrq,
    inte: u8,
    // 256 byte bootstrap image overlaid on 0000-00FF until a write to
    // FF50 switches it out.
    boot: Vec<u8>,
    boot_mode: bool,
    wram: [u8; 0x2000],
    hram: [u8; 0x7f],
}

#[derive(Decode, Encode)]
pub struct MmuState {
    boot_mode: bool,
    inte: u8,
    iflags: u8,
    wram: [u8; 0x2000],
    hram: [u8; 0x7f],
}

impl Mmu {
    pub fn power_up(rom: Vec<u8>, boot: Option<Vec<u8>>) -> Result<Self> {
        if let Some(ref b) = boot {
            if b.len() != 0x0100 {
                return Err(Error::BadBoot);
            }
        }
        let boot_mode = boot.is_some();
        let irq = Rc::new(RefCell::new(Irq::power_up()));
        let mut r = Self {
            cartridge: cartridge::power_up(rom)?,
            ppu: Ppu::power_up(irq.clone()),
            joypad: Joypad::power_up(irq.clone()),
            timer: Timer::power_up(irq.clone()),
            irq,
            inte: 0x00,
            boot: boot.unwrap_or_default(),
            boot_mode,
            wram: [0x00; 0x2000],
            hram: [0x00; 0x7f],
        };
        if !boot_mode {
            // Registers as the boot sequence leaves them.
            r.set(0xff05, 0x00);
            r.set(0xff06, 0x00);
            r.set(0xff07, 0x00);
            r.set(0xff40, 0x91);
            r.set(0xff42, 0x00);
            r.set(0xff43, 0x00);
            r.set(0xff45, 0x00);
            r.set(0xff47, 0xfc);
            r.set(0xff48, 0xff);
            r.set(0xff49, 0xff);
            r.set(0xff4a, 0x00);
            r.set(0xff4b, 0x00);
        }
        Ok(r)
    }

    // Advances the peripherals by the cycles the CPU just spent.
    pub fn next(&mut self, cycles: u32) {
        self.timer.next(cycles);
        self.ppu.next(cycles);
    }

    pub fn request_interrupt(&mut self, source: Source) {
        self.irq.borrow_mut().raise(source);
    }

    pub fn snapshot(&self) -> MmuState {
        MmuState {
            boot_mode: self.boot_mode,
            inte: self.inte,
            iflags: self.irq.borrow().value(),
            wram: self.wram,
            hram: self.hram,
        }
    }

    pub fn restore(&mut self, s: &MmuState) {
        self.boot_mode = s.boot_mode && !self.boot.is_empty();
        self.inte = s.inte;
        self.irq.borrow_mut().load(s.iflags);
        self.wram = s.wram;
        self.hram = s.hram;
    }
}

impl Memory for Mmu {
    fn get(&self, a: u16) -> u8 {
        match a {
            0x0000..=0x00ff if self.boot_mode => self.boot[a as usize],
            0x0000..=0x7fff => self.cartridge.get(a),
            0x8000..=0x9fff => self.ppu.get(a),
            0xa000..=0xbfff => self.cartridge.get(a),
            0xc000..=0xdfff => self.wram[a as usize - 0xc000],
            // Echo of C000-DDFF.
            0xe000..=0xfdff => self.wram[a as usize - 0xe000],
            0xfe00..=0xfe9f => self.ppu.get(a),
            0xfea0..=0xfeff => 0x00,
            0xff00 => self.joypad.get(a),
            0xff04..=0xff07 => self.timer.get(a),
            0xff0f => self.irq.borrow().value(),
            0xff40..=0xff45 | 0xff47..=0xff4b => self.ppu.get(a),
            0xff80..=0xfffe => self.hram[a as usize - 0xff80],
            0xffff => self.inte,
            _ => 0x00,
        }
    }

    fn set(&mut self, a: u16, v: u8) {
        match a {
            0x0000..=0x7fff => self.cartridge.set(a, v),
            0x8000..=0x9fff => self.ppu.set(a, v),
            0xa000..=0xbfff => self.cartridge.set(a, v),
            0xc000..=0xdfff => self.wram[a as usize - 0xc000] = v,
            0xe000..=0xfdff => self.wram[a as usize - 0xe000] = v,
            0xfe00..=0xfe9f => self.ppu.set(a, v),
            0xfea0..=0xfeff => {}
            0xff00 => self.joypad.set(a, v),
            0xff04..=0xff07 => self.timer.set(a, v),
            0xff0f => self.irq.borrow_mut().load(v),
            0xff46 => {
                // OAM DMA: copies 160 bytes from v*0x100 into FE00-FE9F,
                // modeled as instantaneous.
                let base = u16::from(v) << 8;
                for i in 0..0xa0 {
                    let b = self.get(base + i);
                    self.set(0xfe00 + i, b);
                }
            }
            0xff40..=0xff45 | 0xff47..=0xff4b => self.ppu.set(a, v),
            0xff50 => self.boot_mode = false,
            0xff80..=0xfffe => self.hram[a as usize - 0xff80] = v,
            0xffff => self.inte = v,
            _ => {}
        }
    }
}
