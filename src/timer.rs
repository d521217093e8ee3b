// The timer interrupts at a selectable frequency of 4096, 16384, 65536
// or 262144 Hz. That frequency increments the timer counter (TIMA); on
// overflow TIMA is reloaded from the timer modulo (TMA) and a timer
// interrupt is requested. The divider (DIV) free-runs at 16384 Hz.
use super::divider::Divider;
use super::irq::{SharedIrq, Source};
use super::memory::Memory;
use bincode::{Decode, Encode};

pub struct Timer {
    irq: SharedIrq,
    // FF04 - DIV. Incremented every 256 cycles; writing any value resets
    // it to 0.
    div: u8,
    // FF05 - TIMA. Incremented at the TAC rate while TAC bit 2 is set.
    tima: u8,
    // FF06 - TMA. Loaded into TIMA when it overflows.
    tma: u8,
    // FF07 - TAC.
    //   Bit  2   - Timer Enable
    //   Bits 1-0 - Input Clock Select
    //              00: 4096 Hz    01: 262144 Hz
    //              10: 65536 Hz   11: 16384 Hz
    tac: u8,
    div_tick: Divider,
    tima_tick: Divider,
}

#[derive(Decode, Encode)]
pub struct TimerState {
    div: u8,
    tima: u8,
    tma: u8,
    tac: u8,
    div_phase: u32,
    tima_period: u32,
    tima_phase: u32,
}

impl Timer {
    pub fn power_up(irq: SharedIrq) -> Self {
        Self {
            irq,
            div: 0x00,
            tima: 0x00,
            tma: 0x00,
            tac: 0x00,
            div_tick: Divider::power_up(256),
            tima_tick: Divider::power_up(1024),
        }
    }

    pub fn next(&mut self, cycles: u32) {
        let d = self.div_tick.tick(cycles);
        self.div = self.div.wrapping_add(d as u8);
        if self.tac & 0x04 == 0x00 {
            return;
        }
        for _ in 0..self.tima_tick.tick(cycles) {
            self.tima = self.tima.wrapping_add(1);
            if self.tima == 0x00 {
                self.tima = self.tma;
                self.irq.borrow_mut().raise(Source::Timer);
            }
        }
    }

    pub fn snapshot(&self) -> TimerState {
        TimerState {
            div: self.div,
            tima: self.tima,
            tma: self.tma,
            tac: self.tac,
            div_phase: self.div_tick.phase(),
            tima_period: self.tima_tick.period(),
            tima_phase: self.tima_tick.phase(),
        }
    }

    pub fn restore(&mut self, s: &TimerState) {
        self.div = s.div;
        self.tima = s.tima;
        self.tma = s.tma;
        self.tac = s.tac;
        self.div_tick.set_phase(s.div_phase);
        self.tima_tick.set_period(s.tima_period);
        self.tima_tick.set_phase(s.tima_phase);
    }
}

impl Memory for Timer {
    fn get(&self, a: u16) -> u8 {
        match a {
            0xff04 => self.div,
            0xff05 => self.tima,
            0xff06 => self.tma,
            0xff07 => self.tac,
            _ => 0x00,
        }
    }

    fn set(&mut self, a: u16, v: u8) {
        match a {
            0xff04 => {
                self.div = 0x00;
                self.div_tick.set_phase(0);
            }
            0xff05 => self.tima = v,
            0xff06 => self.tma = v,
            0xff07 => {
                self.tac = v;
                self.tima_tick.set_period(match v & 0x03 {
                    0x01 => 16,
                    0x02 => 64,
                    0x03 => 256,
                    _ => 1024,
                });
            }
            _ => {}
        }
    }
}
