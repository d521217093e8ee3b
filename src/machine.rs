// Ties the interpreter to the bus and exposes the surface a driver needs:
// stepping, frames, buttons and snapshots. The machine owns every piece
// of mutable state, so a snapshot of it is a complete save state.
use super::cartridge::{Cartridge, CartridgeState};
use super::cpu::{Cpu, CpuState};
use super::error::{Error, Result};
use super::joypad::{JoypadKey, JoypadState};
use super::mmu::{Mmu, MmuState};
use super::ppu::{PpuState, FRAME_CYCLES, SCREEN_H, SCREEN_W};
use super::register::Register;
use super::timer::TimerState;
use bincode::{Decode, Encode};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Decode, Encode)]
struct Snapshot {
    version: u32,
    cpu: CpuState,
    mmu: MmuState,
    ppu: PpuState,
    timer: TimerState,
    joypad: JoypadState,
    cartridge: CartridgeState,
}

pub struct Machine {
    pub mmu: Mmu,
    pub cpu: Cpu,
    // Cycles already spent beyond the last frame boundary, so that frame
    // totals come out at exactly FRAME_CYCLES.
    frame_overrun: u32,
}

impl Machine {
    // Builds a machine from a raw cartridge image and an optional 256
    // byte boot image. Without a boot image execution starts at 0x0100
    // with the canonical post-boot register values; with one, at 0x0000
    // under the overlay.
    pub fn power_up(rom: Vec<u8>, boot: Option<Vec<u8>>) -> Result<Self> {
        let with_boot = boot.is_some();
        let mmu = Mmu::power_up(rom, boot)?;
        let reg = if with_boot { Register::boot() } else { Register::power_up() };
        Ok(Self { mmu, cpu: Cpu::power_up(reg), frame_overrun: 0 })
    }

    // Executes one instruction (or services one interrupt) and feeds the
    // spent cycles to the peripherals.
    pub fn step_instruction(&mut self) -> Result<u32> {
        let cycles = self.cpu.next(&mut self.mmu)?;
        self.mmu.next(cycles);
        Ok(cycles)
    }

    // Runs instructions until one frame's worth of cycles has elapsed and
    // hands out the finished framebuffer. Instructions straddling the
    // boundary are credited to the next frame.
    pub fn step_frame(&mut self) -> Result<&[u8; SCREEN_W * SCREEN_H]> {
        let mut elapsed = self.frame_overrun;
        while elapsed < FRAME_CYCLES {
            elapsed += self.step_instruction()?;
        }
        self.frame_overrun = elapsed - FRAME_CYCLES;
        Ok(&self.mmu.ppu.data)
    }

    pub fn framebuffer(&self) -> &[u8; SCREEN_W * SCREEN_H] {
        &self.mmu.ppu.data
    }

    pub fn set_button(&mut self, key: JoypadKey, pressed: bool) {
        self.mmu.joypad.set_key(key, pressed);
    }

    pub fn title(&self) -> String {
        self.mmu.cartridge.title()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let s = Snapshot {
            version: SNAPSHOT_VERSION,
            cpu: self.cpu.snapshot(),
            mmu: self.mmu.snapshot(),
            ppu: self.mmu.ppu.snapshot(),
            timer: self.mmu.timer.snapshot(),
            joypad: self.mmu.joypad.snapshot(),
            cartridge: self.mmu.cartridge.snapshot(),
        };
        bincode::encode_to_vec(&s, bincode::config::standard()).expect("snapshot encoding cannot fail")
    }

    pub fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        let (s, _): (Snapshot, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(|_| Error::BadSnapshot)?;
        if s.version != SNAPSHOT_VERSION {
            return Err(Error::BadSnapshot);
        }
        self.cpu.restore(&s.cpu);
        self.mmu.restore(&s.mmu);
        self.mmu.ppu.restore(&s.ppu);
        self.mmu.timer.restore(&s.timer);
        self.mmu.joypad.restore(&s.joypad);
        self.mmu.cartridge.restore(&s.cartridge);
        self.frame_overrun = 0;
        Ok(())
    }
}
