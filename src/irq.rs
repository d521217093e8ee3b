use std::cell::RefCell;
use std::rc::Rc;

// The five interrupt sources in priority order. Each owns one bit of the
// request register at FF0F, and its handler vector sits at 0040h plus
// eight bytes per bit.
#[derive(Clone, Copy)]
pub enum Source {
    VBlank,
    LcdStat,
    Timer,
    Serial,
    Joypad,
}

impl Source {
    pub fn mask(self) -> u8 {
        match self {
            Source::VBlank => 0x01,
            Source::LcdStat => 0x02,
            Source::Timer => 0x04,
            Source::Serial => 0x08,
            Source::Joypad => 0x10,
        }
    }
}

// The IF register. Every peripheral that can pull an interrupt line
// holds a handle to the same instance; the CPU consumes the bits at
// instruction boundaries through the bus.
pub struct Irq {
    flags: u8,
}

pub type SharedIrq = Rc<RefCell<Irq>>;

impl Irq {
    pub fn power_up() -> Self {
        Self { flags: 0x00 }
    }

    pub fn raise(&mut self, source: Source) {
        self.flags |= source.mask();
    }

    pub fn value(&self) -> u8 {
        self.flags
    }

    // Only the low five bits exist in silicon.
    pub fn load(&mut self, v: u8) {
        self.flags = v & 0x1f;
    }
}
