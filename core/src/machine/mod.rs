use crate::{
    cartridge::Cartridge,
    env::AudioSink,
    mbc::Mbc,
    primitives::{Byte, Word, Memory},
};
use self::{
    apu::Apu,
    cpu::Cpu,
    dma::OamDma,
    input::{Button, InputController},
    interrupt::{InterruptController, Interrupt},
    ppu::Ppu,
    serial::SerialPort,
    timer::Timer,
};


#[macro_use]
mod macros;

pub mod apu;
pub mod cpu;
mod dma;
pub mod input;
mod interrupt;
mod mm;
pub mod ppu;
mod serial;
mod step;
mod timer;


/// The whole machine: CPU, PPU, APU, memory and all the glue between them.
///
/// Every piece of state has exactly one owner in here; subsystems talk to
/// each other only through the methods the `Machine` impls provide (the
/// memory map in `mm`, the interrupt controller as the single rendezvous
/// point).
pub struct Machine {
    pub cpu: Cpu,

    pub cartridge: Cartridge,

    pub wram: Memory,
    pub hram: Memory,

    pub ppu: Ppu,
    pub apu: Apu,

    pub(crate) timer: Timer,
    pub(crate) serial: SerialPort,

    pub(crate) interrupt_controller: InterruptController,
    pub(crate) input_controller: InputController,
    pub(crate) oam_dma: OamDma,

    /// Because the EI instruction enables the interrupts only after the
    /// following instruction, we have to remember the request here.
    pub(crate) enable_interrupts_next_step: bool,

    /// Indicates if the machine is in HALT mode. This mode can be exited in
    /// three ways:
    ///
    /// IME is set to true
    ///     1. The CPU jumps to the next enabled and requested interrupt
    ///
    /// IME is set to false
    ///     2. (IE & IF & 0x1F) == 0 -> The CPU resumes to normal when an
    ///        enabled interrupt is requested, but doesn't jump to the ISR.
    ///     3. (IE & IF & 0x1F) != 0 -> The HALT instruction doesn't halt at
    ///        all; instead the HALT bug occurs (see `halt_bug`).
    pub(crate) halt: bool,

    /// The HALT bug: after a HALT with IME=0 and a pending interrupt, PC is
    /// not incremented for the next opcode fetch, so the byte after HALT is
    /// executed twice.
    pub(crate) halt_bug: bool,

    /// Set by the STOP instruction; cleared when a button is pressed.
    pub(crate) stopped: bool,
}

impl Machine {
    pub(crate) fn new(cartridge: Cartridge, sample_rate: u32) -> Self {
        Self {
            cpu: Cpu::new(),
            cartridge,
            wram: Memory::zeroed(Word::new(0x2000)),
            hram: Memory::zeroed(Word::new(0x7F)),
            ppu: Ppu::new(),
            apu: Apu::new(sample_rate),
            timer: Timer::new(),
            serial: SerialPort::new(),
            interrupt_controller: InterruptController::new(),
            input_controller: InputController::new(),
            oam_dma: OamDma::new(),
            enable_interrupts_next_step: false,
            halt: false,
            halt_bug: false,
            stopped: false,
        }
    }

    pub fn interrupt_controller(&self) -> &InterruptController {
        &self.interrupt_controller
    }

    /// Loads the word at the given address (little endian). Wraps around at
    /// the end of the address space.
    pub fn load_word(&self, addr: Word) -> Word {
        let lsb = self.load_byte(addr);
        let msb = self.load_byte(addr + 1u16);

        Word::from_bytes(lsb, msb)
    }

    /// Stores the given word at the given address (little endian). Wraps
    /// around at the end of the address space.
    pub fn store_word(&mut self, addr: Word, word: Word) {
        let (lsb, msb) = word.into_bytes();
        self.store_byte(addr, lsb);
        self.store_byte(addr + 1u16, msb);
    }

    /// Convenience method to load the value which is stored behind the
    /// address in HL.
    pub fn load_hl(&self) -> Byte {
        self.load_byte(self.cpu.hl())
    }

    /// Convenience method to store a value to the address in HL.
    pub fn store_hl(&mut self, byte: Byte) {
        self.store_byte(self.cpu.hl(), byte);
    }

    /// Pushes the given word onto the stack.
    pub fn push(&mut self, word: Word) {
        self.cpu.sp -= 2u16;
        self.store_word(self.cpu.sp, word);
    }

    /// Pops the topmost word from the stack and returns it.
    pub fn pop(&mut self) -> Word {
        let val = self.load_word(self.cpu.sp);
        self.cpu.sp += 2u16;
        val
    }

    /// Jumps to the interrupt service routine of the given interrupt and
    /// returns the number of T-cycles used for the jump.
    pub(crate) fn isr(&mut self, interrupt: Interrupt) -> u8 {
        // Push PC onto the stack and jump to the vector.
        self.push(self.cpu.pc);
        self.cpu.pc = interrupt.addr();

        // Reset interrupt state.
        self.interrupt_controller.ime = false;
        self.interrupt_controller.reset_interrupt_flag(interrupt);

        self.halt = false;

        20
    }

    /// The host pushes a button press in here.
    pub fn button_pressed(&mut self, button: Button) {
        self.input_controller.button_pressed(button, &mut self.interrupt_controller);

        // Pressing a button (whether or not its row is selected) ends STOP
        // mode.
        self.stopped = false;
    }

    /// The host pushes a button release in here.
    pub fn button_released(&mut self, button: Button) {
        self.input_controller.button_released(button);
    }

    /// Resets everything except the cartridge to the post-boot state. The
    /// cartridge keeps its (battery backed) RAM and bank latches, like a
    /// real unit being power cycled quickly.
    pub fn reset(&mut self) {
        let sample_rate = self.apu.sample_rate();
        self.cpu = Cpu::new();
        self.wram = Memory::zeroed(Word::new(0x2000));
        self.hram = Memory::zeroed(Word::new(0x7F));
        self.ppu = Ppu::new();
        self.apu = Apu::new(sample_rate);
        self.timer = Timer::new();
        self.serial = SerialPort::new();
        self.interrupt_controller = InterruptController::new();
        self.input_controller = InputController::new();
        self.oam_dma = OamDma::new();
        self.enable_interrupts_next_step = false;
        self.halt = false;
        self.halt_bug = false;
        self.stopped = false;
    }

    /// Advances everything except the CPU by the given number of T-cycles.
    pub(crate) fn advance_peripherals(&mut self, cycles: u8, audio: &mut impl AudioSink) {
        for _ in 0..cycles {
            self.ppu.step(&mut self.interrupt_controller);
            self.timer.step(&mut self.interrupt_controller);
            self.apu.step(audio);
        }

        self.cartridge.mbc.tick(cycles as u64);
        self.serial.step(cycles, &mut self.interrupt_controller);
    }
}
