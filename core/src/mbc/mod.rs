use crate::{
    error::SaveStateError,
    primitives::{Byte, Word},
    savestate::{StateReader, StateWriter},
};
pub(crate) use self::{
    no_mbc::NoMbc,
    mbc1::Mbc1,
    mbc2::Mbc2,
    mbc3::Mbc3,
    mbc5::Mbc5,
};

mod no_mbc;
mod mbc1;
mod mbc2;
mod mbc3;
mod mbc5;


/// A memory bank controller.
///
/// This part of the cartridge controls all writes and reads to and from ROM
/// and RAM. Usually, some kind of banking strategy is used to store more than
/// `0x8000` bytes on the cartridge.
pub(crate) trait Mbc {
    /// Loads one byte from the cartridge ROM. The `addr` has to be between `0`
    /// and `0x8000`.
    fn load_rom_byte(&self, addr: Word) -> Byte;

    /// Stores one byte to the cartridge ROM. The `addr` has to be between `0`
    /// and `0x8000`. This usually does nothing except potentially writing into
    /// MBC registers.
    fn store_rom_byte(&mut self, addr: Word, byte: Byte);

    /// Loads one byte from the external RAM. The `addr` is relative and has to
    /// be between `0` and `0x2000`. Returns 0xFF if the RAM is disabled or the
    /// cartridge has none.
    fn load_ram_byte(&self, addr: Word) -> Byte;

    /// Stores one byte to the external RAM. The `addr` is relative and has to
    /// be between `0` and `0x2000`.
    fn store_ram_byte(&mut self, addr: Word, byte: Byte);

    /// Advances cartridge-internal time by the given number of T-cycles. A
    /// no-op for every controller except MBC3 (which drives its RTC with it).
    fn tick(&mut self, _cycles: u64) {}

    /// The raw external RAM image (for battery persistence and save states).
    fn ram(&self) -> &[Byte];

    /// Mutable access to the raw external RAM image.
    fn ram_mut(&mut self) -> &mut [Byte];
}


/// The memory bank controller of a loaded cartridge. Selected once at load
/// time from the cartridge type byte; afterwards everything dispatches
/// through this enum.
pub(crate) enum AnyMbc {
    None(NoMbc),
    Mbc1(Mbc1),
    Mbc2(Mbc2),
    Mbc3(Mbc3),
    Mbc5(Mbc5),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            AnyMbc::None($inner) => $body,
            AnyMbc::Mbc1($inner) => $body,
            AnyMbc::Mbc2($inner) => $body,
            AnyMbc::Mbc3($inner) => $body,
            AnyMbc::Mbc5($inner) => $body,
        }
    };
}

impl Mbc for AnyMbc {
    fn load_rom_byte(&self, addr: Word) -> Byte {
        dispatch!(self, mbc => mbc.load_rom_byte(addr))
    }

    fn store_rom_byte(&mut self, addr: Word, byte: Byte) {
        dispatch!(self, mbc => mbc.store_rom_byte(addr, byte))
    }

    fn load_ram_byte(&self, addr: Word) -> Byte {
        dispatch!(self, mbc => mbc.load_ram_byte(addr))
    }

    fn store_ram_byte(&mut self, addr: Word, byte: Byte) {
        dispatch!(self, mbc => mbc.store_ram_byte(addr, byte))
    }

    fn tick(&mut self, cycles: u64) {
        dispatch!(self, mbc => mbc.tick(cycles))
    }

    fn ram(&self) -> &[Byte] {
        dispatch!(self, mbc => mbc.ram())
    }

    fn ram_mut(&mut self) -> &mut [Byte] {
        dispatch!(self, mbc => mbc.ram_mut())
    }
}

impl AnyMbc {
    /// Writes the controller's bank latches (and RTC, if any) into a save
    /// state. The RAM image itself is handled by the cartridge.
    pub(crate) fn save_latches(&self, w: &mut StateWriter) {
        match self {
            AnyMbc::None(_) => {}
            AnyMbc::Mbc1(mbc) => mbc.save_latches(w),
            AnyMbc::Mbc2(mbc) => mbc.save_latches(w),
            AnyMbc::Mbc3(mbc) => mbc.save_latches(w),
            AnyMbc::Mbc5(mbc) => mbc.save_latches(w),
        }
    }

    pub(crate) fn load_latches(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        match self {
            AnyMbc::None(_) => Ok(()),
            AnyMbc::Mbc1(mbc) => mbc.load_latches(r),
            AnyMbc::Mbc2(mbc) => mbc.load_latches(r),
            AnyMbc::Mbc3(mbc) => mbc.load_latches(r),
            AnyMbc::Mbc5(mbc) => mbc.load_latches(r),
        }
    }
}
