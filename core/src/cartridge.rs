//! Everything related to the cartridge and its header.

use std::fmt;

use crate::{
    error::{RomError, SaveStateError},
    log::*,
    mbc::{Mbc, AnyMbc, NoMbc, Mbc1, Mbc2, Mbc3, Mbc5},
    primitives::{Byte, Word},
    savestate::{StateReader, StateWriter},
};


/// The type of a cartridge as stored at `0x0147`. This defines which memory
/// bank controller a cartridge has and whether it carries a battery and/or a
/// real time clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartridgeType {
    RomOnly,
    RomRam,
    RomRamBattery,
    Mbc1,
    Mbc1Ram,
    Mbc1RamBattery,
    Mbc2,
    Mbc2Battery,
    Mbc3,
    Mbc3Ram,
    Mbc3RamBattery,
    Mbc3TimerBattery,
    Mbc3TimerRamBattery,
    Mbc5,
    Mbc5Ram,
    Mbc5RamBattery,
    Mbc5Rumble,
    Mbc5RumbleRam,
    Mbc5RumbleRamBattery,
}

impl CartridgeType {
    /// Parses the cartridge type from the given byte. Unknown codes fall back
    /// to `RomOnly` (with a warning), so an exotic cartridge at least boots.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => CartridgeType::RomOnly,
            0x01 => CartridgeType::Mbc1,
            0x02 => CartridgeType::Mbc1Ram,
            0x03 => CartridgeType::Mbc1RamBattery,
            0x05 => CartridgeType::Mbc2,
            0x06 => CartridgeType::Mbc2Battery,
            0x08 => CartridgeType::RomRam,
            0x09 => CartridgeType::RomRamBattery,
            0x0F => CartridgeType::Mbc3TimerBattery,
            0x10 => CartridgeType::Mbc3TimerRamBattery,
            0x11 => CartridgeType::Mbc3,
            0x12 => CartridgeType::Mbc3Ram,
            0x13 => CartridgeType::Mbc3RamBattery,
            0x19 => CartridgeType::Mbc5,
            0x1A => CartridgeType::Mbc5Ram,
            0x1B => CartridgeType::Mbc5RamBattery,
            0x1C => CartridgeType::Mbc5Rumble,
            0x1D => CartridgeType::Mbc5RumbleRam,
            0x1E => CartridgeType::Mbc5RumbleRamBattery,
            _ => {
                warn!(
                    "[cartridge] unknown cartridge type 0x{:02x}, treating as ROM only",
                    byte,
                );
                CartridgeType::RomOnly
            }
        }
    }

    /// Returns true if this cartridge has a battery, i.e. the host should
    /// persist the external RAM.
    pub fn has_battery(&self) -> bool {
        match self {
            CartridgeType::RomRamBattery
            | CartridgeType::Mbc1RamBattery
            | CartridgeType::Mbc2Battery
            | CartridgeType::Mbc3RamBattery
            | CartridgeType::Mbc3TimerBattery
            | CartridgeType::Mbc3TimerRamBattery
            | CartridgeType::Mbc5RamBattery
            | CartridgeType::Mbc5RumbleRamBattery => true,
            _ => false,
        }
    }

    /// Returns true if this cartridge has a real time clock.
    pub fn has_rtc(&self) -> bool {
        match self {
            CartridgeType::Mbc3TimerBattery | CartridgeType::Mbc3TimerRamBattery => true,
            _ => false,
        }
    }
}

/// Size of cartridge's ROM as stored at `0x0148`. Defined by the number of
/// banks (each 16 KiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RomSize {
    NoBanking,
    Banks4,
    Banks8,
    Banks16,
    Banks32,
    Banks64,
    Banks128,
    Banks256,
    Banks512,
}

impl RomSize {
    /// Parses the ROM size from the given byte.
    pub fn from_byte(byte: u8) -> Result<Self, RomError> {
        match byte {
            0x00 => Ok(RomSize::NoBanking),
            0x01 => Ok(RomSize::Banks4),
            0x02 => Ok(RomSize::Banks8),
            0x03 => Ok(RomSize::Banks16),
            0x04 => Ok(RomSize::Banks32),
            0x05 => Ok(RomSize::Banks64),
            0x06 => Ok(RomSize::Banks128),
            0x07 => Ok(RomSize::Banks256),
            0x08 => Ok(RomSize::Banks512),
            _ => Err(RomError::InvalidRomSize(byte)),
        }
    }

    /// The number of 16 KiB banks.
    pub fn banks(&self) -> usize {
        match self {
            RomSize::NoBanking => 2,
            RomSize::Banks4 => 4,
            RomSize::Banks8 => 8,
            RomSize::Banks16 => 16,
            RomSize::Banks32 => 32,
            RomSize::Banks64 => 64,
            RomSize::Banks128 => 128,
            RomSize::Banks256 => 256,
            RomSize::Banks512 => 512,
        }
    }

    /// ROM length in bytes.
    pub fn len(&self) -> usize {
        self.banks() * 0x4000
    }
}

/// Size of a cartridge's RAM as stored at `0x0149`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RamSize {
    None,
    Kb2,
    Kb8,
    Kb32,
    Kb64,
    Kb128,
}

impl RamSize {
    /// Parses the RAM size from the given byte.
    pub fn from_byte(byte: u8) -> Result<Self, RomError> {
        match byte {
            0x00 => Ok(RamSize::None),
            0x01 => Ok(RamSize::Kb2),
            0x02 => Ok(RamSize::Kb8),
            0x03 => Ok(RamSize::Kb32),
            0x04 => Ok(RamSize::Kb128),
            0x05 => Ok(RamSize::Kb64),
            _ => Err(RomError::InvalidRamSize(byte)),
        }
    }

    /// RAM length in bytes.
    pub fn len(&self) -> usize {
        match self {
            RamSize::None => 0,
            RamSize::Kb2 => 2 * 1024,
            RamSize::Kb8 => 8 * 1024,
            RamSize::Kb32 => 32 * 1024,
            RamSize::Kb64 => 64 * 1024,
            RamSize::Kb128 => 128 * 1024,
        }
    }
}

/// A loaded cartridge.
///
/// This contains the full cartridge data (owned by the selected MBC) and a
/// number of fields for specific header values.
pub struct Cartridge {
    pub(crate) mbc: AnyMbc,
    title: String,
    cartridge_type: CartridgeType,
    rom_size: RomSize,
    ram_size: RamSize,
}

impl Cartridge {
    /// Parses the header of the given ROM image and builds a cartridge with
    /// the memory bank controller the type byte asks for.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RomError> {
        // The header spans 0x0100..0x0150; anything shorter cannot be a ROM.
        if bytes.len() < 0x150 {
            return Err(RomError::TooShort { len: bytes.len() });
        }

        // Detect the name length by testing if the last 4 bytes contain a 0
        let man_code = &bytes[0x013F..=0x0142];
        let max_title_len = if man_code.iter().any(|b| *b == 0x00) {
            15
        } else {
            11
        };

        // Get title
        let title_len = bytes[0x0134..0x0134 + max_title_len]
            .iter()
            .position(|b| *b == 0x00)
            .unwrap_or(max_title_len);
        let title = String::from_utf8_lossy(&bytes[0x0134..0x0134 + title_len]);

        // Read a couple of one byte values
        let cartridge_type = CartridgeType::from_byte(bytes[0x0147]);
        let rom_size = RomSize::from_byte(bytes[0x0148])?;
        let ram_size = RamSize::from_byte(bytes[0x0149])?;

        let mbc = match cartridge_type {
            CartridgeType::RomOnly
            | CartridgeType::RomRam
            | CartridgeType::RomRamBattery => AnyMbc::None(NoMbc::new(bytes, ram_size)),

            CartridgeType::Mbc1
            | CartridgeType::Mbc1Ram
            | CartridgeType::Mbc1RamBattery => AnyMbc::Mbc1(Mbc1::new(bytes, rom_size, ram_size)),

            CartridgeType::Mbc2
            | CartridgeType::Mbc2Battery => AnyMbc::Mbc2(Mbc2::new(bytes, rom_size)),

            CartridgeType::Mbc3
            | CartridgeType::Mbc3Ram
            | CartridgeType::Mbc3RamBattery
            | CartridgeType::Mbc3TimerBattery
            | CartridgeType::Mbc3TimerRamBattery => AnyMbc::Mbc3(Mbc3::new(
                bytes,
                rom_size,
                ram_size,
                cartridge_type.has_rtc(),
            )),

            CartridgeType::Mbc5
            | CartridgeType::Mbc5Ram
            | CartridgeType::Mbc5RamBattery
            | CartridgeType::Mbc5Rumble
            | CartridgeType::Mbc5RumbleRam
            | CartridgeType::Mbc5RumbleRamBattery => {
                AnyMbc::Mbc5(Mbc5::new(bytes, rom_size, ram_size))
            }
        };

        Ok(Self {
            mbc,
            title: title.into_owned(),
            cartridge_type,
            rom_size,
            ram_size,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn cartridge_type(&self) -> CartridgeType {
        self.cartridge_type
    }

    pub fn rom_size(&self) -> RomSize {
        self.rom_size
    }

    pub fn ram_size(&self) -> RamSize {
        self.ram_size
    }

    /// Loads a byte from the `0x0000..0x8000` ROM area (through the MBC's
    /// current bank mapping).
    pub fn load_rom_byte(&self, addr: Word) -> Byte {
        self.mbc.load_rom_byte(addr)
    }

    /// The external RAM image, for battery persistence. Empty if the
    /// cartridge has no RAM.
    pub fn ram_image(&self) -> Vec<u8> {
        self.mbc.ram().iter().map(|b| b.get()).collect()
    }

    /// Restores a previously persisted external RAM image. Ignored (with a
    /// warning) if the length doesn't match the cartridge header.
    pub fn load_ram_image(&mut self, image: &[u8]) {
        let ram = self.mbc.ram_mut();
        if ram.len() != image.len() {
            warn!(
                "[cartridge] battery RAM image has wrong length ({} instead of {}), ignoring",
                image.len(),
                ram.len(),
            );
            return;
        }

        for (dst, &src) in ram.iter_mut().zip(image) {
            *dst = Byte::new(src);
        }
    }

    pub(crate) fn save_state(&self, w: &mut StateWriter) {
        let ram = self.mbc.ram();
        w.u32(ram.len() as u32);
        w.bytes(ram);
        self.mbc.save_latches(w);
    }

    pub(crate) fn load_state(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        let len = r.u32()? as usize;
        if len != self.mbc.ram().len() {
            return Err(SaveStateError::CartridgeMismatch);
        }
        r.bytes_into(self.mbc.ram_mut())?;
        self.mbc.load_latches(r)
    }
}

// Manual implementation to omit printing the full memory.
impl fmt::Debug for Cartridge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cartridge")
            .field("title", &self.title)
            .field("cartridge_type", &self.cartridge_type)
            .field("rom_size", &self.rom_size)
            .field("ram_size", &self.ram_size)
            .finish()
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn rom_with_header(cartridge_type: u8, rom_size: u8, ram_size: u8) -> Vec<u8> {
        let size = RomSize::from_byte(rom_size).unwrap().len();
        let mut rom = vec![0u8; size];
        rom[0x0134..0x0134 + 4].copy_from_slice(b"TEST");
        rom[0x0147] = cartridge_type;
        rom[0x0148] = rom_size;
        rom[0x0149] = ram_size;
        rom
    }

    #[test]
    fn test_header_parsing() {
        let cartridge = Cartridge::from_bytes(&rom_with_header(0x13, 0x05, 0x03)).unwrap();
        assert_eq!(cartridge.title(), "TEST");
        assert_eq!(cartridge.cartridge_type(), CartridgeType::Mbc3RamBattery);
        assert_eq!(cartridge.rom_size(), RomSize::Banks64);
        assert_eq!(cartridge.ram_size(), RamSize::Kb32);
        assert!(cartridge.cartridge_type().has_battery());
        assert!(!cartridge.cartridge_type().has_rtc());
    }

    #[test]
    fn test_too_short_is_rejected() {
        match Cartridge::from_bytes(&[0u8; 0x14F]) {
            Err(RomError::TooShort { len: 0x14F }) => {}
            other => panic!("expected TooShort, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_type_falls_back_to_rom_only() {
        let cartridge = Cartridge::from_bytes(&rom_with_header(0xFC, 0x00, 0x00)).unwrap();
        assert_eq!(cartridge.cartridge_type(), CartridgeType::RomOnly);
    }
}
