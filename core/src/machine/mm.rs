//! Everything related to memory mapping.

use super::Machine;
use crate::{
    mbc::Mbc,
    primitives::{Word, Byte},
};


impl Machine {
    /// Loads a byte from the given address.
    pub fn load_byte(&self, addr: Word) -> Byte {
        // If DMA is ongoing, only HRAM can be accessed.
        if self.oam_dma.is_active() && !(0xFF80..0xFFFF).contains(&addr.get()) {
            Byte::new(0xFF)
        } else {
            self.load_byte_bypass_dma(addr)
        }
    }

    /// Loads a byte from the given address, even if DMA is active (this is
    /// mainly used by the DMA procedure itself).
    pub(crate) fn load_byte_bypass_dma(&self, addr: Word) -> Byte {
        match addr.get() {
            0x0000..0x8000 => self.cartridge.mbc.load_rom_byte(addr),
            0x8000..0xA000 => self.ppu.load_vram_byte(addr),
            0xA000..0xC000 => self.cartridge.mbc.load_ram_byte(addr - 0xA000),
            0xC000..0xE000 => self.wram[addr - 0xC000],
            0xE000..0xFE00 => self.wram[addr - 0xE000], // wram echo
            0xFE00..0xFEA0 => self.ppu.load_oam_byte(addr),
            0xFEA0..0xFF00 => Byte::new(0xFF), // unusable

            0xFF00 => self.input_controller.load_register(),
            0xFF01..=0xFF02 => self.serial.load_byte(addr),
            0xFF04..=0xFF07 => self.timer.load_byte(addr),
            0xFF0F => self.interrupt_controller.load_if(),
            0xFF10..0xFF40 => self.apu.load_byte(addr),
            0xFF46 => self.oam_dma.source_page,
            0xFF40..=0xFF4B => self.ppu.load_io_byte(addr),
            0xFF00..0xFF80 => Byte::new(0xFF), // unmapped IO registers
            0xFF80..0xFFFF => self.hram[addr - 0xFF80],
            0xFFFF => self.interrupt_controller.interrupt_enable,
        }
    }

    /// Stores the given byte at the given address.
    pub fn store_byte(&mut self, addr: Word, byte: Byte) {
        // If DMA is ongoing, only HRAM can be accessed.
        if self.oam_dma.is_active() && !(0xFF80..0xFFFF).contains(&addr.get()) {
            return;
        }

        match addr.get() {
            0x0000..0x8000 => self.cartridge.mbc.store_rom_byte(addr, byte),
            0x8000..0xA000 => self.ppu.store_vram_byte(addr, byte),
            0xA000..0xC000 => self.cartridge.mbc.store_ram_byte(addr - 0xA000, byte),
            0xC000..0xE000 => self.wram[addr - 0xC000] = byte,
            0xE000..0xFE00 => self.wram[addr - 0xE000] = byte, // wram echo
            0xFE00..0xFEA0 => self.ppu.store_oam_byte(addr, byte),
            0xFEA0..0xFF00 => {} // unusable, writes are lost

            0xFF00 => self.input_controller.store_register(byte),
            0xFF01..=0xFF02 => self.serial.store_byte(addr, byte),
            0xFF04..=0xFF07 => self.timer.store_byte(addr, byte),
            0xFF0F => self.interrupt_controller.store_if(byte),
            0xFF10..0xFF40 => self.apu.store_byte(addr, byte),
            0xFF46 => self.start_dma(byte),
            0xFF40..=0xFF4B => {
                self.ppu.store_io_byte(addr, byte, &mut self.interrupt_controller)
            }
            0xFF00..0xFF80 => {} // unmapped IO registers, writes are lost
            0xFF80..0xFFFF => self.hram[addr - 0xFF80] = byte,
            0xFFFF => self.interrupt_controller.interrupt_enable = byte,
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::{cartridge::Cartridge, machine::Machine};


    fn machine() -> Machine {
        let mut rom = vec![0u8; 0x8000];
        rom[0x0000] = 0x42;
        rom[0x0147] = 0x00;
        Machine::new(Cartridge::from_bytes(&rom).unwrap(), 44_100)
    }

    #[test]
    fn test_rom_reads() {
        let m = machine();
        assert_eq!(m.load_byte(Word::new(0x0000)), Byte::new(0x42));
    }

    #[test]
    fn test_wram_and_echo() {
        let mut m = machine();

        m.store_byte(Word::new(0xC123), Byte::new(0xAB));
        assert_eq!(m.load_byte(Word::new(0xC123)), Byte::new(0xAB));
        // Reads and writes both echo.
        assert_eq!(m.load_byte(Word::new(0xE123)), Byte::new(0xAB));
        m.store_byte(Word::new(0xE123), Byte::new(0xCD));
        assert_eq!(m.load_byte(Word::new(0xC123)), Byte::new(0xCD));
    }

    #[test]
    fn test_unusable_range() {
        let mut m = machine();
        m.store_byte(Word::new(0xFEA0), Byte::new(0x12));
        assert_eq!(m.load_byte(Word::new(0xFEA0)), Byte::new(0xFF));
    }

    #[test]
    fn test_hram_and_ie() {
        let mut m = machine();
        m.store_byte(Word::new(0xFF80), Byte::new(0x11));
        assert_eq!(m.load_byte(Word::new(0xFF80)), Byte::new(0x11));

        m.store_byte(Word::new(0xFFFF), Byte::new(0x1F));
        assert_eq!(m.load_byte(Word::new(0xFFFF)), Byte::new(0x1F));
    }

    #[test]
    fn test_disabled_exram_reads_ff() {
        let mut m = machine();
        m.store_byte(Word::new(0xA000), Byte::new(0x99));
        assert_eq!(m.load_byte(Word::new(0xA000)), Byte::new(0xFF));
    }

    #[test]
    fn test_dma_blocks_everything_but_hram() {
        let mut m = machine();
        m.store_byte(Word::new(0xC000), Byte::new(0x55));
        m.store_byte(Word::new(0xFF85), Byte::new(0x66));

        m.store_byte(Word::new(0xFF46), Byte::new(0xC0));
        assert!(m.is_dma_active());
        assert_eq!(m.load_byte(Word::new(0xC000)), Byte::new(0xFF));
        assert_eq!(m.load_byte(Word::new(0xFF85)), Byte::new(0x66));

        // Writes outside HRAM are dropped.
        m.store_byte(Word::new(0xC000), Byte::new(0x77));
        assert_eq!(m.load_byte_bypass_dma(Word::new(0xC000)), Byte::new(0x55));
    }

    #[test]
    fn test_dma_copies_into_oam() {
        let mut m = machine();
        for i in 0..0xA0u16 {
            m.store_byte(Word::new(0xC100 + i), Byte::new(i as u8));
        }

        // Keep the PPU off so OAM stays accessible afterwards.
        m.store_byte(Word::new(0xFF40), Byte::new(0x00));
        m.store_byte(Word::new(0xFF46), Byte::new(0xC1));

        for _ in 0..160 {
            assert!(m.is_dma_active());
            m.dma_step();
        }
        assert!(!m.is_dma_active());

        for i in 0..0xA0u16 {
            assert_eq!(m.load_byte(Word::new(0xFE00 + i)), Byte::new(i as u8));
        }
    }

    #[test]
    fn test_dma_source_above_e000_mirrors_down() {
        let mut m = machine();
        m.store_byte(Word::new(0xC000), Byte::new(0x5A));

        m.store_byte(Word::new(0xFF40), Byte::new(0x00));
        m.store_byte(Word::new(0xFF46), Byte::new(0xE0));
        for _ in 0..160 {
            m.dma_step();
        }
        assert_eq!(m.load_byte(Word::new(0xFE00)), Byte::new(0x5A));
    }
}
