//! The OAM DMA controller.

use super::Machine;
use crate::{
    error::SaveStateError,
    log::*,
    primitives::{Byte, Word},
    savestate::{StateReader, StateWriter},
};


/// State of the OAM DMA controller (the 0xFF46 register).
///
/// A write of `XX` copies `0xXX00..0xXXA0` into OAM, one byte per
/// machine-cycle. The whole transfer takes 160 machine-cycles = 640 T-cycles,
/// during which the CPU is stalled (it could only access HRAM, but since it
/// cannot fetch from anywhere else, it effectively stands still).
pub(crate) struct OamDma {
    /// The last value written to 0xFF46 (reads return it).
    pub(crate) source_page: Byte,

    /// T-cycles left in the running transfer. Zero when idle.
    pub(crate) remaining: u16,
}

/// Total length of one OAM DMA transfer in T-cycles.
pub(crate) const DMA_CYCLES: u16 = 640;

impl OamDma {
    pub(crate) fn new() -> Self {
        Self {
            source_page: Byte::zero(),
            remaining: 0,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.remaining > 0
    }

    pub(crate) fn save_state(&self, w: &mut StateWriter) {
        w.byte(self.source_page);
        w.u16(self.remaining);
    }

    pub(crate) fn load_state(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        self.source_page = r.byte()?;
        self.remaining = r.u16()?;
        Ok(())
    }
}

impl Machine {
    /// Starts an OAM DMA transfer (a write to 0xFF46).
    pub(crate) fn start_dma(&mut self, byte: Byte) {
        trace!("[dma] transfer started from page {}", byte);
        self.oam_dma.source_page = byte;
        self.oam_dma.remaining = DMA_CYCLES;
    }

    pub(crate) fn is_dma_active(&self) -> bool {
        self.oam_dma.is_active()
    }

    /// Advances a running DMA transfer by one machine-cycle (4 T-cycles),
    /// copying one byte into OAM.
    pub(crate) fn dma_step(&mut self) {
        if !self.oam_dma.is_active() {
            return;
        }

        let idx = ((DMA_CYCLES - self.oam_dma.remaining) / 4) as u8;

        let mut src = (self.oam_dma.source_page.get() as u16) * 0x100 + idx as u16;
        // There is no bus behind 0xE000: such sources read the mirrored WRAM.
        if src >= 0xE000 {
            src -= 0x2000;
        }

        // The DMA engine writes OAM directly; the PPU's access gating only
        // applies to the CPU.
        let b = self.load_byte_bypass_dma(Word::new(src));
        self.ppu.oam[Word::new(idx as u16)] = b;

        self.oam_dma.remaining -= 4;
        if !self.oam_dma.is_active() {
            trace!("[dma] transfer finished");
        }
    }
}
