//! Everything related to the pixel processing unit (PPU).

use std::fmt;

use crate::{
    SCREEN_HEIGHT, SCREEN_WIDTH,
    error::SaveStateError,
    log::*,
    primitives::{Byte, Word, Memory, CYCLES_PER_LINE, shade_to_rgb},
    savestate::{StateReader, StateWriter},
};
use super::interrupt::{InterruptController, Interrupt};
use self::fifo::FifoRenderer;

pub(crate) mod fifo;


/// Number of lines including the "V-Blank lines". After drawing the 144 lines
/// on the LCD, the PPU has a V-Blank phase which lasts exactly 10 more line
/// times. These are counted as lines, too, despite no lines being drawn.
const NUM_LINES: u8 = 154;

/// The number of tiles in a background or window map in each dimension.
/// Meaning: the background map is 32 * 32 tiles large.
const MAP_SIZE: u8 = 32;

/// T-cycle within a line at which the LYC=LY comparison happens (and at
/// which LY is re-latched to 0 on line 153).
const LYC_COMPARE_CYCLE: u16 = 4;

/// T-cycle within a line at which mode 3 starts (OAM scan is over).
const MODE_3_START: u16 = 80;


/// Which renderer draws the lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    /// Renders a whole line at once when mode 3 starts. Fast, and correct for
    /// the vast majority of games.
    Scanline,

    /// Pushes pixels through the two hardware FIFOs, one T-cycle at a time.
    /// Reproduces mid-scanline register effects at roughly twice the cost.
    PixelFifo,
}

/// The (public) registers inside of the PPU.
pub struct PpuRegisters {
    /// `0xFF40`: LCD control. All bits can be written.
    ///
    /// Each bit is used for a different purpose:
    /// - 7: LCD display enable (0=Off, 1=On)
    /// - 6: window tile map select (0=9800-9BFF, 1=9C00-9FFF)
    /// - 5: window display enable (0=Off, 1=On)
    /// - 4: background and window tile data select (0=8800-97FF, 1=8000-8FFF)
    /// - 3: background tile map select (0=9800-9BFF, 1=9C00-9FFF)
    /// - 2: sprite size (0=8x8, 1=8x16)
    /// - 1: sprite display enable (0=Off, 1=On)
    /// - 0: background and window display enable (0=Off, 1=On)
    pub lcd_control: Byte,

    /// `0xFF41`: LCD/PPU status. Bits 3, 4, 5 and 6 can be written.
    ///
    /// Purpose of each bit:
    /// - 7: always 1, writes are ignored.
    /// - 6: LYC=LY coincidence interrupt (1=enabled)
    /// - 5: OAM scan interrupt (1=enabled)
    /// - 4: V-Blank interrupt (1=enabled)
    /// - 3: H-Blank interrupt (1=enabled)
    /// - 2: coincidence flag (0=LYC!=LY, 1=LYC==LY). Read only.
    /// - 1 & 0: current PPU mode. Modes 0 -- 3, see [`Mode`] for more
    ///   information. Read only.
    pub status: Byte,

    /// `0xFF42`: y scroll position of background.
    pub scroll_y: Byte,

    /// `0xFF43`: x scroll position of background.
    pub scroll_x: Byte,

    /// `0xFF44`: LY. Stores the line we are currently drawing (including
    /// V-blank lines). This value is always between 0 and 154 (exclusive).
    /// Read only.
    pub current_line: Byte,

    /// `0xFF45`: LY compare. Is compared to `current_line` at a fixed point
    /// of every line. If both values are equal, things happen (see `status`
    /// register).
    pub lyc: Byte,

    /// `0xFF47`: background palette data.
    pub background_palette: Byte,

    /// `0xFF48`: sprite palette 0 data.
    pub sprite_palette_0: Byte,

    /// `0xFF49`: sprite palette 1 data.
    pub sprite_palette_1: Byte,

    /// `0xFF4A`: Y window position
    pub win_y: Byte,

    /// `0xFF4B`: X window position (plus 7)
    pub win_x: Byte,
}

impl PpuRegisters {
    fn new() -> Self {
        Self {
            // Post boot state: LCD on, background on, tile data at 0x8000.
            lcd_control: Byte::new(0x91),
            status: Byte::new(0x85),
            scroll_y: Byte::zero(),
            scroll_x: Byte::zero(),
            current_line: Byte::zero(),
            lyc: Byte::zero(),
            background_palette: Byte::new(0xFC),
            sprite_palette_0: Byte::new(0xFF),
            sprite_palette_1: Byte::new(0xFF),
            win_y: Byte::zero(),
            win_x: Byte::zero(),
        }
    }

    /// Returns bit 7 of the LCD control register which determines if the LCD
    /// is enabled.
    pub fn is_lcd_enabled(&self) -> bool {
        self.lcd_control.bit(7)
    }

    /// Returns bit 5 of the LCD control register which determines if the
    /// window layer is enabled.
    pub fn is_window_enabled(&self) -> bool {
        self.lcd_control.bit(5)
    }

    /// Returns bit 1 of the LCD control register which determines if sprite
    /// rendering is enabled.
    pub fn are_sprites_enabled(&self) -> bool {
        self.lcd_control.bit(1)
    }

    /// Returns bit 0 of the LCD control register which determines if the
    /// background and window are drawn at all.
    pub fn is_background_enabled(&self) -> bool {
        self.lcd_control.bit(0)
    }

    /// Returns the height of all sprites. This can either be 8 or 16,
    /// controlled by bit 2 of the LCD control register.
    pub fn sprite_height(&self) -> u8 {
        if self.lcd_control.bit(2) { 16 } else { 8 }
    }

    /// Returns the start of the tile map for the window layer (relative to
    /// the beginning of VRAM, as determined by LCD control bit 6).
    pub(crate) fn window_tile_map_start(&self) -> Word {
        if self.lcd_control.bit(6) {
            Word::new(0x1C00)
        } else {
            Word::new(0x1800)
        }
    }

    /// Returns the start of the tile map for the background layer (relative
    /// to the beginning of VRAM, as determined by LCD control bit 3).
    pub(crate) fn bg_tile_map_start(&self) -> Word {
        if self.lcd_control.bit(3) {
            Word::new(0x1C00)
        } else {
            Word::new(0x1800)
        }
    }

    /// Returns the address (relative to the beginning of VRAM) of the first
    /// byte of the background/window tile with the given index.
    ///
    /// This implements the two addressing modes selected by LCD control bit
    /// 4: plain indexing from 0x8000, or signed indexing relative to 0x9000.
    pub(crate) fn bg_tile_data_addr(&self, idx: Byte) -> Word {
        if self.lcd_control.bit(4) {
            Word::new(idx.get() as u16 * 16)
        } else {
            let offset = ((idx.get() as i8) as i16) * 16;
            Word::new((0x1000 + offset) as u16)
        }
    }

    /// Returns `true` if the LY=LYC coincidence interrupt is enabled (as
    /// determined by bit 6 of the LCD stat register).
    pub fn coincidence_interrupt(&self) -> bool {
        self.status.bit(6)
    }

    /// Returns `true` if the OAM scan interrupt is enabled (as determined by
    /// bit 5 of the LCD stat register).
    pub fn oam_scan_interrupt(&self) -> bool {
        self.status.bit(5)
    }

    /// Returns `true` if the V-Blank interrupt is enabled (as determined by
    /// bit 4 of the LCD stat register). Note that this interrupt is part of
    /// the 0x48 LCD status interrupt. There is another V-Blank interrupt
    /// (0x40) that is independent from this.
    pub fn vblank_interrupt(&self) -> bool {
        self.status.bit(4)
    }

    /// Returns `true` if the H-Blank interrupt is enabled (as determined by
    /// bit 3 of the LCD stat register).
    pub fn hblank_interrupt(&self) -> bool {
        self.status.bit(3)
    }

    /// Returns the coincidence flag (bit 2 of the LCD stat register).
    pub fn coincidence_flag(&self) -> bool {
        self.status.bit(2)
    }

    /// Returns the mode of the PPU (as determined by bits 1 & 0 from the LCD
    /// stat register). See [`Mode`] for more information.
    pub fn mode(&self) -> Mode {
        match self.status.get() & 0b11 {
            0 => Mode::HBlank,
            1 => Mode::VBlank,
            2 => Mode::OamScan,
            3 => Mode::Drawing,
            _ => unreachable!(),
        }
    }

    /// Sets the given mode (updates bits 1 & 0 in the LCD stat register).
    fn set_mode(&mut self, mode: Mode) {
        let v = mode as u8;
        self.status = self.status.map(|b| (b & 0b1111_1100) | v);
    }

    fn set_coincidence_flag(&mut self, v: bool) {
        self.status = self.status.map(|b| {
            if v {
                b | 0b0000_0100
            } else {
                b & 0b1111_1011
            }
        });
    }
}

/// Specifies which mode the PPU is in.
///
/// Breakdown of one frame (all numbers are T-cycles):
///
/// ```ignore
///    ┌── 80 cycles ──┬────── 172-289 cycles ──────┬───── remainder of 456 ─────┐
///    │               │                            │                            │
///  144     OAM       │          Drawing           │          H-Blank           │
/// lines    Scan      │   (VRAM and OAM locked)    │                            │
///    │               │                            │                            │
///    ├───────────────┴────────────────────────────┴────────────────────────────┤
///   10                                V-Blank                                  │
/// lines                                                                        │
///    └─────────────────────────────────────────────────────────────────────────┘
/// ```
///
/// One line is 456 T-cycles, one frame is 154 * 456 = 70224 T-cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Also called "mode 2": PPU determines which sprites are visible on the
    /// current line.
    OamScan = 2,

    /// Also called "mode 3": pixels are transferred to the LCD screen. VRAM
    /// and OAM are locked.
    Drawing = 3,

    /// Also called "mode 0": time after drawing when the PPU is waiting to
    /// start a new line.
    HBlank = 0,

    /// Also called "mode 1": time after the last line has been drawn and
    /// before the next frame begins.
    VBlank = 1,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mode::OamScan => "OAM scan",
            Mode::Drawing => "drawing",
            Mode::HBlank => "H-Blank",
            Mode::VBlank => "V-Blank",
        }.fmt(f)
    }
}

/// Describes a sprite. The OAM stores exactly this information for up to 40
/// sprites.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Sprite {
    pub(crate) y: Byte,
    pub(crate) x: Byte,
    pub(crate) tile_idx: Byte,
    pub(crate) flags: Byte,

    /// Position in OAM, used as tie breaker for the draw priority of sprites
    /// with equal x.
    pub(crate) oam_idx: u8,
}

impl Sprite {
    /// Returns an instance that is off screen in both directions.
    fn hidden() -> Self {
        Self {
            y: Byte::zero(),
            x: Byte::zero(),
            tile_idx: Byte::zero(),
            flags: Byte::zero(),
            oam_idx: 0,
        }
    }
}

/// Pixel processing unit.
pub struct Ppu {
    pub vram: Memory,
    pub oam: Memory,

    /// The finished 160x144 image as packed RGB values, row major.
    frame_buffer: Box<[u32]>,

    /// Set when V-Blank is entered, cleared when the host picks the frame up.
    frame_completed: bool,

    /// The line the PPU is actually working on, 0..154. This is usually equal
    /// to the LY register; the two only disagree on line 153 (see
    /// `LYC_COMPARE_CYCLE` handling).
    pub(crate) line: u8,

    /// How many T-cycles did we already spend in this line?
    pub(crate) cycle_in_line: u16,

    /// The cycle of the line at which H-Blank starts. This is computed from
    /// the sprite count, the scroll and the window when mode 3 starts.
    pub(crate) mode3_end: u16,

    /// The STAT interrupt line. An interrupt is only requested on the 0 -> 1
    /// edge of this.
    pub(crate) stat_line: bool,

    /// The window's internal line counter. Only incremented on lines where
    /// the window actually produced a pixel.
    pub(crate) window_line: u8,

    /// Whether the window produced at least one pixel on the current line.
    window_drew: bool,

    /// The sprites found during OAM scan for the current line.
    sprites_on_line: [Sprite; 10],
    n_sprites: u8,

    /// Background/window color index (0-3) per pixel of the current line.
    /// Needed to resolve the sprite background priority flag.
    line_indices: [u8; SCREEN_WIDTH],

    renderer: RendererKind,
    fifo: FifoRenderer,

    /// All registers. If you want to read registers, use the `regs()` method
    /// instead. That way, we can avoid accidental mutation of any registers.
    registers: PpuRegisters,
}


impl Ppu {
    pub(crate) fn new() -> Self {
        Self {
            vram: Memory::zeroed(Word::new(0x2000)),
            oam: Memory::zeroed(Word::new(0xA0)),
            frame_buffer: vec![shade_to_rgb(0); SCREEN_WIDTH * SCREEN_HEIGHT]
                .into_boxed_slice(),
            frame_completed: false,
            line: 0,
            cycle_in_line: 0,
            // Will be overwritten before it becomes relevant.
            mode3_end: MODE_3_START + 172,
            stat_line: false,
            window_line: 0,
            window_drew: false,
            sprites_on_line: [Sprite::hidden(); 10],
            n_sprites: 0,
            line_indices: [0; SCREEN_WIDTH],
            renderer: RendererKind::Scanline,
            fifo: FifoRenderer::new(),
            registers: PpuRegisters::new(),
        }
    }

    /// Selects the renderer implementation. Both produce the same image for
    /// code that doesn't change PPU registers mid-line.
    pub fn set_renderer(&mut self, renderer: RendererKind) {
        self.renderer = renderer;
    }

    pub fn renderer(&self) -> RendererKind {
        self.renderer
    }

    /// The finished 160x144 frame, row major, packed RGB.
    pub fn frame_buffer(&self) -> &[u32] {
        &self.frame_buffer
    }

    /// Returns whether a frame was completed since the last call and clears
    /// the flag.
    pub fn take_frame_completed(&mut self) -> bool {
        std::mem::replace(&mut self.frame_completed, false)
    }

    /// Loads a byte from VRAM at the given (absolute!) address.
    ///
    /// The given address has to be in `0x8000..0xA000`, otherwise this
    /// function panics!
    ///
    /// This function behaves like the real VRAM. Meaning: during mode 3, this
    /// returns garbage.
    pub(crate) fn load_vram_byte(&self, addr: Word) -> Byte {
        match self.regs().mode() {
            Mode::Drawing if self.regs().is_lcd_enabled() => Byte::new(0xFF),
            _ => self.vram[addr - 0x8000],
        }
    }

    /// Stores a byte to VRAM at the given (absolute!) address.
    ///
    /// The given address has to be in `0x8000..0xA000`, otherwise this
    /// function panics!
    ///
    /// This function behaves like the real VRAM. Meaning: during mode 3, this
    /// write is lost (does nothing).
    pub(crate) fn store_vram_byte(&mut self, addr: Word, byte: Byte) {
        match self.regs().mode() {
            Mode::Drawing if self.regs().is_lcd_enabled() => {},
            _ => self.vram[addr - 0x8000] = byte,
        }
    }

    /// Loads a byte from OAM at the given (absolute!) address.
    ///
    /// The given address has to be in `0xFE00..0xFEA0`, otherwise this
    /// function panics!
    ///
    /// This function behaves like the real OAM. Meaning: during modes 2 and
    /// 3, this returns garbage.
    pub(crate) fn load_oam_byte(&self, addr: Word) -> Byte {
        match self.regs().mode() {
            Mode::Drawing | Mode::OamScan
                if self.regs().is_lcd_enabled() => Byte::new(0xFF),
            _ => self.oam[addr - 0xFE00],
        }
    }

    /// Stores a byte to OAM at the given (absolute!) address.
    ///
    /// The given address has to be in `0xFE00..0xFEA0`, otherwise this
    /// function panics!
    ///
    /// This function behaves like the real OAM. Meaning: during modes 2 and
    /// 3, this write is lost (does nothing).
    pub(crate) fn store_oam_byte(&mut self, addr: Word, byte: Byte) {
        match self.regs().mode() {
            Mode::Drawing | Mode::OamScan if self.regs().is_lcd_enabled() => {},
            _ => self.oam[addr - 0xFE00] = byte,
        }
    }

    /// Loads a byte from the IO port range `0xFF40..0xFF4C` (except 0xFF46,
    /// which belongs to the DMA controller).
    pub(crate) fn load_io_byte(&self, addr: Word) -> Byte {
        match addr.get() {
            0xFF40 => self.regs().lcd_control,
            0xFF41 => self.regs().status.map(|mut b| {
                // Bit 7 always returns 1
                b |= 0b1000_0000;
                if !self.regs().is_lcd_enabled() {
                    // Bits 0, 1 and 2 return 0 when the LCD is off
                    b &= 0b1111_1000;
                }

                b
            }),
            0xFF42 => self.regs().scroll_y,
            0xFF43 => self.regs().scroll_x,
            0xFF44 => self.regs().current_line,
            0xFF45 => self.regs().lyc,
            0xFF47 => self.regs().background_palette,
            0xFF48 => self.regs().sprite_palette_0,
            0xFF49 => self.regs().sprite_palette_1,
            0xFF4A => self.regs().win_y,
            0xFF4B => self.regs().win_x,
            _ => unreachable!("called `Ppu::load_io_byte` with invalid address"),
        }
    }

    /// Stores a byte in the IO port range `0xFF40..0xFF4C` (except 0xFF46,
    /// which belongs to the DMA controller).
    pub(crate) fn store_io_byte(
        &mut self,
        addr: Word,
        byte: Byte,
        interrupt_controller: &mut InterruptController,
    ) {
        match addr.get() {
            0xFF40 => {
                let was_enabled = self.regs().is_lcd_enabled();
                self.registers.lcd_control = byte;
                match (was_enabled, self.regs().is_lcd_enabled()) {
                    (false, true) => {
                        debug!("[ppu] LCD was enabled");
                        // Re-enabling starts at the top of line 0, in OAM
                        // scan.
                        self.line = 0;
                        self.cycle_in_line = 0;
                        self.registers.current_line = Byte::zero();
                    }
                    (true, false) => {
                        debug!("[ppu] LCD was disabled");
                        self.line = 0;
                        self.cycle_in_line = 0;
                        self.window_line = 0;
                        self.registers.current_line = Byte::zero();
                        self.registers.set_mode(Mode::HBlank);
                        self.stat_line = false;
                        for px in self.frame_buffer.iter_mut() {
                            *px = shade_to_rgb(0);
                        }
                    }
                    _ => {}
                }
            }
            0xFF41 => {
                // Only bits 3 to 6 are writable
                let v = self.regs().status.get() & 0b1000_0111 | byte.get() & 0b0111_1000;
                self.registers.status = Byte::new(v);

                // Writing an enable mask that satisfies a condition while the
                // LCD is on outside of V-Blank pulses the (previously low)
                // interrupt line.
                if self.regs().is_lcd_enabled()
                    && self.regs().mode() != Mode::VBlank
                    && !self.stat_line
                    && self.stat_sources_high()
                {
                    self.stat_line = true;
                    interrupt_controller.request_interrupt(Interrupt::LcdStat);
                }
            },
            0xFF42 => self.registers.scroll_y = byte,
            0xFF43 => self.registers.scroll_x = byte,
            0xFF44 => {}, // read only
            0xFF45 => {
                self.registers.lyc = byte;
                // The flag follows the comparison right away; the interrupt
                // timing is still governed by the STAT line edge.
                let equal = self.registers.current_line == self.registers.lyc;
                self.registers.set_coincidence_flag(equal);
            }
            0xFF47 => self.registers.background_palette = byte,
            0xFF48 => self.registers.sprite_palette_0 = byte,
            0xFF49 => self.registers.sprite_palette_1 = byte,
            0xFF4A => self.registers.win_y = byte,
            0xFF4B => self.registers.win_x = byte,
            _ => unreachable!("called `Ppu::store_io_byte` with invalid address"),
        }
    }

    /// Returns an immutable reference to all public registers.
    pub fn regs(&self) -> &PpuRegisters {
        &self.registers
    }

    /// Whether the window covers any part of the current line.
    fn window_active_on_line(&self) -> bool {
        self.regs().is_window_enabled()
            && self.regs().is_background_enabled()
            && self.regs().win_y.get() <= self.line
            && self.regs().win_x.get() < 167
    }

    /// The length of mode 3 on the current line.
    fn mode3_len(&self) -> u16 {
        let len = 172
            + self.n_sprites as u16 * 11
            + (self.regs().scroll_x.get() % 8) as u16
            + if self.window_active_on_line() { 6 } else { 0 };
        len.min(289)
    }

    /// Whether any enabled STAT interrupt source is currently true.
    fn stat_sources_high(&self) -> bool {
        let mode = self.regs().mode();
        (self.regs().hblank_interrupt() && mode == Mode::HBlank)
            || (self.regs().vblank_interrupt() && mode == Mode::VBlank)
            || (self.regs().oam_scan_interrupt() && mode == Mode::OamScan)
            || (self.regs().coincidence_interrupt() && self.regs().coincidence_flag())
    }

    /// Recomputes the STAT interrupt line and requests an interrupt on its
    /// rising edge.
    fn update_stat_line(&mut self, interrupt_controller: &mut InterruptController) {
        let high = self.stat_sources_high();
        if high && !self.stat_line {
            interrupt_controller.request_interrupt(Interrupt::LcdStat);
        }
        self.stat_line = high;
    }

    /// Executes one T-cycle.
    pub(crate) fn step(&mut self, interrupt_controller: &mut InterruptController) {
        // If the whole LCD is disabled, the PPU does nothing
        if !self.regs().is_lcd_enabled() {
            return;
        }

        match self.cycle_in_line {
            // ===== Start of a line =========================================
            0 => {
                if self.line < SCREEN_HEIGHT as u8 {
                    self.registers.set_mode(Mode::OamScan);

                    // The real hardware scans OAM over the next 80 cycles,
                    // but the result is not observable before drawing starts
                    // and OAM cannot be written during the scan, so we do it
                    // in one go.
                    self.oam_scan();
                } else if self.line == SCREEN_HEIGHT as u8 {
                    self.registers.set_mode(Mode::VBlank);

                    // The V-Blank interrupt is always requested here; the
                    // STAT version of it goes through the shared STAT line.
                    interrupt_controller.request_interrupt(Interrupt::Vblank);
                    self.frame_completed = true;
                }
            }

            // ===== LYC comparison point ====================================
            LYC_COMPARE_CYCLE => {
                // Line 153 quirk: LY is re-latched to 0 here and the rest of
                // V-Blank runs with LY=0. The comparison below uses the new
                // value.
                if self.line == NUM_LINES - 1 {
                    self.registers.current_line = Byte::zero();
                }

                let equal = self.registers.current_line == self.registers.lyc;
                self.registers.set_coincidence_flag(equal);
            }

            // ===== Start of drawing ========================================
            MODE_3_START => {
                if self.line < SCREEN_HEIGHT as u8 {
                    self.registers.set_mode(Mode::Drawing);
                    self.mode3_end = MODE_3_START + self.mode3_len();

                    match self.renderer {
                        RendererKind::Scanline => self.render_scanline(),
                        RendererKind::PixelFifo => self.start_fifo_line(),
                    }
                }
            }

            // ===== Start of H-Blank ========================================
            c if self.line < SCREEN_HEIGHT as u8 && c == self.mode3_end => {
                // If the FIFO pipeline hasn't pushed the full line yet (it
                // can lag a few cycles behind the duration formula), drain
                // it now.
                if self.renderer == RendererKind::PixelFifo {
                    while !self.fifo.done() {
                        self.step_fifo();
                    }
                }

                self.registers.set_mode(Mode::HBlank);
            }

            _ => {}
        }

        // The FIFO renderer works one T-cycle at a time during mode 3.
        if self.renderer == RendererKind::PixelFifo
            && self.regs().mode() == Mode::Drawing
        {
            self.step_fifo();
        }

        self.update_stat_line(interrupt_controller);

        // Update cycle and line counters
        self.cycle_in_line += 1;
        if self.cycle_in_line == CYCLES_PER_LINE {
            self.cycle_in_line = 0;

            if self.window_drew {
                self.window_line += 1;
                self.window_drew = false;
            }

            self.line = if self.line == NUM_LINES - 1 { 0 } else { self.line + 1 };
            self.registers.current_line = Byte::new(self.line);

            if self.line == 0 {
                self.window_line = 0;
            }
        }
    }

    /// Performs the OAM scan.
    ///
    /// Looks through all 40 sprites in the OAM and extracts the first (up to)
    /// 10 that cover the current line. These are stored in the
    /// `sprites_on_line` array.
    fn oam_scan(&mut self) {
        let mut next_idx = 0;
        let height = self.regs().sprite_height() as u16;
        let line = self.line as u16 + 16;

        for (oam_idx, sprite) in self.oam.as_slice().chunks(4).enumerate() {
            let y = sprite[0].get() as u16;
            if line >= y && line < y + height {
                self.sprites_on_line[next_idx] = Sprite {
                    y: sprite[0],
                    x: sprite[1],
                    tile_idx: sprite[2],
                    flags: sprite[3],
                    oam_idx: oam_idx as u8,
                };
                next_idx += 1;

                // If we already found 10 sprites, we stop. Any further
                // sprites are not drawn on this line.
                if next_idx == 10 {
                    break;
                }
            }
        }

        self.n_sprites = next_idx as u8;
    }

    /// Reads one line of one background/window tile and returns the color
    /// indices of its 8 pixels.
    fn tile_line(&self, tile_idx: Byte, row: u8) -> [u8; 8] {
        let tile_start = self.regs().bg_tile_data_addr(tile_idx);
        let line_offset = tile_start + (row * 2);

        let lo = self.vram[line_offset].get();
        let hi = self.vram[line_offset + 1u8].get();

        decode_tile_row(lo, hi)
    }

    /// Renders the whole current line at once into the frame buffer.
    ///
    /// The hardware pushes pixels one by one during mode 3, but for code that
    /// doesn't flip registers mid-line the result is identical.
    fn render_scanline(&mut self) {
        let line = self.line;
        let window_active = self.window_active_on_line();
        let win_start = self.regs().win_x.get().saturating_sub(7) as usize;

        // ----- Background and window ------------------------------------
        for col in 0..SCREEN_WIDTH {
            let idx = if !self.regs().is_background_enabled() {
                0
            } else if window_active && col >= win_start {
                // Window pixel. The window has its own line counter which
                // only advances on lines it was visible on.
                let wx = (col - win_start) as u8;
                let wy = self.window_line;
                self.window_drew = true;

                let map = self.regs().window_tile_map_start();
                let tile_idx = self.vram[
                    map + (wy as u16 / 8) * MAP_SIZE as u16 + (wx as u16 / 8)
                ];
                self.tile_line(tile_idx, wy % 8)[(wx % 8) as usize]
            } else {
                // Background pixel, wrapping inside the 256x256 map.
                let px = self.regs().scroll_x + Byte::new(col as u8);
                let py = self.regs().scroll_y + Byte::new(line);

                let map = self.regs().bg_tile_map_start();
                let tile_idx = self.vram[
                    map + (py.get() as u16 / 8) * MAP_SIZE as u16 + (px.get() as u16 / 8)
                ];
                self.tile_line(tile_idx, py.get() % 8)[(px.get() % 8) as usize]
            };

            self.line_indices[col] = idx;
            let shade = (self.regs().background_palette.get() >> (idx * 2)) & 0b11;
            self.frame_buffer[line as usize * SCREEN_WIDTH + col] = shade_to_rgb(shade);
        }

        // ----- Sprites ---------------------------------------------------
        if self.regs().are_sprites_enabled() {
            let mut sprites = self.sprites_on_line;
            let sprites = &mut sprites[..self.n_sprites as usize];

            // Smaller x wins, OAM position breaks ties. We draw back to
            // front so the winner is drawn last.
            sprites.sort_by_key(|s| (s.x, s.oam_idx));
            for sprite in sprites.iter().rev() {
                self.render_sprite(sprite);
            }
        }
    }

    /// Draws a single sprite into the current line of the frame buffer.
    fn render_sprite(&mut self, sprite: &Sprite) {
        let height = self.regs().sprite_height();
        let line = self.line;

        // The y condition was already checked during OAM scan.
        let mut row = (line as i16 - (sprite.y.get() as i16 - 16)) as u8;
        if sprite.flags.bit(6) {
            row = height - 1 - row;
        }

        // 8x16 sprites ignore the lowest tile index bit; the second half
        // implicitly uses the next tile.
        let tile_idx = if height == 16 {
            Byte::new((sprite.tile_idx.get() & 0xFE) + (row >= 8) as u8)
        } else {
            sprite.tile_idx
        };

        // Sprite tiles always use plain 0x8000 indexing.
        let line_offset = Word::new(tile_idx.get() as u16 * 16) + ((row % 8) * 2);
        let lo = self.vram[line_offset].get();
        let hi = self.vram[line_offset + 1u8].get();
        let pixels = decode_tile_row(lo, hi);

        let palette = if sprite.flags.bit(4) {
            self.regs().sprite_palette_1
        } else {
            self.regs().sprite_palette_0
        };

        for px in 0..8u8 {
            let col = sprite.x.get() as i16 - 8 + px as i16;
            if col < 0 || col >= SCREEN_WIDTH as i16 {
                continue;
            }

            let idx = if sprite.flags.bit(5) {
                pixels[(7 - px) as usize]
            } else {
                pixels[px as usize]
            };

            // Color 0 is transparent.
            if idx == 0 {
                continue;
            }

            // Background-over-sprite flag: the sprite only shows through
            // background color 0.
            if sprite.flags.bit(7) && self.line_indices[col as usize] != 0 {
                continue;
            }

            let shade = (palette.get() >> (idx * 2)) & 0b11;
            self.frame_buffer[line as usize * SCREEN_WIDTH + col as usize] =
                shade_to_rgb(shade);
        }
    }

    /// Sets up the FIFO renderer for the line that just entered mode 3.
    fn start_fifo_line(&mut self) {
        let mut sprites = self.sprites_on_line;
        let sprites_slice = &mut sprites[..self.n_sprites as usize];
        sprites_slice.sort_by_key(|s| (s.x, s.oam_idx));

        self.fifo.start_line(
            self.line,
            self.window_line,
            self.window_active_on_line(),
            sprites_slice,
            &self.registers,
        );
    }

    pub(crate) fn save_state(&self, w: &mut StateWriter) {
        w.memory(&self.vram);
        w.memory(&self.oam);

        let regs = self.regs();
        w.byte(regs.lcd_control);
        w.byte(regs.status);
        w.byte(regs.scroll_y);
        w.byte(regs.scroll_x);
        w.byte(regs.current_line);
        w.byte(regs.lyc);
        w.byte(regs.background_palette);
        w.byte(regs.sprite_palette_0);
        w.byte(regs.sprite_palette_1);
        w.byte(regs.win_y);
        w.byte(regs.win_x);

        w.u8(self.line);
        w.u16(self.cycle_in_line);
        w.u16(self.mode3_end);
        w.bool(self.stat_line);
        w.u8(self.window_line);
        w.bool(self.window_drew);

        w.u8(self.n_sprites);
        for sprite in &self.sprites_on_line {
            w.byte(sprite.y);
            w.byte(sprite.x);
            w.byte(sprite.tile_idx);
            w.byte(sprite.flags);
            w.u8(sprite.oam_idx);
        }
    }

    pub(crate) fn load_state(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        r.memory_into(&mut self.vram)?;
        r.memory_into(&mut self.oam)?;

        self.registers.lcd_control = r.byte()?;
        self.registers.status = r.byte()?;
        self.registers.scroll_y = r.byte()?;
        self.registers.scroll_x = r.byte()?;
        self.registers.current_line = r.byte()?;
        self.registers.lyc = r.byte()?;
        self.registers.background_palette = r.byte()?;
        self.registers.sprite_palette_0 = r.byte()?;
        self.registers.sprite_palette_1 = r.byte()?;
        self.registers.win_y = r.byte()?;
        self.registers.win_x = r.byte()?;

        self.line = r.u8()?;
        self.cycle_in_line = r.u16()?;
        self.mode3_end = r.u16()?;
        self.stat_line = r.bool()?;
        self.window_line = r.u8()?;
        self.window_drew = r.bool()?;

        self.n_sprites = r.u8()?;
        for sprite in self.sprites_on_line.iter_mut() {
            sprite.y = r.byte()?;
            sprite.x = r.byte()?;
            sprite.tile_idx = r.byte()?;
            sprite.flags = r.byte()?;
            sprite.oam_idx = r.u8()?;
        }

        Ok(())
    }

    /// Advances the FIFO renderer by one T-cycle.
    fn step_fifo(&mut self) {
        let Ppu {
            fifo,
            vram,
            registers,
            frame_buffer,
            line_indices,
            ..
        } = self;

        if fifo.step(vram, registers, frame_buffer, line_indices) {
            self.window_drew = true;
        }
    }
}

/// Decodes the two bit planes of one tile row into 8 color indices, leftmost
/// pixel first.
#[inline(always)]
pub(crate) fn decode_tile_row(lo: u8, hi: u8) -> [u8; 8] {
    [
        ((hi >> 6) & 0b10) | ((lo >> 7) & 0b1),
        ((hi >> 5) & 0b10) | ((lo >> 6) & 0b1),
        ((hi >> 4) & 0b10) | ((lo >> 5) & 0b1),
        ((hi >> 3) & 0b10) | ((lo >> 4) & 0b1),
        ((hi >> 2) & 0b10) | ((lo >> 3) & 0b1),
        ((hi >> 1) & 0b10) | ((lo >> 2) & 0b1),
        ((hi >> 0) & 0b10) | ((lo >> 1) & 0b1),
        ((hi << 1) & 0b10) | ((lo >> 0) & 0b1),
    ]
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::primitives::SHADES;


    fn fresh_ppu() -> (Ppu, InterruptController) {
        let mut ppu = Ppu::new();
        // Start from a clean line 0 with default registers.
        ppu.registers.status = Byte::zero();
        let mut ic = InterruptController::new();
        ic.store_if(Byte::zero());
        (ppu, ic)
    }

    fn step_n(ppu: &mut Ppu, ic: &mut InterruptController, n: u32) {
        for _ in 0..n {
            ppu.step(ic);
        }
    }

    #[test]
    fn test_mode_sequence_of_plain_line() {
        let (mut ppu, mut ic) = fresh_ppu();

        ppu.step(&mut ic);
        assert_eq!(ppu.regs().mode(), Mode::OamScan);

        step_n(&mut ppu, &mut ic, 80);
        assert_eq!(ppu.regs().mode(), Mode::Drawing);

        // No sprites, no scroll, no window: mode 3 is exactly 172 cycles.
        step_n(&mut ppu, &mut ic, 172);
        assert_eq!(ppu.regs().mode(), Mode::HBlank);

        // Rest of the line.
        step_n(&mut ppu, &mut ic, 456 - 80 - 172 - 1);
        assert_eq!(ppu.regs().mode(), Mode::HBlank);
        ppu.step(&mut ic);
        assert_eq!(ppu.regs().mode(), Mode::OamScan);
        assert_eq!(ppu.regs().current_line, Byte::new(1));
    }

    #[test]
    fn test_mode3_duration_formula() {
        let (mut ppu, mut ic) = fresh_ppu();
        ppu.registers.scroll_x = Byte::new(5);

        // Three sprites on line 0.
        for i in 0..3u16 {
            ppu.oam[Word::new(i * 4)] = Byte::new(16);
            ppu.oam[Word::new(i * 4 + 1)] = Byte::new(20 + i as u8 * 8);
        }

        step_n(&mut ppu, &mut ic, 81);
        assert_eq!(ppu.regs().mode(), Mode::Drawing);
        assert_eq!(ppu.mode3_end, 80 + 172 + 3 * 11 + 5);
    }

    #[test]
    fn test_vblank_interrupt_and_frame_flag() {
        let (mut ppu, mut ic) = fresh_ppu();

        step_n(&mut ppu, &mut ic, 144 * 456 + 1);
        assert_eq!(ppu.regs().mode(), Mode::VBlank);
        assert_eq!(ic.load_if().get() & 0b1, 0b1);
        assert!(ppu.take_frame_completed());
        assert!(!ppu.take_frame_completed());

        // A whole frame is 154 lines.
        step_n(&mut ppu, &mut ic, 10 * 456);
        assert_eq!(ppu.regs().mode(), Mode::OamScan);
        assert_eq!(ppu.regs().current_line, Byte::new(0));
    }

    #[test]
    fn test_lyc_fires_at_cycle_4() {
        let (mut ppu, mut ic) = fresh_ppu();
        ppu.registers.lyc = Byte::new(2);
        ppu.registers.status = Byte::new(0b0100_0000);

        // Run until just after the start of line 2.
        step_n(&mut ppu, &mut ic, 2 * 456 + 4);
        assert_eq!(ic.load_if().get() & 0b10, 0);
        ppu.step(&mut ic);
        assert!(ppu.regs().coincidence_flag());
        assert_eq!(ic.load_if().get() & 0b10, 0b10);
    }

    #[test]
    fn test_stat_edge_no_retrigger() {
        let (mut ppu, mut ic) = fresh_ppu();
        ppu.registers.lyc = Byte::new(2);
        ppu.registers.status = Byte::new(0b0100_0000);

        step_n(&mut ppu, &mut ic, 2 * 456 + 8);
        assert_eq!(ic.load_if().get() & 0b10, 0b10);

        // The condition stays true for the rest of the line but the line
        // stays high: no second request.
        ic.store_if(Byte::zero());
        step_n(&mut ppu, &mut ic, 300);
        assert_eq!(ic.load_if().get() & 0b10, 0);
    }

    #[test]
    fn test_stat_write_bug_pulses_line() {
        let (mut ppu, mut ic) = fresh_ppu();

        // Enter H-Blank on line 0 with no STAT sources enabled.
        step_n(&mut ppu, &mut ic, 80 + 172 + 4);
        assert_eq!(ppu.regs().mode(), Mode::HBlank);
        assert!(!ppu.stat_line);

        // Enabling the H-Blank source while in H-Blank requests at once.
        ppu.store_io_byte(Word::new(0xFF41), Byte::new(0b0000_1000), &mut ic);
        assert_eq!(ic.load_if().get() & 0b10, 0b10);
    }

    #[test]
    fn test_line_153_quirk() {
        let (mut ppu, mut ic) = fresh_ppu();

        step_n(&mut ppu, &mut ic, 153 * 456);
        assert_eq!(ppu.regs().current_line, Byte::new(153));

        step_n(&mut ppu, &mut ic, 5);
        assert_eq!(ppu.regs().current_line, Byte::new(0));
        assert_eq!(ppu.regs().mode(), Mode::VBlank);

        // The real line 0 starts after the remaining V-Blank cycles.
        step_n(&mut ppu, &mut ic, 452);
        assert_eq!(ppu.regs().mode(), Mode::OamScan);
        assert_eq!(ppu.regs().current_line, Byte::new(0));
    }

    #[test]
    fn test_vram_locked_during_mode3() {
        let (mut ppu, mut ic) = fresh_ppu();
        ppu.vram[Word::new(0)] = Byte::new(0x42);

        step_n(&mut ppu, &mut ic, 81);
        assert_eq!(ppu.regs().mode(), Mode::Drawing);
        assert_eq!(ppu.load_vram_byte(Word::new(0x8000)), Byte::new(0xFF));
        ppu.store_vram_byte(Word::new(0x8000), Byte::new(0x13));

        step_n(&mut ppu, &mut ic, 300);
        assert_eq!(ppu.regs().mode(), Mode::HBlank);
        assert_eq!(ppu.load_vram_byte(Word::new(0x8000)), Byte::new(0x42));
    }

    #[test]
    fn test_oam_locked_during_modes_2_and_3() {
        let (mut ppu, mut ic) = fresh_ppu();
        ppu.oam[Word::new(0)] = Byte::new(0x42);

        ppu.step(&mut ic);
        assert_eq!(ppu.regs().mode(), Mode::OamScan);
        assert_eq!(ppu.load_oam_byte(Word::new(0xFE00)), Byte::new(0xFF));

        step_n(&mut ppu, &mut ic, 80);
        assert_eq!(ppu.regs().mode(), Mode::Drawing);
        assert_eq!(ppu.load_oam_byte(Word::new(0xFE00)), Byte::new(0xFF));

        step_n(&mut ppu, &mut ic, 300);
        assert_eq!(ppu.regs().mode(), Mode::HBlank);
        assert_eq!(ppu.load_oam_byte(Word::new(0xFE00)), Byte::new(0x42));
    }

    #[test]
    fn test_lcd_disable_resets_state() {
        let (mut ppu, mut ic) = fresh_ppu();
        step_n(&mut ppu, &mut ic, 10 * 456);
        assert_eq!(ppu.regs().current_line, Byte::new(10));

        ppu.store_io_byte(Word::new(0xFF40), Byte::new(0x11), &mut ic);
        assert_eq!(ppu.regs().current_line, Byte::new(0));
        assert_eq!(ppu.regs().mode(), Mode::HBlank);
        assert!(ppu.frame_buffer().iter().all(|&px| px == SHADES[0]));

        // While off, stepping does nothing.
        step_n(&mut ppu, &mut ic, 1000);
        assert_eq!(ppu.regs().current_line, Byte::new(0));

        // Re-enabling starts at mode 2 of line 0.
        ppu.store_io_byte(Word::new(0xFF40), Byte::new(0x91), &mut ic);
        ppu.step(&mut ic);
        assert_eq!(ppu.regs().mode(), Mode::OamScan);
    }

    /// Paints tile 1 as solid color 3 and puts it at the top left of the
    /// background map.
    fn paint_tile_1(ppu: &mut Ppu) {
        for i in 0..16u16 {
            ppu.vram[Word::new(0x10 + i)] = Byte::new(0xFF);
        }
        ppu.vram[Word::new(0x1800)] = Byte::new(1);
        // Identity palette
        ppu.registers.background_palette = Byte::new(0b11100100);
    }

    #[test]
    fn test_background_rendering() {
        let (mut ppu, mut ic) = fresh_ppu();
        paint_tile_1(&mut ppu);

        step_n(&mut ppu, &mut ic, 456);

        // The first 8 pixels of line 0 use tile 1 (color 3), the rest tile 0
        // (color 0).
        assert_eq!(ppu.frame_buffer()[0], SHADES[3]);
        assert_eq!(ppu.frame_buffer()[7], SHADES[3]);
        assert_eq!(ppu.frame_buffer()[8], SHADES[0]);
    }

    #[test]
    fn test_scanline_and_fifo_agree() {
        let run = |renderer| {
            let (mut ppu, mut ic) = fresh_ppu();
            ppu.set_renderer(renderer);
            paint_tile_1(&mut ppu);
            ppu.registers.scroll_x = Byte::new(3);

            // A sprite overlapping the tile boundary.
            ppu.oam[Word::new(0)] = Byte::new(16);
            ppu.oam[Word::new(1)] = Byte::new(12);
            ppu.oam[Word::new(2)] = Byte::new(1);
            ppu.oam[Word::new(3)] = Byte::zero();
            ppu.registers.sprite_palette_0 = Byte::new(0b11100100);

            step_n(&mut ppu, &mut ic, 456);
            ppu.frame_buffer()[..SCREEN_WIDTH].to_vec()
        };

        assert_eq!(run(RendererKind::Scanline), run(RendererKind::PixelFifo));
    }

    #[test]
    fn test_window_line_counter() {
        let (mut ppu, mut ic) = fresh_ppu();
        paint_tile_1(&mut ppu);

        // Window enabled from line 10, mapped to the same map as the
        // background.
        ppu.registers.lcd_control = Byte::new(0b1011_0001);
        ppu.registers.win_y = Byte::new(10);
        ppu.registers.win_x = Byte::new(7);

        step_n(&mut ppu, &mut ic, 10 * 456);
        assert_eq!(ppu.window_line, 0);

        step_n(&mut ppu, &mut ic, 3 * 456);
        assert_eq!(ppu.window_line, 3);

        // Window row 0 repeats tile row 0 of the map: line 10 shows tile 1.
        assert_eq!(ppu.frame_buffer()[10 * SCREEN_WIDTH], SHADES[3]);
    }
}
