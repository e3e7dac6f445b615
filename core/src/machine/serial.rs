use crate::{
    error::SaveStateError,
    log::*,
    primitives::{Byte, Word},
    machine::interrupt::{InterruptController, Interrupt},
    savestate::{StateReader, StateWriter},
};


/// The serial port (SB/SC registers).
///
/// There is never a peer on the other end of the link cable in this core, so
/// an internal-clock transfer shifts in 0xFF and transfers started with the
/// external clock never complete.
pub(crate) struct SerialPort {
    /// FF01 SB: the transfer data register.
    pub(crate) data: Byte,

    /// FF02 SC: bit 7 = transfer in progress, bit 1 = fast clock, bit 0 =
    /// internal clock select.
    pub(crate) control: Byte,

    /// T-cycles left until the running transfer completes. Zero when no
    /// internal-clock transfer is in progress.
    pub(crate) countdown: u16,
}

impl SerialPort {
    pub(crate) fn new() -> Self {
        Self {
            data: Byte::zero(),
            control: Byte::zero(),
            countdown: 0,
        }
    }

    /// Loads SB or SC. `addr` has to be 0xFF01 or 0xFF02.
    pub(crate) fn load_byte(&self, addr: Word) -> Byte {
        match addr.get() {
            0xFF01 => self.data,
            // The unused SC bits read as 1.
            0xFF02 => self.control.map(|b| b | 0b0111_1110),
            _ => unreachable!("called `SerialPort::load_byte` with invalid address"),
        }
    }

    /// Stores to SB or SC. `addr` has to be 0xFF01 or 0xFF02.
    pub(crate) fn store_byte(&mut self, addr: Word, byte: Byte) {
        match addr.get() {
            0xFF01 => self.data = byte,
            0xFF02 => {
                self.control = byte.map(|b| b & 0b1000_0011);

                if byte.bit(7) {
                    if byte.bit(0) {
                        // Internal clock: 8 bits at 8192Hz (or 32x that in
                        // fast mode) = 4096 or 256 T-cycles per byte.
                        self.countdown = if byte.bit(1) { 256 } else { 4096 };
                        trace!("[serial] transfer started: {}", self.data);
                    } else {
                        // External clock: without a peer driving the clock
                        // line, this transfer never completes.
                        self.countdown = 0;
                    }
                } else {
                    self.countdown = 0;
                }
            }
            _ => unreachable!("called `SerialPort::store_byte` with invalid address"),
        }
    }

    /// Advances the serial port by the given number of T-cycles.
    pub(crate) fn step(&mut self, cycles: u8, interrupt_controller: &mut InterruptController) {
        if self.countdown == 0 {
            return;
        }

        self.countdown = self.countdown.saturating_sub(cycles as u16);
        if self.countdown == 0 {
            // No device attached: all 1s were shifted in.
            self.data = Byte::new(0xFF);
            self.control = self.control.map(|b| b & 0b0111_1111);
            interrupt_controller.request_interrupt(Interrupt::Serial);
        }
    }

    pub(crate) fn save_state(&self, w: &mut StateWriter) {
        w.byte(self.data);
        w.byte(self.control);
        w.u16(self.countdown);
    }

    pub(crate) fn load_state(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        self.data = r.byte()?;
        self.control = r.byte()?;
        self.countdown = r.u16()?;
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;


    #[test]
    fn test_internal_transfer_completes() {
        let mut serial = SerialPort::new();
        let mut ic = InterruptController::new();
        ic.store_if(Byte::zero());

        serial.store_byte(Word::new(0xFF01), Byte::new(0x42));
        serial.store_byte(Word::new(0xFF02), Byte::new(0x81));

        for _ in 0..(4096 / 4 - 1) {
            serial.step(4, &mut ic);
        }
        assert!(serial.load_byte(Word::new(0xFF02)).bit(7));
        assert_eq!(ic.load_if().get() & 0b1000, 0);

        serial.step(4, &mut ic);
        assert_eq!(serial.load_byte(Word::new(0xFF01)), Byte::new(0xFF));
        assert!(!serial.load_byte(Word::new(0xFF02)).bit(7));
        assert_eq!(ic.load_if().get() & 0b1000, 0b1000);
    }

    #[test]
    fn test_external_transfer_never_completes() {
        let mut serial = SerialPort::new();
        let mut ic = InterruptController::new();
        ic.store_if(Byte::zero());

        serial.store_byte(Word::new(0xFF01), Byte::new(0x42));
        serial.store_byte(Word::new(0xFF02), Byte::new(0x80));

        for _ in 0..100_000 {
            serial.step(4, &mut ic);
        }
        assert!(serial.load_byte(Word::new(0xFF02)).bit(7));
        assert_eq!(serial.load_byte(Word::new(0xFF01)), Byte::new(0x42));
        assert_eq!(ic.load_if().get() & 0b1000, 0);
    }

    #[test]
    fn test_fast_mode_is_shorter() {
        let mut serial = SerialPort::new();
        let mut ic = InterruptController::new();
        ic.store_if(Byte::zero());

        serial.store_byte(Word::new(0xFF02), Byte::new(0x83));
        for _ in 0..(256 / 4) {
            serial.step(4, &mut ic);
        }
        assert!(!serial.load_byte(Word::new(0xFF02)).bit(7));
    }
}
