use crate::{
    error::SaveStateError,
    primitives::Byte,
    machine::interrupt::{InterruptController, Interrupt},
    savestate::{StateReader, StateWriter},
};


/// Represents a button on the Game Boy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Button {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

impl Button {
    /// The bit of this button in the shadow register: direction keys in the
    /// low nybble, buttons in the high nybble.
    fn bit(&self) -> u8 {
        match self {
            Button::Right => 0,
            Button::Left => 1,
            Button::Up => 2,
            Button::Down => 3,
            Button::A => 4,
            Button::B => 5,
            Button::Select => 6,
            Button::Start => 7,
        }
    }
}

/// Manages the joypad state. This is mapped to 0xFF00 in the memory.
///
/// The host pushes button transitions in; the game selects one of the two
/// button rows via bits 4/5 and reads the row state in bits 0--3. Everything
/// is active-low, like the real matrix.
pub(crate) struct InputController {
    /// The row select latch (only bits 4 and 5, as written by the game).
    select: Byte,

    /// Shadow of all eight buttons; bit set = released. Low nybble holds the
    /// direction keys, high nybble the buttons.
    buttons: Byte,
}

impl InputController {
    /// Creates an instance with no buttons pressed and no row selected.
    pub(crate) fn new() -> Self {
        Self {
            select: Byte::new(0x30),
            buttons: Byte::new(0xFF),
        }
    }

    /// Loads the joypad register.
    ///
    /// Bits 6 and 7 always return 1. When both rows are deselected, bits
    /// 0--3 read as 1.
    pub(crate) fn load_register(&self) -> Byte {
        Byte::new(0b1100_0000 | self.select.get() | self.row_bits())
    }

    /// Stores a byte to the joypad register. Only bits 4 and 5 are writable.
    pub(crate) fn store_register(&mut self, byte: Byte) {
        self.select = byte.map(|b| b & 0b0011_0000);
    }

    /// The low nybble of the register: the state of the selected row(s).
    /// Pressing a button in both selected rows ANDs together (0 wins).
    fn row_bits(&self) -> u8 {
        let mut bits = 0x0F;
        if !self.select.bit(4) {
            bits &= self.buttons.get() & 0x0F;
        }
        if !self.select.bit(5) {
            bits &= self.buttons.get() >> 4;
        }
        bits
    }

    /// Marks the given button as pressed. A high-to-low transition on a
    /// selected row bit requests the joypad interrupt.
    pub(crate) fn button_pressed(
        &mut self,
        button: Button,
        interrupt_controller: &mut InterruptController,
    ) {
        let before = self.row_bits();
        self.buttons = self.buttons.map(|b| b & !(1 << button.bit()));
        let after = self.row_bits();

        if before & !after != 0 {
            interrupt_controller.request_interrupt(Interrupt::Joypad);
        }
    }

    /// Marks the given button as released.
    pub(crate) fn button_released(&mut self, button: Button) {
        self.buttons = self.buttons.map(|b| b | (1 << button.bit()));
    }

    /// True if any button at all is held down, regardless of the row
    /// selection. This is what ends STOP mode.
    pub(crate) fn any_button_pressed(&self) -> bool {
        self.buttons.get() != 0xFF
    }

    pub(crate) fn save_state(&self, w: &mut StateWriter) {
        w.byte(self.select);
        w.byte(self.buttons);
    }

    pub(crate) fn load_state(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        self.select = r.byte()?;
        self.buttons = r.byte()?;
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;


    fn run(pressed: &[Button], select: u8) -> Byte {
        let mut ic = InputController::new();
        let mut irqs = InterruptController::new();
        ic.store_register(Byte::new(select));
        for &button in pressed {
            ic.button_pressed(button, &mut irqs);
        }
        ic.load_register()
    }

    #[test]
    fn test_no_row_selected_reads_ones() {
        assert_eq!(run(&[], 0b0011_0000), Byte::new(0b1111_1111));
        assert_eq!(run(&[Button::A, Button::Up], 0b0011_0000), Byte::new(0b1111_1111));
    }

    #[test]
    fn test_button_row() {
        assert_eq!(run(&[], 0b0001_0000), Byte::new(0b1101_1111));
        assert_eq!(run(&[Button::Left], 0b0001_0000), Byte::new(0b1101_1111));
        assert_eq!(run(&[Button::A], 0b0001_0000), Byte::new(0b1101_1110));
        assert_eq!(
            run(&[Button::A, Button::Up, Button::Start], 0b0001_0000),
            Byte::new(0b1101_0110),
        );
    }

    #[test]
    fn test_direction_row() {
        assert_eq!(run(&[], 0b0010_0000), Byte::new(0b1110_1111));
        assert_eq!(run(&[Button::A], 0b0010_0000), Byte::new(0b1110_1111));
        assert_eq!(run(&[Button::Left], 0b0010_0000), Byte::new(0b1110_1101));
        assert_eq!(
            run(&[Button::Right, Button::Up], 0b0010_0000),
            Byte::new(0b1110_1010),
        );
    }

    #[test]
    fn test_both_rows_and_together() {
        assert_eq!(
            run(&[Button::A, Button::Left], 0b0000_0000),
            Byte::new(0b1100_1100),
        );
    }

    #[test]
    fn test_press_requests_interrupt_only_when_selected() {
        let mut ic = InputController::new();
        let mut irqs = InterruptController::new();
        irqs.store_if(Byte::zero());

        // Buttons row selected, direction press: no interrupt.
        ic.store_register(Byte::new(0b0001_0000));
        ic.button_pressed(Button::Up, &mut irqs);
        assert_eq!(irqs.load_if().get() & 0b1_0000, 0);

        // Button press in the selected row: interrupt.
        ic.button_pressed(Button::A, &mut irqs);
        assert_eq!(irqs.load_if().get() & 0b1_0000, 0b1_0000);

        // Holding it down doesn't fire again.
        irqs.store_if(Byte::zero());
        ic.button_pressed(Button::A, &mut irqs);
        assert_eq!(irqs.load_if().get() & 0b1_0000, 0);
    }

    #[test]
    fn test_release_clears_shadow() {
        let mut ic = InputController::new();
        let mut irqs = InterruptController::new();
        ic.store_register(Byte::new(0b0001_0000));
        ic.button_pressed(Button::B, &mut irqs);
        assert!(ic.any_button_pressed());
        ic.button_released(Button::B);
        assert!(!ic.any_button_pressed());
        assert_eq!(ic.load_register(), Byte::new(0b1101_1111));
    }
}
