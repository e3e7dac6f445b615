//! Contains code to actually execute instructions.

use super::Machine;
use crate::{
    Disruption,
    instr::{INSTRUCTIONS, PREFIXED_INSTRUCTIONS},
    log::*,
    primitives::{Byte, Word},
};


impl Machine {
    /// Reads the operand with the given index from the standard operand
    /// encoding: 0=B, 1=C, 2=D, 3=E, 4=H, 5=L, 6=(HL), 7=A.
    fn read_operand(&self, idx: u8) -> Byte {
        match idx {
            0 => self.cpu.b,
            1 => self.cpu.c,
            2 => self.cpu.d,
            3 => self.cpu.e,
            4 => self.cpu.h,
            5 => self.cpu.l,
            6 => self.load_hl(),
            7 => self.cpu.a,
            _ => unreachable!(),
        }
    }

    /// Writes the operand with the given index (see [`Machine::read_operand`]).
    fn write_operand(&mut self, idx: u8, byte: Byte) {
        match idx {
            0 => self.cpu.b = byte,
            1 => self.cpu.c = byte,
            2 => self.cpu.d = byte,
            3 => self.cpu.e = byte,
            4 => self.cpu.h = byte,
            5 => self.cpu.l = byte,
            6 => self.store_hl(byte),
            7 => self.cpu.a = byte,
            _ => unreachable!(),
        }
    }

    /// Evaluates the condition with the given index from the standard
    /// condition encoding: 0=NZ, 1=Z, 2=NC, 3=C.
    fn condition(&self, idx: u8) -> bool {
        match idx {
            0 => !self.cpu.zero(),
            1 => self.cpu.zero(),
            2 => !self.cpu.carry(),
            3 => self.cpu.carry(),
            _ => unreachable!(),
        }
    }

    /// Performs the ALU operation with the given index on A and the given
    /// value: 0=ADD, 1=ADC, 2=SUB, 3=SBC, 4=AND, 5=XOR, 6=OR, 7=CP.
    fn alu(&mut self, op: u8, value: Byte) {
        match op {
            // ADD
            0 => {
                let (carry, half_carry) = self.cpu.a.add_with_carries(value);
                let zero = self.cpu.a == 0;
                set_flags!(self.cpu.f => zero 0 half_carry carry);
            }

            // ADC
            1 => {
                let carry_in = self.cpu.carry();
                let (carry, half_carry) = self.cpu.a.full_add_with_carries(value, carry_in);
                let zero = self.cpu.a == 0;
                set_flags!(self.cpu.f => zero 0 half_carry carry);
            }

            // SUB
            2 => {
                let (carry, half_carry) = self.cpu.a.sub_with_carries(value);
                let zero = self.cpu.a == 0;
                set_flags!(self.cpu.f => zero 1 half_carry carry);
            }

            // SBC
            3 => {
                let carry_in = self.cpu.carry();
                let (carry, half_carry) = self.cpu.a.full_sub_with_carries(value, carry_in);
                let zero = self.cpu.a == 0;
                set_flags!(self.cpu.f => zero 1 half_carry carry);
            }

            // AND
            4 => {
                self.cpu.a &= value;
                let zero = self.cpu.a == 0;
                set_flags!(self.cpu.f => zero 0 1 0);
            }

            // XOR
            5 => {
                self.cpu.a ^= value;
                let zero = self.cpu.a == 0;
                set_flags!(self.cpu.f => zero 0 0 0);
            }

            // OR
            6 => {
                self.cpu.a |= value;
                let zero = self.cpu.a == 0;
                set_flags!(self.cpu.f => zero 0 0 0);
            }

            // CP
            7 => {
                let mut copy = self.cpu.a;
                let (carry, half_carry) = copy.sub_with_carries(value);
                let zero = copy == 0;
                set_flags!(self.cpu.f => zero 1 half_carry carry);
            }

            _ => unreachable!(),
        }
    }

    /// `ADD HL, rr`: Z is left untouched.
    fn add_hl(&mut self, value: Word) {
        let mut hl = self.cpu.hl();
        let (carry, half_carry) = hl.add_with_carries(value);
        self.cpu.set_hl(hl);
        set_flags!(self.cpu.f => - 0 half_carry carry);
    }

    /// Executes one (the next) operation and returns the number of T-cycles
    /// it took.
    pub(crate) fn step(&mut self) -> Result<u8, Disruption> {
        // ========== MACROS ==========

        /// Template for all INC instructions (8 bit).
        macro_rules! inc {
            ($x:expr) => {{
                let (_, half_carry) = $x.add_with_carries(Byte::new(1));
                let zero = $x == 0;
                set_flags!(self.cpu.f => zero 0 half_carry -);

                false
            }}
        }

        /// Template for all DEC instructions (8 bit).
        macro_rules! dec {
            ($x:expr) => {{
                let (_, half_carry) = $x.sub_with_carries(Byte::new(1));
                let zero = $x == 0;
                set_flags!(self.cpu.f => zero 1 half_carry -);

                false
            }}
        }

        // ===== Per-step bookkeeping before the fetch =====

        // A pending interrupt wakes the CPU from HALT even with IME off.
        let pending = self.interrupt_controller.pending();
        if pending != 0 {
            self.halt = false;
        }

        // Service interrupts first.
        if let Some(interrupt) = self.interrupt_controller.should_interrupt() {
            return Ok(self.isr(interrupt));
        }

        // A halted or stopped CPU just burns cycles. STOP is left when the
        // joypad latches a press (see `Machine::button_pressed`).
        if self.halt || self.stopped {
            return Ok(4);
        }

        // EI takes effect after the instruction following it.
        if self.enable_interrupts_next_step {
            self.interrupt_controller.ime = true;
            self.enable_interrupts_next_step = false;
        }

        // ===== Fetch =====
        let instr_start = self.cpu.pc;
        let op_code = self.load_byte(instr_start);
        let arg_byte = self.load_byte(instr_start + 1u16);
        let arg_word = self.load_word(instr_start + 1u16);

        let instr = match INSTRUCTIONS[op_code] {
            Some(v) => v,
            None => {
                // One of the eleven holes in the opcode space. Real hardware
                // locks up; we skip the byte and keep going.
                warn!("[cpu] undefined opcode {} at {}", op_code, instr_start);
                self.cpu.pc += 1u16;
                return Ok(4);
            }
        };

        self.cpu.pc += instr.len as u16;
        if self.halt_bug {
            // The fetch after a bugged HALT fails to advance PC, so the
            // opcode byte is used a second time.
            self.cpu.pc -= 1u16;
            self.halt_bug = false;
        }

        // Cycles of the executed CB instruction (the main table entry for
        // 0xCB itself carries zero cycles).
        let mut cb_cycles = 0;

        // ===== Decode and execute =====
        let action_taken = match op_code.get() {
            // ======== 0x0_ to 0x3_: misc ========

            // NOP
            0x00 => false,

            // STOP
            0x10 => {
                self.stopped = true;

                false
            }

            // LD rr, d16
            0x01 => { self.cpu.set_bc(arg_word); false }
            0x11 => { self.cpu.set_de(arg_word); false }
            0x21 => { self.cpu.set_hl(arg_word); false }
            0x31 => { self.cpu.sp = arg_word; false }

            // LD (rr), A
            0x02 => { self.store_byte(self.cpu.bc(), self.cpu.a); false }
            0x12 => { self.store_byte(self.cpu.de(), self.cpu.a); false }
            0x22 => {
                let dst = self.cpu.hl();
                self.store_byte(dst, self.cpu.a);
                self.cpu.set_hl(dst + 1u16);

                false
            }
            0x32 => {
                let dst = self.cpu.hl();
                self.store_byte(dst, self.cpu.a);
                self.cpu.set_hl(dst - 1u16);

                false
            }

            // LD A, (rr)
            0x0A => { self.cpu.a = self.load_byte(self.cpu.bc()); false }
            0x1A => { self.cpu.a = self.load_byte(self.cpu.de()); false }
            0x2A => {
                let src = self.cpu.hl();
                self.cpu.a = self.load_byte(src);
                self.cpu.set_hl(src + 1u16);

                false
            }
            0x3A => {
                let src = self.cpu.hl();
                self.cpu.a = self.load_byte(src);
                self.cpu.set_hl(src - 1u16);

                false
            }

            // INC rr
            0x03 => { self.cpu.set_bc(self.cpu.bc() + 1u16); false }
            0x13 => { self.cpu.set_de(self.cpu.de() + 1u16); false }
            0x23 => { self.cpu.set_hl(self.cpu.hl() + 1u16); false }
            0x33 => { self.cpu.sp += 1u16; false }

            // DEC rr
            0x0B => { self.cpu.set_bc(self.cpu.bc() - 1u16); false }
            0x1B => { self.cpu.set_de(self.cpu.de() - 1u16); false }
            0x2B => { self.cpu.set_hl(self.cpu.hl() - 1u16); false }
            0x3B => { self.cpu.sp -= 1u16; false }

            // ADD HL, rr
            0x09 => { self.add_hl(self.cpu.bc()); false }
            0x19 => { self.add_hl(self.cpu.de()); false }
            0x29 => { self.add_hl(self.cpu.hl()); false }
            0x39 => { self.add_hl(self.cpu.sp); false }

            // LD (a16), SP
            0x08 => { self.store_word(arg_word, self.cpu.sp); false }

            // RLCA
            0x07 => {
                let carry = self.cpu.a.rotate_left();
                set_flags!(self.cpu.f => 0 0 0 carry);

                false
            }

            // RRCA
            0x0F => {
                let carry = self.cpu.a.rotate_right();
                set_flags!(self.cpu.f => 0 0 0 carry);

                false
            }

            // RLA
            0x17 => {
                let carry = self.cpu.a.rotate_left_through_carry(self.cpu.carry());
                set_flags!(self.cpu.f => 0 0 0 carry);

                false
            }

            // RRA
            0x1F => {
                let carry = self.cpu.a.rotate_right_through_carry(self.cpu.carry());
                set_flags!(self.cpu.f => 0 0 0 carry);

                false
            }

            // JR r8
            0x18 => {
                self.cpu.pc += arg_byte.get() as i8;

                false
            }

            // JR cc, r8
            0x20 | 0x28 | 0x30 | 0x38 => {
                if self.condition((op_code.get() >> 3) & 0b11) {
                    self.cpu.pc += arg_byte.get() as i8;

                    true
                } else {
                    false
                }
            }

            // DAA
            0x27 => {
                let carry = self.cpu.daa();
                let zero = self.cpu.a == 0;
                set_flags!(self.cpu.f => zero - 0 carry);

                false
            }

            // CPL
            0x2F => {
                self.cpu.a = !self.cpu.a;
                set_flags!(self.cpu.f => - 1 1 -);

                false
            }

            // SCF
            0x37 => {
                set_flags!(self.cpu.f => - 0 0 1);

                false
            }

            // CCF
            0x3F => {
                let carry = !self.cpu.carry();
                set_flags!(self.cpu.f => - 0 0 carry);

                false
            }

            // INC r (including INC (HL))
            op if op & 0xC7 == 0x04 => {
                let idx = (op >> 3) & 0b111;
                let mut v = self.read_operand(idx);
                let taken = inc!(v);
                self.write_operand(idx, v);

                taken
            }

            // DEC r (including DEC (HL))
            op if op & 0xC7 == 0x05 => {
                let idx = (op >> 3) & 0b111;
                let mut v = self.read_operand(idx);
                let taken = dec!(v);
                self.write_operand(idx, v);

                taken
            }

            // LD r, d8 (including LD (HL), d8)
            op if op & 0xC7 == 0x06 => {
                self.write_operand((op >> 3) & 0b111, arg_byte);

                false
            }

            // ======== 0x4_ to 0x7_: loads between registers ========

            // HALT (sits in the middle of the LD block)
            0x76 => {
                if !self.interrupt_controller.ime && pending != 0 {
                    // The CPU fails to halt; instead the next byte is
                    // executed twice.
                    self.halt_bug = true;
                } else {
                    self.halt = true;
                }

                false
            }

            // LD r, r'
            op @ 0x40..=0x7F => {
                let v = self.read_operand(op & 0b111);
                self.write_operand((op >> 3) & 0b111, v);

                false
            }

            // ======== 0x8_ to 0xB_: arithmetic and logic ========

            op @ 0x80..=0xBF => {
                let v = self.read_operand(op & 0b111);
                self.alu((op >> 3) & 0b111, v);

                false
            }

            // ======== 0xC_ to 0xF_: control flow and the rest ========

            // RET cc
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                if self.condition((op_code.get() >> 3) & 0b11) {
                    self.cpu.pc = self.pop();

                    true
                } else {
                    false
                }
            }

            // POP rr
            0xC1 => { let v = self.pop(); self.cpu.set_bc(v); false }
            0xD1 => { let v = self.pop(); self.cpu.set_de(v); false }
            0xE1 => { let v = self.pop(); self.cpu.set_hl(v); false }
            0xF1 => { let v = self.pop(); self.cpu.set_af(v); false }

            // PUSH rr
            0xC5 => { self.push(self.cpu.bc()); false }
            0xD5 => { self.push(self.cpu.de()); false }
            0xE5 => { self.push(self.cpu.hl()); false }
            0xF5 => { self.push(self.cpu.af()); false }

            // JP cc, a16
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                if self.condition((op_code.get() >> 3) & 0b11) {
                    self.cpu.pc = arg_word;

                    true
                } else {
                    false
                }
            }

            // JP a16
            0xC3 => {
                self.cpu.pc = arg_word;

                false
            }

            // CALL cc, a16
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                if self.condition((op_code.get() >> 3) & 0b11) {
                    self.push(self.cpu.pc);
                    self.cpu.pc = arg_word;

                    true
                } else {
                    false
                }
            }

            // CALL a16
            0xCD => {
                self.push(self.cpu.pc);
                self.cpu.pc = arg_word;

                false
            }

            // RET
            0xC9 => {
                self.cpu.pc = self.pop();

                false
            }

            // RETI
            0xD9 => {
                self.cpu.pc = self.pop();
                self.interrupt_controller.ime = true;

                false
            }

            // RST
            op if op & 0xC7 == 0xC7 => {
                self.push(self.cpu.pc);
                self.cpu.pc = Word::new((op & 0b0011_1000) as u16);

                false
            }

            // ALU A, d8
            op if op & 0xC7 == 0xC6 => {
                self.alu((op >> 3) & 0b111, arg_byte);

                false
            }

            // LDH (a8), A
            0xE0 => {
                self.store_byte(Word::new(0xFF00) + arg_byte, self.cpu.a);

                false
            }

            // LDH A, (a8)
            0xF0 => {
                self.cpu.a = self.load_byte(Word::new(0xFF00) + arg_byte);

                false
            }

            // LD (C), A
            0xE2 => {
                self.store_byte(Word::new(0xFF00) + self.cpu.c, self.cpu.a);

                false
            }

            // LD A, (C)
            0xF2 => {
                self.cpu.a = self.load_byte(Word::new(0xFF00) + self.cpu.c);

                false
            }

            // LD (a16), A
            0xEA => {
                self.store_byte(arg_word, self.cpu.a);

                false
            }

            // LD A, (a16)
            0xFA => {
                self.cpu.a = self.load_byte(arg_word);

                false
            }

            // ADD SP, r8
            0xE8 => {
                let (carry, half_carry) = self.cpu.sp.add_i8_with_carries(arg_byte.get() as i8);
                set_flags!(self.cpu.f => 0 0 half_carry carry);

                false
            }

            // LD HL, SP+r8
            0xF8 => {
                let mut v = self.cpu.sp;
                let (carry, half_carry) = v.add_i8_with_carries(arg_byte.get() as i8);
                self.cpu.set_hl(v);
                set_flags!(self.cpu.f => 0 0 half_carry carry);

                false
            }

            // JP (HL)
            0xE9 => {
                self.cpu.pc = self.cpu.hl();

                false
            }

            // LD SP, HL
            0xF9 => {
                self.cpu.sp = self.cpu.hl();

                false
            }

            // DI
            0xF3 => {
                self.interrupt_controller.ime = false;
                self.enable_interrupts_next_step = false;

                false
            }

            // EI
            0xFB => {
                self.enable_interrupts_next_step = true;

                false
            }

            // PREFIX CB
            0xCB => {
                let cb_op = arg_byte;
                let cb_instr = PREFIXED_INSTRUCTIONS[cb_op];
                self.cpu.pc += cb_instr.len as u16;
                cb_cycles = cb_instr.cycles;

                let idx = cb_op.get() & 0b111;
                match cb_op.get() >> 6 {
                    // Rotates and shifts
                    0 => {
                        let mut v = self.read_operand(idx);
                        let carry = match (cb_op.get() >> 3) & 0b111 {
                            0 => v.rotate_left(),                                   // RLC
                            1 => v.rotate_right(),                                  // RRC
                            2 => v.rotate_left_through_carry(self.cpu.carry()),     // RL
                            3 => v.rotate_right_through_carry(self.cpu.carry()),    // RR
                            4 => v.shift_left(),                                    // SLA
                            5 => v.arithmetic_shift_right(),                        // SRA
                            6 => { v = v.swap_nybbles(); false }                    // SWAP
                            7 => v.shift_right(),                                   // SRL
                            _ => unreachable!(),
                        };
                        let zero = v == 0;
                        self.write_operand(idx, v);
                        set_flags!(self.cpu.f => zero 0 0 carry);
                    }

                    // BIT n, r
                    1 => {
                        let bit = (cb_op.get() >> 3) & 0b111;
                        let zero = !self.read_operand(idx).bit(bit);
                        set_flags!(self.cpu.f => zero 0 1 -);
                    }

                    // RES n, r
                    2 => {
                        let bit = (cb_op.get() >> 3) & 0b111;
                        let v = self.read_operand(idx).map(|b| b & !(1 << bit));
                        self.write_operand(idx, v);
                    }

                    // SET n, r
                    3 => {
                        let bit = (cb_op.get() >> 3) & 0b111;
                        let v = self.read_operand(idx).map(|b| b | (1 << bit));
                        self.write_operand(idx, v);
                    }

                    _ => unreachable!(),
                }

                false
            }

            op => {
                // Every defined opcode has an arm above; reaching this means
                // the instruction table and this match disagree.
                error!(
                    "[cpu] unimplemented opcode 0x{:02x} at {} -- halting the CPU",
                    op,
                    instr_start,
                );
                return Err(Disruption::Terminated);
            }
        };

        let cycles = if action_taken {
            match instr.cycles_taken {
                Some(c) => c,
                None => instr.cycles,
            }
        } else {
            instr.cycles
        };

        Ok(cycles + cb_cycles)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::cartridge::Cartridge;


    /// Builds a machine whose ROM holds `code` at the entry point 0x0100.
    fn machine_with(code: &[u8]) -> Machine {
        let mut rom = vec![0u8; 0x8000];
        rom[0x0100..0x0100 + code.len()].copy_from_slice(code);
        let mut machine = Machine::new(Cartridge::from_bytes(&rom).unwrap(), 44_100);
        // Clear the boot-time V-Blank request: these tests manage IF
        // themselves.
        machine.interrupt_controller.store_if(Byte::zero());
        machine
    }

    /// Runs `machine.step()` until `code_len` bytes of code were consumed
    /// and returns the spent cycles.
    fn run(machine: &mut Machine, code_len: u16) -> u64 {
        let end = Word::new(0x0100 + code_len);
        let mut cycles = 0;
        while machine.cpu.pc != end {
            cycles += machine.step().ok().unwrap() as u64;
            assert!(cycles < 100_000, "runaway test program");
        }
        cycles
    }

    #[test]
    fn test_ld_and_alu_block() {
        // LD B, 0x12; LD C, B; ADD A, C; ADD A, 0xEE
        let mut m = machine_with(&[0x06, 0x12, 0x48, 0x81, 0xC6, 0xEE]);
        m.cpu.a = Byte::zero();
        let cycles = run(&mut m, 6);

        assert_eq!(m.cpu.b, Byte::new(0x12));
        assert_eq!(m.cpu.c, Byte::new(0x12));
        assert_eq!(m.cpu.a, Byte::new(0x00));
        // 0x12 + 0xEE = 0x100: zero, carry and half carry set.
        assert!(m.cpu.zero() && m.cpu.carry() && m.cpu.half_carry() && !m.cpu.subtract());
        assert_eq!(cycles, 8 + 4 + 4 + 8);
    }

    #[test]
    fn test_hl_memory_operand() {
        // LD HL, 0xC000; LD (HL), 0x40; INC (HL); ADD A, (HL)
        let mut m = machine_with(&[0x21, 0x00, 0xC0, 0x36, 0x40, 0x34, 0x86]);
        m.cpu.a = Byte::new(1);
        let cycles = run(&mut m, 7);

        assert_eq!(m.load_byte(Word::new(0xC000)), Byte::new(0x41));
        assert_eq!(m.cpu.a, Byte::new(0x42));
        assert_eq!(cycles, 12 + 12 + 12 + 8);
    }

    #[test]
    fn test_add_hl_preserves_zero_flag() {
        // SCF (get defined flags); ADD HL, BC
        let mut m = machine_with(&[0x37, 0x09]);
        m.cpu.set_hl(Word::new(0x8FFF));
        m.cpu.set_bc(Word::new(0x0001));
        set_flags!(m.cpu.f => 1 1 0 0);
        run(&mut m, 2);

        assert_eq!(m.cpu.hl(), Word::new(0x9000));
        // Z survives, N cleared, H from bit 11 carry.
        assert!(m.cpu.zero() && !m.cpu.subtract() && m.cpu.half_carry() && !m.cpu.carry());
    }

    #[test]
    fn test_add_sp_flags_come_from_low_byte() {
        // ADD SP, -1
        let mut m = machine_with(&[0xE8, 0xFF]);
        m.cpu.sp = Word::new(0xD000);
        let cycles = run(&mut m, 2);

        assert_eq!(m.cpu.sp, Word::new(0xCFFF));
        // Low byte: 0x00 + 0xFF = no carries.
        assert!(!m.cpu.zero() && !m.cpu.subtract() && !m.cpu.half_carry() && !m.cpu.carry());
        assert_eq!(cycles, 16);
    }

    #[test]
    fn test_ld_hl_sp_plus_offset() {
        // LD HL, SP+0x01
        let mut m = machine_with(&[0xF8, 0x01]);
        m.cpu.sp = Word::new(0xC0FF);
        run(&mut m, 2);

        assert_eq!(m.cpu.hl(), Word::new(0xC100));
        assert!(!m.cpu.zero() && !m.cpu.subtract() && m.cpu.half_carry() && m.cpu.carry());
        assert_eq!(m.cpu.sp, Word::new(0xC0FF));
    }

    #[test]
    fn test_conditional_jump_cycles() {
        // JR NZ, +2 with Z set: not taken, 8 cycles.
        let mut m = machine_with(&[0x20, 0x02]);
        set_flags!(m.cpu.f => 1 0 0 0);
        assert_eq!(m.step().ok().unwrap(), 8);
        assert_eq!(m.cpu.pc, Word::new(0x0102));

        // JR NZ, +2 with Z clear: taken, 12 cycles.
        let mut m = machine_with(&[0x20, 0x02]);
        set_flags!(m.cpu.f => 0 0 0 0);
        assert_eq!(m.step().ok().unwrap(), 12);
        assert_eq!(m.cpu.pc, Word::new(0x0104));
    }

    #[test]
    fn test_call_and_ret() {
        // CALL 0x0110; (at 0x0110) RET
        let mut code = [0u8; 0x11];
        code[0x00..0x03].copy_from_slice(&[0xCD, 0x10, 0x01]);
        code[0x10] = 0xC9;
        let mut m = machine_with(&code);

        assert_eq!(m.step().ok().unwrap(), 24);
        assert_eq!(m.cpu.pc, Word::new(0x0110));
        assert_eq!(m.cpu.sp, Word::new(0xFFFC));
        assert_eq!(m.load_word(Word::new(0xFFFC)), Word::new(0x0103));

        assert_eq!(m.step().ok().unwrap(), 16);
        assert_eq!(m.cpu.pc, Word::new(0x0103));
        assert_eq!(m.cpu.sp, Word::new(0xFFFE));
    }

    #[test]
    fn test_push_pop_af_masks_flags() {
        // LD BC, 0x12FF; PUSH BC; POP AF
        let mut m = machine_with(&[0x01, 0xFF, 0x12, 0xC5, 0xF1]);
        run(&mut m, 5);

        assert_eq!(m.cpu.a, Byte::new(0x12));
        assert_eq!(m.cpu.f, Byte::new(0xF0));
    }

    #[test]
    fn test_rst_vectors() {
        // RST 28H
        let mut m = machine_with(&[0xEF]);
        assert_eq!(m.step().ok().unwrap(), 16);
        assert_eq!(m.cpu.pc, Word::new(0x0028));
        assert_eq!(m.load_word(Word::new(0xFFFC)), Word::new(0x0101));
    }

    #[test]
    fn test_cb_shifts_and_bits() {
        // RLC B; SRL B; SWAP B; BIT 0, B; SET 7, B; RES 7, B
        let mut m = machine_with(&[
            0xCB, 0x00, 0xCB, 0x38, 0xCB, 0x30, 0xCB, 0x40, 0xCB, 0xF8, 0xCB, 0xB8,
        ]);
        m.cpu.b = Byte::new(0x81);
        let cycles = run(&mut m, 12);

        // 0x81 -RLC-> 0x03 (carry), -SRL-> 0x01 (carry), -SWAP-> 0x10,
        // BIT 0 -> zero set, SET 7 -> 0x90, RES 7 -> 0x10.
        assert_eq!(m.cpu.b, Byte::new(0x10));
        assert!(m.cpu.zero());
        assert_eq!(cycles, 6 * 8);
    }

    #[test]
    fn test_cb_memory_operand_cycles() {
        // LD HL, 0xC000; SET 0, (HL); BIT 0, (HL)
        let mut m = machine_with(&[0x21, 0x00, 0xC0, 0xCB, 0xC6, 0xCB, 0x46]);
        let cycles = run(&mut m, 7);

        assert_eq!(m.load_byte(Word::new(0xC000)), Byte::new(0x01));
        assert!(!m.cpu.zero());
        assert_eq!(cycles, 12 + 16 + 12);
    }

    #[test]
    fn test_undefined_opcode_is_a_nop() {
        let mut m = machine_with(&[0xD3, 0x00]);
        assert_eq!(m.step().ok().unwrap(), 4);
        assert_eq!(m.cpu.pc, Word::new(0x0101));
    }

    #[test]
    fn test_ei_is_delayed_one_instruction() {
        // EI; NOP; NOP with a pending interrupt.
        let mut m = machine_with(&[0xFB, 0x00, 0x00]);
        m.interrupt_controller.interrupt_enable = Byte::new(0x01);
        m.interrupt_controller.store_if(Byte::new(0x01));

        // EI executes; IME still off.
        m.step().ok().unwrap();
        assert!(!m.interrupt_controller.ime);

        // The following instruction runs before the interrupt hits.
        m.step().ok().unwrap();
        assert!(m.interrupt_controller.ime);
        assert_eq!(m.cpu.pc, Word::new(0x0102));

        // Now the dispatch happens.
        assert_eq!(m.step().ok().unwrap(), 20);
        assert_eq!(m.cpu.pc, Word::new(0x0040));
    }

    #[test]
    fn test_interrupt_dispatch_priority() {
        let mut m = machine_with(&[0x00; 16]);
        m.interrupt_controller.ime = true;
        m.interrupt_controller.interrupt_enable = Byte::new(0x1F);
        m.interrupt_controller.store_if(Byte::new(0x1F));

        let vectors = [0x40, 0x48, 0x50, 0x58, 0x60];
        for &vector in &vectors {
            assert_eq!(m.step().ok().unwrap(), 20);
            assert_eq!(m.cpu.pc, Word::new(vector));
            assert!(!m.interrupt_controller.ime);

            // The stacked PC is the pre-dispatch one.
            assert_eq!(m.load_word(m.cpu.sp), Word::new(0x0100));

            // Only the dispatched bit was cleared; re-arm for the next one.
            m.interrupt_controller.ime = true;
            m.cpu.pc = Word::new(0x0100);
        }

        assert_eq!(m.interrupt_controller.pending(), 0);
    }

    #[test]
    fn test_halt_wakes_without_dispatch_when_ime_off() {
        // HALT; INC B
        let mut m = machine_with(&[0x76, 0x04]);
        m.interrupt_controller.interrupt_enable = Byte::new(0x04);

        m.step().ok().unwrap();
        assert!(m.halt);

        // Nothing pending: the CPU idles.
        assert_eq!(m.step().ok().unwrap(), 4);
        assert_eq!(m.cpu.pc, Word::new(0x0101));

        // A pending (enabled) interrupt wakes it up without a dispatch.
        m.interrupt_controller.store_if(Byte::new(0x04));
        m.step().ok().unwrap();
        assert!(!m.halt);
        assert_eq!(m.cpu.pc, Word::new(0x0102));
        assert_eq!(m.cpu.b, Byte::new(0x01));
        // IF is untouched.
        assert_eq!(m.interrupt_controller.pending(), 0x04);
    }

    #[test]
    fn test_halt_bug_executes_next_byte_twice() {
        // IME=0, IE & IF != 0: HALT; INC A; INC A
        let mut m = machine_with(&[0x76, 0x3C, 0x3C]);
        m.cpu.a = Byte::zero();
        m.interrupt_controller.interrupt_enable = Byte::new(0x01);
        m.interrupt_controller.store_if(Byte::new(0x01));

        // HALT does not halt; the bug latch is set instead.
        m.step().ok().unwrap();
        assert!(!m.halt);
        assert!(m.halt_bug);

        // First INC A executes without advancing PC.
        m.step().ok().unwrap();
        assert_eq!(m.cpu.a, Byte::new(1));
        assert_eq!(m.cpu.pc, Word::new(0x0101));

        // ... so it executes again, and PC moves on correctly afterwards.
        m.step().ok().unwrap();
        assert_eq!(m.cpu.a, Byte::new(2));
        assert_eq!(m.cpu.pc, Word::new(0x0102));

        m.step().ok().unwrap();
        assert_eq!(m.cpu.a, Byte::new(3));
        assert_eq!(m.cpu.pc, Word::new(0x0103));
    }

    #[test]
    fn test_stop_is_left_by_button_press() {
        // STOP
        let mut m = machine_with(&[0x10, 0x00, 0x04]);
        m.step().ok().unwrap();
        assert!(m.stopped);
        assert_eq!(m.cpu.pc, Word::new(0x0102));

        // The CPU burns cycles while stopped.
        assert_eq!(m.step().ok().unwrap(), 4);
        assert_eq!(m.cpu.pc, Word::new(0x0102));

        m.button_pressed(crate::machine::input::Button::Start);
        m.step().ok().unwrap();
        assert_eq!(m.cpu.pc, Word::new(0x0103));
        assert_eq!(m.cpu.b, Byte::new(1));
    }

    #[test]
    fn test_documented_cycle_counts() {
        // A grab bag of unconditional instructions with their documented
        // T-cycle costs.
        let cases: &[(&[u8], u8)] = &[
            (&[0x00], 4),               // NOP
            (&[0x01, 0x00, 0x00], 12),  // LD BC, d16
            (&[0x08, 0x00, 0xC0], 20),  // LD (a16), SP
            (&[0x36, 0x00], 12),        // LD (HL), d8 (HL points to ROM: dropped)
            (&[0xC3, 0x00, 0x01], 16),  // JP a16
            (&[0xC5], 16),              // PUSH BC
            (&[0xC1], 12),              // POP BC
            (&[0xE0, 0x80], 12),        // LDH (a8), A
            (&[0xF0, 0x80], 12),        // LDH A, (a8)
            (&[0xEA, 0x00, 0xC0], 16),  // LD (a16), A
            (&[0xF9], 8),               // LD SP, HL
            (&[0xE9], 4),               // JP (HL)
        ];

        for (code, expected) in cases {
            let mut m = machine_with(code);
            assert_eq!(
                m.step().ok().unwrap(),
                *expected,
                "wrong cycle count for opcode 0x{:02x}",
                code[0],
            );
        }
    }
}
