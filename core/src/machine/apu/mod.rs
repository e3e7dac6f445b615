//! Everything related to the audio processing unit (APU).

use crate::{
    env::AudioSink,
    error::SaveStateError,
    log::*,
    primitives::{Byte, Word, CPU_CLOCK},
    savestate::{StateReader, StateWriter},
};
use self::{
    noise::NoiseChannel,
    square::SquareChannel,
    wave::WaveChannel,
};

pub(crate) mod noise;
pub(crate) mod square;
pub(crate) mod wave;


/// The frame sequencer is clocked at 512Hz: every 8192 T-cycles.
const FRAME_SEQUENCER_PERIOD: u16 = 8192;

/// One-pole high-pass filter coefficient (removes the DC offset the DACs
/// produce).
const HP_ALPHA: f32 = 0.999;

/// One-pole low-pass filter coefficient (tames the raw square edges).
const LP_ALPHA: f32 = 0.25;

/// Pending PCM bytes are handed to the sink in chunks of this size.
const FLUSH_BYTES: usize = 2048;


/// Audio processing unit: four channels, a frame sequencer driving their
/// length/envelope/sweep units, and a mixer producing 16-bit stereo PCM.
pub struct Apu {
    pub(crate) ch1: SquareChannel,
    pub(crate) ch2: SquareChannel,
    pub(crate) ch3: WaveChannel,
    pub(crate) ch4: NoiseChannel,

    /// FF24 NR50: master volume per side (bit 7 and 3, the VIN bits, are
    /// accepted but ignored: no cartridge ever used VIN).
    pub(crate) nr50: Byte,

    /// FF25 NR51: which channel feeds which side.
    pub(crate) nr51: Byte,

    /// FF26 NR52 bit 7: APU master enable.
    pub(crate) enabled: bool,

    /// Current frame sequencer step, 0--7.
    pub(crate) frame_step: u8,

    /// T-cycles into the current frame sequencer period.
    pub(crate) frame_counter: u16,

    /// 16.16 fixed point accumulator deciding when to emit a sample.
    pub(crate) sample_phase: u32,

    /// 16.16 fixed point phase increment per T-cycle.
    sample_inc: u32,

    sample_rate: u32,

    /// Finished PCM bytes waiting to be flushed to the sink.
    sample_buf: Vec<u8>,

    // Filter state, one per stereo lane.
    hp_prev_in: [f32; 2],
    hp_prev_out: [f32; 2],
    lp_prev: [f32; 2],
}

impl Apu {
    pub(crate) fn new(sample_rate: u32) -> Self {
        let mut apu = Self {
            ch1: SquareChannel::new(true),
            ch2: SquareChannel::new(false),
            ch3: WaveChannel::new(),
            ch4: NoiseChannel::new(),
            nr50: Byte::new(0x77),
            nr51: Byte::new(0xF3),
            enabled: true,
            frame_step: 0,
            frame_counter: 0,
            sample_phase: 0,
            sample_inc: (((sample_rate as u64) << 16) / CPU_CLOCK as u64) as u32,
            sample_rate,
            sample_buf: Vec::with_capacity(2 * FLUSH_BYTES),
            hp_prev_in: [0.0; 2],
            hp_prev_out: [0.0; 2],
            lp_prev: [0.0; 2],
        };

        // Post-boot register state: the boot ROM has played its ping on
        // channel 1 and leaves it enabled.
        apu.ch1.nrx0 = Byte::new(0x80);
        apu.ch1.nrx1 = Byte::new(0x80);
        apu.ch1.nrx2 = Byte::new(0xF3);
        apu.ch1.enabled = true;
        apu.ch1.envelope_volume = 15;

        apu
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Loads a byte from the APU register range `0xFF10..0xFF40`.
    pub(crate) fn load_byte(&self, addr: Word) -> Byte {
        match addr.get() {
            0xFF10..=0xFF14 => self.ch1.read_reg((addr.get() - 0xFF10) as u8),
            0xFF16..=0xFF19 => self.ch2.read_reg((addr.get() - 0xFF15) as u8),
            0xFF1A..=0xFF1E => self.ch3.read_reg((addr.get() - 0xFF1A) as u8),
            0xFF20..=0xFF23 => self.ch4.read_reg((addr.get() - 0xFF1F) as u8),
            0xFF24 => self.nr50,
            0xFF25 => self.nr51,
            0xFF26 => {
                let v = 0x70
                    | (self.enabled as u8) << 7
                    | (self.ch4.enabled as u8) << 3
                    | (self.ch3.enabled as u8) << 2
                    | (self.ch2.enabled as u8) << 1
                    | self.ch1.enabled as u8;
                Byte::new(v)
            }
            0xFF30..=0xFF3F => self.ch3.load_wave_byte(addr),
            // The gaps (FF15, FF1F, FF27-FF2F) read as all ones.
            0xFF10..=0xFF3F => Byte::new(0xFF),
            _ => unreachable!("called `Apu::load_byte` with invalid address"),
        }
    }

    /// Stores a byte into the APU register range `0xFF10..0xFF40`.
    pub(crate) fn store_byte(&mut self, addr: Word, byte: Byte) {
        // While the APU is off, only NR52 itself, the length counters and
        // wave RAM are writable.
        if !self.enabled {
            match addr.get() {
                0xFF11 => self.ch1.write_length_only(byte),
                0xFF16 => self.ch2.write_length_only(byte),
                0xFF1B => self.ch3.write_length_only(byte),
                0xFF20 => self.ch4.write_length_only(byte),
                0xFF26 => self.store_nr52(byte),
                0xFF30..=0xFF3F => self.ch3.store_wave_byte(addr, byte),
                _ => {}
            }
            return;
        }

        match addr.get() {
            0xFF10..=0xFF14 => self.ch1.write_reg((addr.get() - 0xFF10) as u8, byte),
            0xFF16..=0xFF19 => self.ch2.write_reg((addr.get() - 0xFF15) as u8, byte),
            0xFF1A..=0xFF1E => self.ch3.write_reg((addr.get() - 0xFF1A) as u8, byte),
            0xFF20..=0xFF23 => self.ch4.write_reg((addr.get() - 0xFF1F) as u8, byte),
            0xFF24 => self.nr50 = byte,
            0xFF25 => self.nr51 = byte,
            0xFF26 => self.store_nr52(byte),
            0xFF30..=0xFF3F => self.ch3.store_wave_byte(addr, byte),
            // Writes into the gaps are lost.
            0xFF10..=0xFF3F => {}
            _ => unreachable!("called `Apu::store_byte` with invalid address"),
        }
    }

    fn store_nr52(&mut self, byte: Byte) {
        let enable = byte.bit(7);
        if enable && !self.enabled {
            debug!("[apu] powered on");
            self.enabled = true;
            self.frame_step = 0;
            self.frame_counter = 0;
        } else if !enable && self.enabled {
            // Powering off clears every register except wave RAM.
            debug!("[apu] powered off");
            self.ch1.power_off();
            self.ch2.power_off();
            self.ch3.power_off();
            self.ch4.power_off();
            self.nr50 = Byte::zero();
            self.nr51 = Byte::zero();
            self.frame_step = 0;
            self.frame_counter = 0;
            self.enabled = false;
        }
    }

    /// Advances the APU by one T-cycle.
    pub(crate) fn step(&mut self, sink: &mut impl AudioSink) {
        if self.enabled {
            self.frame_counter += 1;
            if self.frame_counter == FRAME_SEQUENCER_PERIOD {
                self.frame_counter = 0;
                self.clock_frame_sequencer();
            }

            self.ch1.step();
            self.ch2.step();
            self.ch3.step();
            self.ch4.step();
        }

        // Samples are emitted even while the APU is disabled; the stream
        // just carries silence then.
        self.sample_phase += self.sample_inc;
        if self.sample_phase >= 1 << 16 {
            self.sample_phase -= 1 << 16;
            self.emit_sample();

            if self.sample_buf.len() >= FLUSH_BYTES {
                self.flush(sink);
            }
        }
    }

    /// One 512Hz tick: length on steps 0/2/4/6, sweep on 2/6, envelope on 7.
    fn clock_frame_sequencer(&mut self) {
        match self.frame_step {
            0 | 4 => self.clock_lengths(),
            2 | 6 => {
                self.clock_lengths();
                self.ch1.clock_sweep();
            }
            7 => {
                self.ch1.clock_envelope();
                self.ch2.clock_envelope();
                self.ch4.clock_envelope();
            }
            _ => {}
        }

        self.frame_step = (self.frame_step + 1) % 8;
    }

    fn clock_lengths(&mut self) {
        self.ch1.clock_length();
        self.ch2.clock_length();
        self.ch3.clock_length();
        self.ch4.clock_length();
    }

    /// Mixes the four channel outputs into one stereo sample and appends it
    /// to the pending PCM bytes.
    fn emit_sample(&mut self) {
        let outputs = [
            self.ch1.output(),
            self.ch2.output(),
            self.ch3.output(),
            self.ch4.output(),
        ];

        let nr51 = self.nr51.get();
        let mut lanes = [0.0f32; 2];
        for (i, &out) in outputs.iter().enumerate() {
            if nr51 & (1 << (i + 4)) != 0 {
                lanes[0] += out as f32;
            }
            if nr51 & (1 << i) != 0 {
                lanes[1] += out as f32;
            }
        }

        let volumes = [
            ((self.nr50.get() >> 4) & 0b111) as f32 + 1.0,
            (self.nr50.get() & 0b111) as f32 + 1.0,
        ];

        for (i, lane) in lanes.iter_mut().enumerate() {
            // Scale by the side volume and normalize by the largest possible
            // sum (4 channels x 15).
            let x = *lane * volumes[i] / 8.0 / 60.0;

            let hp = x - self.hp_prev_in[i] + HP_ALPHA * self.hp_prev_out[i];
            self.hp_prev_in[i] = x;
            self.hp_prev_out[i] = hp;

            let lp = self.lp_prev[i] + LP_ALPHA * (hp - self.lp_prev[i]);
            self.lp_prev[i] = lp;

            *lane = lp.tanh();
        }

        for lane in &lanes {
            let v = (lane * i16::MAX as f32) as i16;
            self.sample_buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Hands the pending PCM bytes to the sink. If the sink can't take them
    /// all without blocking for long, they are dropped instead: falling
    /// behind on audio is better than drifting away from real time.
    pub(crate) fn flush(&mut self, sink: &mut impl AudioSink) {
        if self.sample_buf.is_empty() {
            return;
        }

        if sink.capacity() >= self.sample_buf.len() {
            sink.write(&self.sample_buf);
        } else {
            trace!("[apu] sink full, dropping {} bytes", self.sample_buf.len());
        }
        self.sample_buf.clear();
    }

    pub(crate) fn save_state(&self, w: &mut StateWriter) {
        w.bool(self.enabled);
        w.u8(self.frame_step);
        w.u16(self.frame_counter);
        w.u32(self.sample_phase);
        w.byte(self.nr50);
        w.byte(self.nr51);

        self.ch1.save_state(w);
        self.ch2.save_state(w);
        self.ch3.save_state(w);
        self.ch4.save_state(w);

        for i in 0..2 {
            w.f32(self.hp_prev_in[i]);
            w.f32(self.hp_prev_out[i]);
            w.f32(self.lp_prev[i]);
        }
    }

    pub(crate) fn load_state(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        self.enabled = r.bool()?;
        self.frame_step = r.u8()?;
        self.frame_counter = r.u16()?;
        self.sample_phase = r.u32()?;
        self.nr50 = r.byte()?;
        self.nr51 = r.byte()?;

        self.ch1.load_state(r)?;
        self.ch2.load_state(r)?;
        self.ch3.load_state(r)?;
        self.ch4.load_state(r)?;

        for i in 0..2 {
            self.hp_prev_in[i] = r.f32()?;
            self.hp_prev_out[i] = r.f32()?;
            self.lp_prev[i] = r.f32()?;
        }

        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::env::NullSink;


    /// A sink recording everything written to it.
    struct CaptureSink(Vec<u8>);

    impl AudioSink for CaptureSink {
        fn capacity(&self) -> usize {
            usize::MAX
        }

        fn write(&mut self, bytes: &[u8]) {
            self.0.extend_from_slice(bytes);
        }
    }

    fn fresh_apu() -> Apu {
        // 65536Hz sample rate makes the phase math exact: one sample every
        // 64 T-cycles.
        let mut apu = Apu::new(65536);
        apu.store_byte(Word::new(0xFF26), Byte::zero());
        apu.store_byte(Word::new(0xFF26), Byte::new(0x80));
        apu.store_byte(Word::new(0xFF24), Byte::new(0x77));
        apu.store_byte(Word::new(0xFF25), Byte::new(0xFF));
        apu
    }

    fn step_n(apu: &mut Apu, n: u32) {
        let mut sink = NullSink;
        for _ in 0..n {
            apu.step(&mut sink);
        }
    }

    #[test]
    fn test_frame_sequencer_schedule() {
        let mut apu = fresh_apu();

        // Channel 2 with length counter 10 and length enable.
        apu.store_byte(Word::new(0xFF17), Byte::new(0xF0));
        apu.store_byte(Word::new(0xFF16), Byte::new(0x36));
        apu.store_byte(Word::new(0xFF19), Byte::new(0xC0));
        assert_eq!(apu.ch2.length_counter, 10);

        // Length is clocked on steps 0, 2, 4 and 6: two decrements per four
        // sequencer ticks.
        let expected = [9, 9, 8, 8, 7, 7, 6, 6];
        for &len in &expected {
            step_n(&mut apu, FRAME_SEQUENCER_PERIOD as u32);
            assert_eq!(apu.ch2.length_counter, len);
        }
    }

    #[test]
    fn test_envelope_clocked_on_step_7() {
        let mut apu = fresh_apu();

        // Channel 2, volume 15, decrease with period 1.
        apu.store_byte(Word::new(0xFF17), Byte::new(0xF1));
        apu.store_byte(Word::new(0xFF19), Byte::new(0x80));
        assert_eq!(apu.ch2.envelope_volume, 15);

        // Steps 0 through 6: no envelope change.
        step_n(&mut apu, 7 * FRAME_SEQUENCER_PERIOD as u32);
        assert_eq!(apu.ch2.envelope_volume, 15);

        // Step 7 decays the volume.
        step_n(&mut apu, FRAME_SEQUENCER_PERIOD as u32);
        assert_eq!(apu.ch2.envelope_volume, 14);
    }

    #[test]
    fn test_nr52_reports_channel_status() {
        let mut apu = fresh_apu();
        // All boot state channels off.
        assert_eq!(apu.load_byte(Word::new(0xFF26)), Byte::new(0xF0));

        apu.store_byte(Word::new(0xFF17), Byte::new(0xF0));
        apu.store_byte(Word::new(0xFF19), Byte::new(0x80));
        assert_eq!(apu.load_byte(Word::new(0xFF26)), Byte::new(0xF2));
    }

    #[test]
    fn test_power_off_clears_registers_keeps_wave_ram() {
        let mut apu = fresh_apu();
        apu.store_byte(Word::new(0xFF12), Byte::new(0xF7));
        apu.store_byte(Word::new(0xFF30), Byte::new(0x42));

        apu.store_byte(Word::new(0xFF26), Byte::zero());
        assert_eq!(apu.load_byte(Word::new(0xFF26)), Byte::new(0x70));
        // NR12 reads back cleared; wave RAM survived.
        assert_eq!(apu.load_byte(Word::new(0xFF12)), Byte::zero());
        assert_eq!(apu.load_byte(Word::new(0xFF30)), Byte::new(0x42));

        // While off, register writes are ignored...
        apu.store_byte(Word::new(0xFF12), Byte::new(0xF0));
        assert_eq!(apu.load_byte(Word::new(0xFF12)), Byte::zero());

        // ...except the length counters and wave RAM.
        apu.store_byte(Word::new(0xFF20), Byte::new(0x30));
        assert_eq!(apu.ch4.length_counter, 64 - 0x30);
        apu.store_byte(Word::new(0xFF31), Byte::new(0x13));
        assert_eq!(apu.load_byte(Word::new(0xFF31)), Byte::new(0x13));
    }

    #[test]
    fn test_sample_emission_rate() {
        let mut apu = fresh_apu();
        let mut sink = CaptureSink(Vec::new());

        // 65536Hz at a 4194304Hz clock: one stereo sample (4 bytes) every 64
        // T-cycles.
        for _ in 0..64 * 100 {
            apu.step(&mut sink);
        }
        apu.flush(&mut sink);
        assert_eq!(sink.0.len(), 100 * 4);
    }

    #[test]
    fn test_triggered_square_reaches_the_stream() {
        let mut apu = fresh_apu();
        let mut sink = CaptureSink(Vec::new());

        // Scenario: NR11=0x80 (50% duty), NR12=0xF3, NR13=0x00, NR14=0x87.
        apu.store_byte(Word::new(0xFF11), Byte::new(0x80));
        apu.store_byte(Word::new(0xFF12), Byte::new(0xF3));
        apu.store_byte(Word::new(0xFF13), Byte::new(0x00));
        apu.store_byte(Word::new(0xFF14), Byte::new(0x87));

        // Run for 1/16 of a second.
        for _ in 0..CPU_CLOCK / 16 {
            apu.step(&mut sink);
        }
        apu.flush(&mut sink);

        let samples: Vec<i16> = sink.0
            .chunks(4)
            .map(|frame| i16::from_le_bytes([frame[0], frame[1]]))
            .collect();

        // The stream carries a waveform: values well above and below the
        // resting level, and sign changes at the square frequency
        // (131072 / (2048 - 0x700) = 512Hz, so 32 periods in 1/16s).
        let peak = samples.iter().map(|s| s.abs()).max().unwrap();
        assert!(peak > 2000, "peak too small: {}", peak);

        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0) != (w[1] >= 0))
            .count();
        assert!(
            crossings >= 32 && crossings <= 256,
            "unexpected zero crossing count: {}",
            crossings,
        );
    }
}
