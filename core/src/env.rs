//! Narrow interfaces to the host environment.
//!
//! The core never talks to a window, a sound device or the file system. The
//! host reads the finished frame buffer from the PPU and hands the APU an
//! [`AudioSink`] to write PCM data into. Everything else (input, ROM bytes,
//! battery RAM persistence) goes through plain methods on the emulator.

/// A sink for the APU's output: 16-bit signed little-endian PCM, two
/// channels, at the sample rate the APU was configured with.
///
/// The `write` call is allowed to block until the device has room. It is only
/// invoked from the APU's flush routine, never from the hot per-cycle path.
pub trait AudioSink {
    /// Returns how many bytes the sink can currently accept without dropping.
    /// Sinks without a meaningful limit can return `usize::MAX`.
    fn capacity(&self) -> usize;

    /// Writes PCM bytes to the device. May block until the device buffer has
    /// room for all of `bytes`.
    fn write(&mut self, bytes: &[u8]);
}

/// An [`AudioSink`] that swallows everything. Used when no sound device is
/// available so the emulator can keep running silently.
pub struct NullSink;

impl AudioSink for NullSink {
    fn capacity(&self) -> usize {
        usize::MAX
    }

    fn write(&mut self, _: &[u8]) {}
}
