//! Error types surfaced at the host boundary.
//!
//! Inside the core, conditions with defined hardware behavior (reads from
//! locked VRAM, disabled RAM, out-of-range banks, ...) are not errors: they
//! return 0xFF, drop the write or wrap the index. Only things the host has to
//! react to are represented here.

use thiserror::Error;


/// Errors that can occur while parsing and loading a ROM image.
#[derive(Debug, Error)]
pub enum RomError {
    /// The ROM image is shorter than the cartridge header (0x150 bytes).
    #[error("ROM image is too short ({len} bytes): no full cartridge header")]
    TooShort { len: usize },

    /// The ROM size byte at 0x0148 holds an unknown code.
    #[error("invalid ROM size code 0x{0:02x} in cartridge header")]
    InvalidRomSize(u8),

    /// The RAM size byte at 0x0149 holds an unknown code.
    #[error("invalid RAM size code 0x{0:02x} in cartridge header")]
    InvalidRamSize(u8),
}

/// Errors that can occur while loading a save state. The emulator state is
/// unchanged when any of these is returned.
#[derive(Debug, Error)]
pub enum SaveStateError {
    /// The blob does not start with the save state magic word.
    #[error("save state magic mismatch")]
    BadMagic,

    /// The blob was written by an unknown format version.
    #[error("unsupported save state version {0}")]
    UnsupportedVersion(u32),

    /// The blob ended in the middle of a section.
    #[error("save state is truncated")]
    Truncated,

    /// The blob belongs to a different cartridge (RAM image size mismatch).
    #[error("save state does not match the loaded cartridge")]
    CartridgeMismatch,
}

/// Returned when the host could not set up a real sound device. The emulator
/// keeps running with a [`NullSink`][crate::env::NullSink] in that case.
#[derive(Debug, Error)]
#[error("audio device unavailable: {0}")]
pub struct AudioError(pub String);
