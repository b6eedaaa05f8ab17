//! Patches the ESXi-Arm vmkernel so CPUs reporting unexpected ID register
//! values are not rejected by `CPUID_Save`, and packages the result as a
//! reproducible `K.B00` boot module.

use std::{fmt, io};

pub mod artifact;
pub mod boot_log;
pub mod engine;
pub mod layout;
pub mod patch_descriptor;

pub use engine::{apply_all, patch_image, plan_image, PatchOutcome, PatchReport};
pub use layout::{Layout, ESXI8_TEXT_LAYOUT};
pub use patch_descriptor::{PatchDescriptor, AARCH64_NOP, ESXI8_CPUID_PATCHES, INSTRUCTION_WIDTH};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The patch table and the layout disagree with the image. This means
    /// the wrong image or the wrong table was supplied.
    #[error(
        "configuration error: {address:#x} maps to offset {offset} which is outside the image ({image_len} bytes)"
    )]
    OffsetOutOfRange {
        address: u64,
        /// Signed because an address below the layout base maps before the
        /// start of the file.
        offset: i128,
        image_len: usize,
    },
    /// The bytes at a target address are neither a recognised original
    /// instruction nor the replacement.
    #[error(
        "Unexpected instruction bytes at {address:#x} ({offset:#x}): {} (expected first byte in {})",
        Hex(.found),
        PrefixSet(.expected_prefixes)
    )]
    IntegrityViolation {
        address: u64,
        offset: usize,
        expected_prefixes: &'static [u8],
        found: [u8; INSTRUCTION_WIDTH],
    },
    #[error("configuration error: {0}")]
    InvalidLayout(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to parse ELF image: {0}")]
    Elf(#[from] goblin::error::Error),
}

/// Lower case hex without separators, e.g. `1f2003d5`.
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

struct PrefixSet<'a>(&'a [u8]);

impl fmt::Display for PrefixSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:#04x}", byte)?;
        }
        f.write_str("}")
    }
}
