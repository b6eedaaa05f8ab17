use std::ops::Range;

use goblin::elf::{
    program_header::{PF_X, PT_LOAD},
    Elf,
};
use log::debug;

use crate::{Error, Result, INSTRUCTION_WIDTH};

/// Layout of the vmkernel `.text` region shipped with ESXi-Arm 8.0.
pub const ESXI8_TEXT_LAYOUT: Layout = Layout {
    va_base: 0x4200_0000_0000,
    file_offset_base: 0x28_0000,
};

/// A linear mapping between the virtual addresses an image executes at and
/// byte offsets in the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Virtual address the mapped region starts at.
    pub va_base: u64,
    /// File offset holding the byte mapped at `va_base`.
    pub file_offset_base: u64,
}

impl Layout {
    /// Returns the file offset for `va`, or `None` if it would land before
    /// the start of the file.
    pub fn translate(&self, va: u64) -> Option<u64> {
        u64::try_from(self.signed_offset(va)).ok()
    }

    /// Returns the byte range of the instruction window at `va` in an image
    /// of `image_len` bytes.
    pub fn window(&self, va: u64, image_len: usize) -> Result<Range<usize>> {
        let offset = self.signed_offset(va);
        let out_of_range = || Error::OffsetOutOfRange {
            address: va,
            offset,
            image_len,
        };

        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        let end = start
            .checked_add(INSTRUCTION_WIDTH)
            .filter(|end| *end <= image_len)
            .ok_or_else(out_of_range)?;

        debug!("{:#x} -> file offset {:#x}", va, start);
        Ok(start..end)
    }

    /// Derives the layout from the executable load segment of an ELF image.
    ///
    /// The image must contain exactly one executable `PT_LOAD` segment,
    /// otherwise there is no single base pair to translate with.
    pub fn from_elf(image: &[u8]) -> Result<Self> {
        let elf = Elf::parse(image)?;

        let mut executable_segments = elf
            .program_headers
            .iter()
            .filter(|program_header| {
                program_header.p_type == PT_LOAD && program_header.p_flags & PF_X != 0
            });
        let text = executable_segments
            .next()
            .ok_or_else(|| Error::InvalidLayout("no executable PT_LOAD segment".into()))?;
        if executable_segments.next().is_some() {
            return Err(Error::InvalidLayout(
                "more than one executable PT_LOAD segment".into(),
            ));
        }

        let layout = Self {
            va_base: text.p_vaddr,
            file_offset_base: text.p_offset,
        };
        debug!(
            "derived layout from ELF: va base {:#x}, file offset {:#x}",
            layout.va_base, layout.file_offset_base
        );
        Ok(layout)
    }

    fn signed_offset(&self, va: u64) -> i128 {
        self.file_offset_base as i128 + (va as i128 - self.va_base as i128)
    }
}
