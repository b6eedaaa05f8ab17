/// Width of a single AArch64 instruction.
pub const INSTRUCTION_WIDTH: usize = 4;

/// AArch64 `nop`.
pub const AARCH64_NOP: [u8; INSTRUCTION_WIDTH] = [0x1f, 0x20, 0x03, 0xd5];

/// The conditional branches in `CPUID_Save` that jump to the error return
/// when an ID register holds a value the kernel does not recognise.
pub const ESXI8_CPUID_PATCHES: &[PatchDescriptor] = &[
    PatchDescriptor {
        address: 0x4200_0009_963c,
        accepted_original_prefixes: &[0xc0, 0xe0],
        replacement: AARCH64_NOP,
        description: "Skip CTR_EL0 format rejection",
    },
    PatchDescriptor {
        address: 0x4200_0009_9690,
        accepted_original_prefixes: &[0xc0, 0xe0],
        replacement: AARCH64_NOP,
        description: "Skip ID_AA64PFR0_EL1 rejection",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Replaces the instruction at a known virtual address.
pub struct PatchDescriptor {
    /// The virtual address of the instruction to replace.
    pub address: u64,
    /// First bytes an unpatched instruction may start with. This is only a
    /// coarse check of the instruction class, but it is enough to refuse an
    /// image where the address holds something else entirely.
    pub accepted_original_prefixes: &'static [u8],
    pub replacement: [u8; INSTRUCTION_WIDTH],
    pub description: &'static str,
}

impl PatchDescriptor {
    pub fn is_applied(&self, window: &[u8]) -> bool {
        window == self.replacement
    }

    pub fn accepts_original(&self, window: &[u8]) -> bool {
        window
            .first()
            .map_or(false, |byte| self.accepted_original_prefixes.contains(byte))
    }
}
