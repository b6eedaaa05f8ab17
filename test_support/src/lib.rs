//! Fixtures shared by the tests of the vmkpatch crates.
//!
//! Nothing here depends on `vmkpatch_lib`, so offsets of the shipped patch
//! table are repeated below.

/// File offsets of the two `CPUID_Save` branches in an ESXi-Arm 8.0 vmkernel.
pub const ESXI8_CTR_EL0_OFFSET: usize = 0x31_963c;
pub const ESXI8_ID_AA64PFR0_OFFSET: usize = 0x31_9690;
/// Large enough to hold both branches, small enough to keep tests quick.
pub const ESXI8_IMAGE_LEN: usize = 0x31_a000;

/// `b.eq`-class branch as found in an unpatched vmkernel.
pub const BRANCH_C0: [u8; 4] = [0xc0, 0x00, 0x00, 0x54];
/// `br x0`-class word with an accepted leading byte.
pub const BRANCH_E0: [u8; 4] = [0xe0, 0x03, 0x1f, 0xd6];
/// A word whose leading byte is not an accepted original.
pub const UNRELATED_90: [u8; 4] = [0x90, 0x03, 0x1f, 0xd6];
pub const NOP: [u8; 4] = [0x1f, 0x20, 0x03, 0xd5];

/// Builds an image of `len` bytes of filler with `windows` written at their
/// offsets. The filler never contains a NOP so stray matches cannot happen.
pub fn image_with_windows(len: usize, windows: &[(usize, [u8; 4])]) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i % 0x1f) as u8).collect();
    for (offset, bytes) in windows {
        image[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    }
    image
}

/// A synthetic ESXi-Arm 8.0 vmkernel holding `ctr_el0` and `id_aa64pfr0` at
/// the two branch offsets.
pub fn esxi8_vmkernel(ctr_el0: [u8; 4], id_aa64pfr0: [u8; 4]) -> Vec<u8> {
    image_with_windows(
        ESXI8_IMAGE_LEN,
        &[
            (ESXI8_CTR_EL0_OFFSET, ctr_el0),
            (ESXI8_ID_AA64PFR0_OFFSET, id_aa64pfr0),
        ],
    )
}

pub struct ElfSegment {
    pub executable: bool,
    pub offset: u64,
    pub vaddr: u64,
    pub size: u64,
}

const ELF_HEADER_SIZE: usize = 64;
const PROGRAM_HEADER_SIZE: usize = 56;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_R: u32 = 4;
const EM_AARCH64: u16 = 183;

/// Builds a little endian ELF64 executable with one `PT_LOAD` program header
/// per segment and no section headers.
pub fn minimal_elf(segments: &[ElfSegment]) -> Vec<u8> {
    let headers_end = ELF_HEADER_SIZE + PROGRAM_HEADER_SIZE * segments.len();
    let len = segments
        .iter()
        .map(|segment| (segment.offset + segment.size) as usize)
        .fold(headers_end, usize::max);
    let mut image = vec![0u8; len];

    image[..4].copy_from_slice(b"\x7fELF");
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // ELFDATA2LSB
    image[6] = 1; // EV_CURRENT
    put_u16(&mut image, 16, 2); // ET_EXEC
    put_u16(&mut image, 18, EM_AARCH64);
    put_u32(&mut image, 20, 1);
    put_u64(&mut image, 24, segments.first().map_or(0, |segment| segment.vaddr));
    put_u64(&mut image, 32, ELF_HEADER_SIZE as u64);
    put_u16(&mut image, 52, ELF_HEADER_SIZE as u16);
    put_u16(&mut image, 54, PROGRAM_HEADER_SIZE as u16);
    put_u16(&mut image, 56, segments.len() as u16);
    put_u16(&mut image, 58, 64);

    for (index, segment) in segments.iter().enumerate() {
        let at = ELF_HEADER_SIZE + index * PROGRAM_HEADER_SIZE;
        let flags = if segment.executable { PF_R | PF_X } else { PF_R };
        put_u32(&mut image, at, PT_LOAD);
        put_u32(&mut image, at + 4, flags);
        put_u64(&mut image, at + 8, segment.offset);
        put_u64(&mut image, at + 16, segment.vaddr);
        put_u64(&mut image, at + 24, segment.vaddr);
        put_u64(&mut image, at + 32, segment.size);
        put_u64(&mut image, at + 40, segment.size);
        put_u64(&mut image, at + 48, 0x1000);
    }

    image
}

fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(image: &mut [u8], at: usize, value: u64) {
    image[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Serial console capture of a successful boot through the generic UEFI
/// boot entry, with the colour codes and carriage returns a real console
/// produces.
pub const BOOT_LOG_PASS: &str = concat!(
    "\x1b[2J\x1b[01;01HBdsDxe: loading Boot0001 \"UEFI Misc Device\"\r\n",
    "BdsDxe: starting Boot0001 \"UEFI Misc Device\"\r\n",
    "\x1b]0;esxi\x07Loading /k.b00\r\n",
    "\x1b[1;32mStarting VMKernel\x1b[0m\r\n",
    "cpu0:1)Boot complete (2/2)\r\n",
    "Starting service DCUI\r\n",
);

/// As [`BOOT_LOG_PASS`] but booted through the VMware ESXi boot entry.
pub const BOOT_LOG_PASS_STRONG: &str = concat!(
    "BdsDxe: loading Boot0003 \"VMware ESXi\" from HD(1,GPT)\r\n",
    "BdsDxe: starting Boot0003 \"VMware ESXi\" from HD(1,GPT)\r\n",
    "Starting VMKernel\r\n",
    "Boot complete (2/2)\r\n",
    "To manage this host, go to: https://192.168.1.10/\r\n",
);

/// The unpatched kernel rejecting the CPU before the boot completes.
pub const BOOT_LOG_CPUID_FAILURE: &str = concat!(
    "BdsDxe: starting Boot0001 \"UEFI Misc Device\"\r\n",
    "Starting VMKernel\r\n",
    "cpu0:1)CPU identification failed.\r\n",
);

/// A booted system that later panicked in the ITS driver.
pub const BOOT_LOG_ITS_PANIC: &str = concat!(
    "BdsDxe: starting Boot0001 \"UEFI Misc Device\"\r\n",
    "Starting VMKernel\r\n",
    "Boot complete (2/2)\r\n",
    "Starting service DCUI\r\n",
    "cpu2:1)@BlueScreen: VERIFY bora/vmkernel/arm64/its.c:2934\r\n",
    "Module(s) involved in panic: [vmkernel]\r\n",
);

/// A completed boot that logged a generic, non fatal VERIFY message.
pub const BOOT_LOG_VERIFY_ONLY: &str = concat!(
    "BdsDxe: starting Boot0001 \"UEFI Misc Device\"\r\n",
    "Starting VMKernel\r\n",
    "cpu1:1)WARNING: VERIFY failed in timer calibration, continuing\r\n",
    "Boot complete (2/2)\r\n",
    "Starting service DCUI\r\n",
);
