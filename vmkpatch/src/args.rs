use std::path::PathBuf;

#[derive(clap::Parser)]
#[clap(about = "Patch the ESXi-Arm 8.0 vmkernel CPUID rejection branches")]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
    /// Log what the patcher is doing.
    #[clap(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// NOP the CPUID_Save rejection branches and write K.B00.
    Patch {
        #[clap(long = "input-vmkernel")]
        input_vmkernel: PathBuf,
        /// Required unless --dry-run is given.
        #[clap(long = "output-vmkernel")]
        output_vmkernel: Option<PathBuf>,
        /// Required unless --dry-run is given.
        #[clap(long = "output-kb00")]
        output_kb00: Option<PathBuf>,
        /// Report what would be patched without writing anything.
        #[clap(long = "dry-run")]
        dry_run: bool,
        /// Take the text layout from the image's executable ELF segment.
        #[clap(long = "layout-from-elf")]
        layout_from_elf: bool,
    },
    /// Validate a serial console log captured while booting the patched image.
    CheckLog {
        log_path: PathBuf,
        /// Do not fail on a generic VERIFY hit unless panic-specific
        /// signatures are present.
        #[clap(long = "allow-verify-only")]
        allow_verify_only: bool,
    },
}
