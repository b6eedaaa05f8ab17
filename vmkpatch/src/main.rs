use std::{fs, path::Path, process};

use clap::Parser;
use log::{debug, LevelFilter};
use vmkpatch_lib::{
    artifact::write_artifact,
    boot_log::{self, Rules},
    patch_image, plan_image, Hex, Layout, PatchOutcome, PatchReport, ESXI8_CPUID_PATCHES,
    ESXI8_TEXT_LAYOUT,
};

mod args;
use args::{Args, Command};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();

    let code = match run(args.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            EXIT_FAILURE
        }
    };
    process::exit(code);
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Patch {
            input_vmkernel,
            output_vmkernel,
            output_kb00,
            dry_run,
            layout_from_elf,
        } => {
            let layout = if layout_from_elf {
                Layout::from_elf(&fs::read(&input_vmkernel)?)?
            } else {
                ESXI8_TEXT_LAYOUT
            };
            debug!("using layout {:x?}", layout);

            if dry_run {
                for report in plan_image(&input_vmkernel, &layout, ESXI8_CPUID_PATCHES)? {
                    print_report(&report, true);
                }
                println!("Dry run: nothing written");
                return Ok(0);
            }

            match (output_vmkernel, output_kb00) {
                (Some(output_vmkernel), Some(output_kb00)) => {
                    patch(&input_vmkernel, &output_vmkernel, &output_kb00, &layout)?;
                    Ok(0)
                }
                _ => {
                    eprintln!(
                        "ERROR: --output-vmkernel and --output-kb00 are required unless --dry-run is given"
                    );
                    Ok(EXIT_USAGE)
                }
            }
        }
        Command::CheckLog {
            log_path,
            allow_verify_only,
        } => check_log(&log_path, allow_verify_only),
    }
}

fn patch(input: &Path, output_vmkernel: &Path, output_kb00: &Path, layout: &Layout) -> Result<()> {
    for report in patch_image(input, output_vmkernel, layout, ESXI8_CPUID_PATCHES)? {
        print_report(&report, false);
    }

    // The artifact is built from what landed on disk, not from memory.
    write_artifact(output_vmkernel, output_kb00)?;

    println!("Wrote patched vmkernel: {}", output_vmkernel.display());
    println!("Wrote patched K.B00:     {}", output_kb00.display());
    Ok(())
}

fn print_report(report: &PatchReport, dry_run: bool) {
    let descriptor = &report.descriptor;
    match report.outcome {
        PatchOutcome::Applied => println!(
            "{} {:#x} ({:#x}): {} -> {} [{}]",
            if dry_run { "Would patch" } else { "Patched" },
            descriptor.address,
            report.offset,
            Hex(&report.original),
            Hex(&descriptor.replacement),
            descriptor.description
        ),
        PatchOutcome::Skipped => println!(
            "Already patched {:#x} ({:#x}) [{}]",
            descriptor.address, report.offset, descriptor.description
        ),
    }
}

fn check_log(log_path: &Path, allow_verify_only: bool) -> Result<i32> {
    if !log_path.is_file() {
        eprintln!("ERROR: log file not found: {}", log_path.display());
        return Ok(EXIT_USAGE);
    }

    let text = match boot_log::read_log(log_path) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("ERROR: failed to read {}: {}", log_path.display(), err);
            return Ok(EXIT_USAGE);
        }
    };

    let verdict = Rules::esxi8().check(&text, allow_verify_only);
    print!("{}", verdict.report());
    Ok(verdict.exit_code())
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::{Path, PathBuf},
        process::Command,
    };

    use expect_test::{expect, Expect};
    use test_support::{
        esxi8_vmkernel, image_with_windows, minimal_elf, ElfSegment, BOOT_LOG_ITS_PANIC,
        BOOT_LOG_PASS, BOOT_LOG_PASS_STRONG, BOOT_LOG_VERIFY_ONLY, BRANCH_C0, BRANCH_E0, NOP,
        UNRELATED_90,
    };

    fn test_vmkpatch(dir: &Path, args: &[&str], expected: Expect) {
        cargo_build("vmkpatch");

        let output = Command::new(vmkpatch_bin())
            .current_dir(dir)
            .args(args)
            .output()
            .unwrap();

        let result = format!(
            "status code: {}\n\nstd out:\n{}\nstd err:\n{}\n",
            match output.status.code() {
                Some(c) => format!("{}", c),
                None => "None".into(),
            },
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        expected.assert_eq(&result);
    }

    fn cargo_build(bin_name: &str) {
        let status = Command::new("cargo")
            // cargo test sets the current working directory to the package
            // root. We need to go up to the workspace root because this
            // bin could be in a different package.
            .current_dir("..")
            .args(&["build", "--bin", bin_name])
            .status()
            .unwrap();

        assert!(status.success());
    }

    fn patch_args() -> Vec<&'static str> {
        vec![
            "patch",
            "--input-vmkernel",
            "vmkernel",
            "--output-vmkernel",
            "vmkernel.patched",
            "--output-kb00",
            "K.B00",
        ]
    }

    /// The binary runs inside a scratch directory, so it has to be
    /// spawned by absolute path.
    fn vmkpatch_bin() -> PathBuf {
        fs::canonicalize("../target/debug/vmkpatch").unwrap()
    }

    fn scratch_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn patches_unpatched_image() {
        let dir = scratch_dir();
        fs::write(dir.path().join("vmkernel"), esxi8_vmkernel(BRANCH_C0, BRANCH_E0)).unwrap();

        test_vmkpatch(
            dir.path(),
            &patch_args(),
            expect![[r#"
                status code: 0

                std out:
                Patched 0x42000009963c (0x31963c): c0000054 -> 1f2003d5 [Skip CTR_EL0 format rejection]
                Patched 0x420000099690 (0x319690): e0031fd6 -> 1f2003d5 [Skip ID_AA64PFR0_EL1 rejection]
                Wrote patched vmkernel: vmkernel.patched
                Wrote patched K.B00:     K.B00

                std err:

            "#]],
        );

        let patched = fs::read(dir.path().join("vmkernel.patched")).unwrap();
        assert_eq!(esxi8_vmkernel(NOP, NOP), patched);
        let packaged = fs::read(dir.path().join("K.B00")).unwrap();
        assert_eq!(patched, vmkpatch_lib::artifact::unpack(&packaged).unwrap());
    }

    #[test]
    fn reports_already_patched_image() {
        let dir = scratch_dir();
        fs::write(dir.path().join("vmkernel"), esxi8_vmkernel(NOP, BRANCH_E0)).unwrap();

        test_vmkpatch(
            dir.path(),
            &patch_args(),
            expect![[r#"
                status code: 0

                std out:
                Already patched 0x42000009963c (0x31963c) [Skip CTR_EL0 format rejection]
                Patched 0x420000099690 (0x319690): e0031fd6 -> 1f2003d5 [Skip ID_AA64PFR0_EL1 rejection]
                Wrote patched vmkernel: vmkernel.patched
                Wrote patched K.B00:     K.B00

                std err:

            "#]],
        );
    }

    #[test]
    fn artifact_is_identical_across_runs() {
        let dir = scratch_dir();
        fs::write(dir.path().join("vmkernel"), esxi8_vmkernel(BRANCH_C0, BRANCH_C0)).unwrap();

        let run = |kb00: &str| {
            let status = Command::new(vmkpatch_bin())
                .current_dir(dir.path())
                .args(&["patch", "--input-vmkernel", "vmkernel"])
                .args(&["--output-vmkernel", "vmkernel.patched", "--output-kb00", kb00])
                .status()
                .unwrap();
            assert!(status.success());
            fs::read(dir.path().join(kb00)).unwrap()
        };

        cargo_build("vmkpatch");
        let first = run("first.B00");
        let second = run("second.B00");
        assert_eq!(first, second);
    }

    #[test]
    fn refuses_unexpected_instruction() {
        let dir = scratch_dir();
        fs::write(dir.path().join("vmkernel"), esxi8_vmkernel(UNRELATED_90, BRANCH_C0)).unwrap();

        test_vmkpatch(
            dir.path(),
            &patch_args(),
            expect![[r#"
                status code: 1

                std out:

                std err:
                ERROR: Unexpected instruction bytes at 0x42000009963c (0x31963c): 90031fd6 (expected first byte in {0xc0, 0xe0})

            "#]],
        );

        assert!(!dir.path().join("vmkernel.patched").exists());
        assert!(!dir.path().join("K.B00").exists());
    }

    #[test]
    fn refuses_image_too_short_for_layout() {
        let dir = scratch_dir();
        fs::write(dir.path().join("vmkernel"), image_with_windows(0x1000, &[])).unwrap();

        test_vmkpatch(
            dir.path(),
            &patch_args(),
            expect![[r#"
                status code: 1

                std out:

                std err:
                ERROR: configuration error: 0x42000009963c maps to offset 3249724 which is outside the image (4096 bytes)

            "#]],
        );

        assert!(!dir.path().join("vmkernel.patched").exists());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let dir = scratch_dir();
        fs::write(dir.path().join("vmkernel"), esxi8_vmkernel(BRANCH_E0, NOP)).unwrap();

        test_vmkpatch(
            dir.path(),
            &["patch", "--input-vmkernel", "vmkernel", "--dry-run"],
            expect![[r#"
                status code: 0

                std out:
                Would patch 0x42000009963c (0x31963c): e0031fd6 -> 1f2003d5 [Skip CTR_EL0 format rejection]
                Already patched 0x420000099690 (0x319690) [Skip ID_AA64PFR0_EL1 rejection]
                Dry run: nothing written

                std err:

            "#]],
        );

        assert_eq!(1, fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn outputs_are_required_without_dry_run() {
        let dir = scratch_dir();
        fs::write(dir.path().join("vmkernel"), esxi8_vmkernel(BRANCH_E0, NOP)).unwrap();

        test_vmkpatch(
            dir.path(),
            &["patch", "--input-vmkernel", "vmkernel"],
            expect![[r#"
                status code: 2

                std out:

                std err:
                ERROR: --output-vmkernel and --output-kb00 are required unless --dry-run is given

            "#]],
        );
    }

    #[test]
    fn takes_layout_from_elf_segment() {
        let dir = scratch_dir();
        let mut image = minimal_elf(&[ElfSegment {
            executable: true,
            offset: 0x1000,
            vaddr: 0x4200_0000_0000,
            size: 0xa_0000,
        }]);
        image[0x9_a63c..0x9_a640].copy_from_slice(&BRANCH_C0);
        image[0x9_a690..0x9_a694].copy_from_slice(&BRANCH_C0);
        fs::write(dir.path().join("vmkernel"), &image).unwrap();

        let mut args = patch_args();
        args.push("--layout-from-elf");
        test_vmkpatch(
            dir.path(),
            &args,
            expect![[r#"
                status code: 0

                std out:
                Patched 0x42000009963c (0x9a63c): c0000054 -> 1f2003d5 [Skip CTR_EL0 format rejection]
                Patched 0x420000099690 (0x9a690): c0000054 -> 1f2003d5 [Skip ID_AA64PFR0_EL1 rejection]
                Wrote patched vmkernel: vmkernel.patched
                Wrote patched K.B00:     K.B00

                std err:

            "#]],
        );
    }

    #[test]
    fn check_log_passes_completed_boot() {
        let dir = scratch_dir();
        fs::write(dir.path().join("serial.log"), BOOT_LOG_PASS_STRONG).unwrap();

        test_vmkpatch(
            dir.path(),
            &["check-log", "serial.log"],
            expect![[r#"
                status code: 0

                std out:
                RESULT: PASS
                Markers: uefi_boot_path, vmkernel_boot, boot_complete, dcui_or_management
                Strong markers: vmware_boot_entry

                std err:

            "#]],
        );
    }

    #[test]
    fn check_log_fails_on_panic() {
        let dir = scratch_dir();
        fs::write(dir.path().join("serial.log"), BOOT_LOG_ITS_PANIC).unwrap();

        test_vmkpatch(
            dir.path(),
            &["check-log", "--allow-verify-only", "serial.log"],
            expect![[r#"
                status code: 4

                std out:
                RESULT: FAIL (panic signature detected)
                Panic markers: panic_its_2934, panic_module, kernel_verify

                std err:

            "#]],
        );
    }

    #[test]
    fn check_log_tolerates_lone_verify_when_allowed() {
        let dir = scratch_dir();
        fs::write(dir.path().join("serial.log"), BOOT_LOG_VERIFY_ONLY).unwrap();

        test_vmkpatch(
            dir.path(),
            &["check-log", "--allow-verify-only", "serial.log"],
            expect![[r#"
                status code: 0

                std out:
                RESULT: PASS
                Markers: uefi_boot_path, vmkernel_boot, boot_complete, dcui_or_management
                Strong markers: none (acceptable; firmware may boot via generic UEFI entry)

                std err:

            "#]],
        );
    }

    #[test]
    fn check_log_fails_on_missing_markers() {
        let dir = scratch_dir();
        let truncated: String = BOOT_LOG_PASS.lines().take(3).collect::<Vec<_>>().join("\n");
        fs::write(dir.path().join("serial.log"), truncated).unwrap();

        test_vmkpatch(
            dir.path(),
            &["check-log", "serial.log"],
            expect![[r#"
                status code: 3

                std out:
                RESULT: FAIL (missing required boot markers)
                Missing: vmkernel_boot, boot_complete, dcui_or_management

                std err:

            "#]],
        );
    }

    #[test]
    fn check_log_reports_missing_file() {
        let dir = scratch_dir();

        test_vmkpatch(
            dir.path(),
            &["check-log", "absent.log"],
            expect![[r#"
                status code: 2

                std out:

                std err:
                ERROR: log file not found: absent.log

            "#]],
        );
    }
}
