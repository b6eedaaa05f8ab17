use std::{fs, ops::Range, path::Path};

use log::{debug, info};

use crate::{Error, Layout, PatchDescriptor, Result, INSTRUCTION_WIDTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The replacement was already in place.
    Skipped,
    /// An accepted original was overwritten with the replacement.
    Applied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub descriptor: PatchDescriptor,
    pub offset: usize,
    /// Bytes found in the window before patching.
    pub original: [u8; INSTRUCTION_WIDTH],
    pub outcome: PatchOutcome,
}

/// Applies every descriptor of `table` to `image`, in table order.
///
/// All descriptors are checked before the first byte is written, so on
/// error `image` is left exactly as it was passed in.
pub fn apply_all(
    image: &mut [u8],
    layout: &Layout,
    table: &[PatchDescriptor],
) -> Result<Vec<PatchReport>> {
    let plan = plan(image, layout, table)?;

    for (window, report) in &plan {
        if report.outcome == PatchOutcome::Applied {
            image[window.clone()].copy_from_slice(&report.descriptor.replacement);
        }
    }

    Ok(plan.into_iter().map(|(_, report)| report).collect())
}

/// Patches the image at `src` and writes it to `dst`.
///
/// `dst` is only written once every descriptor has been applied or found
/// already applied.
pub fn patch_image(
    src: &Path,
    dst: &Path,
    layout: &Layout,
    table: &[PatchDescriptor],
) -> Result<Vec<PatchReport>> {
    let mut image = fs::read(src)?;
    let reports = apply_all(&mut image, layout, table)?;

    fs::write(dst, &image)?;
    info!("wrote {} bytes to {}", image.len(), dst.display());

    Ok(reports)
}

/// Reports what [`patch_image`] would do to the image at `src`.
pub fn plan_image(src: &Path, layout: &Layout, table: &[PatchDescriptor]) -> Result<Vec<PatchReport>> {
    let image = fs::read(src)?;
    Ok(plan(&image, layout, table)?
        .into_iter()
        .map(|(_, report)| report)
        .collect())
}

fn plan(
    image: &[u8],
    layout: &Layout,
    table: &[PatchDescriptor],
) -> Result<Vec<(Range<usize>, PatchReport)>> {
    // A table that does not fit the image is a configuration problem and is
    // reported before looking at any instruction bytes.
    let windows = table
        .iter()
        .map(|descriptor| layout.window(descriptor.address, image.len()))
        .collect::<Result<Vec<_>>>()?;

    table
        .iter()
        .zip(windows)
        .map(|(descriptor, window)| -> Result<(Range<usize>, PatchReport)> {
            let mut original = [0u8; INSTRUCTION_WIDTH];
            original.copy_from_slice(&image[window.clone()]);

            let outcome = if descriptor.is_applied(&original) {
                PatchOutcome::Skipped
            } else if descriptor.accepts_original(&original) {
                PatchOutcome::Applied
            } else {
                return Err(Error::IntegrityViolation {
                    address: descriptor.address,
                    offset: window.start,
                    expected_prefixes: descriptor.accepted_original_prefixes,
                    found: original,
                });
            };
            debug!(
                "{:#x}: {:?} ({})",
                descriptor.address, outcome, descriptor.description
            );

            let offset = window.start;
            Ok((
                window,
                PatchReport {
                    descriptor: *descriptor,
                    offset,
                    original,
                    outcome,
                },
            ))
        })
        .collect()
}
