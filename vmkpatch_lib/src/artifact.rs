//! The `K.B00` boot module: a single gzip member holding the patched
//! vmkernel.
//!
//! The header carries no file name and a zero modification time, and the
//! compression level is fixed, so the same image always packages to the
//! same bytes.

use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
};

use flate2::{read::GzDecoder, Compression, GzBuilder};
use log::info;

use crate::Result;

pub fn package(image: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(image.len() / 2), Compression::best());
    encoder.write_all(image)?;
    encoder.finish()
}

pub fn unpack(artifact: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(artifact);
    let mut image = Vec::new();
    decoder.read_to_end(&mut image)?;
    Ok(image)
}

/// Packages the patched image at `patched_image` into `artifact`.
pub fn write_artifact(patched_image: &Path, artifact: &Path) -> Result<()> {
    let image = fs::read(patched_image)?;
    let packaged = package(&image)?;
    fs::write(artifact, &packaged)?;
    info!(
        "packaged {} bytes into {} bytes at {}",
        image.len(),
        packaged.len(),
        artifact.display()
    );
    Ok(())
}
