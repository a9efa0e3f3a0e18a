//! Depth artifact: a NumPy `.npy` (format 1.0) array of `<u2` millimetre
//! values shaped `(frames, height, width)`.

use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use crate::camera::{DepthBuffer, Dimensions};

const MAGIC: &[u8] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

/// Serialize `frames` to `path` and return the file size in bytes.
/// Every buffer must already match `dimensions`.
pub fn write_depth_stack(path: &Path, dimensions: Dimensions, frames: &[DepthBuffer]) -> Result<u64> {
    let file = File::create(path)
        .with_context(|| format!("failed to create depth file {}", path.display()))?;
    let mut out = BufWriter::new(file);

    out.write_all(&header(frames.len(), dimensions))?;
    for frame in frames {
        for value in &frame.data {
            out.write_all(&value.to_le_bytes())?;
        }
    }

    let file = out
        .into_inner()
        .map_err(|err| err.into_error())
        .with_context(|| format!("failed to flush depth file {}", path.display()))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

fn header(frames: usize, dimensions: Dimensions) -> Vec<u8> {
    let mut dict = format!(
        "{{'descr': '<u2', 'fortran_order': False, 'shape': ({}, {}, {}), }}",
        frames, dimensions.height, dimensions.width
    );
    // magic(6) + version(2) + header_len(2) + dict, terminated by '\n'
    let unpadded = MAGIC.len() + 4 + dict.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    dict.extend(std::iter::repeat(' ').take(padding));
    dict.push('\n');

    let mut header = Vec::with_capacity(MAGIC.len() + 4 + dict.len());
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&[1, 0]);
    header.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    header.extend_from_slice(dict.as_bytes());
    header
}
