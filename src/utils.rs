//! Utility functions

use crate::error::{Result, VolumeError};

/// Join container paths, normalizing separators. The container root is `""`.
pub fn join_path(base: &str, child: &str) -> String {
    let base = normalize_path(base);
    let child = normalize_path(child);
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child,
        (_, true) => base,
        _ => format!("{base}/{child}"),
    }
}

/// Strip leading/trailing and repeated slashes
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative key of a block inside its dataset directory: `"i/j/k"`
pub fn block_path(position: &[u64]) -> String {
    position
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Read a big-endian `u16` at `offset`
pub fn read_u16_be(bytes: &[u8], offset: usize) -> Result<u16> {
    bytes
        .get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_be_bytes)
        .ok_or_else(|| truncated(offset))
}

/// Read a big-endian `u32` at `offset`
pub fn read_u32_be(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| truncated(offset))
}

/// Read a big-endian `u64` at `offset`
pub fn read_u64_be(bytes: &[u8], offset: usize) -> Result<u64> {
    bytes
        .get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| truncated(offset))
}

fn truncated(offset: usize) -> VolumeError {
    VolumeError::InvalidBlock(format!("block truncated at byte {offset}"))
}

/// Byte count with binary units, e.g. `1.5 KiB`
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    let exponent = (bytes.checked_ilog2().unwrap_or(0) / 10) as usize;
    if exponent == 0 {
        return format!("{bytes} B");
    }
    let exponent = exponent.min(UNITS.len());
    let scaled = bytes as f64 / (1u64 << (10 * exponent)) as f64;
    format!("{scaled:.1} {}", UNITS[exponent - 1])
}
