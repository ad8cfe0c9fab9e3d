//! CFDP modular checksum.
//!
//! The file content is treated as a sequence of big-endian 32-bit words aligned to file
//! offsets, summed with wraparound. The word alignment makes the checksum independent of how
//! the file is split into segments, so partial segment checksums can be accumulated in any
//! arrival order.

/// Modular checksum of a complete file, equivalent to [checksum_segment] at offset 0.
pub fn checksum(data: &[u8]) -> u32 {
    checksum_segment(data, 0)
}

/// Modular checksum contribution of a file segment starting at the given file offset.
///
/// Each byte at file position `p` contributes its value shifted into byte `3 - p % 4` of a
/// 32-bit word. Summing the segment checksums of any partition of a file yields the checksum
/// of the whole file.
pub fn checksum_segment(data: &[u8], file_offset: u64) -> u32 {
    let mut sum: u32 = 0;
    let mut pos = file_offset;
    for &byte in data {
        let shift = 8 * (3 - (pos % 4) as u32);
        sum = sum.wrapping_add((byte as u32) << shift);
        pos += 1;
    }
    sum
}
