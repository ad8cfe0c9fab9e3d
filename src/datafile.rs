//! Sparse model of a file under reception.
//!
//! Received file data segments are kept keyed by start offset. The model answers the two
//! questions the receiving state machine cares about: which byte ranges are still missing
//! (for NAK generation) and whether reception is complete, and it can assemble the final
//! content and compute its modular checksum once it is.
use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::checksum::checksum_segment;
use crate::pdu::nak::SegmentRequest;

#[derive(Debug, Default)]
pub struct DataFile {
    segments: BTreeMap<u64, Vec<u8>>,
    expected_size: Option<u64>,
}

impl DataFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected_size(size: u64) -> Self {
        Self {
            segments: BTreeMap::new(),
            expected_size: Some(size),
        }
    }

    /// Sets the total file size, normally learned from the metadata or EOF PDU.
    pub fn set_expected_size(&mut self, size: u64) {
        self.expected_size = Some(size);
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    /// Stores one received segment, trimmed to the byte ranges not already covered: bytes
    /// received earlier always win over an overlapping retransmission, keeping the stored
    /// segments disjoint. Returns whether any new bytes were stored.
    pub fn add_segment(&mut self, offset: u64, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return false;
        }
        let end = offset + data.len() as u64;
        let mut pieces: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut cursor = offset;
        // Stored segments are disjoint, so walking the ones starting before `end` in order
        // yields the uncovered sub-ranges directly.
        for (&seg_start, seg) in self.segments.range(..end) {
            let seg_end = seg_start + seg.len() as u64;
            if seg_end <= cursor {
                continue;
            }
            if seg_start > cursor {
                let lo = (cursor - offset) as usize;
                let hi = (seg_start - offset) as usize;
                pieces.push((cursor, data[lo..hi].to_vec()));
            }
            cursor = cursor.max(seg_end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            pieces.push((cursor, data[(cursor - offset) as usize..].to_vec()));
        }
        let stored = !pieces.is_empty();
        for (start, piece) in pieces {
            self.segments.insert(start, piece);
        }
        stored
    }

    /// End offset (exclusive) of the highest received byte.
    pub fn end_of_data(&self) -> u64 {
        self.segments
            .iter()
            .map(|(offset, data)| offset + data.len() as u64)
            .max()
            .unwrap_or(0)
    }

    /// Byte ranges not yet received, in ascending order. The tail gap up to the expected file
    /// size is only reported when `include_tail` is set and the size is known; before EOF
    /// arrives the highest received byte may simply be the last one sent so far.
    pub fn missing_chunks(&self, include_tail: bool) -> SmallVec<[SegmentRequest; 4]> {
        let mut chunks = SmallVec::new();
        let mut covered_until = 0;
        for (&offset, data) in &self.segments {
            if offset > covered_until {
                chunks.push(SegmentRequest::new(covered_until, offset));
            }
            covered_until = covered_until.max(offset + data.len() as u64);
        }
        if include_tail {
            if let Some(size) = self.expected_size {
                if covered_until < size {
                    chunks.push(SegmentRequest::new(covered_until, size));
                }
            }
        }
        chunks
    }

    /// True once the expected size is known and every byte up to it was received.
    pub fn is_complete(&self) -> bool {
        match self.expected_size {
            Some(size) => self.received_size() == size && self.missing_chunks(true).is_empty(),
            None => false,
        }
    }

    /// Number of bytes received. The stored segments are disjoint, so this is a plain sum.
    pub fn received_size(&self) -> u64 {
        self.segments.values().map(|data| data.len() as u64).sum()
    }

    /// Assembles the received content into a contiguous buffer of the expected size (or the
    /// highest received offset if the size is unknown), zero-filling any gaps.
    pub fn assemble(&self) -> Vec<u8> {
        let len = self.end_of_data().max(self.expected_size.unwrap_or(0)) as usize;
        let mut content = vec![0; len];
        for (&offset, data) in &self.segments {
            content[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
        content
    }

    /// Modular checksum of the received bytes, accumulated segment-wise without assembling
    /// the file. Matches the whole-file checksum once reception is complete.
    pub fn checksum(&self) -> u32 {
        self.segments.iter().fold(0u32, |sum, (&offset, data)| {
            sum.wrapping_add(checksum_segment(data, offset))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;
    use rand::seq::SliceRandom;
    use rand::Rng;

    #[test]
    fn empty_file_has_no_data_and_is_incomplete() {
        let file = DataFile::new();
        assert_eq!(file.received_size(), 0);
        assert_eq!(file.end_of_data(), 0);
        assert!(!file.is_complete());
        assert!(file.missing_chunks(false).is_empty());
    }

    #[test]
    fn retransmitted_bytes_never_replace_earlier_data() {
        let mut file = DataFile::new();
        assert!(file.add_segment(0, vec![1, 2, 3]));
        // Fully covered retransmission: nothing new to store.
        assert!(!file.add_segment(0, vec![9, 9, 9]));
        // Partial overlap: only the tail past the known bytes is kept.
        assert!(file.add_segment(1, vec![8, 8, 8, 8]));
        assert_eq!(file.received_size(), 5);
        assert_eq!(file.assemble(), vec![1, 2, 3, 8, 8]);
    }

    #[test]
    fn checksum_and_assembly_agree_on_conflicting_overlaps() {
        let mut file = DataFile::with_expected_size(12);
        file.add_segment(4, vec![7; 4]);
        file.add_segment(0, vec![1; 8]);
        file.add_segment(6, vec![9; 6]);
        assert!(file.is_complete());
        assert_eq!(file.assemble(), vec![1, 1, 1, 1, 7, 7, 7, 7, 9, 9, 9, 9]);
        assert_eq!(file.checksum(), checksum(&file.assemble()));
    }

    #[test]
    fn gaps_are_reported_in_order() {
        let mut file = DataFile::with_expected_size(100);
        file.add_segment(10, vec![0; 10]);
        file.add_segment(40, vec![0; 20]);
        let chunks = file.missing_chunks(true);
        assert_eq!(
            chunks.as_slice(),
            &[
                SegmentRequest::new(0, 10),
                SegmentRequest::new(20, 40),
                SegmentRequest::new(60, 100)
            ]
        );
        // Without the tail the trailing gap is not reported.
        let chunks = file.missing_chunks(false);
        assert_eq!(
            chunks.as_slice(),
            &[SegmentRequest::new(0, 10), SegmentRequest::new(20, 40)]
        );
    }

    #[test]
    fn overlapping_segments_counted_once() {
        let mut file = DataFile::with_expected_size(30);
        file.add_segment(0, vec![1; 20]);
        file.add_segment(10, vec![2; 20]);
        assert_eq!(file.received_size(), 30);
        assert!(file.is_complete());
        let assembled = file.assemble();
        assert_eq!(&assembled[..20], &[1; 20]);
        assert_eq!(&assembled[20..], &[2; 10]);
    }

    #[test]
    fn completion_requires_known_size() {
        let mut file = DataFile::new();
        file.add_segment(0, vec![0; 50]);
        assert!(!file.is_complete());
        file.set_expected_size(50);
        assert!(file.is_complete());
        file.set_expected_size(60);
        assert!(!file.is_complete());
    }

    #[test]
    fn segment_checksum_matches_whole_file_checksum() {
        let mut rng = rand::thread_rng();
        let content: Vec<u8> = (0..997).map(|_| rng.gen()).collect();
        let mut offsets: Vec<usize> = (0..content.len()).step_by(64).collect();
        offsets.shuffle(&mut rng);
        let mut file = DataFile::with_expected_size(content.len() as u64);
        for offset in offsets {
            let end = (offset + 64).min(content.len());
            file.add_segment(offset as u64, content[offset..end].to_vec());
        }
        assert!(file.is_complete());
        assert_eq!(file.checksum(), checksum(&content));
        assert_eq!(file.assemble(), content);
    }

    #[test]
    fn missing_chunks_complement_received_ranges() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let size = rng.gen_range(1..2000_u64);
            let mut file = DataFile::with_expected_size(size);
            let mut offset = 0;
            while offset < size {
                let len = rng.gen_range(1..=64).min(size - offset);
                if rng.gen_bool(0.6) {
                    file.add_segment(offset, vec![0xAB; len as usize]);
                }
                offset += len;
            }
            let missing: u64 = file
                .missing_chunks(true)
                .iter()
                .map(|c| c.end_offset - c.start_offset)
                .sum();
            assert_eq!(file.received_size() + missing, size);
        }
    }
}
