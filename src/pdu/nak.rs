//! NAK PDU, requesting retransmission of lost data. The scope brackets the file region the
//! request covers; each segment request is one missing byte range. The special request
//! (0, 0) asks for a metadata retransmission.
use smallvec::SmallVec;

use crate::pdu::PduError;

/// One requested byte range, end offset exclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub start_offset: u64,
    pub end_offset: u64,
}

impl SegmentRequest {
    pub fn new(start_offset: u64, end_offset: u64) -> Self {
        Self {
            start_offset,
            end_offset,
        }
    }

    /// The all-zero request which stands for the metadata PDU itself.
    pub fn is_metadata_request(&self) -> bool {
        self.start_offset == 0 && self.end_offset == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPdu {
    pub scope_start: u32,
    pub scope_end: u32,
    pub segment_requests: SmallVec<[SegmentRequest; 4]>,
}

impl NakPdu {
    pub fn new(
        scope_start: u32,
        scope_end: u32,
        segment_requests: SmallVec<[SegmentRequest; 4]>,
    ) -> Self {
        Self {
            scope_start,
            scope_end,
            segment_requests,
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.scope_start.to_be_bytes());
        buf.extend_from_slice(&self.scope_end.to_be_bytes());
        for request in &self.segment_requests {
            buf.extend_from_slice(&(request.start_offset as u32).to_be_bytes());
            buf.extend_from_slice(&(request.end_offset as u32).to_be_bytes());
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Result<NakPdu, PduError> {
        if raw.len() < 8 || (raw.len() - 8) % 8 != 0 {
            return Err(PduError::MalformedPayload("NAK"));
        }
        let scope_start = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let scope_end = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let mut segment_requests = SmallVec::new();
        for chunk in raw[8..].chunks_exact(8) {
            let start = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let end = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            segment_requests.push(SegmentRequest::new(start as u64, end as u64));
        }
        Ok(NakPdu {
            scope_start,
            scope_end,
            segment_requests,
        })
    }
}
