//! Keep-alive PDU, reporting the receiver's reception progress in acknowledged mode.
use crate::pdu::PduError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeepAlivePdu {
    pub progress: u32,
}

impl KeepAlivePdu {
    pub fn new(progress: u32) -> Self {
        Self { progress }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.progress.to_be_bytes());
    }

    pub fn from_bytes(raw: &[u8]) -> Result<KeepAlivePdu, PduError> {
        if raw.len() < 4 {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: 4,
            });
        }
        Ok(KeepAlivePdu {
            progress: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        })
    }
}
