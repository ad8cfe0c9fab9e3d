//! File data PDU: a 32-bit file offset followed by the raw segment bytes.
use crate::pdu::PduError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataPdu {
    pub offset: u32,
    pub data: Vec<u8>,
}

impl FileDataPdu {
    pub fn new(offset: u32, data: Vec<u8>) -> Self {
        Self { offset, data }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.data);
    }

    pub fn from_bytes(raw: &[u8]) -> Result<FileDataPdu, PduError> {
        if raw.len() < 4 {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: 4,
            });
        }
        Ok(FileDataPdu {
            offset: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            data: raw[4..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let pdu = FileDataPdu::new(0x01020304, vec![5, 6, 7]);
        let mut buf = Vec::new();
        pdu.write_to(&mut buf);
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(FileDataPdu::from_bytes(&buf).unwrap(), pdu);
    }

    #[test]
    fn empty_segment_is_allowed() {
        // An EOF-adjacent zero-length segment is unusual but wire-legal.
        let pdu = FileDataPdu::from_bytes(&[0, 0, 0, 9]).unwrap();
        assert_eq!(pdu.offset, 9);
        assert!(pdu.data.is_empty());
        assert!(FileDataPdu::from_bytes(&[0, 0]).is_err());
    }
}
