//! Metadata PDU, the first PDU of a transaction. Announces file names, size, checksum type
//! and the closure request flag, plus optional TLV messages.
use crate::pdu::tlv::{read_lv, write_lv, ReservedMessage, Tlv};
use crate::pdu::PduError;

/// The only checksum algorithm this implementation supports.
pub const CHECKSUM_TYPE_MODULAR: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPdu {
    pub closure_requested: bool,
    /// Checksum algorithm identifier. Anything other than [CHECKSUM_TYPE_MODULAR] is decoded
    /// but rejected by the receiving state machine.
    pub checksum_type: u8,
    pub file_size: u32,
    pub source_file_name: String,
    pub dest_file_name: String,
    pub options: Vec<Tlv>,
}

impl MetadataPdu {
    pub fn new(
        closure_requested: bool,
        file_size: u32,
        source_file_name: String,
        dest_file_name: String,
    ) -> Self {
        Self {
            closure_requested,
            checksum_type: CHECKSUM_TYPE_MODULAR,
            file_size,
            source_file_name,
            dest_file_name,
            options: Vec::new(),
        }
    }

    /// The originating transaction ID option, if present.
    pub fn originating_transaction_id(&self) -> Option<crate::TransactionId> {
        self.options.iter().find_map(|tlv| {
            match ReservedMessage::from_tlv(tlv) {
                Some(ReservedMessage::OriginatingTransactionId(id)) => Some(id),
                _ => None,
            }
        })
    }

    /// The directory listing request option, if present.
    pub fn directory_listing_request(&self) -> Option<(String, String)> {
        self.options.iter().find_map(|tlv| {
            match ReservedMessage::from_tlv(tlv) {
                Some(ReservedMessage::DirectoryListingRequest {
                    directory_name,
                    listing_file_name,
                }) => Some((directory_name, listing_file_name)),
                _ => None,
            }
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(((self.closure_requested as u8) << 6) | (self.checksum_type & 0x0F));
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        write_lv(buf, &self.source_file_name);
        write_lv(buf, &self.dest_file_name);
        for option in &self.options {
            option.write_to(buf);
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetadataPdu, PduError> {
        if raw.len() < 5 {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: 5,
            });
        }
        let closure_requested = (raw[0] >> 6) & 0b1 == 1;
        let checksum_type = raw[0] & 0x0F;
        let file_size = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        let mut pos = 5;
        let source_file_name = read_lv(raw, &mut pos)?;
        let dest_file_name = read_lv(raw, &mut pos)?;
        let mut options = Vec::new();
        while pos < raw.len() {
            let (tlv, consumed) = Tlv::from_bytes(&raw[pos..])?;
            options.push(tlv);
            pos += consumed;
        }
        Ok(MetadataPdu {
            closure_requested,
            checksum_type,
            file_size,
            source_file_name,
            dest_file_name,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionId;

    #[test]
    fn round_trip_with_options() {
        let mut pdu = MetadataPdu::new(
            true,
            1024,
            "a.bin".to_string(),
            "/download/a.bin".to_string(),
        );
        pdu.options
            .push(ReservedMessage::OriginatingTransactionId(TransactionId::new(2, 9)).to_tlv(2, 4));
        let mut buf = Vec::new();
        pdu.write_to(&mut buf);
        let parsed = MetadataPdu::from_bytes(&buf).unwrap();
        assert_eq!(parsed, pdu);
        assert_eq!(
            parsed.originating_transaction_id(),
            Some(TransactionId::new(2, 9))
        );
        assert_eq!(parsed.directory_listing_request(), None);
    }

    #[test]
    fn flags_byte_layout() {
        let pdu = MetadataPdu::new(true, 0, String::new(), String::new());
        let mut buf = Vec::new();
        pdu.write_to(&mut buf);
        assert_eq!(buf[0], 0b0100_0000);
        let mut pdu = pdu;
        pdu.closure_requested = false;
        pdu.checksum_type = 0x0B;
        buf.clear();
        pdu.write_to(&mut buf);
        assert_eq!(buf[0], 0x0B);
    }

    #[test]
    fn truncated_file_names_are_rejected() {
        let pdu = MetadataPdu::new(false, 10, "source".to_string(), "dest".to_string());
        let mut buf = Vec::new();
        pdu.write_to(&mut buf);
        assert!(MetadataPdu::from_bytes(&buf[..8]).is_err());
    }
}
