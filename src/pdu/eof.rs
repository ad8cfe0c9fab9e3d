//! EOF PDU, sent by the source once all file data went out (or to signal cancellation).
//! Carries the condition code, the file checksum and the file size; on non-nominal
//! conditions a fault location TLV names the entity that declared the fault.
use crate::pdu::tlv::{Tlv, TLV_TYPE_ENTITY_ID};
use crate::pdu::PduError;
use crate::ConditionCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EofPdu {
    pub condition: ConditionCode,
    pub checksum: u32,
    pub file_size: u32,
    pub fault_location: Option<u64>,
}

impl EofPdu {
    pub fn new(condition: ConditionCode, checksum: u32, file_size: u32) -> Self {
        Self {
            condition,
            checksum,
            file_size,
            fault_location: None,
        }
    }

    pub fn with_fault_location(mut self, entity_id: u64) -> Self {
        self.fault_location = Some(entity_id);
        self
    }

    pub fn write_to(&self, buf: &mut Vec<u8>, entity_id_length: usize) {
        buf.push(u8::from(self.condition) << 4);
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        if let Some(entity_id) = self.fault_location {
            Tlv::entity_id(entity_id, entity_id_length).write_to(buf);
        }
    }

    pub fn from_bytes(raw: &[u8], entity_id_length: usize) -> Result<EofPdu, PduError> {
        if raw.len() < 9 {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: 9,
            });
        }
        let condition = ConditionCode::try_from(raw[0] >> 4).map_err(|_| {
            PduError::InvalidFieldValue {
                field: "condition code",
                value: raw[0] >> 4,
            }
        })?;
        let checksum = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        let file_size = u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]);
        let mut fault_location = None;
        if raw.len() > 9 {
            let (tlv, _) = Tlv::from_bytes(&raw[9..])?;
            if tlv.tlv_type == TLV_TYPE_ENTITY_ID {
                // The header fixes the entity ID width for the whole transaction.
                if tlv.value.len() != entity_id_length {
                    return Err(PduError::InvalidFieldValue {
                        field: "fault location length",
                        value: tlv.value.len() as u8,
                    });
                }
                fault_location = tlv.as_entity_id();
            }
        }
        Ok(EofPdu {
            condition,
            checksum,
            file_size,
            fault_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_round_trip() {
        let pdu = EofPdu::new(ConditionCode::NoError, 0xCAFEBABE, 4096);
        let mut buf = Vec::new();
        pdu.write_to(&mut buf, 2);
        assert_eq!(buf.len(), 9);
        assert_eq!(buf[0], 0);
        assert_eq!(EofPdu::from_bytes(&buf, 2).unwrap(), pdu);
    }

    #[test]
    fn cancel_eof_carries_fault_location() {
        let pdu =
            EofPdu::new(ConditionCode::CancelRequestReceived, 0, 100).with_fault_location(23);
        let mut buf = Vec::new();
        pdu.write_to(&mut buf, 2);
        assert_eq!(buf[0], 0b1111_0000);
        let parsed = EofPdu::from_bytes(&buf, 2).unwrap();
        assert_eq!(parsed.condition, ConditionCode::CancelRequestReceived);
        assert_eq!(parsed.fault_location, Some(23));
    }

    #[test]
    fn fault_location_width_must_match_the_header() {
        let pdu =
            EofPdu::new(ConditionCode::CancelRequestReceived, 0, 0).with_fault_location(23);
        let mut buf = Vec::new();
        pdu.write_to(&mut buf, 4);
        assert!(matches!(
            EofPdu::from_bytes(&buf, 2),
            Err(PduError::InvalidFieldValue { .. })
        ));
        assert_eq!(EofPdu::from_bytes(&buf, 4).unwrap().fault_location, Some(23));
    }

    #[test]
    fn reserved_condition_code_is_rejected() {
        let mut buf = Vec::new();
        EofPdu::new(ConditionCode::NoError, 0, 0).write_to(&mut buf, 2);
        buf[0] = 0b1100 << 4;
        assert!(matches!(
            EofPdu::from_bytes(&buf, 2),
            Err(PduError::InvalidFieldValue { .. })
        ));
    }
}
