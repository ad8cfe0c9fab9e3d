//! Finished PDU, the receiver's final verdict on a transaction.
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::pdu::tlv::{Tlv, TLV_TYPE_ENTITY_ID};
use crate::pdu::PduError;
use crate::ConditionCode;

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeliveryCode {
    Complete = 0,
    Incomplete = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FileStatus {
    DiscardedDeliberately = 0b00,
    DiscardedFilestoreRejection = 0b01,
    Retained = 0b10,
    Unreported = 0b11,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedPdu {
    pub condition: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub fault_location: Option<u64>,
}

impl FinishedPdu {
    pub fn success() -> Self {
        Self {
            condition: ConditionCode::NoError,
            delivery_code: DeliveryCode::Complete,
            file_status: FileStatus::Retained,
            fault_location: None,
        }
    }

    pub fn failure(
        condition: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) -> Self {
        Self {
            condition,
            delivery_code,
            file_status,
            fault_location: None,
        }
    }

    pub fn with_fault_location(mut self, entity_id: u64) -> Self {
        self.fault_location = Some(entity_id);
        self
    }

    pub fn write_to(&self, buf: &mut Vec<u8>, entity_id_length: usize) {
        buf.push(
            (u8::from(self.condition) << 4)
                | (u8::from(self.delivery_code) << 2)
                | u8::from(self.file_status),
        );
        if let Some(entity_id) = self.fault_location {
            Tlv::entity_id(entity_id, entity_id_length).write_to(buf);
        }
    }

    pub fn from_bytes(raw: &[u8], entity_id_length: usize) -> Result<FinishedPdu, PduError> {
        if raw.is_empty() {
            return Err(PduError::ByteConversion {
                got: 0,
                expected: 1,
            });
        }
        let condition = ConditionCode::try_from(raw[0] >> 4).map_err(|_| {
            PduError::InvalidFieldValue {
                field: "condition code",
                value: raw[0] >> 4,
            }
        })?;
        let delivery_code = DeliveryCode::try_from((raw[0] >> 2) & 0b1)
            .map_err(|_| PduError::MalformedPayload("Finished"))?;
        let file_status = FileStatus::try_from(raw[0] & 0b11)
            .map_err(|_| PduError::MalformedPayload("Finished"))?;
        let mut fault_location = None;
        let mut pos = 1;
        while pos < raw.len() {
            let (tlv, consumed) = Tlv::from_bytes(&raw[pos..])?;
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
            pos += consumed;
        }
        Ok(FinishedPdu {
            condition,
            delivery_code,
            file_status,
            fault_location,
        })
    }
}
