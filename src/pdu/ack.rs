//! ACK PDU, acknowledging an EOF or Finished directive.
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::pdu::{DirectiveType, PduError};
use crate::ConditionCode;

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TransactionStatus {
    Undefined = 0b00,
    Active = 0b01,
    Terminated = 0b10,
    Unrecognized = 0b11,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPdu {
    /// The directive being acknowledged; only EOF and Finished are ackable.
    pub acked_directive: DirectiveType,
    /// The condition code carried by the acknowledged directive.
    pub condition: ConditionCode,
    pub transaction_status: TransactionStatus,
}

impl AckPdu {
    pub fn for_eof(condition: ConditionCode) -> Self {
        Self {
            acked_directive: DirectiveType::Eof,
            condition,
            transaction_status: TransactionStatus::Active,
        }
    }

    pub fn for_finished(condition: ConditionCode, transaction_status: TransactionStatus) -> Self {
        Self {
            acked_directive: DirectiveType::Finished,
            condition,
            transaction_status,
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        // The directive subtype is 1 when acknowledging Finished, 0 otherwise.
        let subtype = (self.acked_directive == DirectiveType::Finished) as u8;
        buf.push((u8::from(self.acked_directive) << 4) | subtype);
        buf.push((u8::from(self.condition) << 4) | u8::from(self.transaction_status));
    }

    pub fn from_bytes(raw: &[u8]) -> Result<AckPdu, PduError> {
        if raw.len() < 2 {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: 2,
            });
        }
        let acked_directive = DirectiveType::try_from(raw[0] >> 4)
            .map_err(|_| PduError::InvalidFieldValue {
                field: "acknowledged directive",
                value: raw[0] >> 4,
            })?;
        if !matches!(
            acked_directive,
            DirectiveType::Eof | DirectiveType::Finished
        ) {
            return Err(PduError::InvalidFieldValue {
                field: "acknowledged directive",
                value: raw[0] >> 4,
            });
        }
        let condition = ConditionCode::try_from(raw[1] >> 4).map_err(|_| {
            PduError::InvalidFieldValue {
                field: "condition code",
                value: raw[1] >> 4,
            }
        })?;
        // Conversion of a 2-bit field cannot fail.
        let transaction_status = TransactionStatus::try_from(raw[1] & 0b11)
            .map_err(|_| PduError::MalformedPayload("ACK"))?;
        Ok(AckPdu {
            acked_directive,
            condition,
            transaction_status,
        })
    }
}
