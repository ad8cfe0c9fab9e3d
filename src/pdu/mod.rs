//! Binary codec for the CFDP PDU format.
//!
//! Every PDU consists of a fixed header with variable-width entity ID and sequence number
//! fields, followed either by raw file data or by a file directive payload introduced by a
//! directive code byte. All multi-byte integers are big-endian. When the header CRC flag is
//! set a CRC-16/IBM-3740 trailer covers the entire PDU and is included in the declared data
//! field length.
use core::fmt;

use crc::{Crc, CRC_16_IBM_3740};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{TransactionId, TransmissionMode};

pub mod ack;
pub mod eof;
pub mod file_data;
pub mod finished;
pub mod keep_alive;
pub mod metadata;
pub mod nak;
pub mod tlv;

pub use ack::AckPdu;
pub use eof::EofPdu;
pub use file_data::FileDataPdu;
pub use finished::FinishedPdu;
pub use keep_alive::KeepAlivePdu;
pub use metadata::MetadataPdu;
pub use nak::{NakPdu, SegmentRequest};
pub use tlv::{ReservedMessage, Tlv};

pub const CFDP_VERSION_2: u8 = 0b001;
/// Fixed header bytes before the variable-width ID fields.
pub const FIXED_HEADER_LEN: usize = 4;

const CRC_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// File directive codes, chapter 5.4 of the CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DirectiveType {
    Eof = 0x04,
    Finished = 0x05,
    Ack = 0x06,
    Metadata = 0x07,
    Nak = 0x08,
    KeepAlive = 0x0C,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Direction {
    TowardsReceiver = 0,
    TowardsSender = 1,
}

/// Decode failure reasons.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PduError {
    #[error("byte stream too short: got {got} bytes, expected at least {expected}")]
    ByteConversion { got: usize, expected: usize },
    #[error("unsupported CFDP version {0}, only version {CFDP_VERSION_2} is supported")]
    InvalidVersion(u8),
    #[error("declared data field length {declared} exceeds the {available} available bytes")]
    DataLengthMismatch { declared: usize, available: usize },
    #[error("unknown or unsupported file directive code {0:#04x}")]
    UnknownDirective(u8),
    #[error("CRC failure: computed {computed:#06x}, trailer holds {stored:#06x}")]
    CrcFailure { computed: u16, stored: u16 },
    #[error("invalid {field} value {value:#04x}")]
    InvalidFieldValue { field: &'static str, value: u8 },
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
}

fn hex_string(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A [PduError] together with the raw bytes that failed to decode, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}; raw PDU 0x{}", hex_string(.raw))]
pub struct DecodeError {
    pub reason: PduError,
    pub raw: Vec<u8>,
}

/// The fixed PDU header. The PDU type bit is derived from the payload on encoding and is not
/// stored here; everything else is carried verbatim.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub direction: Direction,
    pub transmission_mode: TransmissionMode,
    pub crc_flag: bool,
    pub large_file: bool,
    /// Byte width of both entity ID fields, 1 to 8.
    pub entity_id_length: usize,
    /// Byte width of the sequence number field, 1 to 8.
    pub seq_num_length: usize,
    pub source_id: u64,
    pub seq_num: u64,
    pub dest_id: u64,
}

impl PduHeader {
    pub fn len_written(&self) -> usize {
        FIXED_HEADER_LEN + 2 * self.entity_id_length + self.seq_num_length
    }

    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source_id, self.seq_num)
    }

    fn write_to(&self, buf: &mut Vec<u8>, pdu_type_file_data: bool, data_field_len: u16) {
        let first = (CFDP_VERSION_2 << 5)
            | ((pdu_type_file_data as u8) << 4)
            | ((self.direction as u8) << 3)
            | ((self.transmission_mode as u8) << 2)
            | ((self.crc_flag as u8) << 1)
            | (self.large_file as u8);
        buf.push(first);
        buf.extend_from_slice(&data_field_len.to_be_bytes());
        let fourth =
            (((self.entity_id_length - 1) as u8) << 4) | ((self.seq_num_length - 1) as u8);
        buf.push(fourth);
        write_be(buf, self.source_id, self.entity_id_length);
        write_be(buf, self.seq_num, self.seq_num_length);
        write_be(buf, self.dest_id, self.entity_id_length);
    }

    /// Parses a header, returning it together with the PDU type bit, the header length and
    /// the declared data field length.
    fn from_bytes(raw: &[u8]) -> Result<(PduHeader, bool, usize, usize), PduError> {
        if raw.len() < FIXED_HEADER_LEN {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: FIXED_HEADER_LEN,
            });
        }
        let version = raw[0] >> 5;
        if version != CFDP_VERSION_2 {
            return Err(PduError::InvalidVersion(version));
        }
        let pdu_type_file_data = (raw[0] >> 4) & 0b1 == 1;
        let direction = Direction::try_from((raw[0] >> 3) & 0b1)
            .map_err(|_| PduError::InvalidFieldValue {
                field: "direction",
                value: raw[0],
            })?;
        let transmission_mode = TransmissionMode::try_from((raw[0] >> 2) & 0b1)
            .map_err(|_| PduError::InvalidFieldValue {
                field: "transmission mode",
                value: raw[0],
            })?;
        let crc_flag = (raw[0] >> 1) & 0b1 == 1;
        let large_file = raw[0] & 0b1 == 1;
        let data_field_len = u16::from_be_bytes([raw[1], raw[2]]) as usize;
        let entity_id_length = (((raw[3] >> 4) & 0b111) + 1) as usize;
        let seq_num_length = ((raw[3] & 0b111) + 1) as usize;
        let header_len = FIXED_HEADER_LEN + 2 * entity_id_length + seq_num_length;
        if raw.len() < header_len {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: header_len,
            });
        }
        let mut pos = FIXED_HEADER_LEN;
        let source_id = read_be(&raw[pos..pos + entity_id_length]);
        pos += entity_id_length;
        let seq_num = read_be(&raw[pos..pos + seq_num_length]);
        pos += seq_num_length;
        let dest_id = read_be(&raw[pos..pos + entity_id_length]);
        let header = PduHeader {
            direction,
            transmission_mode,
            crc_flag,
            large_file,
            entity_id_length,
            seq_num_length,
            source_id,
            seq_num,
            dest_id,
        };
        Ok((header, pdu_type_file_data, header_len, data_field_len))
    }
}

/// The payload of one PDU, one variant per supported PDU type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduPayload {
    Metadata(MetadataPdu),
    FileData(FileDataPdu),
    Eof(EofPdu),
    Ack(AckPdu),
    Nak(NakPdu),
    Finished(FinishedPdu),
    KeepAlive(KeepAlivePdu),
}

impl PduPayload {
    pub fn name(&self) -> &'static str {
        match self {
            PduPayload::Metadata(_) => "Metadata",
            PduPayload::FileData(_) => "FileData",
            PduPayload::Eof(_) => "EOF",
            PduPayload::Ack(_) => "ACK",
            PduPayload::Nak(_) => "NAK",
            PduPayload::Finished(_) => "Finished",
            PduPayload::KeepAlive(_) => "KeepAlive",
        }
    }
}

/// A fully decoded PDU: header plus typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfdpPdu {
    pub header: PduHeader,
    pub payload: PduPayload,
}

impl CfdpPdu {
    pub fn new(header: PduHeader, payload: PduPayload) -> Self {
        Self { header, payload }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.header.transaction_id()
    }

    /// Encodes the PDU including header, optional directive code and optional CRC trailer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut payload_buf = Vec::with_capacity(64);
        let is_file_data = match &self.payload {
            PduPayload::FileData(pdu) => {
                pdu.write_to(&mut payload_buf);
                true
            }
            PduPayload::Metadata(pdu) => {
                payload_buf.push(DirectiveType::Metadata.into());
                pdu.write_to(&mut payload_buf);
                false
            }
            PduPayload::Eof(pdu) => {
                payload_buf.push(DirectiveType::Eof.into());
                pdu.write_to(&mut payload_buf, self.header.entity_id_length);
                false
            }
            PduPayload::Ack(pdu) => {
                payload_buf.push(DirectiveType::Ack.into());
                pdu.write_to(&mut payload_buf);
                false
            }
            PduPayload::Nak(pdu) => {
                payload_buf.push(DirectiveType::Nak.into());
                pdu.write_to(&mut payload_buf);
                false
            }
            PduPayload::Finished(pdu) => {
                payload_buf.push(DirectiveType::Finished.into());
                pdu.write_to(&mut payload_buf, self.header.entity_id_length);
                false
            }
            PduPayload::KeepAlive(pdu) => {
                payload_buf.push(DirectiveType::KeepAlive.into());
                pdu.write_to(&mut payload_buf);
                false
            }
        };
        let crc_len = if self.header.crc_flag { 2 } else { 0 };
        let data_field_len = (payload_buf.len() + crc_len) as u16;
        let mut buf = Vec::with_capacity(self.header.len_written() + payload_buf.len() + crc_len);
        self.header.write_to(&mut buf, is_file_data, data_field_len);
        buf.extend_from_slice(&payload_buf);
        if self.header.crc_flag {
            let crc = CRC_CCITT.checksum(&buf);
            buf.extend_from_slice(&crc.to_be_bytes());
        }
        buf
    }

    /// Decodes one PDU from a datagram. Errors carry the raw bytes, so a malformed packet can
    /// be logged without aborting the caller.
    pub fn decode(raw: &[u8]) -> Result<CfdpPdu, DecodeError> {
        Self::decode_inner(raw).map_err(|reason| DecodeError {
            reason,
            raw: raw.to_vec(),
        })
    }

    fn decode_inner(raw: &[u8]) -> Result<CfdpPdu, PduError> {
        let (header, is_file_data, header_len, data_field_len) = PduHeader::from_bytes(raw)?;
        let total = header_len + data_field_len;
        if raw.len() < total {
            return Err(PduError::DataLengthMismatch {
                declared: data_field_len,
                available: raw.len() - header_len,
            });
        }
        let mut data_field = &raw[header_len..total];
        if header.crc_flag {
            if data_field.len() < 2 {
                return Err(PduError::ByteConversion {
                    got: data_field.len(),
                    expected: 2,
                });
            }
            let stored = u16::from_be_bytes([raw[total - 2], raw[total - 1]]);
            let computed = CRC_CCITT.checksum(&raw[..total - 2]);
            if stored != computed {
                return Err(PduError::CrcFailure { computed, stored });
            }
            data_field = &raw[header_len..total - 2];
        }
        let payload = if is_file_data {
            PduPayload::FileData(FileDataPdu::from_bytes(data_field)?)
        } else {
            if data_field.is_empty() {
                return Err(PduError::ByteConversion {
                    got: 0,
                    expected: 1,
                });
            }
            let directive = DirectiveType::try_from(data_field[0])
                .map_err(|_| PduError::UnknownDirective(data_field[0]))?;
            let body = &data_field[1..];
            match directive {
                DirectiveType::Metadata => PduPayload::Metadata(MetadataPdu::from_bytes(body)?),
                DirectiveType::Eof => {
                    PduPayload::Eof(EofPdu::from_bytes(body, header.entity_id_length)?)
                }
                DirectiveType::Ack => PduPayload::Ack(AckPdu::from_bytes(body)?),
                DirectiveType::Nak => PduPayload::Nak(NakPdu::from_bytes(body)?),
                DirectiveType::Finished => {
                    PduPayload::Finished(FinishedPdu::from_bytes(body, header.entity_id_length)?)
                }
                DirectiveType::KeepAlive => {
                    PduPayload::KeepAlive(KeepAlivePdu::from_bytes(body)?)
                }
            }
        };
        Ok(CfdpPdu { header, payload })
    }
}

impl fmt::Display for CfdpPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} PDU of transaction {}",
            self.payload.name(),
            self.transaction_id()
        )
    }
}

pub(crate) fn write_be(buf: &mut Vec<u8>, value: u64, width: usize) {
    buf.extend_from_slice(&value.to_be_bytes()[8 - width..]);
}

pub(crate) fn read_be(raw: &[u8]) -> u64 {
    raw.iter().fold(0, |acc, &b| (acc << 8) | b as u64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ConditionCode;

    pub(crate) fn test_header(crc_flag: bool) -> PduHeader {
        PduHeader {
            direction: Direction::TowardsReceiver,
            transmission_mode: TransmissionMode::Acknowledged,
            crc_flag,
            large_file: false,
            entity_id_length: 2,
            seq_num_length: 4,
            source_id: 23,
            seq_num: 1,
            dest_id: 5,
        }
    }

    #[test]
    fn header_round_trip_with_odd_field_widths() {
        let header = PduHeader {
            direction: Direction::TowardsSender,
            transmission_mode: TransmissionMode::Unacknowledged,
            crc_flag: false,
            large_file: false,
            entity_id_length: 3,
            seq_num_length: 5,
            source_id: 0x0A0B0C,
            seq_num: 0x0102030405,
            dest_id: 0x010203,
        };
        let pdu = CfdpPdu::new(header, PduPayload::KeepAlive(KeepAlivePdu::new(42)));
        let raw = pdu.to_vec();
        assert_eq!(raw.len(), header.len_written() + 1 + 4);
        let decoded = CfdpPdu::decode(&raw).unwrap();
        assert_eq!(decoded, pdu);
        assert_eq!(decoded.transaction_id(), TransactionId::new(0x0A0B0C, 0x0102030405));
    }

    #[test]
    fn first_byte_layout() {
        let pdu = CfdpPdu::new(
            test_header(false),
            PduPayload::FileData(FileDataPdu::new(0, vec![1, 2, 3])),
        );
        let raw = pdu.to_vec();
        // version 001, file data, towards receiver, acknowledged, no CRC, no large file.
        assert_eq!(raw[0], 0b0011_0000);
        // entity ID length 2, sequence number length 4.
        assert_eq!(raw[3], 0b0001_0011);
    }

    #[test]
    fn crc_trailer_is_appended_and_verified() {
        let pdu = CfdpPdu::new(
            test_header(true),
            PduPayload::Eof(EofPdu::new(ConditionCode::NoError, 0xDEADBEEF, 100)),
        );
        let mut raw = pdu.to_vec();
        assert_eq!(CfdpPdu::decode(&raw).unwrap(), pdu);
        *raw.last_mut().unwrap() ^= 0xFF;
        let err = CfdpPdu::decode(&raw).unwrap_err();
        assert!(matches!(err.reason, PduError::CrcFailure { .. }));
        assert_eq!(err.raw, raw);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let pdu = CfdpPdu::new(
            test_header(false),
            PduPayload::KeepAlive(KeepAlivePdu::new(0)),
        );
        let raw = pdu.to_vec();
        let err = CfdpPdu::decode(&raw[..raw.len() - 1]).unwrap_err();
        assert!(matches!(err.reason, PduError::DataLengthMismatch { .. }));
        let err = CfdpPdu::decode(&raw[..3]).unwrap_err();
        assert!(matches!(err.reason, PduError::ByteConversion { .. }));
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let pdu = CfdpPdu::new(
            test_header(false),
            PduPayload::KeepAlive(KeepAlivePdu::new(0)),
        );
        let mut raw = pdu.to_vec();
        let header_len = test_header(false).len_written();
        // Prompt PDUs are not supported.
        raw[header_len] = 0x09;
        let err = CfdpPdu::decode(&raw).unwrap_err();
        assert_eq!(err.reason, PduError::UnknownDirective(0x09));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let pdu = CfdpPdu::new(
            test_header(false),
            PduPayload::KeepAlive(KeepAlivePdu::new(0)),
        );
        let mut raw = pdu.to_vec();
        raw[0] = (raw[0] & 0b0001_1111) | (0b111 << 5);
        let err = CfdpPdu::decode(&raw).unwrap_err();
        assert_eq!(err.reason, PduError::InvalidVersion(0b111));
    }

    #[test]
    fn large_file_flag_is_decoded() {
        let mut header = test_header(false);
        header.large_file = true;
        let pdu = CfdpPdu::new(header, PduPayload::KeepAlive(KeepAlivePdu::new(9)));
        let decoded = CfdpPdu::decode(&pdu.to_vec()).unwrap();
        assert!(decoded.header.large_file);
    }
}
