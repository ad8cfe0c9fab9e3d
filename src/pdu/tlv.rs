//! Type-length-value fields carried in metadata options and fault locations, including the
//! reserved CFDP message-to-user messages (value prefixed with the "cfdp" magic).
use crate::pdu::{read_be, write_be, PduError};
use crate::TransactionId;

/// Filestore request TLV, carried in metadata options.
pub const TLV_TYPE_FILESTORE_REQUEST: u8 = 0x00;
/// Entity ID TLV, used as the fault location in EOF and Finished PDUs.
pub const TLV_TYPE_ENTITY_ID: u8 = 0x06;

/// Filestore request action code asking the receiver to create a directory.
pub const FILESTORE_ACTION_CREATE_DIRECTORY: u8 = 0b0011;
/// Message-to-user TLV, the container for the reserved CFDP messages.
pub const TLV_TYPE_MESSAGE_TO_USER: u8 = 0x02;

const RESERVED_MESSAGE_MAGIC: &[u8; 4] = b"cfdp";

const MSG_ORIGINATING_TRANSACTION_ID: u8 = 0x0A;
const MSG_DIRECTORY_LISTING_REQUEST: u8 = 0x10;
const MSG_DIRECTORY_LISTING_RESPONSE: u8 = 0x11;

/// A raw TLV. Typed accessors interpret the value for the kinds this crate understands;
/// unknown types are carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u8,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tlv_type: u8, value: Vec<u8>) -> Self {
        Self { tlv_type, value }
    }

    /// Fault location TLV holding an entity ID of the given byte width.
    pub fn entity_id(id: u64, width: usize) -> Self {
        let mut value = Vec::with_capacity(width);
        write_be(&mut value, id, width);
        Self::new(TLV_TYPE_ENTITY_ID, value)
    }

    /// Filestore request TLV with a single file name operand.
    pub fn filestore_request(action: u8, first_file_name: &str) -> Self {
        let mut value = Vec::with_capacity(first_file_name.len() + 2);
        value.push(action << 4);
        write_lv(&mut value, first_file_name);
        Self::new(TLV_TYPE_FILESTORE_REQUEST, value)
    }

    /// Interprets the value as a filestore request, returning the action code and the first
    /// file name operand.
    pub fn as_filestore_request(&self) -> Option<(u8, String)> {
        if self.tlv_type != TLV_TYPE_FILESTORE_REQUEST || self.value.is_empty() {
            return None;
        }
        let mut pos = 1;
        let first_file_name = read_lv(&self.value, &mut pos).ok()?;
        Some((self.value[0] >> 4, first_file_name))
    }

    /// Interprets the value as a big-endian entity ID.
    pub fn as_entity_id(&self) -> Option<u64> {
        if self.tlv_type != TLV_TYPE_ENTITY_ID || self.value.is_empty() || self.value.len() > 8 {
            return None;
        }
        Some(read_be(&self.value))
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.tlv_type);
        buf.push(self.value.len() as u8);
        buf.extend_from_slice(&self.value);
    }

    /// Parses one TLV from the start of the buffer, returning it and the bytes consumed.
    pub fn from_bytes(raw: &[u8]) -> Result<(Tlv, usize), PduError> {
        if raw.len() < 2 {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: 2,
            });
        }
        let len = raw[1] as usize;
        if raw.len() < 2 + len {
            return Err(PduError::ByteConversion {
                got: raw.len(),
                expected: 2 + len,
            });
        }
        Ok((Tlv::new(raw[0], raw[2..2 + len].to_vec()), 2 + len))
    }
}

/// The reserved CFDP message-to-user messages this crate interprets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservedMessage {
    /// Links a transaction back to the transaction that requested it.
    OriginatingTransactionId(TransactionId),
    DirectoryListingRequest {
        directory_name: String,
        listing_file_name: String,
    },
    DirectoryListingResponse {
        response_code: u8,
        directory_name: String,
        listing_file_name: String,
    },
}

impl ReservedMessage {
    pub fn to_tlv(&self, entity_id_length: usize, seq_num_length: usize) -> Tlv {
        let mut value = Vec::with_capacity(16);
        value.extend_from_slice(RESERVED_MESSAGE_MAGIC);
        match self {
            ReservedMessage::OriginatingTransactionId(id) => {
                value.push(MSG_ORIGINATING_TRANSACTION_ID);
                value.push(
                    (((entity_id_length - 1) as u8) << 4) | ((seq_num_length - 1) as u8),
                );
                write_be(&mut value, id.source_id(), entity_id_length);
                write_be(&mut value, id.seq_num(), seq_num_length);
            }
            ReservedMessage::DirectoryListingRequest {
                directory_name,
                listing_file_name,
            } => {
                value.push(MSG_DIRECTORY_LISTING_REQUEST);
                write_lv(&mut value, directory_name);
                write_lv(&mut value, listing_file_name);
            }
            ReservedMessage::DirectoryListingResponse {
                response_code,
                directory_name,
                listing_file_name,
            } => {
                value.push(MSG_DIRECTORY_LISTING_RESPONSE);
                value.push(*response_code);
                write_lv(&mut value, directory_name);
                write_lv(&mut value, listing_file_name);
            }
        }
        Tlv::new(TLV_TYPE_MESSAGE_TO_USER, value)
    }

    /// Interprets a message-to-user TLV. Returns `None` for TLVs of other types, messages
    /// without the reserved magic and message types this crate does not understand.
    pub fn from_tlv(tlv: &Tlv) -> Option<ReservedMessage> {
        if tlv.tlv_type != TLV_TYPE_MESSAGE_TO_USER || tlv.value.len() < 5 {
            return None;
        }
        if &tlv.value[..4] != RESERVED_MESSAGE_MAGIC {
            return None;
        }
        let body = &tlv.value[5..];
        match tlv.value[4] {
            MSG_ORIGINATING_TRANSACTION_ID => {
                if body.is_empty() {
                    return None;
                }
                let entity_id_length = ((body[0] >> 4) & 0b111) as usize + 1;
                let seq_num_length = (body[0] & 0b111) as usize + 1;
                if body.len() < 1 + entity_id_length + seq_num_length {
                    return None;
                }
                let source_id = read_be(&body[1..1 + entity_id_length]);
                let seq_num = read_be(
                    &body[1 + entity_id_length..1 + entity_id_length + seq_num_length],
                );
                Some(ReservedMessage::OriginatingTransactionId(
                    TransactionId::new(source_id, seq_num),
                ))
            }
            MSG_DIRECTORY_LISTING_REQUEST => {
                let mut pos = 0;
                let directory_name = read_lv(body, &mut pos).ok()?;
                let listing_file_name = read_lv(body, &mut pos).ok()?;
                Some(ReservedMessage::DirectoryListingRequest {
                    directory_name,
                    listing_file_name,
                })
            }
            MSG_DIRECTORY_LISTING_RESPONSE => {
                if body.is_empty() {
                    return None;
                }
                let mut pos = 1;
                let directory_name = read_lv(body, &mut pos).ok()?;
                let listing_file_name = read_lv(body, &mut pos).ok()?;
                Some(ReservedMessage::DirectoryListingResponse {
                    response_code: body[0],
                    directory_name,
                    listing_file_name,
                })
            }
            _ => None,
        }
    }
}

/// Writes a length-value string field (one length byte plus the UTF-8 bytes).
pub(crate) fn write_lv(buf: &mut Vec<u8>, value: &str) {
    buf.push(value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
}

/// Reads a length-value string field starting at `*pos`, advancing it past the field.
pub(crate) fn read_lv(raw: &[u8], pos: &mut usize) -> Result<String, PduError> {
    if *pos >= raw.len() {
        return Err(PduError::ByteConversion {
            got: raw.len(),
            expected: *pos + 1,
        });
    }
    let len = raw[*pos] as usize;
    let start = *pos + 1;
    if raw.len() < start + len {
        return Err(PduError::ByteConversion {
            got: raw.len(),
            expected: start + len,
        });
    }
    *pos = start + len;
    String::from_utf8(raw[start..start + len].to_vec())
        .map_err(|_| PduError::MalformedPayload("LV string"))
}
