//! The request surface of the engine: everything a transfer initiator specifies up front.
//!
//! A [PutRequest] is an immutable value object. Pause, resume and cancel are addressed to an
//! already running transfer and are therefore plain registry methods taking a transfer ID.
use crate::checksum::checksum;

/// Errors rejecting a put request before any PDU is generated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    #[error("object name must not be empty")]
    EmptyObjectName,
    #[error("unknown source entity {0}")]
    UnknownSourceEntity(String),
    #[error("unknown destination entity {0}")]
    UnknownDestinationEntity(String),
    #[error("file size {size} exceeds the maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },
    #[error("another transfer towards {destination} is already writing {path}")]
    DestinationConflict { destination: String, path: String },
}

/// A request to transfer one object to a remote entity.
///
/// The file content is captured at request time along with its modular checksum, so a
/// transfer is unaffected by later changes to the underlying object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    source_entity: String,
    destination_entity: String,
    object_name: String,
    destination_path: String,
    acknowledged: bool,
    closure_requested: bool,
    overwrite: bool,
    create_path: bool,
    data: Vec<u8>,
    checksum: u32,
}

impl PutRequest {
    pub fn new(
        source_entity: &str,
        destination_entity: &str,
        object_name: &str,
        destination_path: &str,
        data: Vec<u8>,
    ) -> Result<Self, RequestError> {
        if object_name.is_empty() {
            return Err(RequestError::EmptyObjectName);
        }
        let checksum = checksum(&data);
        Ok(Self {
            source_entity: source_entity.to_string(),
            destination_entity: destination_entity.to_string(),
            object_name: object_name.to_string(),
            destination_path: destination_path.to_string(),
            acknowledged: true,
            closure_requested: false,
            overwrite: true,
            create_path: false,
            data,
            checksum,
        })
    }

    pub fn with_acknowledged(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }

    pub fn with_closure_requested(mut self, closure_requested: bool) -> Self {
        self.closure_requested = closure_requested;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_create_path(mut self, create_path: bool) -> Self {
        self.create_path = create_path;
        self
    }

    pub fn source_entity(&self) -> &str {
        &self.source_entity
    }

    pub fn destination_entity(&self) -> &str {
        &self.destination_entity
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn destination_path(&self) -> &str {
        &self.destination_path
    }

    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn closure_requested(&self) -> bool {
        self.closure_requested
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn create_path(&self) -> bool {
        self.create_path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Modular checksum of the full content, computed once at construction.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}
