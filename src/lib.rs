//! Implementation of the CCSDS File Delivery Protocol (CFDP) transfer engine.
//!
//! CFDP moves files (or file-less metadata) between two entities over an unreliable, possibly
//! half-duplex link by exchanging packet data units (PDUs). The protocol has an unacknowledged
//! mode (CFDP class 1) which sends best-effort, optionally with a transaction closure handshake,
//! and an acknowledged mode (CFDP class 2) with explicit ACK/NAK/Finished handshakes and lost
//! segment retransmission. The acknowledged mode can be compared to a specialized TCP for file
//! transfers with remote systems.
//!
//! The core components of this crate are:
//!
//! * The [pdu] module, a binary codec for the fixed CFDP PDU format.
//! * The [checksum] module with the order-independent modular checksum used to verify file
//!   integrity.
//! * The [datafile] module, a sparse model of a partially received file which tracks missing
//!   byte ranges.
//! * The [source::OutgoingTransfer] and [dest::IncomingTransfer] state machines which model
//!   the sending and receiving side of one transaction.
//! * The [registry::TransferRegistry] which owns all active transactions, routes inbound PDUs
//!   to them and executes each transaction on its own strictly serialized sequencer.
//!
//! The engine talks to its surroundings exclusively through narrow collaborator traits: a
//! [PduSender] hands raw PDU bytes to the transport, a [filestore::Filestore] stores completed
//! files, an [EventSink] receives operator-facing events, a [TransferMonitor] is notified of
//! every lifecycle transition and a [TransferLog] keeps an append-only record of transfer
//! snapshots for later querying.
use core::fmt;
use std::sync::{mpsc, Mutex};
use std::time::{Duration, SystemTime};

use hashbrown::HashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod checksum;
pub mod datafile;
pub mod dest;
pub mod filestore;
pub mod pdu;
pub mod registry;
pub mod request;
pub mod source;
pub mod timer;

/// The CFDP transaction ID consists of the entity ID of the transaction initiator and a
/// sequence number chosen by that entity. It uniquely identifies a transaction on both peers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId {
    source_id: u64,
    seq_num: u64,
}

impl TransactionId {
    pub fn new(source_id: u64, seq_num: u64) -> Self {
        Self { source_id, seq_num }
    }

    #[inline]
    pub fn source_id(&self) -> u64 {
        self.source_id
    }

    #[inline]
    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source_id, self.seq_num)
    }
}

/// Condition codes as specified in chapter 5.1.5 of the CFDP standard. These form the fault
/// vocabulary of the protocol and are carried inside EOF, Finished and ACK PDUs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConditionCode {
    NoError = 0b0000,
    AckLimitReached = 0b0001,
    KeepAliveLimitReached = 0b0010,
    InvalidTransmissionMode = 0b0011,
    FilestoreRejection = 0b0100,
    FileChecksumFailure = 0b0101,
    FileSizeError = 0b0110,
    NakLimitReached = 0b0111,
    InactivityDetected = 0b1000,
    InvalidFileStructure = 0b1001,
    CheckLimitReached = 0b1010,
    UnsupportedChecksumType = 0b1011,
    SuspendRequestReceived = 0b1110,
    CancelRequestReceived = 0b1111,
}

impl ConditionCode {
    #[inline]
    pub fn is_success(&self) -> bool {
        *self == ConditionCode::NoError
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TransmissionMode {
    Acknowledged = 0,
    Unacknowledged = 1,
}

/// Recovery action applied when a protocol fault is declared, configurable per condition code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultHandlingAction {
    /// Force-complete the transfer as failed without any further PDU exchange.
    Abandon,
    /// Initiate the regular cancel handshake with the peer.
    Cancel,
    /// Pause the transfer and await an external resume.
    Suspend,
}

impl FaultHandlingAction {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "abandon" => Some(FaultHandlingAction::Abandon),
            "cancel" => Some(FaultHandlingAction::Cancel),
            "suspend" => Some(FaultHandlingAction::Suspend),
            _ => None,
        }
    }
}

/// Per-role mapping of condition codes to fault handling actions.
///
/// Codes without an explicit override map to [FaultHandlingAction::Cancel].
#[derive(Debug, Default, Clone)]
pub struct FaultHandlers {
    overrides: HashMap<ConditionCode, FaultHandlingAction>,
}

impl FaultHandlers {
    pub fn new(overrides: HashMap<ConditionCode, FaultHandlingAction>) -> Self {
        Self { overrides }
    }

    pub fn set(&mut self, code: ConditionCode, action: FaultHandlingAction) {
        self.overrides.insert(code, action);
    }

    pub fn action_for(&self, code: ConditionCode) -> FaultHandlingAction {
        self.overrides
            .get(&code)
            .copied()
            .unwrap_or(FaultHandlingAction::Cancel)
    }
}

/// Lifecycle state of a transfer as visible to callers and monitors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Accepted but waiting for an upload slot to free up.
    Queued,
    Running,
    Paused,
    Cancelling,
    Completed,
    Failed,
}

impl TransferState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Static configuration of one CFDP entity: a numeric protocol ID, a logical name used by
/// request issuers, and an optional dedicated storage bucket.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct EntityConf {
    pub id: u64,
    pub name: String,
    pub bucket: Option<String>,
}

/// Read-only lookup table for the local or remote entities known to the engine.
#[derive(Debug, Default, Clone)]
pub struct EntityTable {
    entities: Vec<EntityConf>,
}

impl EntityTable {
    pub fn new(entities: Vec<EntityConf>) -> Self {
        Self { entities }
    }

    pub fn by_name(&self, name: &str) -> Option<&EntityConf> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn by_id(&self, id: u64) -> Option<&EntityConf> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityConf> {
        self.entities.iter()
    }
}

/// The full recognized configuration surface of the transfer engine.
#[derive(Debug, Clone)]
pub struct CfdpConfig {
    /// Byte length of entity ID fields in PDU headers. Must match the peer configuration.
    pub entity_id_length: usize,
    /// Byte length of the transaction sequence number field in PDU headers.
    pub sequence_number_length: usize,
    /// Maximum size of a generated PDU including the header.
    pub max_pdu_size: usize,
    pub eof_ack_timeout: Duration,
    pub eof_ack_limit: i32,
    pub fin_ack_timeout: Duration,
    pub fin_ack_limit: i32,
    /// Delay between two outgoing PDUs of the same transfer (the periodic send tick).
    pub sleep_between_pdus: Duration,
    pub nak_timeout: Duration,
    /// Maximum number of NAK rounds; negative means unlimited.
    pub nak_limit: i32,
    /// Issue a NAK as soon as EOF reveals missing data instead of waiting a full NAK interval.
    pub immediate_nak: bool,
    /// Interval and budget of the completion re-check timer used for unacknowledged receives.
    pub check_timeout: Duration,
    pub check_limit: i32,
    pub max_file_size: u64,
    pub inactivity_timeout: Duration,
    pub max_pending_uploads: usize,
    pub max_pending_downloads: usize,
    /// Maximum number of archived transfer records returned by a recency query.
    pub archive_retrieval_limit: usize,
    /// How long a completed or failed transfer stays addressable so trailing peer PDUs can
    /// still be answered.
    pub eviction_grace: Duration,
    /// Whether an EOF received while the transfer is suspended is still acknowledged.
    pub eof_ack_while_suspended: bool,
    /// Bucket receiving downloaded files when no entity-specific bucket is configured.
    pub incoming_bucket: String,
    pub sender_fault_handlers: FaultHandlers,
    pub receiver_fault_handlers: FaultHandlers,
    pub local_entities: EntityTable,
    pub remote_entities: EntityTable,
}

impl Default for CfdpConfig {
    fn default() -> Self {
        Self {
            entity_id_length: 2,
            sequence_number_length: 4,
            max_pdu_size: 512,
            eof_ack_timeout: Duration::from_millis(5000),
            eof_ack_limit: 5,
            fin_ack_timeout: Duration::from_millis(10000),
            fin_ack_limit: 5,
            sleep_between_pdus: Duration::from_millis(500),
            nak_timeout: Duration::from_millis(5000),
            nak_limit: -1,
            immediate_nak: true,
            check_timeout: Duration::from_millis(5000),
            check_limit: 5,
            max_file_size: 100 * 1024 * 1024,
            inactivity_timeout: Duration::from_millis(10000),
            max_pending_uploads: 10,
            max_pending_downloads: 100,
            archive_retrieval_limit: 100,
            eviction_grace: Duration::from_millis(20000),
            eof_ack_while_suspended: true,
            incoming_bucket: "cfdpDown".to_string(),
            sender_fault_handlers: FaultHandlers::default(),
            receiver_fault_handlers: FaultHandlers::default(),
            local_entities: EntityTable::default(),
            remote_entities: EntityTable::default(),
        }
    }
}

impl CfdpConfig {
    /// Maximum number of file data bytes fitting into one file data PDU: the configured
    /// maximum PDU size minus the fixed header, both entity IDs, the sequence number and the
    /// 4-byte file offset.
    pub fn max_data_size(&self) -> usize {
        self.max_pdu_size - 4 - 2 * self.entity_id_length - self.sequence_number_length - 4
    }
}

/// Error type for handing a PDU to the transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SendError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("transport queue is full")]
    QueueFull,
    #[error("other send error")]
    Other,
}

/// Non-blocking hand-off of an encoded PDU to the underlying transport.
pub trait PduSender: Send + Sync {
    fn send_pdu(&self, transaction_id: TransactionId, raw_pdu: &[u8]) -> Result<(), SendError>;
}

impl PduSender for mpsc::Sender<Vec<u8>> {
    fn send_pdu(&self, _transaction_id: TransactionId, raw_pdu: &[u8]) -> Result<(), SendError> {
        self.send(raw_pdu.to_vec())
            .map_err(|_| SendError::Disconnected)
    }
}

impl<T: PduSender> PduSender for Mutex<T> {
    fn send_pdu(&self, transaction_id: TransactionId, raw_pdu: &[u8]) -> Result<(), SendError> {
        self.lock()
            .map_err(|_| SendError::Other)?
            .send_pdu(transaction_id, raw_pdu)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Sink for operator-facing events. Event types are short upper-case identifiers, see the
/// constants in the [registry] module.
pub trait EventSink: Send + Sync {
    fn emit(&self, severity: EventSeverity, event_type: &str, message: &str);
}

/// [EventSink] forwarding everything to the [log] facade.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, severity: EventSeverity, event_type: &str, message: &str) {
        match severity {
            EventSeverity::Info => log::info!("[{}] {}", event_type, message),
            EventSeverity::Warning => log::warn!("[{}] {}", event_type, message),
            EventSeverity::Error => log::error!("[{}] {}", event_type, message),
        }
    }
}

/// Point-in-time view of one transfer, shared with monitors and persisted via [TransferLog].
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    /// Registry-unique numeric ID, distinct from the protocol transaction ID.
    pub id: u64,
    pub transaction_id: TransactionId,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub acknowledged: bool,
    pub transferred_bytes: u64,
    pub total_size: Option<u64>,
    pub bucket: Option<String>,
    pub object_name: Option<String>,
    pub remote_path: Option<String>,
    pub failure_reason: Option<String>,
    pub creation_time: SystemTime,
}

/// Callback invoked on every transfer lifecycle transition.
pub trait TransferMonitor: Send + Sync {
    fn state_changed(&self, transfer: &TransferSnapshot);
}

/// No-op monitor for callers not interested in transition callbacks.
#[derive(Debug, Default)]
pub struct NullTransferMonitor;

impl TransferMonitor for NullTransferMonitor {
    fn state_changed(&self, _transfer: &TransferSnapshot) {}
}

/// Append-only record of transfer lifecycle snapshots, queryable by registry ID and by
/// recency. Used to answer status queries for transfers no longer held in memory.
pub trait TransferLog: Send + Sync {
    fn record(&self, snapshot: &TransferSnapshot);
    fn by_id(&self, id: u64) -> Option<TransferSnapshot>;
    /// Most recent snapshots first, at most `limit` entries, one per transfer.
    fn recent(&self, limit: usize) -> Vec<TransferSnapshot>;
}

/// In-memory [TransferLog] keeping the latest snapshot per transfer in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryTransferLog {
    records: Mutex<Vec<TransferSnapshot>>,
}

impl TransferLog for InMemoryTransferLog {
    fn record(&self, snapshot: &TransferSnapshot) {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.iter_mut().find(|r| r.id == snapshot.id) {
            *existing = snapshot.clone();
        } else {
            records.push(snapshot.clone());
        }
    }

    fn by_id(&self, id: u64) -> Option<TransferSnapshot> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    fn recent(&self, limit: usize) -> Vec<TransferSnapshot> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}
