//! # CFDP transfer registry
//!
//! The [TransferRegistry] is the entry point of the engine. It validates and admits
//! [PutRequest]s, decodes raw inbound datagrams and routes them to the owning transaction,
//! creates receiving state machines for transactions initiated by a remote entity, and
//! exposes pause, resume, cancel and status queries addressed by registry ID.
//!
//! Every transaction runs on its own worker thread with a command mailbox. The worker is the
//! transaction's sequencer: inbound PDUs, operator commands and timer expiries are all
//! applied there, strictly one at a time, so the state machines themselves need no internal
//! locking discipline beyond the mailbox. The worker wakes up at the configured inter-PDU
//! interval to poll timers and generate the next outbound PDU.
//!
//! A background housekeeper evicts terminal transfers after a grace period during which
//! trailing PDUs from the peer (such as a resent Finished) are still answered, and promotes
//! queued uploads when a slot frees up.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use hashbrown::HashMap;

use crate::dest::IncomingTransfer;
use crate::filestore::Filestore;
use crate::pdu::{CfdpPdu, Direction, PduPayload};
use crate::request::{PutRequest, RequestError};
use crate::source::OutgoingTransfer;
use crate::{
    CfdpConfig, ConditionCode, EventSeverity, EventSink, PduSender, TransactionId,
    TransferDirection, TransferLog, TransferMonitor, TransferSnapshot, TransferState,
};

pub const ETYPE_TRANSFER_STARTED: &str = "TRANSFER_STARTED";
pub const ETYPE_TRANSFER_FINISHED: &str = "TRANSFER_FINISHED";
pub const ETYPE_TRANSFER_SUSPENDED: &str = "TRANSFER_SUSPENDED";
pub const ETYPE_TRANSFER_RESUMED: &str = "TRANSFER_RESUMED";
pub const ETYPE_EOF_LIMIT_REACHED: &str = "EOF_LIMIT_REACHED";
pub const ETYPE_FIN_LIMIT_REACHED: &str = "FIN_LIMIT_REACHED";
pub const ETYPE_PDU_DECODING_ERROR: &str = "PDU_DECODING_ERROR";
pub const ETYPE_UNEXPECTED_PDU: &str = "UNEXPECTED_PDU";
pub const ETYPE_LARGE_FILE_NOT_SUPPORTED: &str = "LARGE_FILE_NOT_SUPPORTED";
pub const ETYPE_TX_LIMIT_REACHED: &str = "TX_LIMIT_REACHED";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("no transfer with ID {0}")]
    UnknownTransfer(u64),
}

/// Command posted to a transfer's mailbox.
enum Command {
    Pdu(CfdpPdu),
    Suspend,
    Resume,
    Cancel(ConditionCode),
    Shutdown,
}

/// Either side of a transaction, as owned by a worker.
enum Transfer {
    Outgoing(OutgoingTransfer),
    Incoming(IncomingTransfer),
}

impl Transfer {
    fn tick(&mut self, now: Instant) {
        match self {
            Transfer::Outgoing(t) => t.tick(now),
            Transfer::Incoming(t) => t.tick(now),
        }
    }

    fn handle_pdu(&mut self, pdu: &CfdpPdu, now: Instant) {
        match self {
            Transfer::Outgoing(t) => t.handle_pdu(pdu, now),
            Transfer::Incoming(t) => t.handle_pdu(pdu, now),
        }
    }

    fn suspend(&mut self) {
        match self {
            Transfer::Outgoing(t) => t.suspend(),
            Transfer::Incoming(t) => t.suspend(),
        }
    }

    fn resume(&mut self, now: Instant) {
        match self {
            Transfer::Outgoing(t) => t.resume(now),
            Transfer::Incoming(t) => t.resume(now),
        }
    }

    fn cancel(&mut self, condition: ConditionCode, now: Instant) {
        match self {
            Transfer::Outgoing(t) => t.cancel(condition, now),
            Transfer::Incoming(t) => t.cancel(condition, now),
        }
    }

    fn snapshot(&self) -> TransferSnapshot {
        match self {
            Transfer::Outgoing(t) => t.snapshot(),
            Transfer::Incoming(t) => t.snapshot(),
        }
    }

    fn is_ongoing(&self) -> bool {
        match self {
            Transfer::Outgoing(t) => t.is_ongoing(),
            Transfer::Incoming(t) => t.is_ongoing(),
        }
    }
}

struct WorkerHandle {
    commands: mpsc::Sender<Command>,
    transfer: Arc<Mutex<Transfer>>,
    direction: TransferDirection,
    /// Destination entity ID and remote path of an upload, for conflict detection.
    destination: Option<(u64, String)>,
    /// When the housekeeper first observed the transfer in a terminal state.
    terminal_since: Option<Instant>,
    join: Option<JoinHandle<()>>,
}

struct QueuedUpload {
    id: u64,
    seq_num: u64,
    source_id: u64,
    dest_id: u64,
    request: PutRequest,
    creation_time: SystemTime,
}

impl QueuedUpload {
    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            transaction_id: TransactionId::new(self.source_id, self.seq_num),
            direction: TransferDirection::Upload,
            state: TransferState::Queued,
            acknowledged: self.request.acknowledged(),
            transferred_bytes: 0,
            total_size: Some(self.request.file_size()),
            bucket: None,
            object_name: Some(self.request.object_name().to_string()),
            remote_path: Some(self.request.destination_path().to_string()),
            failure_reason: None,
            creation_time: self.creation_time,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    workers: HashMap<u64, WorkerHandle>,
    /// Transaction ID to registry ID, for PDU routing.
    index: HashMap<TransactionId, u64>,
    queue: VecDeque<QueuedUpload>,
}

impl RegistryInner {
    fn ongoing(&self, direction: TransferDirection) -> usize {
        self.workers
            .values()
            .filter(|w| w.direction == direction)
            .filter(|w| w.transfer.lock().unwrap().is_ongoing())
            .count()
    }
}

/// State shared between the registry front end and the housekeeper thread.
struct Shared {
    config: CfdpConfig,
    sender: Arc<dyn PduSender>,
    filestore: Arc<dyn Filestore>,
    events: Arc<dyn EventSink>,
    monitor: Arc<dyn TransferMonitor>,
    log: Arc<dyn TransferLog>,
    inner: Mutex<RegistryInner>,
}

impl Shared {
    fn start_upload(&self, inner: &mut RegistryInner, queued: QueuedUpload) {
        let QueuedUpload {
            id,
            seq_num,
            source_id,
            dest_id,
            request,
            ..
        } = queued;
        self.events.emit(
            EventSeverity::Info,
            ETYPE_TRANSFER_STARTED,
            &format!(
                "TXID[{}_{}] starting upload of {} towards entity {}",
                source_id,
                seq_num,
                request.object_name(),
                dest_id
            ),
        );
        let destination = Some((dest_id, request.destination_path().to_string()));
        let transfer = OutgoingTransfer::new(
            id,
            seq_num,
            source_id,
            dest_id,
            request,
            &self.config,
            self.sender.clone(),
            self.events.clone(),
            self.monitor.clone(),
        );
        let handle = spawn_worker(
            id,
            Transfer::Outgoing(transfer),
            TransferDirection::Upload,
            destination,
            self.config.sleep_between_pdus,
            self.log.clone(),
        );
        inner.index.insert(TransactionId::new(source_id, seq_num), id);
        inner.workers.insert(id, handle);
    }

    fn start_download(&self, inner: &mut RegistryInner, id: u64, pdu: CfdpPdu) {
        let transaction_id = pdu.transaction_id();
        // A remote entity may have a dedicated bucket configured; everything else lands in
        // the common incoming bucket.
        let bucket = self
            .config
            .remote_entities
            .by_id(pdu.header.source_id)
            .and_then(|e| e.bucket.clone())
            .unwrap_or_else(|| self.config.incoming_bucket.clone());
        self.events.emit(
            EventSeverity::Info,
            ETYPE_TRANSFER_STARTED,
            &format!(
                "TXID[{}] starting download from entity {} into bucket {}",
                transaction_id, pdu.header.source_id, bucket
            ),
        );
        let transfer = IncomingTransfer::new(
            id,
            &pdu.header,
            &self.config,
            bucket,
            self.filestore.clone(),
            self.sender.clone(),
            self.events.clone(),
            self.monitor.clone(),
            Instant::now(),
        );
        let handle = spawn_worker(
            id,
            Transfer::Incoming(transfer),
            TransferDirection::Download,
            None,
            self.config.sleep_between_pdus,
            self.log.clone(),
        );
        let _ = handle.commands.send(Command::Pdu(pdu));
        inner.index.insert(transaction_id, id);
        inner.workers.insert(id, handle);
    }

    /// One housekeeping pass: evict transfers terminal for longer than the grace period and
    /// promote queued uploads into freed slots.
    fn housekeeping(&self) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for (&id, handle) in inner.workers.iter_mut() {
            if handle.transfer.lock().unwrap().is_ongoing() {
                handle.terminal_since = None;
                continue;
            }
            let since = *handle.terminal_since.get_or_insert(now);
            if now.duration_since(since) >= self.config.eviction_grace {
                evicted.push(id);
            }
        }
        for id in evicted {
            if let Some(handle) = inner.workers.remove(&id) {
                self.log.record(&handle.transfer.lock().unwrap().snapshot());
                inner.index.retain(|_, v| *v != id);
                let _ = handle.commands.send(Command::Shutdown);
                if let Some(join) = handle.join {
                    let _ = join.join();
                }
            }
        }
        while inner.ongoing(TransferDirection::Upload) < self.config.max_pending_uploads {
            match inner.queue.pop_front() {
                Some(queued) => self.start_upload(&mut inner, queued),
                None => break,
            }
        }
    }
}

fn spawn_worker(
    id: u64,
    transfer: Transfer,
    direction: TransferDirection,
    destination: Option<(u64, String)>,
    tick_interval: Duration,
    log: Arc<dyn TransferLog>,
) -> WorkerHandle {
    let (commands, mailbox) = mpsc::channel();
    let transfer = Arc::new(Mutex::new(transfer));
    let worker_transfer = transfer.clone();
    let spawned = thread::Builder::new()
        .name(format!("cfdp-transfer-{}", id))
        .spawn(move || loop {
            let command = mailbox.recv_timeout(tick_interval);
            let now = Instant::now();
            let mut transfer = worker_transfer.lock().unwrap();
            match command {
                Ok(Command::Pdu(pdu)) => transfer.handle_pdu(&pdu, now),
                Ok(Command::Suspend) => transfer.suspend(),
                Ok(Command::Resume) => transfer.resume(now),
                Ok(Command::Cancel(condition)) => transfer.cancel(condition, now),
                Ok(Command::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            transfer.tick(now);
            log.record(&transfer.snapshot());
        });
    let join = match spawned {
        Ok(join) => Some(join),
        Err(e) => {
            log::error!("failed to spawn the worker thread of transfer {}: {}", id, e);
            None
        }
    };
    WorkerHandle {
        commands,
        transfer,
        direction,
        destination,
        terminal_since: None,
        join,
    }
}

/// [TransferMonitor] decorator keeping the transfer log current on every transition before
/// forwarding to the caller's monitor.
struct LoggingMonitor {
    log: Arc<dyn TransferLog>,
    inner: Arc<dyn TransferMonitor>,
}

impl TransferMonitor for LoggingMonitor {
    fn state_changed(&self, transfer: &TransferSnapshot) {
        self.log.record(transfer);
        self.inner.state_changed(transfer);
    }
}

pub struct TransferRegistry {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    next_seq_num: AtomicU64,
    shutdown: Arc<AtomicBool>,
    housekeeper: Option<JoinHandle<()>>,
}

impl TransferRegistry {
    pub fn new(
        config: CfdpConfig,
        sender: Arc<dyn PduSender>,
        filestore: Arc<dyn Filestore>,
        events: Arc<dyn EventSink>,
        monitor: Arc<dyn TransferMonitor>,
        log: Arc<dyn TransferLog>,
    ) -> Self {
        let monitor = Arc::new(LoggingMonitor {
            log: log.clone(),
            inner: monitor,
        });
        let shared = Arc::new(Shared {
            config,
            sender,
            filestore,
            events,
            monitor,
            log,
            inner: Mutex::new(RegistryInner::default()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let housekeeper_shared = shared.clone();
        let housekeeper_shutdown = shutdown.clone();
        let interval = (shared.config.eviction_grace / 4)
            .clamp(Duration::from_millis(10), Duration::from_millis(500));
        let housekeeper = thread::Builder::new()
            .name("cfdp-housekeeper".to_string())
            .spawn(move || {
                while !housekeeper_shutdown.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    housekeeper_shared.housekeeping();
                }
            })
            .map_err(|e| log::error!("failed to spawn the housekeeper thread: {}", e))
            .ok();
        Self {
            shared,
            next_id: AtomicU64::new(1),
            next_seq_num: AtomicU64::new(1),
            shutdown,
            housekeeper,
        }
    }

    /// Admits an upload request. Returns the registry ID under which the transfer can be
    /// queried and commanded. When all upload slots are busy the request is queued and
    /// started in submission order as slots free up.
    pub fn submit(&self, request: PutRequest) -> Result<u64, RequestError> {
        let shared = &self.shared;
        let source = shared
            .config
            .local_entities
            .by_name(request.source_entity())
            .ok_or_else(|| {
                RequestError::UnknownSourceEntity(request.source_entity().to_string())
            })?;
        let destination = shared
            .config
            .remote_entities
            .by_name(request.destination_entity())
            .ok_or_else(|| {
                RequestError::UnknownDestinationEntity(request.destination_entity().to_string())
            })?;
        if request.file_size() > shared.config.max_file_size {
            return Err(RequestError::FileTooLarge {
                size: request.file_size(),
                max: shared.config.max_file_size,
            });
        }
        let mut inner = shared.inner.lock().unwrap();
        // A second concurrent transfer towards the same destination object is refused,
        // unless the request explicitly allows overwriting it.
        if !request.overwrite() {
            let conflicting = inner
                .workers
                .values()
                .filter(|w| w.transfer.lock().unwrap().is_ongoing())
                .filter_map(|w| w.destination.as_ref())
                .any(|(dest_id, path)| {
                    *dest_id == destination.id && path == request.destination_path()
                })
                || inner.queue.iter().any(|q| {
                    q.dest_id == destination.id
                        && q.request.destination_path() == request.destination_path()
                });
            if conflicting {
                return Err(RequestError::DestinationConflict {
                    destination: request.destination_entity().to_string(),
                    path: request.destination_path().to_string(),
                });
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queued = QueuedUpload {
            id,
            seq_num: self.next_seq_num.fetch_add(1, Ordering::Relaxed),
            source_id: source.id,
            dest_id: destination.id,
            request,
            creation_time: SystemTime::now(),
        };
        if inner.ongoing(TransferDirection::Upload) >= shared.config.max_pending_uploads {
            shared.monitor.state_changed(&queued.snapshot());
            inner.queue.push_back(queued);
        } else {
            shared.start_upload(&mut inner, queued);
        }
        Ok(id)
    }

    /// Decodes one inbound datagram and routes it. Undecodable, oversized-file and otherwise
    /// unexpected PDUs are reported as events and dropped; they never abort the engine.
    pub fn process_pdu(&self, raw: &[u8]) {
        let shared = &self.shared;
        let pdu = match CfdpPdu::decode(raw) {
            Ok(pdu) => pdu,
            Err(e) => {
                shared.events.emit(
                    EventSeverity::Warning,
                    ETYPE_PDU_DECODING_ERROR,
                    &format!("dropping undecodable PDU: {}", e),
                );
                return;
            }
        };
        if pdu.header.large_file {
            shared.events.emit(
                EventSeverity::Warning,
                ETYPE_LARGE_FILE_NOT_SUPPORTED,
                &format!(
                    "TXID[{}] dropping large file {} PDU, large files are not supported",
                    pdu.transaction_id(),
                    pdu.payload.name()
                ),
            );
            return;
        }
        let transaction_id = pdu.transaction_id();
        let mut inner = shared.inner.lock().unwrap();
        let mut pdu = pdu;
        if let Some(&id) = inner.index.get(&transaction_id) {
            if let Some(handle) = inner.workers.get(&id) {
                match handle.commands.send(Command::Pdu(pdu)) {
                    Ok(()) => return,
                    // The worker is gone; take the PDU back and fall through as if the
                    // transaction were unknown.
                    Err(mpsc::SendError(Command::Pdu(returned))) => pdu = returned,
                    Err(_) => unreachable!("sent a Pdu command"),
                }
            }
        }
        let starts_download = pdu.header.direction == Direction::TowardsReceiver
            && matches!(
                pdu.payload,
                PduPayload::Metadata(_) | PduPayload::FileData(_) | PduPayload::Eof(_)
            );
        if !starts_download {
            shared.events.emit(
                EventSeverity::Warning,
                ETYPE_UNEXPECTED_PDU,
                &format!(
                    "TXID[{}] dropping {} PDU of unknown transaction",
                    transaction_id,
                    pdu.payload.name()
                ),
            );
            return;
        }
        if !shared.config.local_entities.is_empty()
            && shared.config.local_entities.by_id(pdu.header.dest_id).is_none()
        {
            shared.events.emit(
                EventSeverity::Warning,
                ETYPE_UNEXPECTED_PDU,
                &format!(
                    "TXID[{}] dropping {} PDU addressed to unknown entity {}",
                    transaction_id,
                    pdu.payload.name(),
                    pdu.header.dest_id
                ),
            );
            return;
        }
        if inner.ongoing(TransferDirection::Download) >= shared.config.max_pending_downloads {
            shared.events.emit(
                EventSeverity::Warning,
                ETYPE_TX_LIMIT_REACHED,
                &format!(
                    "TXID[{}] dropping {} PDU, the download limit of {} is reached",
                    transaction_id,
                    pdu.payload.name(),
                    shared.config.max_pending_downloads
                ),
            );
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        shared.start_download(&mut inner, id, pdu);
    }

    pub fn suspend(&self, id: u64) -> Result<(), RegistryError> {
        self.command(id, Command::Suspend, ETYPE_TRANSFER_SUSPENDED, "suspending")
    }

    pub fn resume(&self, id: u64) -> Result<(), RegistryError> {
        self.command(id, Command::Resume, ETYPE_TRANSFER_RESUMED, "resuming")
    }

    /// Cancels a transfer. A still queued upload is removed from the queue without any PDU
    /// exchange.
    pub fn cancel(&self, id: u64) -> Result<(), RegistryError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();
        if let Some(pos) = inner.queue.iter().position(|q| q.id == id) {
            let queued = inner.queue.remove(pos).ok_or(RegistryError::UnknownTransfer(id))?;
            let mut snapshot = queued.snapshot();
            snapshot.state = TransferState::Failed;
            snapshot.failure_reason = Some("canceled before start".to_string());
            shared.monitor.state_changed(&snapshot);
            return Ok(());
        }
        let handle = inner
            .workers
            .get(&id)
            .ok_or(RegistryError::UnknownTransfer(id))?;
        let _ = handle
            .commands
            .send(Command::Cancel(ConditionCode::CancelRequestReceived));
        Ok(())
    }

    fn command(
        &self,
        id: u64,
        command: Command,
        event_type: &str,
        verb: &str,
    ) -> Result<(), RegistryError> {
        let shared = &self.shared;
        let inner = shared.inner.lock().unwrap();
        if inner.queue.iter().any(|q| q.id == id) {
            // Suspending or resuming a queued transfer has nothing to act on.
            return Ok(());
        }
        let handle = inner
            .workers
            .get(&id)
            .ok_or(RegistryError::UnknownTransfer(id))?;
        shared.events.emit(
            EventSeverity::Info,
            event_type,
            &format!("{} transfer {}", verb, id),
        );
        let _ = handle.commands.send(command);
        Ok(())
    }

    /// Current snapshot of one transfer, falling back to the archived record once the
    /// transfer was evicted.
    pub fn snapshot(&self, id: u64) -> Option<TransferSnapshot> {
        let shared = &self.shared;
        {
            let inner = shared.inner.lock().unwrap();
            if let Some(handle) = inner.workers.get(&id) {
                return Some(handle.transfer.lock().unwrap().snapshot());
            }
            if let Some(queued) = inner.queue.iter().find(|q| q.id == id) {
                return Some(queued.snapshot());
            }
        }
        shared.log.by_id(id)
    }

    /// Snapshots of all transfers currently held in memory, running and queued.
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        let inner = self.shared.inner.lock().unwrap();
        let mut snapshots: Vec<TransferSnapshot> = inner
            .workers
            .values()
            .map(|w| w.transfer.lock().unwrap().snapshot())
            .chain(inner.queue.iter().map(|q| q.snapshot()))
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Most recent archived transfer records, bounded by the configured retrieval limit.
    pub fn recent(&self) -> Vec<TransferSnapshot> {
        self.shared
            .log
            .recent(self.shared.config.archive_retrieval_limit)
    }
}

impl Drop for TransferRegistry {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(housekeeper) = self.housekeeper.take() {
            let _ = housekeeper.join();
        }
        let mut inner = self.shared.inner.lock().unwrap();
        for (_, handle) in inner.workers.drain() {
            let _ = handle.commands.send(Command::Shutdown);
            if let Some(join) = handle.join {
                let _ = join.join();
            }
        }
    }
}
