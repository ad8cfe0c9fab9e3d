//! # CFDP destination entity module
//!
//! The [IncomingTransfer] state machine models the receiving side of one transaction. It is
//! created by the registry when the first PDU of an unknown transaction arrives, accumulates
//! file data in a sparse [DataFile], requests retransmission of lost segments via NAK in
//! acknowledged mode, verifies the modular checksum against the EOF PDU and delivers the
//! completed file to the [Filestore]. Transfers requiring a closure handshake send a
//! Finished PDU and retry it on a bounded timer until its ACK arrives.
//!
//! Like the sending side, the transfer is driven entirely by its sequencer:
//! [IncomingTransfer::handle_pdu] for inbound PDUs and the periodic
//! [IncomingTransfer::tick] for timer expiries, with the current time passed in explicitly.
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::datafile::DataFile;
use crate::filestore::Filestore;
use crate::pdu::finished::{DeliveryCode, FileStatus};
use crate::pdu::metadata::CHECKSUM_TYPE_MODULAR;
use crate::pdu::{
    AckPdu, CfdpPdu, Direction, DirectiveType, EofPdu, FinishedPdu, MetadataPdu, NakPdu,
    PduHeader, PduPayload, SegmentRequest,
};
use crate::registry::{ETYPE_FIN_LIMIT_REACHED, ETYPE_TRANSFER_FINISHED};
use crate::timer::{Expiry, RetryTimer};
use crate::{
    CfdpConfig, ConditionCode, EventSeverity, EventSink, FaultHandlers, FaultHandlingAction,
    PduSender, TransactionId, TransferDirection, TransferMonitor, TransferSnapshot,
    TransferState, TransmissionMode,
};

/// Protocol sub-state of the receiving side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum IncomingState {
    ReceivingData,
    Fin,
    Completed,
}

pub struct IncomingTransfer {
    id: u64,
    transaction_id: TransactionId,
    /// Header template for PDUs sent back to the initiator.
    header: PduHeader,
    state: IncomingState,
    lifecycle: TransferState,
    acknowledged: bool,
    metadata: Option<MetadataPdu>,
    datafile: DataFile,
    eof: Option<EofPdu>,
    /// The Finished PDU last sent, resent by the FIN retry timer and echoed into the final
    /// outcome when its ACK arrives.
    sent_finished: Option<FinishedPdu>,
    deferred_cancel: Option<ConditionCode>,
    checksum_failed: bool,
    saved_object: Option<String>,
    nak_timer: RetryTimer,
    fin_timer: RetryTimer,
    check_timer: RetryTimer,
    inactivity_timer: RetryTimer,
    immediate_nak: bool,
    eof_ack_while_suspended: bool,
    max_file_size: u64,
    fault_handlers: FaultHandlers,
    bucket: String,
    errors: Vec<String>,
    creation_time: SystemTime,
    filestore: Arc<dyn Filestore>,
    sender: Arc<dyn PduSender>,
    events: Arc<dyn EventSink>,
    monitor: Arc<dyn TransferMonitor>,
}

impl IncomingTransfer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        inbound_header: &PduHeader,
        config: &CfdpConfig,
        bucket: String,
        filestore: Arc<dyn Filestore>,
        sender: Arc<dyn PduSender>,
        events: Arc<dyn EventSink>,
        monitor: Arc<dyn TransferMonitor>,
        now: Instant,
    ) -> Self {
        let header = PduHeader {
            direction: Direction::TowardsSender,
            ..*inbound_header
        };
        let mut inactivity_timer = RetryTimer::new(config.inactivity_timeout, 0);
        inactivity_timer.start(now);
        Self {
            id,
            transaction_id: inbound_header.transaction_id(),
            header,
            state: IncomingState::ReceivingData,
            lifecycle: TransferState::Running,
            acknowledged: inbound_header.transmission_mode == TransmissionMode::Acknowledged,
            metadata: None,
            datafile: DataFile::new(),
            eof: None,
            sent_finished: None,
            deferred_cancel: None,
            checksum_failed: false,
            saved_object: None,
            nak_timer: RetryTimer::new(config.nak_timeout, config.nak_limit),
            fin_timer: RetryTimer::new(config.fin_ack_timeout, config.fin_ack_limit),
            check_timer: RetryTimer::new(config.check_timeout, config.check_limit),
            inactivity_timer,
            immediate_nak: config.immediate_nak,
            eof_ack_while_suspended: config.eof_ack_while_suspended,
            max_file_size: config.max_file_size,
            fault_handlers: config.receiver_fault_handlers.clone(),
            bucket,
            errors: Vec::new(),
            creation_time: SystemTime::now(),
            filestore,
            sender,
            events,
            monitor,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn lifecycle(&self) -> TransferState {
        self.lifecycle
    }

    pub fn is_ongoing(&self) -> bool {
        !self.lifecycle.is_terminal()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            transaction_id: self.transaction_id,
            direction: TransferDirection::Download,
            state: self.lifecycle,
            acknowledged: self.acknowledged,
            transferred_bytes: self.datafile.received_size(),
            total_size: self.datafile.expected_size(),
            bucket: Some(self.bucket.clone()),
            object_name: self
                .saved_object
                .clone()
                .or_else(|| self.metadata.as_ref().map(|m| m.dest_file_name.clone())),
            remote_path: self.metadata.as_ref().map(|m| m.source_file_name.clone()),
            failure_reason: if self.errors.is_empty() {
                None
            } else {
                Some(self.errors.join("; "))
            },
            creation_time: self.creation_time,
        }
    }

    /// The earliest pending timer deadline, for precise sequencer sleeping.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.nak_timer.next_deadline(),
            self.fin_timer.next_deadline(),
            self.check_timer.next_deadline(),
            self.inactivity_timer.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Periodic driver, only responsible for timer expiries; all sends of the receiving side
    /// are reactions to inbound PDUs or timers.
    pub fn tick(&mut self, now: Instant) {
        if self.lifecycle.is_terminal() {
            return;
        }
        match self.nak_timer.poll(now) {
            Some(Expiry::Intermediate) => self.send_nak(),
            Some(Expiry::Final) => {
                self.handle_fault(ConditionCode::NakLimitReached, now);
                return;
            }
            None => {}
        }
        match self.fin_timer.poll(now) {
            Some(Expiry::Intermediate) => self.resend_finished(),
            Some(Expiry::Final) => {
                self.events.emit(
                    EventSeverity::Warning,
                    ETYPE_FIN_LIMIT_REACHED,
                    &format!(
                        "TXID[{}] Finished ACK limit reached after {} attempts",
                        self.transaction_id,
                        self.fin_timer.attempts()
                    ),
                );
                // Deliberately also a failure when the file itself was delivered fine: the
                // peer never confirmed our Finished.
                self.complete_failed(
                    ConditionCode::AckLimitReached,
                    "Finished ACK limit reached",
                );
                return;
            }
            None => {}
        }
        match self.check_timer.poll(now) {
            Some(Expiry::Intermediate) => self.check_completion(now),
            Some(Expiry::Final) => {
                self.handle_fault(ConditionCode::CheckLimitReached, now);
                return;
            }
            None => {}
        }
        if let Some(Expiry::Final) = self.inactivity_timer.poll(now) {
            if self.state == IncomingState::ReceivingData {
                self.handle_fault(ConditionCode::InactivityDetected, now);
            } else {
                // The watchdog is canceled when leaving ReceivingData; firing here is a bug.
                log::error!(
                    "TXID{} inactivity timer fired in {:?}",
                    self.transaction_id,
                    self.state
                );
                if !self.lifecycle.is_terminal() {
                    self.complete_failed(
                        ConditionCode::InactivityDetected,
                        "internal error: inactivity timer fired after data phase",
                    );
                }
            }
        }
    }

    /// Processes one inbound PDU of this transaction.
    pub fn handle_pdu(&mut self, pdu: &CfdpPdu, now: Instant) {
        if self.state == IncomingState::ReceivingData
            && self.lifecycle == TransferState::Running
        {
            self.inactivity_timer.start(now);
        }
        match &pdu.payload {
            PduPayload::Metadata(metadata) => self.handle_metadata(metadata.clone(), now),
            PduPayload::FileData(file_data) => {
                self.handle_file_data(file_data.offset as u64, file_data.data.clone(), now)
            }
            PduPayload::Eof(eof) => self.handle_eof(eof.clone(), now),
            PduPayload::Ack(ack) => self.handle_ack(ack.acked_directive),
            other => {
                log::warn!(
                    "TXID{} unexpected {} PDU at the receiving side, dropped",
                    self.transaction_id,
                    other.name()
                );
            }
        }
    }

    fn handle_metadata(&mut self, metadata: MetadataPdu, now: Instant) {
        if self.state != IncomingState::ReceivingData {
            return;
        }
        if self.metadata.is_some() {
            log::debug!("TXID{} duplicate metadata, dropped", self.transaction_id);
            return;
        }
        if metadata.checksum_type != CHECKSUM_TYPE_MODULAR {
            self.errors.push(format!(
                "unsupported checksum type {}",
                metadata.checksum_type
            ));
            self.handle_fault(ConditionCode::UnsupportedChecksumType, now);
            return;
        }
        let size = metadata.file_size as u64;
        if size > self.max_file_size {
            self.errors.push(format!(
                "declared file size {} exceeds the maximum of {}",
                size, self.max_file_size
            ));
            self.handle_fault(ConditionCode::FileSizeError, now);
            return;
        }
        if self.datafile.end_of_data() > size {
            self.errors.push(format!(
                "already received data up to offset {} beyond the declared size {}",
                self.datafile.end_of_data(),
                size
            ));
            self.handle_fault(ConditionCode::FileSizeError, now);
            return;
        }
        self.datafile.set_expected_size(size);
        self.metadata = Some(metadata);
        self.check_completion(now);
    }

    fn handle_file_data(&mut self, offset: u64, data: Vec<u8>, now: Instant) {
        if self.state != IncomingState::ReceivingData {
            log::debug!(
                "TXID{} file data in {:?}, dropped",
                self.transaction_id,
                self.state
            );
            return;
        }
        let end = offset + data.len() as u64;
        let limit = self.datafile.expected_size().unwrap_or(self.max_file_size);
        if end > limit {
            self.errors
                .push(format!("file data up to offset {} exceeds size {}", end, limit));
            self.handle_fault(ConditionCode::FileSizeError, now);
            return;
        }
        self.datafile.add_segment(offset, data);
        self.check_completion(now);
    }

    fn handle_eof(&mut self, eof: EofPdu, now: Instant) {
        if self.state != IncomingState::ReceivingData {
            // The peer may have missed our EOF ACK; answer again in acknowledged mode.
            if self.acknowledged {
                self.send(PduPayload::Ack(AckPdu::for_eof(eof.condition)));
            }
            return;
        }
        match eof.condition {
            ConditionCode::NoError => {
                if self.acknowledged
                    && (self.lifecycle != TransferState::Paused || self.eof_ack_while_suspended)
                {
                    self.send(PduPayload::Ack(AckPdu::for_eof(ConditionCode::NoError)));
                }
                let size = eof.file_size as u64;
                if size > self.max_file_size {
                    self.errors.push(format!(
                        "EOF file size {} exceeds the maximum of {}",
                        size, self.max_file_size
                    ));
                    self.eof = Some(eof);
                    self.handle_fault(ConditionCode::FileSizeError, now);
                    return;
                }
                if self.datafile.expected_size().is_none() {
                    self.datafile.set_expected_size(size);
                }
                self.eof = Some(eof);
                if self.lifecycle == TransferState::Paused {
                    return;
                }
                if !self.try_complete(now) {
                    if self.acknowledged {
                        if self.immediate_nak {
                            self.send_nak();
                        }
                        self.nak_timer.start(now);
                    } else {
                        self.check_timer.start(now);
                    }
                }
            }
            ConditionCode::CancelRequestReceived => {
                if self.acknowledged {
                    self.send(PduPayload::Ack(AckPdu::for_eof(eof.condition)));
                }
                self.complete_failed(
                    ConditionCode::CancelRequestReceived,
                    "canceled by the remote entity",
                );
            }
            other => {
                self.eof = Some(eof);
                self.errors.push(format!("EOF with condition {:?}", other));
                self.handle_fault(other, now);
            }
        }
    }

    fn handle_ack(&mut self, acked: DirectiveType) {
        if acked != DirectiveType::Finished || self.state != IncomingState::Fin {
            log::warn!(
                "TXID{} unexpected ACK of {:?} in {:?}, dropped",
                self.transaction_id,
                acked,
                self.state
            );
            return;
        }
        self.fin_timer.cancel();
        let condition = self
            .sent_finished
            .as_ref()
            .map(|f| f.condition)
            .unwrap_or(ConditionCode::NoError);
        if condition.is_success() {
            self.complete_success();
        } else {
            self.complete_failed(condition, &format!("finished with {:?}", condition));
        }
    }

    fn check_completion(&mut self, now: Instant) {
        if self.eof.is_some() {
            self.try_complete(now);
        }
    }

    /// Checks whether reception is complete and if so runs checksum verification and file
    /// delivery. Returns true when the data phase is over.
    fn try_complete(&mut self, now: Instant) -> bool {
        if self.state != IncomingState::ReceivingData || !self.datafile.is_complete() {
            return false;
        }
        let eof_checksum = match &self.eof {
            Some(eof) => eof.checksum,
            None => return false,
        };
        self.nak_timer.cancel();
        self.check_timer.cancel();
        self.inactivity_timer.cancel();
        let computed = self.datafile.checksum();
        if computed != eof_checksum {
            self.checksum_failed = true;
            self.events.emit(
                EventSeverity::Warning,
                ETYPE_TRANSFER_FINISHED,
                &format!(
                    "TXID[{}] checksum mismatch: computed {:#010x}, EOF declared {:#010x}; \
                     saving the file flagged for inspection",
                    self.transaction_id, computed, eof_checksum
                ),
            );
            self.save_file();
            self.handle_fault(ConditionCode::FileChecksumFailure, now);
            return true;
        }
        if self.save_file() {
            self.events.emit(
                EventSeverity::Info,
                ETYPE_TRANSFER_FINISHED,
                &format!(
                    "TXID[{}] received {} ({} bytes)",
                    self.transaction_id,
                    self.saved_object.as_deref().unwrap_or("<unnamed>"),
                    self.datafile.received_size()
                ),
            );
            if self.needs_finished() {
                self.finish_with(FinishedPdu::success(), now);
            } else {
                self.complete_success();
            }
        } else {
            self.handle_fault(ConditionCode::FilestoreRejection, now);
        }
        true
    }

    fn save_file(&mut self) -> bool {
        let name = self
            .metadata
            .as_ref()
            .map(|m| m.dest_file_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("transfer_{}", self.transaction_id));
        let mut object_metadata = HashMap::new();
        object_metadata.insert(
            "sourceEntity".to_string(),
            self.header.source_id.to_string(),
        );
        object_metadata.insert(
            "transactionId".to_string(),
            self.transaction_id.to_string(),
        );
        if let Some(origin) = self
            .metadata
            .as_ref()
            .and_then(|m| m.originating_transaction_id())
        {
            object_metadata.insert("originatingTransactionId".to_string(), origin.to_string());
        }
        if self.checksum_failed {
            object_metadata.insert("checksumFailure".to_string(), "true".to_string());
        }
        match self.filestore.save_object(
            &self.bucket,
            &name,
            &self.datafile.assemble(),
            &object_metadata,
            false,
        ) {
            Ok(effective) => {
                self.saved_object = Some(effective);
                true
            }
            Err(e) => {
                log::warn!("TXID{} failed to save {}: {}", self.transaction_id, name, e);
                self.errors.push(format!("filestore rejected {}: {}", name, e));
                false
            }
        }
    }

    /// Whether this transfer concludes with a Finished/ACK handshake: always in acknowledged
    /// mode, and in unacknowledged mode when the metadata requested closure.
    fn needs_finished(&self) -> bool {
        self.acknowledged
            || self
                .metadata
                .as_ref()
                .map(|m| m.closure_requested)
                .unwrap_or(false)
    }

    fn send_nak(&mut self) {
        let mut requests: SmallVec<[SegmentRequest; 4]> = SmallVec::new();
        if self.metadata.is_none() {
            // The all-zero request asks for a metadata retransmission.
            requests.push(SegmentRequest::new(0, 0));
        }
        requests.extend(self.datafile.missing_chunks(self.eof.is_some()));
        if requests.is_empty() {
            return;
        }
        let scope_end = self
            .datafile
            .expected_size()
            .unwrap_or_else(|| self.datafile.end_of_data());
        self.send(PduPayload::Nak(NakPdu::new(0, scope_end as u32, requests)));
    }

    fn finish_with(&mut self, finished: FinishedPdu, now: Instant) {
        self.state = IncomingState::Fin;
        self.inactivity_timer.cancel();
        self.nak_timer.cancel();
        self.check_timer.cancel();
        self.sent_finished = Some(finished.clone());
        self.send(PduPayload::Finished(finished));
        self.fin_timer.start(now);
    }

    fn resend_finished(&mut self) {
        if let Some(finished) = self.sent_finished.clone() {
            log::debug!("TXID{} resending Finished", self.transaction_id);
            self.send(PduPayload::Finished(finished));
        }
    }

    /// Cancels the transfer. While suspended the cancellation is remembered and applied on
    /// resume instead of producing an immediate Finished.
    pub fn cancel(&mut self, condition: ConditionCode, now: Instant) {
        if self.lifecycle.is_terminal() || self.state == IncomingState::Fin {
            return;
        }
        if self.lifecycle == TransferState::Paused {
            self.deferred_cancel = Some(condition);
            return;
        }
        self.errors.push(format!("canceled with {:?}", condition));
        if self.needs_finished() {
            self.change_state(TransferState::Cancelling);
            let file_status = if self.saved_object.is_some() {
                FileStatus::Retained
            } else {
                FileStatus::DiscardedDeliberately
            };
            let finished = FinishedPdu::failure(condition, DeliveryCode::Incomplete, file_status)
                .with_fault_location(self.header.dest_id);
            self.finish_with(finished, now);
        } else {
            self.complete_failed(condition, "canceled");
        }
    }

    /// Routes a protocol fault through the configured fault handlers, honoring the current
    /// protocol state.
    pub fn handle_fault(&mut self, code: ConditionCode, now: Instant) {
        match self.state {
            IncomingState::Completed => {}
            IncomingState::Fin => {
                self.complete_failed(code, &format!("fault {:?} during Finished handshake", code))
            }
            IncomingState::ReceivingData => match self.fault_handlers.action_for(code) {
                FaultHandlingAction::Abandon => {
                    self.complete_failed(code, &format!("abandoned on {:?}", code))
                }
                FaultHandlingAction::Cancel => self.cancel(code, now),
                FaultHandlingAction::Suspend => self.suspend(),
            },
        }
    }

    /// Freezes the transfer and its timers. Idempotent.
    pub fn suspend(&mut self) {
        if self.lifecycle != TransferState::Running {
            return;
        }
        self.fin_timer.cancel();
        self.nak_timer.cancel();
        self.check_timer.cancel();
        self.inactivity_timer.cancel();
        self.change_state(TransferState::Paused);
    }

    /// Resumes a suspended transfer. A deferred cancellation is applied before anything
    /// else; otherwise the transfer re-triggers completion checking or resends Finished.
    pub fn resume(&mut self, now: Instant) {
        if self.lifecycle != TransferState::Paused {
            return;
        }
        self.change_state(TransferState::Running);
        if let Some(condition) = self.deferred_cancel.take() {
            self.cancel(condition, now);
            return;
        }
        match self.state {
            IncomingState::Fin => {
                self.resend_finished();
                self.fin_timer.start(now);
            }
            IncomingState::ReceivingData => {
                self.inactivity_timer.start(now);
                if self.eof.is_some() && !self.try_complete(now) {
                    if self.acknowledged {
                        self.send_nak();
                        self.nak_timer.start(now);
                    } else {
                        self.check_timer.start(now);
                    }
                }
            }
            IncomingState::Completed => {}
        }
    }

    fn send(&mut self, payload: PduPayload) {
        let pdu = CfdpPdu::new(self.header, payload);
        log::debug!("TXID{} sending {}", self.transaction_id, pdu);
        if let Err(e) = self.sender.send_pdu(self.transaction_id, &pdu.to_vec()) {
            log::warn!("TXID{} failed to send {}: {}", self.transaction_id, pdu, e);
        }
    }

    fn complete_success(&mut self) {
        self.state = IncomingState::Completed;
        self.cancel_timers();
        self.change_state(TransferState::Completed);
    }

    fn complete_failed(&mut self, condition: ConditionCode, reason: &str) {
        self.state = IncomingState::Completed;
        self.cancel_timers();
        self.errors.push(reason.to_string());
        self.events.emit(
            EventSeverity::Warning,
            ETYPE_TRANSFER_FINISHED,
            &format!(
                "TXID[{}] download failed with {:?}: {}",
                self.transaction_id, condition, reason
            ),
        );
        self.change_state(TransferState::Failed);
    }

    fn cancel_timers(&mut self) {
        self.nak_timer.cancel();
        self.fin_timer.cancel();
        self.check_timer.cancel();
        self.inactivity_timer.cancel();
    }

    fn change_state(&mut self, new_state: TransferState) {
        self.lifecycle = new_state;
        self.monitor.state_changed(&self.snapshot());
    }

}
