//! # CFDP source entity module
//!
//! The [OutgoingTransfer] state machine drives the sending side of one transaction: it
//! converts a [PutRequest] into the Metadata, FileData and EOF PDUs to be sent to the remote
//! entity, handles NAK-triggered retransmission and the EOF ACK / Finished handshake, and
//! composes suspend, resume and cancel with the in-flight timers.
//!
//! The transfer is driven by its sequencer through two entry points: the periodic
//! [OutgoingTransfer::tick], which polls the timers and generates at most one PDU per call
//! (giving natural flow control through the inter-PDU send delay), and
//! [OutgoingTransfer::handle_pdu] for inbound PDUs of the transaction. All methods take the
//! current time explicitly, so tests can step through timer expiries deterministically.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::checksum::checksum_segment;
use crate::pdu::tlv::{Tlv, FILESTORE_ACTION_CREATE_DIRECTORY};
use crate::pdu::{
    AckPdu, CfdpPdu, DirectiveType, Direction, EofPdu, FileDataPdu, FinishedPdu, MetadataPdu,
    PduHeader, PduPayload, SegmentRequest,
};
use crate::registry::{ETYPE_EOF_LIMIT_REACHED, ETYPE_TRANSFER_FINISHED};
use crate::timer::{Expiry, RetryTimer};
use crate::{
    CfdpConfig, ConditionCode, EventSeverity, EventSink, FaultHandlers, FaultHandlingAction,
    PduSender, TransactionId, TransferDirection, TransferMonitor, TransferSnapshot,
    TransferState, TransmissionMode,
};
use crate::request::PutRequest;

/// Protocol sub-state of the sending side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OutgoingState {
    Start,
    SendingData,
    Canceling,
    Completed,
}

pub struct OutgoingTransfer {
    id: u64,
    transaction_id: TransactionId,
    header: PduHeader,
    request: PutRequest,
    state: OutgoingState,
    lifecycle: TransferState,
    /// First-pass send cursor into the file content.
    offset: u64,
    max_data_size: usize,
    eof_sent: bool,
    eof_acked: bool,
    resend_metadata: bool,
    retransmission_queue: VecDeque<SegmentRequest>,
    eof_timer: RetryTimer,
    inactivity_timer: RetryTimer,
    cancel_condition: Option<ConditionCode>,
    fault_handlers: FaultHandlers,
    errors: Vec<String>,
    creation_time: SystemTime,
    sender: Arc<dyn PduSender>,
    events: Arc<dyn EventSink>,
    monitor: Arc<dyn TransferMonitor>,
}

impl OutgoingTransfer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        seq_num: u64,
        source_id: u64,
        destination_id: u64,
        request: PutRequest,
        config: &CfdpConfig,
        sender: Arc<dyn PduSender>,
        events: Arc<dyn EventSink>,
        monitor: Arc<dyn TransferMonitor>,
    ) -> Self {
        let transmission_mode = if request.acknowledged() {
            TransmissionMode::Acknowledged
        } else {
            TransmissionMode::Unacknowledged
        };
        let header = PduHeader {
            direction: Direction::TowardsReceiver,
            transmission_mode,
            crc_flag: false,
            large_file: false,
            entity_id_length: config.entity_id_length,
            seq_num_length: config.sequence_number_length,
            source_id,
            seq_num,
            dest_id: destination_id,
        };
        Self {
            id,
            transaction_id: TransactionId::new(source_id, seq_num),
            header,
            request,
            state: OutgoingState::Start,
            lifecycle: TransferState::Running,
            offset: 0,
            max_data_size: config.max_data_size(),
            eof_sent: false,
            eof_acked: false,
            resend_metadata: false,
            retransmission_queue: VecDeque::new(),
            eof_timer: RetryTimer::new(config.eof_ack_timeout, config.eof_ack_limit),
            inactivity_timer: RetryTimer::new(config.inactivity_timeout, 0),
            cancel_condition: None,
            fault_handlers: config.sender_fault_handlers.clone(),
            errors: Vec::new(),
            creation_time: SystemTime::now(),
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
            direction: TransferDirection::Upload,
            state: self.lifecycle,
            acknowledged: self.request.acknowledged(),
            transferred_bytes: self.offset,
            total_size: Some(self.request.file_size()),
            bucket: None,
            object_name: Some(self.request.object_name().to_string()),
            remote_path: Some(self.request.destination_path().to_string()),
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
        match (self.eof_timer.next_deadline(), self.inactivity_timer.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Periodic driver. Polls the timers, then generates at most one PDU.
    pub fn tick(&mut self, now: Instant) {
        self.poll_timers(now);
        if self.lifecycle != TransferState::Running
            && self.lifecycle != TransferState::Cancelling
        {
            return;
        }
        match self.state {
            OutgoingState::Start => {
                self.send_metadata();
                self.state = OutgoingState::SendingData;
                self.offset = 0;
            }
            OutgoingState::SendingData => self.sending_data_step(now),
            OutgoingState::Canceling | OutgoingState::Completed => {}
        }
    }

    fn sending_data_step(&mut self, now: Instant) {
        if self.resend_metadata {
            self.resend_metadata = false;
            self.send_metadata();
        } else if let Some(request) = self.retransmission_queue.pop_front() {
            let data = self.request.data()
                [request.start_offset as usize..request.end_offset as usize]
                .to_vec();
            self.send(PduPayload::FileData(FileDataPdu::new(
                request.start_offset as u32,
                data,
            )));
        } else if self.offset < self.request.file_size() {
            let end = (self.offset + self.max_data_size as u64).min(self.request.file_size());
            let data = self.request.data()[self.offset as usize..end as usize].to_vec();
            self.send(PduPayload::FileData(FileDataPdu::new(
                self.offset as u32,
                data,
            )));
            self.offset = end;
        } else if !self.eof_sent {
            self.send_eof();
            if !self.request.acknowledged() && !self.request.closure_requested() {
                self.complete_success();
            } else {
                self.eof_timer.start(now);
            }
        }
    }

    fn poll_timers(&mut self, now: Instant) {
        match self.eof_timer.poll(now) {
            Some(Expiry::Intermediate) => {
                log::debug!("TXID{} resending EOF", self.transaction_id);
                self.send_eof();
            }
            Some(Expiry::Final) => {
                self.events.emit(
                    EventSeverity::Warning,
                    ETYPE_EOF_LIMIT_REACHED,
                    &format!(
                        "TXID[{}] EOF ACK limit reached after {} attempts",
                        self.transaction_id,
                        self.eof_timer.attempts()
                    ),
                );
                if self.state == OutgoingState::Canceling {
                    self.complete_failed(
                        self.cancel_condition.unwrap_or(ConditionCode::AckLimitReached),
                        "EOF ACK limit reached while canceling",
                    );
                } else {
                    self.handle_fault(ConditionCode::AckLimitReached, now);
                }
            }
            None => {}
        }
        if let Some(Expiry::Final) = self.inactivity_timer.poll(now) {
            self.handle_fault(ConditionCode::InactivityDetected, now);
        }
    }

    /// Processes one inbound PDU of this transaction.
    pub fn handle_pdu(&mut self, pdu: &CfdpPdu, now: Instant) {
        match &pdu.payload {
            PduPayload::Ack(ack) => self.handle_ack(ack.acked_directive, now),
            PduPayload::Finished(finished) => self.handle_finished(finished.clone()),
            PduPayload::Nak(nak) => self.handle_nak(&nak.segment_requests),
            PduPayload::KeepAlive(keep_alive) => {
                log::debug!(
                    "TXID{} keep-alive, peer progress {}",
                    self.transaction_id,
                    keep_alive.progress
                );
            }
            other => {
                log::warn!(
                    "TXID{} unexpected {} PDU at the sending side, dropped",
                    self.transaction_id,
                    other.name()
                );
            }
        }
    }

    fn handle_ack(&mut self, acked: DirectiveType, now: Instant) {
        if acked != DirectiveType::Eof {
            log::warn!(
                "TXID{} unexpected ACK of {:?}, dropped",
                self.transaction_id,
                acked
            );
            return;
        }
        if !self.eof_sent {
            log::warn!("TXID{} EOF ACK before EOF was sent, dropped", self.transaction_id);
            return;
        }
        self.eof_timer.cancel();
        self.eof_acked = true;
        if self.state == OutgoingState::Canceling {
            self.complete_failed(
                self.cancel_condition.unwrap_or(ConditionCode::CancelRequestReceived),
                "canceled",
            );
        } else if self.state == OutgoingState::SendingData && self.is_ongoing() {
            // Only the wait for Finished is bounded by the inactivity watchdog.
            self.inactivity_timer.start(now);
        }
    }

    fn handle_finished(&mut self, finished: FinishedPdu) {
        // A Finished PDU is acknowledged unconditionally, also when it arrives again after
        // completion; the peer keeps resending it until the ACK gets through.
        self.send(PduPayload::Ack(AckPdu::for_finished(
            finished.condition,
            crate::pdu::ack::TransactionStatus::Terminated,
        )));
        if self.lifecycle.is_terminal() {
            return;
        }
        self.inactivity_timer.cancel();
        self.eof_timer.cancel();
        if finished.condition.is_success() {
            if !self.eof_sent {
                log::warn!(
                    "TXID{} Finished(NoError) before EOF was sent, dropped",
                    self.transaction_id
                );
                return;
            }
            self.complete_success();
        } else {
            self.complete_failed(
                finished.condition,
                &format!("peer finished with {:?}", finished.condition),
            );
        }
    }

    fn handle_nak(&mut self, requests: &[SegmentRequest]) {
        let file_size = self.request.file_size();
        for request in requests {
            if request.is_metadata_request() {
                self.resend_metadata = true;
                continue;
            }
            if request.end_offset > file_size || request.start_offset >= request.end_offset {
                log::warn!(
                    "TXID{} NAK for invalid range [{}, {}), dropped",
                    self.transaction_id,
                    request.start_offset,
                    request.end_offset
                );
                continue;
            }
            let mut start = request.start_offset;
            while start < request.end_offset {
                let end = (start + self.max_data_size as u64).min(request.end_offset);
                self.retransmission_queue.push_back(SegmentRequest::new(start, end));
                start = end;
            }
        }
    }

    /// Enters the cancel handshake: EOF with the cancel condition, a checksum over the bytes
    /// transferred so far, and a fault location naming this entity.
    pub fn cancel(&mut self, condition: ConditionCode, now: Instant) {
        if self.lifecycle.is_terminal() || self.state == OutgoingState::Canceling {
            return;
        }
        self.errors.push(format!("canceled with {:?}", condition));
        self.state = OutgoingState::Canceling;
        self.cancel_condition = Some(condition);
        self.change_state(TransferState::Cancelling);
        self.send_eof();
        self.eof_timer.start(now);
    }

    /// Routes a protocol fault through the configured fault handlers.
    pub fn handle_fault(&mut self, code: ConditionCode, now: Instant) {
        if self.lifecycle.is_terminal() {
            return;
        }
        if self.state == OutgoingState::Canceling {
            self.complete_failed(code, &format!("fault {:?} while canceling", code));
            return;
        }
        match self.fault_handlers.action_for(code) {
            FaultHandlingAction::Abandon => {
                self.complete_failed(code, &format!("abandoned on {:?}", code))
            }
            FaultHandlingAction::Cancel => self.cancel(code, now),
            FaultHandlingAction::Suspend => self.suspend(),
        }
    }

    /// Freezes the transfer: no sends, no timer expiries. Idempotent.
    pub fn suspend(&mut self) {
        if self.lifecycle != TransferState::Running {
            return;
        }
        self.eof_timer.cancel();
        self.inactivity_timer.cancel();
        self.change_state(TransferState::Paused);
    }

    /// Resumes a suspended transfer. If the EOF ACK is still outstanding the EOF is resent
    /// immediately. Resuming a running transfer is a no-op.
    pub fn resume(&mut self, now: Instant) {
        if self.lifecycle != TransferState::Paused {
            return;
        }
        self.change_state(if self.state == OutgoingState::Canceling {
            TransferState::Cancelling
        } else {
            TransferState::Running
        });
        if self.eof_sent && !self.eof_acked {
            self.send_eof();
            self.eof_timer.start(now);
        }
    }

    fn send_metadata(&mut self) {
        let mut metadata = MetadataPdu::new(
            self.request.closure_requested(),
            self.request.file_size() as u32,
            self.request.object_name().to_string(),
            self.request.destination_path().to_string(),
        );
        // A request allowed to create the target directory asks the remote filestore for it.
        if self.request.create_path() {
            if let Some((parent, _)) = self.request.destination_path().rsplit_once('/') {
                if !parent.is_empty() {
                    metadata
                        .options
                        .push(Tlv::filestore_request(FILESTORE_ACTION_CREATE_DIRECTORY, parent));
                }
            }
        }
        self.send(PduPayload::Metadata(metadata));
    }

    fn send_eof(&mut self) {
        let eof = match self.cancel_condition {
            Some(condition) => {
                let progress = self.offset.min(self.request.file_size());
                EofPdu::new(
                    condition,
                    checksum_segment(&self.request.data()[..progress as usize], 0),
                    progress as u32,
                )
                .with_fault_location(self.header.source_id)
            }
            None => EofPdu::new(
                ConditionCode::NoError,
                self.request.checksum(),
                self.request.file_size() as u32,
            ),
        };
        self.send(PduPayload::Eof(eof));
        self.eof_sent = true;
    }

    fn send(&mut self, payload: PduPayload) {
        let pdu = CfdpPdu::new(self.header, payload);
        log::debug!("TXID{} sending {}", self.transaction_id, pdu);
        if let Err(e) = self.sender.send_pdu(self.transaction_id, &pdu.to_vec()) {
            log::warn!("TXID{} failed to send {}: {}", self.transaction_id, pdu, e);
        }
    }

    fn complete_success(&mut self) {
        self.state = OutgoingState::Completed;
        self.cancel_timers();
        self.events.emit(
            EventSeverity::Info,
            ETYPE_TRANSFER_FINISHED,
            &format!(
                "TXID[{}] upload of {} finished successfully",
                self.transaction_id,
                self.request.object_name()
            ),
        );
        self.change_state(TransferState::Completed);
    }

    fn complete_failed(&mut self, condition: ConditionCode, reason: &str) {
        self.state = OutgoingState::Completed;
        self.cancel_timers();
        self.errors.push(reason.to_string());
        self.events.emit(
            EventSeverity::Warning,
            ETYPE_TRANSFER_FINISHED,
            &format!(
                "TXID[{}] upload of {} failed with {:?}: {}",
                self.transaction_id,
                self.request.object_name(),
                condition,
                reason
            ),
        );
        self.change_state(TransferState::Failed);
    }

    fn cancel_timers(&mut self) {
        self.eof_timer.cancel();
        self.inactivity_timer.cancel();
    }

    fn change_state(&mut self, new_state: TransferState) {
        self.lifecycle = new_state;
        self.monitor.state_changed(&self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingEvents, RecordingMonitor, RecordingSender};
    use std::time::Duration;

    struct Fixture {
        transfer: OutgoingTransfer,
        sender: Arc<RecordingSender>,
        events: Arc<RecordingEvents>,
        monitor: Arc<RecordingMonitor>,
        config: CfdpConfig,
        now: Instant,
    }

    fn fixture(request: PutRequest) -> Fixture {
        // 16 byte overhead (12 byte header plus the 4 byte file data offset) on a 20 byte
        // PDU leaves 4 bytes of file data per PDU.
        let config = CfdpConfig {
            max_pdu_size: 20,
            ..CfdpConfig::default()
        };
        assert_eq!(config.max_data_size(), 4);
        let sender = Arc::new(RecordingSender::default());
        let events = Arc::new(RecordingEvents::default());
        let monitor = Arc::new(RecordingMonitor::default());
        let transfer = OutgoingTransfer::new(
            1,
            7,
            23,
            5,
            request,
            &config,
            sender.clone(),
            events.clone(),
            monitor.clone(),
        );
        Fixture {
            transfer,
            sender,
            events,
            monitor,
            config,
            now: Instant::now(),
        }
    }

    fn ten_byte_request(acknowledged: bool) -> PutRequest {
        PutRequest::new(
            "ground",
            "spacecraft",
            "ten.bin",
            "/down/ten.bin",
            (0..10).collect(),
        )
        .unwrap()
        .with_acknowledged(acknowledged)
    }

    #[test]
    fn create_path_request_asks_for_the_target_directory() {
        let mut f = fixture(ten_byte_request(true).with_create_path(true));
        f.transfer.tick(f.now);
        let sent = f.sender.take();
        match &sent[0].payload {
            PduPayload::Metadata(m) => {
                assert_eq!(
                    m.options[0].as_filestore_request(),
                    Some((FILESTORE_ACTION_CREATE_DIRECTORY, "/down".to_string()))
                );
            }
            other => panic!("expected Metadata, got {}", other.name()),
        }
        // Without the flag the metadata carries no filestore request.
        let mut f = fixture(ten_byte_request(true));
        f.transfer.tick(f.now);
        let sent = f.sender.take();
        match &sent[0].payload {
            PduPayload::Metadata(m) => assert!(m.options.is_empty()),
            other => panic!("expected Metadata, got {}", other.name()),
        }
    }

    fn tick_n(f: &mut Fixture, n: usize) {
        for _ in 0..n {
            f.transfer.tick(f.now);
        }
    }

    /// Header of PDUs the peer sends back to this transfer.
    fn reply_header() -> PduHeader {
        PduHeader {
            direction: Direction::TowardsSender,
            transmission_mode: TransmissionMode::Acknowledged,
            crc_flag: false,
            large_file: false,
            entity_id_length: 2,
            seq_num_length: 4,
            source_id: 23,
            seq_num: 7,
            dest_id: 5,
        }
    }

    #[test]
    fn unacknowledged_ten_byte_sequence() {
        let mut f = fixture(ten_byte_request(false));
        tick_n(&mut f, 5);
        let sent = f.sender.take();
        assert_eq!(sent.len(), 5);
        match &sent[0].payload {
            PduPayload::Metadata(m) => {
                assert_eq!(m.file_size, 10);
                assert_eq!(m.source_file_name, "ten.bin");
                assert!(!m.closure_requested);
            }
            other => panic!("expected Metadata, got {}", other.name()),
        }
        let expected_segments = [(0_u32, vec![0, 1, 2, 3]), (4, vec![4, 5, 6, 7]), (8, vec![8, 9])];
        for (pdu, (offset, data)) in sent[1..4].iter().zip(expected_segments) {
            match &pdu.payload {
                PduPayload::FileData(fd) => {
                    assert_eq!(fd.offset, offset);
                    assert_eq!(fd.data, data);
                }
                other => panic!("expected FileData, got {}", other.name()),
            }
        }
        match &sent[4].payload {
            PduPayload::Eof(eof) => {
                assert_eq!(eof.condition, ConditionCode::NoError);
                assert_eq!(eof.file_size, 10);
                assert_eq!(eof.checksum, crate::checksum::checksum(&(0..10).collect::<Vec<u8>>()));
            }
            other => panic!("expected EOF, got {}", other.name()),
        }
        // No ACK required; the transfer completes as soon as EOF goes out.
        assert_eq!(f.transfer.lifecycle(), TransferState::Completed);
        // Further ticks stay silent.
        tick_n(&mut f, 3);
        assert!(f.sender.take().is_empty());
        assert_eq!(
            f.monitor.states.lock().unwrap().last().unwrap().state,
            TransferState::Completed
        );
    }

    #[test]
    fn acknowledged_flow_awaits_ack_and_finished() {
        let mut f = fixture(ten_byte_request(true));
        tick_n(&mut f, 5);
        assert_eq!(f.sender.take().len(), 5);
        // EOF is out, the transfer stays active awaiting the ACK.
        assert_eq!(f.transfer.lifecycle(), TransferState::Running);
        let header = reply_header();
        f.transfer.handle_pdu(
            &CfdpPdu::new(header, PduPayload::Ack(AckPdu::for_eof(ConditionCode::NoError))),
            f.now,
        );
        // The EOF ACK alone does not complete the transfer.
        assert_eq!(f.transfer.lifecycle(), TransferState::Running);
        f.transfer.handle_pdu(
            &CfdpPdu::new(header, PduPayload::Finished(FinishedPdu::success())),
            f.now,
        );
        assert_eq!(f.transfer.lifecycle(), TransferState::Completed);
        let sent = f.sender.take();
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            PduPayload::Ack(ack) => {
                assert_eq!(ack.acked_directive, DirectiveType::Finished);
                assert_eq!(ack.condition, ConditionCode::NoError);
            }
            other => panic!("expected ACK, got {}", other.name()),
        }
    }

    #[test]
    fn late_finished_is_still_acknowledged() {
        let mut f = fixture(ten_byte_request(true));
        tick_n(&mut f, 5);
        let header = reply_header();
        f.sender.take();
        let finished = CfdpPdu::new(header, PduPayload::Finished(FinishedPdu::success()));
        f.transfer.handle_pdu(&finished, f.now);
        assert_eq!(f.transfer.lifecycle(), TransferState::Completed);
        f.sender.take();
        // The peer did not see our ACK and resends Finished after completion.
        f.transfer.handle_pdu(&finished, f.now);
        let sent = f.sender.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].payload, PduPayload::Ack(_)));
        assert_eq!(f.transfer.lifecycle(), TransferState::Completed);
    }

    #[test]
    fn nak_triggers_retransmission_and_metadata_resend() {
        let mut f = fixture(ten_byte_request(true));
        tick_n(&mut f, 5);
        f.sender.take();
        let header = reply_header();
        let nak = crate::pdu::NakPdu::new(
            0,
            10,
            smallvec::smallvec![SegmentRequest::new(0, 0), SegmentRequest::new(2, 8)],
        );
        f.transfer.handle_pdu(&CfdpPdu::new(header, PduPayload::Nak(nak)), f.now);
        tick_n(&mut f, 3);
        let sent = f.sender.take();
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[0].payload, PduPayload::Metadata(_)));
        // The 6 byte range is split at the 4 byte data size limit.
        match (&sent[1].payload, &sent[2].payload) {
            (PduPayload::FileData(a), PduPayload::FileData(b)) => {
                assert_eq!((a.offset, a.data.as_slice()), (2, &[2, 3, 4, 5][..]));
                assert_eq!((b.offset, b.data.as_slice()), (6, &[6, 7][..]));
            }
            _ => panic!("expected two FileData PDUs"),
        }
    }

    #[test]
    fn eof_retry_and_ack_limit_fault() {
        let mut f = fixture(ten_byte_request(true));
        tick_n(&mut f, 5);
        f.sender.take();
        // Each elapsed EOF ACK interval produces one resend.
        for i in 1..=f.config.eof_ack_limit {
            f.transfer.tick(f.now + i as u32 * f.config.eof_ack_timeout);
        }
        let sent = f.sender.take();
        assert_eq!(sent.len(), f.config.eof_ack_limit as usize);
        assert!(sent.iter().all(|p| matches!(&p.payload, PduPayload::Eof(_))));
        // The next expiry exhausts the budget; default fault action is cancel, which sends
        // an EOF carrying the fault condition.
        f.transfer.tick(f.now + 6 * f.config.eof_ack_timeout);
        assert_eq!(f.transfer.lifecycle(), TransferState::Cancelling);
        let sent = f.sender.take();
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            PduPayload::Eof(eof) => {
                assert_eq!(eof.condition, ConditionCode::AckLimitReached);
                assert_eq!(eof.fault_location, Some(23));
            }
            other => panic!("expected EOF, got {}", other.name()),
        }
        assert!(f.events.contains(ETYPE_EOF_LIMIT_REACHED));
    }

    #[test]
    fn abandon_fault_action_fails_without_handshake() {
        let mut f = fixture(ten_byte_request(true));
        f.transfer.fault_handlers.set(
            ConditionCode::AckLimitReached,
            FaultHandlingAction::Abandon,
        );
        tick_n(&mut f, 5);
        f.sender.take();
        for i in 1..=6_u32 {
            f.transfer.tick(f.now + i * f.config.eof_ack_timeout);
        }
        assert_eq!(f.transfer.lifecycle(), TransferState::Failed);
        // Resends only, no cancel EOF.
        let sent = f.sender.take();
        assert!(sent
            .iter()
            .all(|p| matches!(&p.payload, PduPayload::Eof(e) if e.condition == ConditionCode::NoError)));
    }

    #[test]
    fn cancel_sends_eof_with_progress_checksum() {
        let mut f = fixture(ten_byte_request(true));
        // Metadata plus one segment, 4 bytes transferred.
        tick_n(&mut f, 2);
        f.sender.take();
        f.transfer.cancel(ConditionCode::CancelRequestReceived, f.now);
        assert_eq!(f.transfer.lifecycle(), TransferState::Cancelling);
        let sent = f.sender.take();
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            PduPayload::Eof(eof) => {
                assert_eq!(eof.condition, ConditionCode::CancelRequestReceived);
                assert_eq!(eof.file_size, 4);
                assert_eq!(eof.checksum, checksum_segment(&[0, 1, 2, 3], 0));
                assert_eq!(eof.fault_location, Some(23));
            }
            other => panic!("expected EOF, got {}", other.name()),
        }
        // The ACK for the cancel EOF terminates the transfer as failed.
        let header = reply_header();
        f.transfer.handle_pdu(
            &CfdpPdu::new(
                header,
                PduPayload::Ack(AckPdu::for_eof(ConditionCode::CancelRequestReceived)),
            ),
            f.now,
        );
        assert_eq!(f.transfer.lifecycle(), TransferState::Failed);
    }

    #[test]
    fn suspend_freezes_and_resume_resends_outstanding_eof() {
        let mut f = fixture(ten_byte_request(true));
        tick_n(&mut f, 5);
        f.sender.take();
        f.transfer.suspend();
        assert_eq!(f.transfer.lifecycle(), TransferState::Paused);
        // Suspending again is a no-op.
        f.transfer.suspend();
        assert_eq!(f.transfer.lifecycle(), TransferState::Paused);
        // No sends and no timer firings while paused, even long past the EOF deadline.
        f.transfer.tick(f.now + 100 * f.config.eof_ack_timeout);
        assert!(f.sender.take().is_empty());
        f.transfer.resume(f.now);
        assert_eq!(f.transfer.lifecycle(), TransferState::Running);
        let sent = f.sender.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].payload, PduPayload::Eof(_)));
        // Resuming a running transfer neither changes state nor resends.
        f.transfer.resume(f.now);
        assert!(f.sender.take().is_empty());
    }

    #[test]
    fn inactivity_after_eof_ack_is_a_fault() {
        let mut f = fixture(ten_byte_request(true));
        tick_n(&mut f, 5);
        let header = reply_header();
        f.transfer.handle_pdu(
            &CfdpPdu::new(header, PduPayload::Ack(AckPdu::for_eof(ConditionCode::NoError))),
            f.now,
        );
        f.sender.take();
        f.transfer.tick(f.now + f.config.inactivity_timeout + Duration::from_millis(1));
        // Default action cancels, so a cancel EOF with InactivityDetected goes out.
        assert_eq!(f.transfer.lifecycle(), TransferState::Cancelling);
        let sent = f.sender.take();
        assert!(
            matches!(&sent[0].payload, PduPayload::Eof(e) if e.condition == ConditionCode::InactivityDetected)
        );
    }
}
