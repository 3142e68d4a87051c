//! Transmit and receive transactions.
//!
//! Transmit: `Init -> Validated -> Broadcasting -> Done`. The message is
//! validated outside the lock, then the route lookup, buffer allocation, copy
//! and fan-out happen in one locked section. Each destination gets a
//! reference to the same buffer; a full or over-limit pipe only affects that
//! destination.
//!
//! Receive: `Init -> Waiting -> Dequeued -> Done`. The wait on the pipe's
//! queue runs with the global lock released. A received buffer stays valid
//! until the same pipe is read again.
//!
//! Either may end in `Failed` from any state short of `Done`.

use crate::bus::{BusState, SoftwareBus};
use crate::error::{BusError, Result};
use crate::events::{defer, event_ids, BusEvent, EventSeverity, PendingEvents};
use crate::header::MessageHeader;
use crate::ids::{AppId, BufferHandle, MsgId, PipeId};
use crate::pipe::OverflowPolicy;
use crate::queue::{QueueError, QueueHandle, QueueService, Timeout};
use crate::route::DestinationIndices;
use crate::telemetry::{bump, encode_packet};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Init,
    Validated,
    Broadcasting,
    Waiting,
    Dequeued,
    Done,
    Failed,
}

impl TxnState {
    pub fn can_advance_to(self, next: Self) -> bool {
        match next {
            Self::Failed => !matches!(self, Self::Done | Self::Failed),
            _ => matches!(
                (self, next),
                (Self::Init, Self::Validated | Self::Waiting)
                    | (Self::Validated, Self::Broadcasting)
                    | (Self::Broadcasting, Self::Done)
                    | (Self::Waiting, Self::Dequeued | Self::Done)
                    | (Self::Dequeued, Self::Done)
            ),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Transaction {
    state: TxnState,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            state: TxnState::Init,
        }
    }

    pub(crate) fn state(&self) -> TxnState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: TxnState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transaction step {:?} -> {next:?}",
            self.state
        );
        trace!(from = ?self.state, to = ?next, "transaction");
        self.state = next;
    }

    pub(crate) fn fail(&mut self, err: BusError) -> BusError {
        self.advance(TxnState::Failed);
        err
    }
}

/// Outcome of a transmit that reached the broadcast stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitReport {
    pub msg_id: MsgId,
    /// No route, or a route with no destinations. Not an error.
    pub no_subscribers: bool,
    pub delivered: u16,
    /// Discarded at a full pipe whose policy is [`OverflowPolicy::Drop`].
    pub dropped: u16,
    pub failed: u16,
}

impl TransmitReport {
    pub const fn new(msg_id: MsgId) -> Self {
        Self {
            msg_id,
            no_subscribers: false,
            delivered: 0,
            dropped: 0,
            failed: 0,
        }
    }

    pub const fn without_subscribers(msg_id: MsgId) -> Self {
        let mut report = Self::new(msg_id);
        report.no_subscribers = true;
        report
    }

    pub fn attempted(&self) -> u16 {
        self.delivered + self.dropped + self.failed
    }

    /// At least one destination was tried and none took the message.
    pub fn all_failed(&self) -> bool {
        self.failed > 0 && self.failed == self.attempted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub buffer: BufferHandle,
    pub msg_id: MsgId,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Message(ReceivedMessage),
    /// Polled an empty pipe.
    NoMessage,
    TimedOut,
}

impl Received {
    pub fn message(self) -> Option<ReceivedMessage> {
        match self {
            Self::Message(message) => Some(message),
            Self::NoMessage | Self::TimedOut => None,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message(_))
    }
}

/// A pool buffer the caller fills in place and then transmits or releases.
///
/// Not `Clone`: transmitting or releasing consumes it. A buffer that is
/// simply dropped stays allocated until its application is cleaned up.
#[derive(Debug)]
#[must_use]
pub struct ZeroCopyBuffer {
    handle: BufferHandle,
    owner: AppId,
    size: usize,
}

impl ZeroCopyBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn owner(&self) -> AppId {
        self.owner
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Read routing fields from an outgoing message and check them.
pub(crate) fn parse_outgoing(
    header: &dyn MessageHeader,
    message: &[u8],
    highest_valid_msg_id: u32,
    max_msg_size: usize,
) -> Result<(MsgId, usize)> {
    let msg_id = header.msg_id(message)?;
    if !msg_id.is_valid(highest_valid_msg_id) {
        return Err(BusError::InvalidMsgId(msg_id));
    }
    let size = header.size(message)?;
    if size > max_msg_size {
        return Err(BusError::MsgTooBig {
            size,
            max: max_msg_size,
        });
    }
    if size > message.len() {
        return Err(BusError::BadArgument("message shorter than its header length"));
    }
    Ok((msg_id, size))
}

impl BusState {
    pub(crate) fn has_subscribers(&self, msg_id: MsgId) -> bool {
        self.routes
            .lookup(msg_id)
            .and_then(|route| self.routes.route(route))
            .is_some_and(|route| route.destination_count() > 0)
    }

    fn note_no_subscribers(
        &mut self,
        msg_id: MsgId,
        sender: Option<AppId>,
        events: &mut PendingEvents,
    ) {
        bump(&mut self.counters.no_subscribers_counter);
        defer(
            events,
            BusEvent::new(
                event_ids::SEND_NO_SUBS,
                EventSeverity::Information,
                format!("No subscribers for message {msg_id}"),
            )
            .with_app(sender),
        );
    }

    pub(crate) fn note_send_failure(
        &mut self,
        err: &BusError,
        sender: Option<AppId>,
        events: &mut PendingEvents,
    ) {
        let id = match err {
            BusError::InvalidMsgId(_) => event_ids::SEND_INV_MSGID,
            BusError::MsgTooBig { .. } => event_ids::MSG_TOO_BIG,
            BusError::BufferAllocFailed(_) => event_ids::GET_BUF_ERR,
            _ => event_ids::SEND_BAD_ARG,
        };
        bump(&mut self.counters.msg_send_error_counter);
        defer(
            events,
            BusEvent::new(id, EventSeverity::Error, format!("Transmit failed: {err}"))
                .with_app(sender),
        );
    }

    fn stamp_sequence(&mut self, header: &dyn MessageHeader, msg_id: MsgId, buffer: BufferHandle) {
        let Some(route) = self.routes.lookup(msg_id) else {
            return;
        };
        let sequence = self.routes.next_sequence(route);
        if let Ok(content) = self.pool.content_mut(buffer) {
            let _ = header.set_sequence_count(content, sequence);
        }
    }

    /// Fan `buffer` out to every active destination of `msg_id`, then drop
    /// the transmitter's own reference.
    pub(crate) fn broadcast(
        &mut self,
        queues: &dyn QueueService,
        msg_id: MsgId,
        buffer: BufferHandle,
        sender: Option<AppId>,
        events: &mut PendingEvents,
    ) -> TransmitReport {
        let mut report = TransmitReport::new(msg_id);
        let _ = self.pool.mark_in_transit(buffer);

        let destinations = match self.routes.lookup(msg_id) {
            Some(route) => self.routes.destination_indices(route),
            None => DestinationIndices::new(),
        };
        if destinations.is_empty() {
            report.no_subscribers = true;
            self.note_no_subscribers(msg_id, sender, events);
        }

        for index in destinations {
            let Some(destination) = self.routes.destination_mut(index) else {
                continue;
            };
            if !destination.active {
                continue;
            }
            let Some(pipe) = self.pipes.locate_mut(destination.pipe_id) else {
                continue;
            };
            if pipe.options.ignore_mine && sender == Some(pipe.owner) {
                continue;
            }

            if destination.buff_count >= destination.msg_limit {
                pipe.note_send_error();
                bump(&mut self.counters.msg_limit_error_counter);
                report.failed += 1;
                defer(
                    events,
                    BusEvent::new(
                        event_ids::MSGID_LIM_ERR,
                        EventSeverity::Error,
                        format!(
                            "Message limit {} reached for {msg_id} on '{}' ({})",
                            destination.msg_limit, pipe.name, pipe.pipe_id
                        ),
                    )
                    .with_app(sender),
                );
                continue;
            }

            match queues.put(pipe.queue, buffer) {
                Ok(()) => {
                    let _ = self.pool.incr_use_count(buffer);
                    destination.buff_count = destination.buff_count.saturating_add(1);
                    destination.dest_count = destination.dest_count.wrapping_add(1);
                    pipe.note_enqueued();
                    report.delivered += 1;
                }
                Err(QueueError::Full) => match pipe.options.overflow {
                    OverflowPolicy::Report => {
                        pipe.note_send_error();
                        bump(&mut self.counters.pipe_overflow_error_counter);
                        report.failed += 1;
                        defer(
                            events,
                            BusEvent::new(
                                event_ids::Q_FULL_ERR,
                                EventSeverity::Error,
                                format!(
                                    "Pipe '{}' ({}) full, {msg_id} not delivered",
                                    pipe.name, pipe.pipe_id
                                ),
                            )
                            .with_app(sender),
                        );
                    }
                    OverflowPolicy::Drop => {
                        pipe.overflow_drops = pipe.overflow_drops.saturating_add(1);
                        bump(&mut self.counters.pipe_overflow_drop_counter);
                        report.dropped += 1;
                        defer(
                            events,
                            BusEvent::new(
                                event_ids::Q_FULL_DROP,
                                EventSeverity::Debug,
                                format!(
                                    "Pipe '{}' ({}) full, {msg_id} dropped",
                                    pipe.name, pipe.pipe_id
                                ),
                            )
                            .with_app(sender),
                        );
                    }
                },
                Err(cause) => {
                    pipe.note_send_error();
                    bump(&mut self.counters.internal_error_counter);
                    report.failed += 1;
                    defer(
                        events,
                        BusEvent::new(
                            event_ids::Q_WR_ERR,
                            EventSeverity::Error,
                            format!(
                                "Queue write to '{}' ({}) failed for {msg_id}: {cause}",
                                pipe.name, pipe.pipe_id
                            ),
                        )
                        .with_app(sender),
                    );
                }
            }
        }

        if report.failed > 0 {
            bump(&mut self.counters.msg_send_error_counter);
        }
        let _ = self.pool.decr_use_count(buffer);
        report
    }

    /// Validate the pipe and release the buffer its previous read returned.
    fn begin_receive(&mut self, pipe_id: PipeId, events: &mut PendingEvents) -> Result<QueueHandle> {
        let Some(pipe) = self.pipes.locate_mut(pipe_id) else {
            bump(&mut self.counters.msg_receive_error_counter);
            defer(
                events,
                BusEvent::new(
                    event_ids::BAD_PIPEID,
                    EventSeverity::Error,
                    format!("Receive: {pipe_id} does not exist"),
                ),
            );
            return Err(BusError::InvalidPipe(pipe_id));
        };
        let queue = pipe.queue;
        if let Some(last) = pipe.last_buffer.take() {
            let _ = self.pool.decr_use_count(last);
        }
        Ok(queue)
    }

    fn finish_receive(
        &mut self,
        pipe_id: PipeId,
        queue: QueueHandle,
        dequeued: core::result::Result<BufferHandle, QueueError>,
        events: &mut PendingEvents,
    ) -> Result<Received> {
        let buffer = match dequeued {
            Ok(buffer) => buffer,
            Err(QueueError::Empty) => return Ok(Received::NoMessage),
            Err(QueueError::TimedOut) => return Ok(Received::TimedOut),
            Err(cause) => return Err(self.receive_failure(pipe_id, cause, events)),
        };

        let pipe = self
            .pipes
            .locate_mut(pipe_id)
            .filter(|pipe| pipe.queue == queue);
        let Some(pipe) = pipe else {
            // pipe deleted while we waited; drop the queue's reference
            let _ = self.pool.decr_use_count(buffer);
            return Err(self.receive_failure(pipe_id, QueueError::Deleted, events));
        };

        // the queue's reference becomes the pipe's lookahead reference; an
        // overlapping reader on the same pipe may have parked one already
        if let Some(previous) = pipe.last_buffer.replace(buffer) {
            let _ = self.pool.decr_use_count(previous);
        }
        pipe.note_dequeued();

        let msg_id = self.pool.msg_id(buffer).unwrap_or(MsgId::new(0));
        let size = self.pool.content(buffer).map_or(0, <[u8]>::len);
        let destination = self
            .routes
            .lookup(msg_id)
            .and_then(|route| self.routes.find_destination(route, pipe_id));
        if let Some(destination) = destination.and_then(|index| self.routes.destination_mut(index)) {
            destination.buff_count = destination.buff_count.saturating_sub(1);
        }

        Ok(Received::Message(ReceivedMessage {
            buffer,
            msg_id,
            size,
        }))
    }

    fn receive_failure(
        &mut self,
        pipe_id: PipeId,
        cause: QueueError,
        events: &mut PendingEvents,
    ) -> BusError {
        bump(&mut self.counters.internal_error_counter);
        defer(
            events,
            BusEvent::new(
                event_ids::Q_RD_ERR,
                EventSeverity::Error,
                format!("Receive from {pipe_id} failed: {cause}"),
            ),
        );
        BusError::PipeReadError {
            pipe: pipe_id,
            cause,
        }
    }
}

impl SoftwareBus {
    /// Copy `message` into a pool buffer and deliver it to every subscriber.
    pub fn transmit_msg(&self, message: &[u8], increment_sequence: bool) -> Result<TransmitReport> {
        let mut txn = Transaction::new();
        let sender = self.identity.current_app_id().ok();

        let parsed = parse_outgoing(
            &*self.header,
            message,
            self.config.highest_valid_msg_id,
            self.config.max_msg_size,
        );
        let (msg_id, size) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                self.locked(|state, events| state.note_send_failure(&err, sender, events));
                return Err(txn.fail(err));
            }
        };
        txn.advance(TxnState::Validated);

        let outcome = self.locked(|state, events| {
            txn.advance(TxnState::Broadcasting);
            if !state.has_subscribers(msg_id) {
                state.note_no_subscribers(msg_id, sender, events);
                return Ok(TransmitReport::without_subscribers(msg_id));
            }

            let buffer = match state.pool.get_buffer(size) {
                Ok(buffer) => buffer,
                Err(err) => {
                    state.note_send_failure(&err, sender, events);
                    return Err(err);
                }
            };
            if let Ok(content) = state.pool.content_mut(buffer) {
                content.copy_from_slice(&message[..size]);
            }
            if increment_sequence {
                state.stamp_sequence(&*self.header, msg_id, buffer);
            }
            let _ = state.pool.set_msg_id(buffer, msg_id);
            Ok(state.broadcast(&*self.queues, msg_id, buffer, sender, events))
        });

        finish_transmit(txn, outcome)
    }

    /// Deliver a filled zero-copy buffer. The buffer is consumed either way;
    /// if it fails validation it goes back to the pool.
    pub fn transmit_buffer(
        &self,
        buffer: ZeroCopyBuffer,
        increment_sequence: bool,
    ) -> Result<TransmitReport> {
        let mut txn = Transaction::new();
        let sender = self.identity.current_app_id().ok();
        let ZeroCopyBuffer { handle, owner, .. } = buffer;

        let outcome = self.locked(|state, events| {
            if state.pool.validate_zero_copy(handle).ok() != Some(owner) {
                let err = BusError::BufferInvalid(handle);
                state.note_send_failure(&err, sender, events);
                return Err(err);
            }

            let parsed = state.pool.content(handle).and_then(|content| {
                parse_outgoing(
                    &*self.header,
                    content,
                    state.config.highest_valid_msg_id,
                    state.config.max_msg_size,
                )
            });
            let (msg_id, size) = match parsed {
                Ok(parsed) => parsed,
                Err(err) => {
                    let _ = state.pool.release_zero_copy(handle);
                    state.note_send_failure(&err, sender, events);
                    return Err(err);
                }
            };
            txn.advance(TxnState::Validated);
            txn.advance(TxnState::Broadcasting);

            let _ = state.pool.truncate_content(handle, size);
            if increment_sequence {
                state.stamp_sequence(&*self.header, msg_id, handle);
            }
            let _ = state.pool.set_msg_id(handle, msg_id);
            Ok(state.broadcast(&*self.queues, msg_id, handle, sender, events))
        });

        finish_transmit(txn, outcome)
    }

    /// Encode `record` as a telemetry packet and transmit it.
    pub fn transmit_telemetry<T: Serialize>(
        &self,
        msg_id: MsgId,
        record: &T,
    ) -> Result<TransmitReport> {
        let packet = encode_packet(&*self.header, msg_id, record)?;
        self.transmit_msg(&packet, true)
    }

    pub fn receive_buffer(&self, pipe_id: PipeId, timeout: Timeout) -> Result<Received> {
        let mut txn = Transaction::new();

        let queue = match self.locked(|state, events| state.begin_receive(pipe_id, events)) {
            Ok(queue) => queue,
            Err(err) => return Err(txn.fail(err)),
        };

        txn.advance(TxnState::Waiting);
        let dequeued = self.queues.get(queue, timeout);

        let outcome = self
            .locked(|state, events| state.finish_receive(pipe_id, queue, dequeued, events));
        match outcome {
            Ok(received) => {
                if received.is_message() {
                    txn.advance(TxnState::Dequeued);
                }
                txn.advance(TxnState::Done);
                Ok(received)
            }
            Err(err) => Err(txn.fail(err)),
        }
    }

    /// Receive with a raw timeout: `-1` pends forever, `0` polls, `>0` is milliseconds.
    pub fn receive_buffer_raw(&self, pipe_id: PipeId, timeout: i32) -> Result<Received> {
        match Timeout::from_raw(timeout) {
            Some(timeout) => self.receive_buffer(pipe_id, timeout),
            None => {
                self.locked(|state, events| {
                    bump(&mut state.counters.msg_receive_error_counter);
                    defer(
                        events,
                        BusEvent::new(
                            event_ids::RCV_BAD_ARG,
                            EventSeverity::Error,
                            format!("Receive: bad timeout {timeout} for {pipe_id}"),
                        ),
                    );
                });
                Err(BusError::BadArgument("timeout must be -1, 0 or positive"))
            }
        }
    }

    /// Allocate a buffer of `size` bytes for the calling application to fill.
    pub fn allocate_message_buffer(&self, size: usize) -> Result<ZeroCopyBuffer> {
        let owner = self.caller()?;
        self.locked(|state, events| match state.pool.allocate_zero_copy(size, owner) {
            Ok(handle) => Ok(ZeroCopyBuffer {
                handle,
                owner,
                size,
            }),
            Err(err) => {
                defer(
                    events,
                    BusEvent::new(
                        event_ids::GET_BUF_ERR,
                        EventSeverity::Error,
                        format!("Zero-copy allocation of {size} bytes failed: {err}"),
                    )
                    .with_app(Some(owner)),
                );
                Err(err)
            }
        })
    }

    pub fn release_message_buffer(&self, buffer: ZeroCopyBuffer) -> Result<()> {
        let ZeroCopyBuffer { handle, owner, .. } = buffer;
        self.locked(|state, events| {
            if state.pool.validate_zero_copy(handle).ok() != Some(owner) {
                return Err(BusError::BufferInvalid(handle));
            }
            state.pool.release_zero_copy(handle)?;
            defer(
                events,
                BusEvent::new(
                    event_ids::ZERO_COPY_RELEASED,
                    EventSeverity::Debug,
                    format!("Zero-copy {handle} released"),
                )
                .with_app(Some(owner)),
            );
            Ok(())
        })
    }

    pub fn read_zero_copy<R>(&self, buffer: &ZeroCopyBuffer, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.locked(|state, _| {
            if state.pool.validate_zero_copy(buffer.handle).ok() != Some(buffer.owner) {
                return Err(BusError::BufferInvalid(buffer.handle));
            }
            Ok(f(state.pool.content(buffer.handle)?))
        })
    }

    pub fn write_zero_copy<R>(
        &self,
        buffer: &mut ZeroCopyBuffer,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.locked(|state, _| {
            if state.pool.validate_zero_copy(buffer.handle).ok() != Some(buffer.owner) {
                return Err(BusError::BufferInvalid(buffer.handle));
            }
            Ok(f(state.pool.content_mut(buffer.handle)?))
        })
    }

    /// Borrow the content of a received buffer under the bus lock.
    pub fn read_buffer<R>(&self, buffer: BufferHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.locked(|state, _| Ok(f(state.pool.content(buffer)?)))
    }

    pub fn copy_message(&self, buffer: BufferHandle) -> Result<Vec<u8>> {
        self.read_buffer(buffer, <[u8]>::to_vec)
    }
}

fn finish_transmit(
    mut txn: Transaction,
    outcome: Result<TransmitReport>,
) -> Result<TransmitReport> {
    match outcome {
        Ok(report) if report.all_failed() => Err(txn.fail(BusError::DeliveryFailed {
            msg_id: report.msg_id,
            failed: report.failed,
        })),
        Ok(report) => {
            txn.advance(TxnState::Done);
            Ok(report)
        }
        Err(err) => {
            if txn.state() != TxnState::Failed {
                txn.advance(TxnState::Failed);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusServices;
    use crate::config::BusConfig;
    use crate::events::RecordingEventSink;
    use crate::header::CcsdsHeader;
    use crate::identity::TaskRegistry;
    use crate::pipe::PipeOptions;
    use std::sync::Arc;

    struct Fixture {
        bus: SoftwareBus,
        registry: Arc<TaskRegistry>,
        recorder: Arc<RecordingEventSink>,
        app: AppId,
    }

    fn fixture() -> Fixture {
        let config = BusConfig::default();
        let registry = Arc::new(TaskRegistry::new());
        let app = registry.register_app("TXN_TEST").unwrap();
        registry.bind_current_thread(app).unwrap();
        let recorder = Arc::new(RecordingEventSink::new());
        let services = BusServices::new(registry.clone(), &config).with_events(recorder.clone());
        Fixture {
            bus: SoftwareBus::new(config, services).unwrap(),
            registry,
            recorder,
            app,
        }
    }

    fn tlm(msg_id: u32, payload: &[u8]) -> Vec<u8> {
        CcsdsHeader::new()
            .build_telemetry(MsgId::new(msg_id), 0, 0, payload)
            .unwrap()
    }

    #[test]
    fn test_state_machine_paths() {
        use TxnState::*;
        assert!(Init.can_advance_to(Validated));
        assert!(Validated.can_advance_to(Broadcasting));
        assert!(Broadcasting.can_advance_to(Done));
        assert!(Init.can_advance_to(Waiting));
        assert!(Waiting.can_advance_to(Dequeued));
        assert!(Dequeued.can_advance_to(Done));
        assert!(Waiting.can_advance_to(Failed));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Init.can_advance_to(Broadcasting));
        assert!(!Validated.can_advance_to(Waiting));
    }

    #[test]
    fn test_report_all_failed() {
        let mut report = TransmitReport::new(MsgId::new(1));
        assert!(!report.all_failed());
        report.failed = 2;
        assert!(report.all_failed());
        report.dropped = 1;
        assert!(!report.all_failed());
        assert_eq!(report.attempted(), 3);
    }

    #[test]
    fn test_parse_outgoing_checks() {
        let header = CcsdsHeader::new();
        let good = tlm(0x100, &[1, 2, 3]);
        assert_eq!(
            parse_outgoing(&header, &good, 0x1FFF, 1024).unwrap(),
            (MsgId::new(0x100), good.len())
        );
        assert!(matches!(
            parse_outgoing(&header, &good[..good.len() - 1], 0x1FFF, 1024),
            Err(BusError::BadArgument(_))
        ));
        assert!(matches!(
            parse_outgoing(&header, &good, 0x1FFF, 8),
            Err(BusError::MsgTooBig { .. })
        ));
        assert!(matches!(
            parse_outgoing(&header, &tlm(0, &[]), 0x1FFF, 1024),
            Err(BusError::InvalidMsgId(_))
        ));
        assert!(matches!(
            parse_outgoing(&header, &[0x08], 0x1FFF, 1024),
            Err(BusError::Header(_))
        ));
    }

    #[test]
    fn test_no_subscribers_is_counted_success() {
        let fx = fixture();
        let report = fx.bus.transmit_msg(&tlm(0x321, b"x"), false).unwrap();
        assert!(report.no_subscribers);
        assert_eq!(report.delivered, 0);
        assert_eq!(fx.bus.counters().no_subscribers_counter, 1);
        assert!(fx.recorder.contains(event_ids::SEND_NO_SUBS));
        assert_eq!(fx.bus.pool_stats().buffers_in_use, 0);
    }

    #[test]
    fn test_sequence_count_is_stamped_per_route() {
        let fx = fixture();
        let pipe = fx.bus.create_pipe(4, "SEQ").unwrap();
        fx.bus.subscribe(MsgId::new(0x100), pipe).unwrap();

        fx.bus.transmit_msg(&tlm(0x100, b"a"), true).unwrap();
        fx.bus.transmit_msg(&tlm(0x100, b"b"), true).unwrap();
        fx.bus.transmit_msg(&tlm(0x100, b"c"), false).unwrap();

        let header = CcsdsHeader::new();
        let mut counts = Vec::new();
        while let Some(message) = fx.bus.receive_buffer(pipe, Timeout::Poll).unwrap().message() {
            let bytes = fx.bus.copy_message(message.buffer).unwrap();
            counts.push(header.sequence_count(&bytes).unwrap());
        }
        assert_eq!(counts, vec![1, 2, 0]);
    }

    #[test]
    fn test_ignore_mine_skips_senders_own_pipe() {
        let fx = fixture();
        let mine = fx.bus.create_pipe(4, "MINE").unwrap();
        fx.bus
            .set_pipe_opts(mine, PipeOptions::new().with_ignore_mine(true))
            .unwrap();
        fx.bus.subscribe(MsgId::new(0x10), mine).unwrap();

        let report = fx.bus.transmit_msg(&tlm(0x10, b"self"), false).unwrap();
        assert_eq!(report.attempted(), 0);
        assert!(!fx.bus.receive_buffer(mine, Timeout::Poll).unwrap().is_message());

        // a different sender gets through
        let other = fx.registry.register_app("OTHER").unwrap();
        fx.registry.bind_current_thread(other).unwrap();
        assert_eq!(fx.bus.transmit_msg(&tlm(0x10, b"other"), false).unwrap().delivered, 1);
        fx.registry.bind_current_thread(fx.app).unwrap();
        assert!(fx.bus.receive_buffer(mine, Timeout::Poll).unwrap().is_message());
    }

    #[test]
    fn test_msg_limit_released_by_receive() {
        let fx = fixture();
        let pipe = fx.bus.create_pipe(8, "LIMITED").unwrap();
        fx.bus
            .subscribe_ex(MsgId::new(0x20), pipe, crate::route::Qos::DEFAULT, 2)
            .unwrap();

        fx.bus.transmit_msg(&tlm(0x20, b"1"), false).unwrap();
        fx.bus.transmit_msg(&tlm(0x20, b"2"), false).unwrap();
        assert!(matches!(
            fx.bus.transmit_msg(&tlm(0x20, b"3"), false),
            Err(BusError::DeliveryFailed { failed: 1, .. })
        ));
        assert_eq!(fx.bus.counters().msg_limit_error_counter, 1);
        assert_eq!(fx.bus.counters().msg_send_error_counter, 1);

        assert!(fx.bus.receive_buffer(pipe, Timeout::Poll).unwrap().is_message());
        assert_eq!(fx.bus.transmit_msg(&tlm(0x20, b"4"), false).unwrap().delivered, 1);
    }

    #[test]
    fn test_lookahead_buffer_survives_until_next_read() {
        let fx = fixture();
        let pipe = fx.bus.create_pipe(4, "LOOK").unwrap();
        fx.bus.subscribe(MsgId::new(0x30), pipe).unwrap();
        fx.bus.transmit_msg(&tlm(0x30, b"first"), false).unwrap();
        fx.bus.transmit_msg(&tlm(0x30, b"second"), false).unwrap();

        let first = fx.bus.receive_buffer(pipe, Timeout::Poll).unwrap().message().unwrap();
        assert!(fx.bus.copy_message(first.buffer).unwrap().ends_with(b"first"));

        let second = fx.bus.receive_buffer(pipe, Timeout::Poll).unwrap().message().unwrap();
        assert!(matches!(
            fx.bus.copy_message(first.buffer),
            Err(BusError::BufferInvalid(_))
        ));
        assert_eq!(second.size, tlm(0x30, b"second").len());

        // an empty read still releases the lookahead buffer
        assert_eq!(fx.bus.receive_buffer(pipe, Timeout::Poll).unwrap(), Received::NoMessage);
        assert_eq!(fx.bus.pool_stats().buffers_in_use, 0);
    }

    #[test]
    fn test_receive_argument_errors() {
        let fx = fixture();
        assert!(matches!(
            fx.bus.receive_buffer(PipeId::new(42), Timeout::Poll),
            Err(BusError::InvalidPipe(_))
        ));
        let pipe = fx.bus.create_pipe(1, "R").unwrap();
        assert!(matches!(
            fx.bus.receive_buffer_raw(pipe, -5),
            Err(BusError::BadArgument(_))
        ));
        assert_eq!(
            fx.bus.receive_buffer_raw(pipe, 10).unwrap(),
            Received::TimedOut
        );
        assert_eq!(fx.bus.counters().msg_receive_error_counter, 2);
        assert!(fx.recorder.contains(event_ids::BAD_PIPEID));
        assert!(fx.recorder.contains(event_ids::RCV_BAD_ARG));
    }

    #[test]
    fn test_zero_copy_transmit_releases_on_bad_header() {
        let fx = fixture();
        let free_before = fx.bus.free_pool_bytes();
        let mut buffer = fx.bus.allocate_message_buffer(32).unwrap();
        // header claims message id 0
        fx.bus
            .write_zero_copy(&mut buffer, |bytes| bytes.fill(0))
            .unwrap();

        assert!(matches!(
            fx.bus.transmit_buffer(buffer, false),
            Err(BusError::InvalidMsgId(_))
        ));
        assert_eq!(fx.bus.free_pool_bytes(), free_before);
        assert!(fx.recorder.contains(event_ids::SEND_INV_MSGID));
    }
}
