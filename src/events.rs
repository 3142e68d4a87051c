//! Diagnostic event reporting.
//!
//! Events are fire-and-forget: they never change control flow. Bus code that
//! holds the global lock queues events into a [`PendingEvents`] list and
//! flushes it only after the lock is released.

use crate::ids::AppId;
use heapless::Vec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Upper bound on events one locked section can produce (full fan-out plus summary).
pub const MAX_PENDING_EVENTS: usize = crate::config::MAX_DEST_PER_ROUTE + 8;
const MAX_EVENT_FILTERS: usize = 8;

pub mod event_ids {
    pub const INIT: u16 = 1;
    pub const CR_PIPE_BAD_ARG: u16 = 2;
    pub const MAX_PIPES_MET: u16 = 3;
    pub const CR_PIPE_ERR: u16 = 4;
    pub const PIPE_ADDED: u16 = 5;
    pub const SUB_ARG_ERR: u16 = 6;
    pub const DUP_SUBSCRIPTION: u16 = 7;
    pub const MAX_MSGS_MET: u16 = 8;
    pub const MAX_DESTS_MET: u16 = 9;
    pub const SUBSCRIPTION_RCVD: u16 = 10;
    pub const UNSUB_ARG_ERR: u16 = 11;
    pub const UNSUB_NO_SUBS: u16 = 12;
    pub const SEND_BAD_ARG: u16 = 13;
    pub const SEND_NO_SUBS: u16 = 14;
    pub const MSG_TOO_BIG: u16 = 15;
    pub const GET_BUF_ERR: u16 = 16;
    pub const MSGID_LIM_ERR: u16 = 17;
    pub const RCV_BAD_ARG: u16 = 18;
    pub const BAD_PIPEID: u16 = 19;
    pub const DEST_BLK_ERR: u16 = 20;
    pub const SEND_INV_MSGID: u16 = 21;
    pub const SUBSCRIPTION_RPT: u16 = 22;
    pub const HASH_COLLISION: u16 = 23;
    pub const Q_FULL_ERR: u16 = 25;
    pub const Q_WR_ERR: u16 = 26;
    pub const Q_RD_ERR: u16 = 27;
    pub const CMD0_RCVD: u16 = 28;
    pub const CMD1_RCVD: u16 = 29;
    pub const SND_STATS: u16 = 32;
    pub const ENBL_RTE1: u16 = 33;
    pub const ENBL_RTE2: u16 = 34;
    pub const ENBL_RTE3: u16 = 35;
    pub const DSBL_RTE1: u16 = 36;
    pub const DSBL_RTE2: u16 = 37;
    pub const DSBL_RTE3: u16 = 38;
    pub const SND_RTG: u16 = 39;
    pub const SND_RTG_ERR: u16 = 40;
    pub const BAD_CMD_CODE: u16 = 42;
    pub const BAD_MSGID: u16 = 43;
    pub const FULL_SUB_PKT: u16 = 44;
    pub const PART_SUB_PKT: u16 = 45;
    pub const DEL_PIPE_ERR1: u16 = 46;
    pub const PIPE_DELETED: u16 = 47;
    pub const SUBSCRIPTION_REMOVED: u16 = 48;
    pub const FILEWRITE_ERR: u16 = 49;
    pub const SUB_INV_PIPE: u16 = 50;
    pub const SUB_INV_CALLER: u16 = 51;
    pub const UNSUB_INV_PIPE: u16 = 52;
    pub const UNSUB_INV_CALLER: u16 = 53;
    pub const DEL_PIPE_ERR2: u16 = 54;
    pub const SETPIPEOPTS_ID_ERR: u16 = 55;
    pub const SETPIPEOPTS_OWNER_ERR: u16 = 56;
    pub const SETPIPEOPTS: u16 = 57;
    pub const GETPIPEOPTS_ID_ERR: u16 = 58;
    pub const GETPIPEOPTS: u16 = 60;
    pub const GETPIPENAME: u16 = 62;
    pub const GETPIPENAME_ID_ERR: u16 = 64;
    pub const GETPIPEIDBYNAME: u16 = 65;
    pub const GETPIPEIDBYNAME_NAME_ERR: u16 = 67;
    pub const LEN_ERR: u16 = 68;
    pub const CR_PIPE_NAME_TAKEN: u16 = 69;
    pub const CR_PIPE_NO_FREE: u16 = 70;
    pub const Q_FULL_DROP: u16 = 73;
    pub const ZERO_COPY_RELEASED: u16 = 74;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Information,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: u16,
    pub severity: EventSeverity,
    /// Application the event is attributed to, when known.
    pub app: Option<AppId>,
    pub message: String,
}

impl BusEvent {
    pub fn new(id: u16, severity: EventSeverity, message: impl Into<String>) -> Self {
        Self {
            id,
            severity,
            app: None,
            message: message.into(),
        }
    }

    pub fn with_app(mut self, app: Option<AppId>) -> Self {
        self.app = app;
        self
    }
}

pub trait EventSink: Send + Sync {
    fn send_event(&self, event: &BusEvent);
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn send_event(&self, event: &BusEvent) {
        (**self).send_event(event);
    }
}

/// Events produced under the global lock, flushed after unlock.
pub type PendingEvents = Vec<BusEvent, MAX_PENDING_EVENTS>;

pub(crate) fn defer(pending: &mut PendingEvents, event: BusEvent) {
    debug_assert!(
        !pending.is_full(),
        "pending event list overflow; raise MAX_PENDING_EVENTS"
    );
    let _ = pending.push(event);
}

pub(crate) fn flush(sink: &dyn EventSink, pending: PendingEvents) {
    for event in &pending {
        sink.send_event(event);
    }
}

/// Default sink: forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn send_event(&self, event: &BusEvent) {
        let app = event.app.map(AppId::value);
        match event.severity {
            EventSeverity::Debug => debug!(event_id = event.id, app, "{}", event.message),
            EventSeverity::Information => info!(event_id = event.id, app, "{}", event.message),
            EventSeverity::Error | EventSeverity::Critical => {
                error!(event_id = event.id, app, "{}", event.message);
            }
        }
    }
}

/// Passes through the first `max_count` occurrences of an event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_id: u16,
    pub max_count: u32,
}

impl EventFilter {
    pub const fn first(event_id: u16, max_count: u32) -> Self {
        Self {
            event_id,
            max_count,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FilterState {
    filter: EventFilter,
    seen: u32,
}

/// Wraps another sink and silences noisy event ids after N occurrences.
pub struct FilteredEventSink<S> {
    inner: S,
    filters: Mutex<Vec<FilterState, MAX_EVENT_FILTERS>>,
}

impl<S: EventSink> FilteredEventSink<S> {
    pub fn new(inner: S, filters: &[EventFilter]) -> Self {
        let mut states = Vec::new();
        for filter in filters.iter().take(MAX_EVENT_FILTERS) {
            let _ = states.push(FilterState {
                filter: *filter,
                seen: 0,
            });
        }
        Self {
            inner,
            filters: Mutex::new(states),
        }
    }

    /// Restart counting, letting filtered events through again.
    pub fn reset(&self) {
        for state in self.filters.lock().iter_mut() {
            state.seen = 0;
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: EventSink> EventSink for FilteredEventSink<S> {
    fn send_event(&self, event: &BusEvent) {
        let pass = {
            let mut filters = self.filters.lock();
            match filters.iter_mut().find(|s| s.filter.event_id == event.id) {
                Some(state) => {
                    state.seen = state.seen.saturating_add(1);
                    state.seen <= state.filter.max_count
                }
                None => true,
            }
        };
        if pass {
            self.inner.send_event(event);
        }
    }
}

/// Keeps every event in memory. Used by tests and ground-test harnesses.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<alloc::vec::Vec<BusEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> alloc::vec::Vec<BusEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, id: u16) -> usize {
        self.events.lock().iter().filter(|e| e.id == id).count()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.count(id) > 0
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn send_event(&self, event: &BusEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recording_sink_counts_by_id() {
        let sink = RecordingEventSink::new();
        sink.send_event(&BusEvent::new(5, EventSeverity::Debug, "pipe added"));
        sink.send_event(&BusEvent::new(5, EventSeverity::Debug, "pipe added"));
        sink.send_event(&BusEvent::new(7, EventSeverity::Information, "dup"));

        assert_eq!(sink.count(5), 2);
        assert!(sink.contains(7));
        assert!(!sink.contains(9));

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_filter_stops_after_first_n() {
        let recorder = Arc::new(RecordingEventSink::new());
        let filtered = FilteredEventSink::new(
            Arc::clone(&recorder),
            &[EventFilter::first(event_ids::SEND_NO_SUBS, 2)],
        );

        for _ in 0..5 {
            filtered.send_event(&BusEvent::new(
                event_ids::SEND_NO_SUBS,
                EventSeverity::Information,
                "no subscribers",
            ));
            filtered.send_event(&BusEvent::new(
                event_ids::PIPE_ADDED,
                EventSeverity::Debug,
                "pipe added",
            ));
        }

        assert_eq!(recorder.count(event_ids::SEND_NO_SUBS), 2);
        assert_eq!(recorder.count(event_ids::PIPE_ADDED), 5);

        filtered.reset();
        filtered.send_event(&BusEvent::new(
            event_ids::SEND_NO_SUBS,
            EventSeverity::Information,
            "no subscribers",
        ));
        assert_eq!(recorder.count(event_ids::SEND_NO_SUBS), 3);
    }

    #[test]
    fn test_deferred_events_flush_in_order() {
        let recorder = RecordingEventSink::new();
        let mut pending = PendingEvents::new();
        defer(&mut pending, BusEvent::new(1, EventSeverity::Debug, "a"));
        defer(&mut pending, BusEvent::new(2, EventSeverity::Error, "b"));
        flush(&recorder, pending);

        let ids: alloc::vec::Vec<u16> = recorder.events().iter().map(|e| e.id).collect();
        assert_eq!(ids, [1, 2]);
    }
}
