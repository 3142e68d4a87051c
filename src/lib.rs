//! # Software Bus
//!
//! An in-process publish/subscribe message bus for flight software. Tasks
//! send messages tagged with a message id; the bus fans each message out to
//! the pipes subscribed to that id without copying it per subscriber.
//!
//! ## Features
//!
//! - **Pipes**: named, bounded, per-application receive queues with owner checks
//! - **Routing**: message id to destination list, hashed or direct lookup
//! - **Subscriptions**: per-destination QoS, message limits and local/global scope
//! - **Zero-copy**: reference-counted pool buffers shared by every destination
//! - **Bounded memory**: fixed tables and a bucketed buffer pool sized at startup
//! - **Management**: counters, statistics, routing dumps and a command pipe
//!
//! ## Quick Start
//!
//! ```rust
//! use softbus::{BusConfig, BusServices, CcsdsHeader, MsgId, SoftwareBus, TaskRegistry, Timeout};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(TaskRegistry::new());
//! let app = registry.register_app("NAV").unwrap();
//! registry.bind_current_thread(app).unwrap();
//!
//! let config = BusConfig::default();
//! let bus = SoftwareBus::new(config.clone(), BusServices::new(registry, &config)).unwrap();
//!
//! let pipe = bus.create_pipe(8, "NAV_PIPE").unwrap();
//! bus.subscribe(MsgId::new(0x0801), pipe).unwrap();
//!
//! let packet = CcsdsHeader::new()
//!     .build_telemetry(MsgId::new(0x0801), 0, 0, b"attitude")
//!     .unwrap();
//! bus.transmit_msg(&packet, true).unwrap();
//!
//! let received = bus.receive_buffer(pipe, Timeout::Poll).unwrap().message().unwrap();
//! assert_eq!(received.msg_id, MsgId::new(0x0801));
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - the [`SoftwareBus`] facade, pipe and management operations
//! - [`subscription`] - subscribe and unsubscribe
//! - [`transaction`] - transmit, receive and zero-copy buffers
//! - [`pipe`] / [`route`] / [`pool`] - the tables behind the global lock
//! - [`queue`] / [`identity`] / [`events`] / [`header`] - pluggable collaborators
//! - [`command`] - the bus's own command pipe
//! - [`telemetry`] - housekeeping, statistics and info dumps

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::too_many_lines)]

extern crate alloc;

pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod header;
pub mod identity;
pub mod ids;
pub mod mempool;
pub mod pipe;
pub mod pool;
pub mod queue;
pub mod route;
pub mod subscription;
pub mod telemetry;
pub mod transaction;

// Re-export main public types for convenience
pub use bus::{BusServices, CleanupReport, SoftwareBus};
pub use command::{fcn_codes, BusCommand, CommandError, CommandTask};
pub use config::BusConfig;
pub use error::{BusError, Result};
pub use events::{
    event_ids, BusEvent, EventFilter, EventSeverity, EventSink, FilteredEventSink,
    RecordingEventSink, TracingEventSink,
};
pub use header::{CcsdsHeader, MessageHeader};
pub use identity::{AppIdentity, TaskRegistry};
pub use ids::{AppId, BufferHandle, MsgId, PipeId, RouteId};
pub use pipe::{OverflowPolicy, PipeOptions};
pub use queue::{MemoryQueueService, QueueError, QueueService, Timeout};
pub use route::{Qos, RouteMapKind, Scope};
pub use subscription::{SubscribeStatus, SubscriptionRequest, UnsubscribeStatus};
pub use telemetry::{msg_ids, BusCounters, HousekeepingTlm, StatsTlm};
pub use transaction::{Received, ReceivedMessage, TransmitReport, ZeroCopyBuffer};
