//! The software bus facade.
//!
//! [`SoftwareBus`] owns the global lock and the collaborators. Every table,
//! the buffer pool and the counters live in one [`BusState`] behind a single
//! `parking_lot` mutex. The blocking parts of the bus (queue creation, the
//! receive wait, draining a deleted pipe) always run with that lock released.
//!
//! The pipe and management operations live here; subscription and
//! transmit/receive operations are in [`crate::subscription`] and
//! [`crate::transaction`].

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::events::{
    defer, event_ids, flush, BusEvent, EventSeverity, EventSink, FilteredEventSink,
    PendingEvents, TracingEventSink,
};
use crate::header::{CcsdsHeader, MessageHeader};
use crate::identity::AppIdentity;
use crate::ids::{AppId, MsgId, PipeId};
use crate::mempool::MemPoolStats;
use crate::pipe::{PipeDescriptor, PipeName, PipeOptions, PipeTable};
use crate::pool::{BufferPool, PoolStats};
use crate::queue::{MemoryQueueService, QueueError, QueueService, Timeout};
use crate::route::{RouteTable, Scope};
use crate::subscription::SubscriptionStats;
use crate::telemetry::{
    bump, segment_subscriptions, AllSubscriptionsTlm, BusCounters, HousekeepingTlm,
    MsgMapFileEntry, PipeDepthStats, PipeInfoEntry, PreviousSubscriptionEntry, RoutingFileEntry,
    StatsTlm,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything the global lock protects.
#[derive(Debug)]
pub(crate) struct BusState {
    pub(crate) config: BusConfig,
    pub(crate) pipes: PipeTable,
    pub(crate) routes: RouteTable,
    pub(crate) pool: BufferPool,
    pub(crate) counters: BusCounters,
    pub(crate) subscriptions: SubscriptionStats,
    pub(crate) subscription_reporting: bool,
}

impl BusState {
    fn new(config: &BusConfig) -> Self {
        Self {
            config: config.clone(),
            pipes: PipeTable::new(config.max_pipes),
            routes: RouteTable::new(
                config.max_msg_ids,
                config.route_map,
                config.highest_valid_msg_id,
            ),
            pool: BufferPool::new(
                config.buf_memory_bytes,
                &config.mem_block_sizes,
                config.max_msg_size,
            ),
            counters: BusCounters::default(),
            subscriptions: SubscriptionStats::default(),
            subscription_reporting: config.subscription_reporting,
        }
    }
}

/// Downward collaborators of the bus.
#[derive(Clone)]
pub struct BusServices {
    pub queues: Arc<dyn QueueService>,
    pub identity: Arc<dyn AppIdentity>,
    pub events: Arc<dyn EventSink>,
    pub header: Arc<dyn MessageHeader>,
}

impl BusServices {
    /// Stock services: in-memory queues, tracing events filtered per
    /// `config.event_filters`, CCSDS headers.
    pub fn new(identity: Arc<dyn AppIdentity>, config: &BusConfig) -> Self {
        Self {
            queues: Arc::new(MemoryQueueService::new()),
            identity,
            events: Arc::new(FilteredEventSink::new(
                TracingEventSink,
                &config.event_filters,
            )),
            header: Arc::new(CcsdsHeader::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_queues(mut self, queues: Arc<dyn QueueService>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_header(mut self, header: Arc<dyn MessageHeader>) -> Self {
        self.header = header;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub pipes_deleted: usize,
    pub buffers_released: usize,
}

pub struct SoftwareBus {
    pub(crate) config: BusConfig,
    pub(crate) state: Mutex<BusState>,
    pub(crate) queues: Arc<dyn QueueService>,
    pub(crate) identity: Arc<dyn AppIdentity>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) header: Arc<dyn MessageHeader>,
}

impl SoftwareBus {
    pub fn new(config: BusConfig, services: BusServices) -> Result<Self> {
        config.validate()?;

        let bus = Self {
            state: Mutex::new(BusState::new(&config)),
            config,
            queues: services.queues,
            identity: services.identity,
            events: services.events,
            header: services.header,
        };
        bus.emit(BusEvent::new(
            event_ids::INIT,
            EventSeverity::Information,
            "Software bus initialized",
        ));
        Ok(bus)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn header(&self) -> &dyn MessageHeader {
        &*self.header
    }

    /// Run `f` under the global lock, then emit whatever events it queued.
    pub(crate) fn locked<R>(&self, f: impl FnOnce(&mut BusState, &mut PendingEvents) -> R) -> R {
        let mut pending = PendingEvents::new();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut pending)
        };
        flush(&*self.events, pending);
        result
    }

    pub(crate) fn emit(&self, event: BusEvent) {
        self.events.send_event(&event);
    }

    pub(crate) fn caller(&self) -> Result<AppId> {
        Ok(self.identity.current_app_id()?)
    }

    fn app_name(&self, app: AppId) -> String {
        self.identity
            .app_name(app)
            .map(|name| name.to_string())
            .unwrap_or_default()
    }

    pub fn create_pipe(&self, depth: u16, name: &str) -> Result<PipeId> {
        let owner = self.caller()?;
        self.create_pipe_with_app_id(depth, name, owner)
    }

    pub(crate) fn create_pipe_with_app_id(
        &self,
        depth: u16,
        name: &str,
        owner: AppId,
    ) -> Result<PipeId> {
        let pipe_name = match PipeName::from(name) {
            Ok(pipe_name)
                if !name.is_empty() && depth > 0 && depth <= self.config.max_pipe_depth =>
            {
                pipe_name
            }
            _ => {
                self.locked(|state, events| {
                    bump(&mut state.counters.create_pipe_error_counter);
                    defer(
                        events,
                        BusEvent::new(
                            event_ids::CR_PIPE_BAD_ARG,
                            EventSeverity::Error,
                            format!("CreatePipe bad argument: depth {depth}, name '{name}'"),
                        )
                        .with_app(Some(owner)),
                    );
                });
                return Err(BusError::BadArgument("pipe depth or name out of range"));
            }
        };

        let pipe_id = self.locked(|state, events| {
            let reserved = state.pipes.reserve();
            if reserved.is_none() {
                bump(&mut state.counters.create_pipe_error_counter);
                defer(
                    events,
                    BusEvent::new(
                        event_ids::MAX_PIPES_MET,
                        EventSeverity::Error,
                        format!("CreatePipe '{name}' failed: max pipes in use"),
                    )
                    .with_app(Some(owner)),
                );
            }
            reserved
        });
        let Some(pipe_id) = pipe_id else {
            return Err(BusError::MaxPipesMet(self.config.max_pipes));
        };

        let created = self.queues.create(name, usize::from(depth));

        self.locked(|state, events| match created {
            Ok(queue) => {
                let mut descriptor =
                    PipeDescriptor::new(pipe_id, pipe_name, queue, owner, depth, PipeOptions::new());
                descriptor.options.overflow = state.config.default_overflow;
                state.pipes.commit(descriptor);
                defer(
                    events,
                    BusEvent::new(
                        event_ids::PIPE_ADDED,
                        EventSeverity::Debug,
                        format!("Pipe created: name '{name}', {pipe_id}, depth {depth}"),
                    )
                    .with_app(Some(owner)),
                );
                Ok(pipe_id)
            }
            Err(cause) => {
                state.pipes.abandon(pipe_id);
                bump(&mut state.counters.create_pipe_error_counter);
                let (id, err) = match cause {
                    QueueError::NameTaken => (
                        event_ids::CR_PIPE_NAME_TAKEN,
                        BusError::PipeNameTaken(name.to_string()),
                    ),
                    QueueError::NoFreeIds => {
                        (event_ids::CR_PIPE_NO_FREE, BusError::PipeCreateFailed(cause))
                    }
                    _ => (event_ids::CR_PIPE_ERR, BusError::PipeCreateFailed(cause)),
                };
                defer(
                    events,
                    BusEvent::new(
                        id,
                        EventSeverity::Error,
                        format!("CreatePipe '{name}' failed: {err}"),
                    )
                    .with_app(Some(owner)),
                );
                Err(err)
            }
        })
    }

    pub fn delete_pipe(&self, pipe_id: PipeId) -> Result<()> {
        let caller = self.caller()?;
        self.delete_pipe_with_app_id(pipe_id, caller)
    }

    /// Delete a pipe on behalf of `app`, which must own it.
    pub fn delete_pipe_with_app_id(&self, pipe_id: PipeId, app: AppId) -> Result<()> {
        let (queue, name, removed) = self.locked(|state, events| {
            let owner = match state.pipes.locate(pipe_id) {
                Some(pipe) => pipe.owner,
                None => {
                    defer(
                        events,
                        BusEvent::new(
                            event_ids::DEL_PIPE_ERR1,
                            EventSeverity::Error,
                            format!("DeletePipe: {pipe_id} does not exist"),
                        )
                        .with_app(Some(app)),
                    );
                    return Err(BusError::InvalidPipe(pipe_id));
                }
            };
            if owner != app {
                defer(
                    events,
                    BusEvent::new(
                        event_ids::DEL_PIPE_ERR2,
                        EventSeverity::Error,
                        format!("DeletePipe: {pipe_id} is owned by {owner}, not {app}"),
                    )
                    .with_app(Some(app)),
                );
                return Err(BusError::NotOwner { pipe: pipe_id, caller: app });
            }

            let removed = state.remove_pipe_destinations(pipe_id);
            let Some(descriptor) = state.pipes.begin_delete(pipe_id) else {
                return Err(BusError::InvalidPipe(pipe_id));
            };
            if let Some(last) = descriptor.last_buffer {
                let _ = state.pool.decr_use_count(last);
            }
            Ok((descriptor.queue, descriptor.name, removed))
        })?;

        // drain without the global lock; a brief re-lock per buffer
        let mut drained = 0usize;
        while let Ok(buffer) = self.queues.get(queue, Timeout::Poll) {
            self.locked(|state, _| {
                let _ = state.pool.decr_use_count(buffer);
            });
            drained += 1;
        }
        let deleted = self.queues.delete(queue);

        self.locked(|state, events| {
            if let Err(cause) = deleted {
                warn!(pipe = pipe_id.value(), %cause, "queue delete failed");
                bump(&mut state.counters.internal_error_counter);
            }
            state.pipes.finish_delete(pipe_id);
            defer(
                events,
                BusEvent::new(
                    event_ids::PIPE_DELETED,
                    EventSeverity::Debug,
                    format!(
                        "Pipe deleted: '{name}' ({pipe_id}), {removed} subscriptions removed, {drained} messages drained"
                    ),
                )
                .with_app(Some(app)),
            );
        });
        Ok(())
    }

    pub fn set_pipe_opts(&self, pipe_id: PipeId, options: PipeOptions) -> Result<()> {
        let caller = self.caller()?;
        self.locked(|state, events| {
            let Some(pipe) = state.pipes.locate_mut(pipe_id) else {
                bump(&mut state.counters.pipe_opts_error_counter);
                defer(
                    events,
                    BusEvent::new(
                        event_ids::SETPIPEOPTS_ID_ERR,
                        EventSeverity::Error,
                        format!("SetPipeOpts: {pipe_id} does not exist"),
                    )
                    .with_app(Some(caller)),
                );
                return Err(BusError::InvalidPipe(pipe_id));
            };
            if pipe.owner != caller {
                let owner = pipe.owner;
                bump(&mut state.counters.pipe_opts_error_counter);
                defer(
                    events,
                    BusEvent::new(
                        event_ids::SETPIPEOPTS_OWNER_ERR,
                        EventSeverity::Error,
                        format!("SetPipeOpts: {pipe_id} is owned by {owner}"),
                    )
                    .with_app(Some(caller)),
                );
                return Err(BusError::NotOwner { pipe: pipe_id, caller });
            }

            pipe.options = options;
            defer(
                events,
                BusEvent::new(
                    event_ids::SETPIPEOPTS,
                    EventSeverity::Debug,
                    format!("SetPipeOpts: {pipe_id} set to {options:?}"),
                )
                .with_app(Some(caller)),
            );
            Ok(())
        })
    }

    pub fn get_pipe_opts(&self, pipe_id: PipeId) -> Result<PipeOptions> {
        self.locked(|state, events| match state.pipes.locate(pipe_id) {
            Some(pipe) => {
                let options = pipe.options;
                defer(
                    events,
                    BusEvent::new(
                        event_ids::GETPIPEOPTS,
                        EventSeverity::Debug,
                        format!("GetPipeOpts: {pipe_id} is {options:?}"),
                    ),
                );
                Ok(options)
            }
            None => {
                bump(&mut state.counters.pipe_opts_error_counter);
                defer(
                    events,
                    BusEvent::new(
                        event_ids::GETPIPEOPTS_ID_ERR,
                        EventSeverity::Error,
                        format!("GetPipeOpts: {pipe_id} does not exist"),
                    ),
                );
                Err(BusError::InvalidPipe(pipe_id))
            }
        })
    }

    pub fn get_pipe_name(&self, pipe_id: PipeId) -> Result<PipeName> {
        self.locked(|state, events| match state.pipes.locate(pipe_id) {
            Some(pipe) => {
                defer(
                    events,
                    BusEvent::new(
                        event_ids::GETPIPENAME,
                        EventSeverity::Debug,
                        format!("GetPipeName: {pipe_id} is '{}'", pipe.name),
                    ),
                );
                Ok(pipe.name)
            }
            None => {
                defer(
                    events,
                    BusEvent::new(
                        event_ids::GETPIPENAME_ID_ERR,
                        EventSeverity::Error,
                        format!("GetPipeName: {pipe_id} does not exist"),
                    ),
                );
                Err(BusError::BadArgument("unknown pipe id"))
            }
        })
    }

    pub fn get_pipe_id_by_name(&self, name: &str) -> Result<PipeId> {
        let queue = if name.is_empty() {
            Err(QueueError::NameNotFound)
        } else {
            self.queues.get_id_by_name(name)
        };

        self.locked(|state, events| {
            match queue.ok().and_then(|queue| state.pipes.find_by_queue(queue)) {
                Some(pipe_id) => {
                    defer(
                        events,
                        BusEvent::new(
                            event_ids::GETPIPEIDBYNAME,
                            EventSeverity::Debug,
                            format!("GetPipeIdByName: '{name}' is {pipe_id}"),
                        ),
                    );
                    Ok(pipe_id)
                }
                None => {
                    bump(&mut state.counters.get_pipe_id_by_name_error_counter);
                    defer(
                        events,
                        BusEvent::new(
                            event_ids::GETPIPEIDBYNAME_NAME_ERR,
                            EventSeverity::Error,
                            format!("GetPipeIdByName: no pipe named '{name}'"),
                        ),
                    );
                    Err(BusError::BadArgument("no pipe with that name"))
                }
            }
        })
    }

    /// Delete every pipe `app` owns, then release the zero-copy buffers it still holds.
    pub fn cleanup_app(&self, app: AppId) -> CleanupReport {
        let owned = self.locked(|state, _| state.pipes.owned_by(app));
        let mut report = CleanupReport::default();
        for pipe_id in owned {
            match self.delete_pipe_with_app_id(pipe_id, app) {
                Ok(()) => report.pipes_deleted += 1,
                Err(err) => warn!(%app, pipe = pipe_id.value(), %err, "cleanup could not delete pipe"),
            }
        }
        report.buffers_released = self.locked(|state, _| state.pool.release_app_buffers(app));
        debug!(
            %app,
            pipes = report.pipes_deleted,
            buffers = report.buffers_released,
            "application cleaned up"
        );
        report
    }

    pub fn housekeeping(&self) -> HousekeepingTlm {
        self.locked(|state, _| HousekeepingTlm {
            counters: state.counters,
            mem_in_use: state.pool.get_stats().mem_in_use,
            unmarked_mem: state.pool.free_bytes(),
        })
    }

    pub fn counters(&self) -> BusCounters {
        self.locked(|state, _| state.counters)
    }

    pub fn stats(&self) -> StatsTlm {
        self.locked(|state, _| {
            let pipes = state.pipes.get_stats();
            let pool = state.pool.get_stats();
            StatsTlm {
                msg_ids_in_use: state.subscriptions.msg_ids_in_use,
                peak_msg_ids_in_use: state.subscriptions.peak_msg_ids_in_use,
                max_msg_ids_allowed: state.config.max_msg_ids as u32,
                pipes_in_use: pipes.pipes_in_use,
                peak_pipes_in_use: pipes.peak_pipes_in_use,
                max_pipes_allowed: state.config.max_pipes as u32,
                mem_in_use: pool.mem_in_use,
                peak_mem_in_use: pool.peak_mem_in_use,
                max_mem_allowed: state.pool.pool_size(),
                subscriptions_in_use: state.subscriptions.subscriptions_in_use,
                peak_subscriptions_in_use: state.subscriptions.peak_subscriptions_in_use,
                max_subscriptions_allowed: state.config.max_subscriptions() as u32,
                sb_buffers_in_use: pool.buffers_in_use,
                peak_sb_buffers_in_use: pool.peak_buffers_in_use,
                max_pipe_depth_allowed: state.config.max_pipe_depth,
                pipe_depth_stats: state
                    .pipes
                    .iter_used()
                    .map(|pipe| PipeDepthStats {
                        pipe_id: pipe.pipe_id,
                        max_queue_depth: pipe.max_queue_depth,
                        current_queue_depth: pipe.current_queue_depth,
                        peak_queue_depth: pipe.peak_queue_depth,
                    })
                    .collect(),
            }
        })
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.locked(|state, _| state.pool.get_stats())
    }

    pub fn mem_pool_stats(&self) -> MemPoolStats {
        self.locked(|state, _| state.pool.get_mem_stats())
    }

    /// Pool bytes not tied up in live buffers or destinations.
    pub fn free_pool_bytes(&self) -> usize {
        self.locked(|state, _| state.pool.free_bytes())
    }

    pub fn reset_counters(&self) {
        self.locked(|state, _| state.counters = BusCounters::default());
    }

    pub fn subscription_reporting(&self) -> bool {
        self.locked(|state, _| state.subscription_reporting)
    }

    pub fn set_subscription_reporting(&self, enabled: bool) {
        self.locked(|state, _| state.subscription_reporting = enabled);
    }

    pub fn enable_route(&self, msg_id: MsgId, pipe_id: PipeId) -> Result<()> {
        self.set_route_state(msg_id, pipe_id, true)
    }

    pub fn disable_route(&self, msg_id: MsgId, pipe_id: PipeId) -> Result<()> {
        self.set_route_state(msg_id, pipe_id, false)
    }

    fn set_route_state(&self, msg_id: MsgId, pipe_id: PipeId, active: bool) -> Result<()> {
        let (bad_arg, no_dest, done, verb) = if active {
            (event_ids::ENBL_RTE3, event_ids::ENBL_RTE1, event_ids::ENBL_RTE2, "Enable")
        } else {
            (event_ids::DSBL_RTE3, event_ids::DSBL_RTE1, event_ids::DSBL_RTE2, "Disable")
        };

        self.locked(|state, events| {
            let valid_msg = msg_id.is_valid(state.config.highest_valid_msg_id);
            if !valid_msg || state.pipes.locate(pipe_id).is_none() {
                defer(
                    events,
                    BusEvent::new(
                        bad_arg,
                        EventSeverity::Error,
                        format!("{verb} route: invalid parameter, {msg_id} {pipe_id}"),
                    ),
                );
                return Err(if valid_msg {
                    BusError::InvalidPipe(pipe_id)
                } else {
                    BusError::InvalidMsgId(msg_id)
                });
            }

            let destination = state
                .routes
                .lookup(msg_id)
                .and_then(|route| state.routes.find_destination(route, pipe_id))
                .and_then(|index| state.routes.destination_mut(index));
            let Some(destination) = destination else {
                defer(
                    events,
                    BusEvent::new(
                        no_dest,
                        EventSeverity::Error,
                        format!("{verb} route: no route for {msg_id} on {pipe_id}"),
                    ),
                );
                return Err(BusError::BadArgument("no subscription for that route"));
            };

            destination.active = active;
            defer(
                events,
                BusEvent::new(
                    done,
                    EventSeverity::Debug,
                    format!("{verb} route: {msg_id} on {pipe_id}"),
                ),
            );
            Ok(())
        })
    }

    /// One entry per destination, route by route.
    pub fn routing_info(&self) -> Vec<RoutingFileEntry> {
        let rows: Vec<(RoutingFileEntry, AppId)> = self.locked(|state, _| {
            let mut rows = Vec::new();
            for (route_id, route) in state.routes.iter_routes() {
                for destination in state.routes.destinations(route_id) {
                    let Some(pipe) = state.pipes.locate(destination.pipe_id) else {
                        continue;
                    };
                    rows.push((
                        RoutingFileEntry {
                            msg_id: route.msg_id,
                            pipe_id: destination.pipe_id,
                            state: u8::from(destination.active),
                            msg_cnt: destination.dest_count,
                            app_name: String::new(),
                            pipe_name: pipe.name.to_string(),
                        },
                        pipe.owner,
                    ));
                }
            }
            rows
        });

        rows.into_iter()
            .map(|(mut entry, owner)| {
                entry.app_name = self.app_name(owner);
                entry
            })
            .collect()
    }

    pub fn pipe_info(&self) -> Vec<PipeInfoEntry> {
        let entries: Vec<PipeInfoEntry> = self.locked(|state, _| {
            state
                .pipes
                .iter_used()
                .map(|pipe| PipeInfoEntry {
                    pipe_id: pipe.pipe_id,
                    app_id: pipe.owner,
                    app_name: String::new(),
                    pipe_name: pipe.name.to_string(),
                    max_queue_depth: pipe.max_queue_depth,
                    current_queue_depth: pipe.current_queue_depth,
                    peak_queue_depth: pipe.peak_queue_depth,
                    send_errors: pipe.send_errors,
                    overflow_drops: pipe.overflow_drops,
                    options: pipe.options,
                })
                .collect()
        });

        entries
            .into_iter()
            .map(|mut entry| {
                entry.app_name = self.app_name(entry.app_id);
                entry
            })
            .collect()
    }

    pub fn map_info(&self) -> Vec<MsgMapFileEntry> {
        self.locked(|state, _| {
            state
                .routes
                .iter_routes()
                .map(|(route_id, route)| MsgMapFileEntry {
                    msg_id: route.msg_id,
                    route_index: route_id.index() as u16,
                })
                .collect()
        })
    }

    /// The first global-scope destination of every route, in packets of 20.
    pub fn previous_subscriptions(&self) -> Vec<AllSubscriptionsTlm> {
        let entries: Vec<PreviousSubscriptionEntry> = self.locked(|state, _| {
            state
                .routes
                .iter_routes()
                .filter_map(|(route_id, route)| {
                    state
                        .routes
                        .destinations(route_id)
                        .find(|d| d.scope == Scope::Global)
                        .map(|d| PreviousSubscriptionEntry {
                            msg_id: route.msg_id,
                            pipe_id: d.pipe_id,
                            qos: d.qos,
                        })
                })
                .collect()
        });
        segment_subscriptions(&entries)
    }

    pub(crate) fn note_command(&self, accepted: bool) {
        self.locked(|state, _| {
            if accepted {
                bump(&mut state.counters.command_counter);
            } else {
                bump(&mut state.counters.command_error_counter);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::identity::TaskRegistry;
    use crate::pipe::OverflowPolicy;

    fn bus_with_recorder() -> (SoftwareBus, Arc<TaskRegistry>, Arc<RecordingEventSink>, AppId) {
        let config = BusConfig::default();
        let registry = Arc::new(TaskRegistry::new());
        let app = registry.register_app("TEST_APP").unwrap();
        registry.bind_current_thread(app).unwrap();
        let recorder = Arc::new(RecordingEventSink::new());
        let services = BusServices::new(registry.clone(), &config).with_events(recorder.clone());
        (SoftwareBus::new(config, services).unwrap(), registry, recorder, app)
    }

    #[test]
    fn test_create_pipe_validates_arguments() {
        let (bus, _registry, recorder, _app) = bus_with_recorder();

        assert!(matches!(bus.create_pipe(0, "P"), Err(BusError::BadArgument(_))));
        assert!(matches!(bus.create_pipe(257, "P"), Err(BusError::BadArgument(_))));
        assert!(matches!(bus.create_pipe(4, ""), Err(BusError::BadArgument(_))));
        assert!(matches!(
            bus.create_pipe(4, "THIS_NAME_IS_TOO_LONG_FOR_A_PIPE"),
            Err(BusError::BadArgument(_))
        ));
        assert_eq!(bus.counters().create_pipe_error_counter, 4);
        assert_eq!(recorder.count(event_ids::CR_PIPE_BAD_ARG), 4);
    }

    #[test]
    fn test_pipe_name_taken_frees_reserved_slot() {
        let (bus, _registry, recorder, _app) = bus_with_recorder();
        bus.create_pipe(4, "DUP").unwrap();

        assert!(matches!(bus.create_pipe(4, "DUP"), Err(BusError::PipeNameTaken(_))));
        assert!(recorder.contains(event_ids::CR_PIPE_NAME_TAKEN));
        assert_eq!(bus.stats().pipes_in_use, 1);
        assert!(bus.create_pipe(4, "OTHER").is_ok());
    }

    #[test]
    fn test_pipe_table_full() {
        let config = BusConfig {
            max_pipes: 2,
            ..BusConfig::default()
        };
        let registry = Arc::new(TaskRegistry::new());
        let app = registry.register_app("APP").unwrap();
        registry.bind_current_thread(app).unwrap();
        let services = BusServices::new(registry.clone(), &config);
        let bus = SoftwareBus::new(config, services).unwrap();

        bus.create_pipe(1, "A").unwrap();
        bus.create_pipe(1, "B").unwrap();
        assert!(matches!(bus.create_pipe(1, "C"), Err(BusError::MaxPipesMet(2))));
        assert_eq!(bus.counters().create_pipe_error_counter, 1);
    }

    #[test]
    fn test_pipe_name_lookup() {
        let (bus, _registry, _recorder, _app) = bus_with_recorder();
        let pipe = bus.create_pipe(4, "NAV_PIPE").unwrap();

        assert_eq!(bus.get_pipe_name(pipe).unwrap().as_str(), "NAV_PIPE");
        assert_eq!(bus.get_pipe_id_by_name("NAV_PIPE").unwrap(), pipe);
        assert!(matches!(
            bus.get_pipe_id_by_name("NOPE"),
            Err(BusError::BadArgument(_))
        ));
        assert_eq!(bus.counters().get_pipe_id_by_name_error_counter, 1);
        assert!(matches!(
            bus.get_pipe_name(PipeId::new(999)),
            Err(BusError::BadArgument(_))
        ));
    }

    #[test]
    fn test_pipe_opts_owner_only() {
        let (bus, registry, _recorder, _app) = bus_with_recorder();
        let pipe = bus.create_pipe(4, "OPTS").unwrap();
        assert_eq!(bus.get_pipe_opts(pipe).unwrap(), PipeOptions::default());

        let options = PipeOptions::new()
            .with_ignore_mine(true)
            .with_overflow(OverflowPolicy::Drop);
        bus.set_pipe_opts(pipe, options).unwrap();
        assert_eq!(bus.get_pipe_opts(pipe).unwrap(), options);

        let other = registry.register_app("OTHER").unwrap();
        registry.bind_current_thread(other).unwrap();
        assert!(matches!(
            bus.set_pipe_opts(pipe, PipeOptions::new()),
            Err(BusError::NotOwner { .. })
        ));
        assert!(matches!(
            bus.get_pipe_opts(PipeId::new(77)),
            Err(BusError::InvalidPipe(_))
        ));
        assert_eq!(bus.counters().pipe_opts_error_counter, 2);
    }

    #[test]
    fn test_default_overflow_policy_from_config() {
        let config = BusConfig {
            default_overflow: OverflowPolicy::Drop,
            ..BusConfig::default()
        };
        let registry = Arc::new(TaskRegistry::new());
        let app = registry.register_app("APP").unwrap();
        registry.bind_current_thread(app).unwrap();
        let services = BusServices::new(registry.clone(), &config);
        let bus = SoftwareBus::new(config, services).unwrap();

        let pipe = bus.create_pipe(2, "DROPPER").unwrap();
        assert_eq!(bus.get_pipe_opts(pipe).unwrap().overflow, OverflowPolicy::Drop);
    }

    #[test]
    fn test_delete_pipe_owner_checks() {
        let (bus, registry, recorder, app) = bus_with_recorder();
        let pipe = bus.create_pipe(4, "DEL").unwrap();
        let intruder = registry.register_app("INTRUDER").unwrap();

        assert!(matches!(
            bus.delete_pipe_with_app_id(pipe, intruder),
            Err(BusError::NotOwner { .. })
        ));
        bus.delete_pipe_with_app_id(pipe, app).unwrap();
        assert!(recorder.contains(event_ids::PIPE_DELETED));
        assert!(matches!(bus.delete_pipe(pipe), Err(BusError::InvalidPipe(_))));
        assert!(recorder.contains(event_ids::DEL_PIPE_ERR1));
        assert_eq!(bus.stats().pipes_in_use, 0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = BusConfig {
            max_pipes: 0,
            ..BusConfig::default()
        };
        let registry = Arc::new(TaskRegistry::new());
        let services = BusServices::new(registry, &config);
        assert!(matches!(
            SoftwareBus::new(config, services),
            Err(BusError::Config(_))
        ));
    }
}
