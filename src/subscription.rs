//! Subscribe and unsubscribe.
//!
//! A subscription is a [`DestinationNode`] on the route for a message id.
//! Checks run in a fixed order: the pipe must exist, the caller must own it,
//! and the message id must be in range. A duplicate subscription and an
//! unsubscribe with nothing to remove are reported as statuses, not errors.

use crate::bus::{BusState, SoftwareBus};
use crate::config::DEFAULT_MSG_LIMIT;
use crate::error::{BusError, Result};
use crate::events::{defer, event_ids, BusEvent, EventSeverity, PendingEvents};
use crate::ids::{AppId, MsgId, PipeId, RouteId};
use crate::route::{DestinationNode, Qos, Scope};
use crate::telemetry::{bump, encode_packet, msg_ids, SubscriptionReport};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    /// The pipe was already subscribed; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeStatus {
    Removed,
    NoSubscription,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub subscriptions_in_use: u32,
    pub peak_subscriptions_in_use: u32,
    /// Routes ever created. Routes are not reclaimed, so this only grows.
    pub msg_ids_in_use: u32,
    pub peak_msg_ids_in_use: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub msg_id: MsgId,
    pub pipe_id: PipeId,
    pub qos: Qos,
    pub msg_limit: u16,
    pub scope: Scope,
}

impl SubscriptionRequest {
    pub const fn new(msg_id: MsgId, pipe_id: PipeId) -> Self {
        Self {
            msg_id,
            pipe_id,
            qos: Qos::DEFAULT,
            msg_limit: DEFAULT_MSG_LIMIT,
            scope: Scope::Global,
        }
    }

    pub const fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub const fn with_msg_limit(mut self, msg_limit: u16) -> Self {
        self.msg_limit = msg_limit;
        self
    }

    pub const fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

impl BusState {
    pub(crate) fn subscribe(
        &mut self,
        request: &SubscriptionRequest,
        caller: AppId,
        events: &mut PendingEvents,
    ) -> Result<SubscribeStatus> {
        let result = self.try_subscribe(request, caller, events);
        if result.is_err() {
            bump(&mut self.counters.subscribe_error_counter);
        }
        result
    }

    fn try_subscribe(
        &mut self,
        request: &SubscriptionRequest,
        caller: AppId,
        events: &mut PendingEvents,
    ) -> Result<SubscribeStatus> {
        let SubscriptionRequest {
            msg_id, pipe_id, ..
        } = *request;

        let Some(pipe) = self.pipes.locate(pipe_id) else {
            defer(
                events,
                BusEvent::new(
                    event_ids::SUB_INV_PIPE,
                    EventSeverity::Error,
                    format!("Subscribe: invalid {pipe_id} for {msg_id}"),
                )
                .with_app(Some(caller)),
            );
            return Err(BusError::InvalidPipe(pipe_id));
        };
        let pipe_name = pipe.name;
        if pipe.owner != caller {
            defer(
                events,
                BusEvent::new(
                    event_ids::SUB_INV_CALLER,
                    EventSeverity::Error,
                    format!("Subscribe: {caller} does not own '{pipe_name}' ({pipe_id})"),
                )
                .with_app(Some(caller)),
            );
            return Err(BusError::NotOwner {
                pipe: pipe_id,
                caller,
            });
        }
        if !msg_id.is_valid(self.config.highest_valid_msg_id) {
            defer(
                events,
                BusEvent::new(
                    event_ids::SUB_ARG_ERR,
                    EventSeverity::Error,
                    format!("Subscribe: bad message id {msg_id} for '{pipe_name}'"),
                )
                .with_app(Some(caller)),
            );
            return Err(BusError::InvalidMsgId(msg_id));
        }

        let route = match self.routes.lookup(msg_id) {
            Some(route) => route,
            None => self.add_route(msg_id, caller, events)?,
        };

        if self.routes.find_destination(route, pipe_id).is_some() {
            bump(&mut self.counters.duplicate_subscriptions_counter);
            defer(
                events,
                BusEvent::new(
                    event_ids::DUP_SUBSCRIPTION,
                    EventSeverity::Information,
                    format!("Duplicate subscription to {msg_id} on '{pipe_name}'"),
                )
                .with_app(Some(caller)),
            );
            return Ok(SubscribeStatus::Duplicate);
        }

        let dest_count = self
            .routes
            .route(route)
            .map_or(0, |route| route.destination_count());
        if dest_count >= self.config.max_dest_per_route {
            defer(
                events,
                BusEvent::new(
                    event_ids::MAX_DESTS_MET,
                    EventSeverity::Error,
                    format!(
                        "Subscribe to {msg_id} on '{pipe_name}' failed: max destinations ({}) met",
                        self.config.max_dest_per_route
                    ),
                )
                .with_app(Some(caller)),
            );
            return Err(BusError::MaxDestsMet {
                msg_id,
                max: self.config.max_dest_per_route,
            });
        }

        let block = match self.pool.allocate_destination_block() {
            Ok(block) => block,
            Err(err) => {
                defer(
                    events,
                    BusEvent::new(
                        event_ids::DEST_BLK_ERR,
                        EventSeverity::Error,
                        format!("Subscribe to {msg_id}: destination block allocation failed"),
                    )
                    .with_app(Some(caller)),
                );
                return Err(err);
            }
        };

        self.routes.insert_head(
            route,
            DestinationNode::new(pipe_id, request.scope, request.qos, request.msg_limit, block),
        );

        let stats = &mut self.subscriptions;
        stats.subscriptions_in_use += 1;
        stats.peak_subscriptions_in_use = stats
            .peak_subscriptions_in_use
            .max(stats.subscriptions_in_use);

        defer(
            events,
            BusEvent::new(
                event_ids::SUBSCRIPTION_RCVD,
                EventSeverity::Debug,
                format!("Subscription received: {msg_id} on '{pipe_name}' ({pipe_id})"),
            )
            .with_app(Some(caller)),
        );
        Ok(SubscribeStatus::Subscribed)
    }

    fn add_route(
        &mut self,
        msg_id: MsgId,
        caller: AppId,
        events: &mut PendingEvents,
    ) -> Result<RouteId> {
        let added = match self.routes.add_route(msg_id) {
            Ok(added) => added,
            Err(err) => {
                defer(
                    events,
                    BusEvent::new(
                        event_ids::MAX_MSGS_MET,
                        EventSeverity::Error,
                        format!(
                            "Subscribe to {msg_id} failed: max message ids ({}) met",
                            self.config.max_msg_ids
                        ),
                    )
                    .with_app(Some(caller)),
                );
                return Err(err);
            }
        };

        if added.collisions > 0 {
            defer(
                events,
                BusEvent::new(
                    event_ids::HASH_COLLISION,
                    EventSeverity::Debug,
                    format!("Route map collision for {msg_id}: {} probes", added.collisions),
                ),
            );
        }

        let stats = &mut self.subscriptions;
        stats.msg_ids_in_use += 1;
        stats.peak_msg_ids_in_use = stats.peak_msg_ids_in_use.max(stats.msg_ids_in_use);
        Ok(added.route)
    }

    pub(crate) fn unsubscribe(
        &mut self,
        msg_id: MsgId,
        pipe_id: PipeId,
        scope: Scope,
        caller: AppId,
        events: &mut PendingEvents,
    ) -> Result<UnsubscribeStatus> {
        let result = self.try_unsubscribe(msg_id, pipe_id, scope, caller, events);
        if result.is_err() {
            bump(&mut self.counters.subscribe_error_counter);
        }
        result
    }

    fn try_unsubscribe(
        &mut self,
        msg_id: MsgId,
        pipe_id: PipeId,
        scope: Scope,
        caller: AppId,
        events: &mut PendingEvents,
    ) -> Result<UnsubscribeStatus> {
        let Some(pipe) = self.pipes.locate(pipe_id) else {
            defer(
                events,
                BusEvent::new(
                    event_ids::UNSUB_INV_PIPE,
                    EventSeverity::Error,
                    format!("Unsubscribe: invalid {pipe_id} for {msg_id}"),
                )
                .with_app(Some(caller)),
            );
            return Err(BusError::InvalidPipe(pipe_id));
        };
        let pipe_name = pipe.name;
        if pipe.owner != caller {
            defer(
                events,
                BusEvent::new(
                    event_ids::UNSUB_INV_CALLER,
                    EventSeverity::Error,
                    format!("Unsubscribe: {caller} does not own '{pipe_name}' ({pipe_id})"),
                )
                .with_app(Some(caller)),
            );
            return Err(BusError::NotOwner {
                pipe: pipe_id,
                caller,
            });
        }
        if !msg_id.is_valid(self.config.highest_valid_msg_id) {
            defer(
                events,
                BusEvent::new(
                    event_ids::UNSUB_ARG_ERR,
                    EventSeverity::Error,
                    format!("Unsubscribe: bad message id {msg_id} for '{pipe_name}'"),
                )
                .with_app(Some(caller)),
            );
            return Err(BusError::InvalidMsgId(msg_id));
        }

        let found = self.routes.lookup(msg_id).and_then(|route| {
            self.routes
                .find_destination(route, pipe_id)
                .map(|index| (route, index))
        });
        let Some((route, index)) = found else {
            defer(
                events,
                BusEvent::new(
                    event_ids::UNSUB_NO_SUBS,
                    EventSeverity::Information,
                    format!("Unsubscribe: no subscription to {msg_id} on '{pipe_name}'"),
                )
                .with_app(Some(caller)),
            );
            return Ok(UnsubscribeStatus::NoSubscription);
        };

        if let Some(node) = self.routes.remove_destination(route, index) {
            self.pool.release_destination_block(node.block);
            self.subscriptions.subscriptions_in_use =
                self.subscriptions.subscriptions_in_use.saturating_sub(1);
        }

        defer(
            events,
            BusEvent::new(
                event_ids::SUBSCRIPTION_REMOVED,
                EventSeverity::Debug,
                format!("Subscription removed: {msg_id} on '{pipe_name}' ({scope:?} scope)"),
            )
            .with_app(Some(caller)),
        );
        Ok(UnsubscribeStatus::Removed)
    }

    /// Drop every destination that points at `pipe_id`. Returns how many.
    pub(crate) fn remove_pipe_destinations(&mut self, pipe_id: PipeId) -> usize {
        let route_ids: Vec<RouteId> = self.routes.iter_routes().map(|(id, _)| id).collect();
        let mut removed = 0;
        for route in route_ids {
            let Some(index) = self.routes.find_destination(route, pipe_id) else {
                continue;
            };
            if let Some(node) = self.routes.remove_destination(route, index) {
                self.pool.release_destination_block(node.block);
                self.subscriptions.subscriptions_in_use =
                    self.subscriptions.subscriptions_in_use.saturating_sub(1);
                removed += 1;
            }
        }
        removed
    }
}

impl SoftwareBus {
    /// Subscribe with the default QoS and message limit, global scope.
    pub fn subscribe(&self, msg_id: MsgId, pipe_id: PipeId) -> Result<SubscribeStatus> {
        self.subscribe_full(
            SubscriptionRequest::new(msg_id, pipe_id).with_msg_limit(self.config.default_msg_limit),
        )
    }

    pub fn subscribe_ex(
        &self,
        msg_id: MsgId,
        pipe_id: PipeId,
        qos: Qos,
        msg_limit: u16,
    ) -> Result<SubscribeStatus> {
        self.subscribe_full(
            SubscriptionRequest::new(msg_id, pipe_id)
                .with_qos(qos)
                .with_msg_limit(msg_limit),
        )
    }

    /// Subscribe for messages from this processor only.
    pub fn subscribe_local(
        &self,
        msg_id: MsgId,
        pipe_id: PipeId,
        msg_limit: u16,
    ) -> Result<SubscribeStatus> {
        self.subscribe_full(
            SubscriptionRequest::new(msg_id, pipe_id)
                .with_msg_limit(msg_limit)
                .with_scope(Scope::Local),
        )
    }

    pub fn subscribe_full(&self, request: SubscriptionRequest) -> Result<SubscribeStatus> {
        let caller = self.caller()?;
        self.subscribe_with_app_id(request, caller)
    }

    pub(crate) fn subscribe_with_app_id(
        &self,
        request: SubscriptionRequest,
        app: AppId,
    ) -> Result<SubscribeStatus> {
        let (status, report) = self.locked(|state, events| {
            let status = state.subscribe(&request, app, events);
            let report = matches!(status, Ok(SubscribeStatus::Subscribed))
                && request.scope == Scope::Global
                && state.subscription_reporting;
            (status, report)
        });

        if report {
            self.send_subscription_report(&request);
        }
        status
    }

    fn send_subscription_report(&self, request: &SubscriptionRequest) {
        let report = SubscriptionReport {
            msg_id: request.msg_id,
            pipe_id: request.pipe_id,
            qos: request.qos,
        };
        let sent = encode_packet(&*self.header, msg_ids::ONESUB_TLM_MID, &report)
            .and_then(|packet| self.transmit_msg(&packet, true));
        match sent {
            Ok(_) => self.emit(BusEvent::new(
                event_ids::SUBSCRIPTION_RPT,
                EventSeverity::Debug,
                format!(
                    "Subscription report sent: {} on {}",
                    request.msg_id, request.pipe_id
                ),
            )),
            Err(err) => warn!(msg_id = %request.msg_id, %err, "subscription report not sent"),
        }
    }

    pub fn unsubscribe(&self, msg_id: MsgId, pipe_id: PipeId) -> Result<UnsubscribeStatus> {
        let caller = self.caller()?;
        self.unsubscribe_full(msg_id, pipe_id, Scope::Global, caller)
    }

    pub fn unsubscribe_local(&self, msg_id: MsgId, pipe_id: PipeId) -> Result<UnsubscribeStatus> {
        let caller = self.caller()?;
        self.unsubscribe_full(msg_id, pipe_id, Scope::Local, caller)
    }

    /// Unsubscribe on behalf of `app`, which must own the pipe.
    pub fn unsubscribe_with_app_id(
        &self,
        msg_id: MsgId,
        pipe_id: PipeId,
        app: AppId,
    ) -> Result<UnsubscribeStatus> {
        self.unsubscribe_full(msg_id, pipe_id, Scope::Global, app)
    }

    fn unsubscribe_full(
        &self,
        msg_id: MsgId,
        pipe_id: PipeId,
        scope: Scope,
        app: AppId,
    ) -> Result<UnsubscribeStatus> {
        self.locked(|state, events| state.unsubscribe(msg_id, pipe_id, scope, app, events))
    }
}
