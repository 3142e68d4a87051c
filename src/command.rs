//! Bus management commands.
//!
//! Commands arrive as ordinary bus messages on the bus's own command pipe.
//! [`BusCommand::decode`] turns a packet into a typed command after checking
//! its length against the function code; [`CommandTask`] reads the pipe and
//! dispatches each command onto the [`SoftwareBus`] management API.

use crate::bus::SoftwareBus;
use crate::error::{BusError, Result};
use crate::events::{event_ids, BusEvent, EventSeverity};
use crate::header::{CcsdsHeader, HeaderError, MessageHeader, CMD_HEADER_LEN};
use crate::ids::{AppId, MsgId, PipeId};
use crate::queue::Timeout;
use crate::subscription::SubscriptionRequest;
use crate::telemetry::{msg_ids, write_json_lines};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub mod fcn_codes {
    pub const NOOP: u8 = 0;
    pub const RESET_COUNTERS: u8 = 1;
    pub const SEND_STATS: u8 = 2;
    pub const WRITE_ROUTING_INFO: u8 = 3;
    pub const ENABLE_ROUTE: u8 = 4;
    pub const DISABLE_ROUTE: u8 = 5;
    pub const WRITE_PIPE_INFO: u8 = 7;
    pub const WRITE_MAP_INFO: u8 = 8;
    pub const ENABLE_SUB_REPORTING: u8 = 9;
    pub const DISABLE_SUB_REPORTING: u8 = 10;
    pub const SEND_PREV_SUBS: u8 = 11;
}

/// NUL-padded file name field of the write-info commands.
pub const FILENAME_LEN: usize = 64;
const ROUTE_PAYLOAD_LEN: usize = 8;
const RECEIVE_SLICE_MS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    Noop,
    ResetCounters,
    SendStats,
    /// `None` writes to the configured default file.
    WriteRoutingInfo { file: Option<PathBuf> },
    EnableRoute { msg_id: MsgId, pipe_id: PipeId },
    DisableRoute { msg_id: MsgId, pipe_id: PipeId },
    WritePipeInfo { file: Option<PathBuf> },
    WriteMapInfo { file: Option<PathBuf> },
    EnableSubReporting,
    DisableSubReporting,
    SendPrevSubs,
    /// Arrives on its own message id with no function code.
    SendHousekeeping,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0} is not a bus command message id")]
    UnknownMsgId(MsgId),

    #[error("invalid command code {0}")]
    UnknownCode(u8),

    #[error("command code {code}: length {actual}, expected {expected}")]
    Length {
        code: u8,
        expected: usize,
        actual: usize,
    },

    #[error("file name is not valid UTF-8 or longer than {FILENAME_LEN} bytes")]
    FileName,

    #[error("command header: {0}")]
    Header(#[from] HeaderError),
}

impl BusCommand {
    pub fn msg_id(&self) -> MsgId {
        match self {
            Self::SendHousekeeping => msg_ids::SEND_HK_MID,
            _ => msg_ids::CMD_MID,
        }
    }

    pub fn fcn_code(&self) -> u8 {
        use fcn_codes::*;
        match self {
            Self::Noop | Self::SendHousekeeping => NOOP,
            Self::ResetCounters => RESET_COUNTERS,
            Self::SendStats => SEND_STATS,
            Self::WriteRoutingInfo { .. } => WRITE_ROUTING_INFO,
            Self::EnableRoute { .. } => ENABLE_ROUTE,
            Self::DisableRoute { .. } => DISABLE_ROUTE,
            Self::WritePipeInfo { .. } => WRITE_PIPE_INFO,
            Self::WriteMapInfo { .. } => WRITE_MAP_INFO,
            Self::EnableSubReporting => ENABLE_SUB_REPORTING,
            Self::DisableSubReporting => DISABLE_SUB_REPORTING,
            Self::SendPrevSubs => SEND_PREV_SUBS,
        }
    }

    pub fn decode(header: &dyn MessageHeader, message: &[u8]) -> core::result::Result<Self, CommandError> {
        let msg_id = header.msg_id(message)?;
        let size = header.size(message)?;
        if size > message.len() {
            return Err(CommandError::Header(HeaderError::TooShort {
                needed: size,
                actual: message.len(),
            }));
        }

        if msg_id == msg_ids::SEND_HK_MID {
            expect_len(fcn_codes::NOOP, 0, size)?;
            return Ok(Self::SendHousekeeping);
        }
        if msg_id != msg_ids::CMD_MID {
            return Err(CommandError::UnknownMsgId(msg_id));
        }

        use fcn_codes::*;
        let code = header.fcn_code(message)?;
        let payload_len = match code {
            NOOP | RESET_COUNTERS | SEND_STATS | ENABLE_SUB_REPORTING | DISABLE_SUB_REPORTING
            | SEND_PREV_SUBS => 0,
            ENABLE_ROUTE | DISABLE_ROUTE => ROUTE_PAYLOAD_LEN,
            WRITE_ROUTING_INFO | WRITE_PIPE_INFO | WRITE_MAP_INFO => FILENAME_LEN,
            _ => return Err(CommandError::UnknownCode(code)),
        };
        expect_len(code, payload_len, size)?;
        let payload = &message[CMD_HEADER_LEN..size];

        Ok(match code {
            NOOP => Self::Noop,
            RESET_COUNTERS => Self::ResetCounters,
            SEND_STATS => Self::SendStats,
            ENABLE_SUB_REPORTING => Self::EnableSubReporting,
            DISABLE_SUB_REPORTING => Self::DisableSubReporting,
            SEND_PREV_SUBS => Self::SendPrevSubs,
            ENABLE_ROUTE => {
                let (msg_id, pipe_id) = decode_route(payload);
                Self::EnableRoute { msg_id, pipe_id }
            }
            DISABLE_ROUTE => {
                let (msg_id, pipe_id) = decode_route(payload);
                Self::DisableRoute { msg_id, pipe_id }
            }
            WRITE_ROUTING_INFO => Self::WriteRoutingInfo {
                file: decode_file_name(payload)?,
            },
            WRITE_PIPE_INFO => Self::WritePipeInfo {
                file: decode_file_name(payload)?,
            },
            _ => Self::WriteMapInfo {
                file: decode_file_name(payload)?,
            },
        })
    }

    /// Build the command packet with the stock CCSDS header.
    pub fn encode(&self) -> core::result::Result<Vec<u8>, CommandError> {
        let mut payload = Vec::new();
        match self {
            Self::EnableRoute { msg_id, pipe_id } | Self::DisableRoute { msg_id, pipe_id } => {
                payload.extend_from_slice(&msg_id.value().to_be_bytes());
                payload.extend_from_slice(&pipe_id.value().to_be_bytes());
            }
            Self::WriteRoutingInfo { file }
            | Self::WritePipeInfo { file }
            | Self::WriteMapInfo { file } => {
                payload = encode_file_name(file.as_deref())?;
            }
            _ => {}
        }
        Ok(CcsdsHeader::new().build_command(self.msg_id(), self.fcn_code(), &payload)?)
    }
}

fn expect_len(code: u8, payload_len: usize, size: usize) -> core::result::Result<(), CommandError> {
    let expected = CMD_HEADER_LEN + payload_len;
    if size == expected {
        Ok(())
    } else {
        Err(CommandError::Length {
            code,
            expected,
            actual: size,
        })
    }
}

fn decode_route(payload: &[u8]) -> (MsgId, PipeId) {
    let word = |at: usize| u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]]);
    (MsgId::new(word(0)), PipeId::new(word(4)))
}

fn decode_file_name(payload: &[u8]) -> core::result::Result<Option<PathBuf>, CommandError> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let name = core::str::from_utf8(&payload[..end]).map_err(|_| CommandError::FileName)?;
    Ok((!name.is_empty()).then(|| PathBuf::from(name)))
}

fn encode_file_name(file: Option<&Path>) -> core::result::Result<Vec<u8>, CommandError> {
    let mut field = vec![0u8; FILENAME_LEN];
    if let Some(file) = file {
        let name = file.to_str().ok_or(CommandError::FileName)?;
        // keep room for the terminating NUL
        if name.len() >= FILENAME_LEN {
            return Err(CommandError::FileName);
        }
        field[..name.len()].copy_from_slice(name.as_bytes());
    }
    Ok(field)
}

/// How a dispatched command moves the command counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    Accepted,
    Rejected,
    /// Housekeeping requests and counter resets leave both counters alone.
    Uncounted,
}

/// Reads the command pipe and executes bus management commands.
pub struct CommandTask {
    bus: Arc<SoftwareBus>,
    pipe: PipeId,
    app: AppId,
}

impl CommandTask {
    /// Create the command pipe for `app` and subscribe it to the command and
    /// housekeeping-request ids.
    pub fn new(bus: Arc<SoftwareBus>, app: AppId) -> Result<Self> {
        let config = bus.config();
        let pipe = bus.create_pipe_with_app_id(config.cmd_pipe_depth, &config.cmd_pipe_name, app)?;
        for msg_id in [msg_ids::CMD_MID, msg_ids::SEND_HK_MID] {
            bus.subscribe_with_app_id(
                SubscriptionRequest::new(msg_id, pipe).with_msg_limit(config.cmd_pipe_depth),
                app,
            )?;
        }
        debug!(pipe = pipe.value(), %app, "command pipe ready");
        Ok(Self { bus, pipe, app })
    }

    pub fn pipe_id(&self) -> PipeId {
        self.pipe
    }

    pub fn app_id(&self) -> AppId {
        self.app
    }

    /// Read one message from the command pipe and execute it.
    ///
    /// Returns the command that ran, or `None` when the pipe was empty, the
    /// wait timed out, or the packet was rejected.
    pub fn process_one(&self, timeout: Timeout) -> Result<Option<BusCommand>> {
        let Some(message) = self.bus.receive_buffer(self.pipe, timeout)?.message() else {
            return Ok(None);
        };
        let packet = self.bus.copy_message(message.buffer)?;

        match BusCommand::decode(self.bus.header(), &packet) {
            Ok(command) => {
                self.dispatch(&command);
                Ok(Some(command))
            }
            Err(err) => {
                self.reject(message.msg_id, &err);
                Ok(None)
            }
        }
    }

    /// Process commands until `stop` is set or the command pipe goes away.
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.process_one(Timeout::Millis(RECEIVE_SLICE_MS)) {
                Ok(_) => {}
                Err(err @ (BusError::InvalidPipe(_) | BusError::PipeReadError { .. })) => {
                    warn!(%err, "command pipe closed, stopping");
                    break;
                }
                Err(err) => warn!(%err, "command processing failed"),
            }
        }
    }

    pub fn dispatch(&self, command: &BusCommand) {
        debug!(?command, "bus command");
        let tally = match command {
            BusCommand::Noop => {
                self.event(event_ids::CMD0_RCVD, EventSeverity::Information, "No-op command".to_string());
                Tally::Accepted
            }
            BusCommand::ResetCounters => {
                self.bus.reset_counters();
                self.event(event_ids::CMD1_RCVD, EventSeverity::Debug, "Reset counters command".to_string());
                Tally::Uncounted
            }
            BusCommand::SendHousekeeping => {
                self.send_telemetry(msg_ids::HK_TLM_MID, &self.bus.housekeeping());
                Tally::Uncounted
            }
            BusCommand::SendStats => {
                self.send_telemetry(msg_ids::STATS_TLM_MID, &self.bus.stats());
                self.event(event_ids::SND_STATS, EventSeverity::Debug, "Statistics packet sent".to_string());
                Tally::Accepted
            }
            BusCommand::WriteRoutingInfo { file } => {
                let path = file_or_default(file.as_deref(), &self.bus.config().routing_info_file);
                self.write_info(&path, "routing", &self.bus.routing_info())
            }
            BusCommand::WritePipeInfo { file } => {
                let path = file_or_default(file.as_deref(), &self.bus.config().pipe_info_file);
                self.write_info(&path, "pipe", &self.bus.pipe_info())
            }
            BusCommand::WriteMapInfo { file } => {
                let path = file_or_default(file.as_deref(), &self.bus.config().map_info_file);
                self.write_info(&path, "message map", &self.bus.map_info())
            }
            BusCommand::EnableRoute { msg_id, pipe_id } => {
                tally_of(self.bus.enable_route(*msg_id, *pipe_id).is_ok())
            }
            BusCommand::DisableRoute { msg_id, pipe_id } => {
                tally_of(self.bus.disable_route(*msg_id, *pipe_id).is_ok())
            }
            BusCommand::EnableSubReporting => {
                self.bus.set_subscription_reporting(true);
                Tally::Accepted
            }
            BusCommand::DisableSubReporting => {
                self.bus.set_subscription_reporting(false);
                Tally::Accepted
            }
            BusCommand::SendPrevSubs => {
                self.send_previous_subscriptions();
                Tally::Accepted
            }
        };

        match tally {
            Tally::Accepted => self.bus.note_command(true),
            Tally::Rejected => self.bus.note_command(false),
            Tally::Uncounted => {}
        }
    }

    fn reject(&self, msg_id: MsgId, err: &CommandError) {
        warn!(%msg_id, %err, "command rejected");
        let id = match err {
            CommandError::UnknownCode(_) => event_ids::BAD_CMD_CODE,
            CommandError::UnknownMsgId(_) => event_ids::BAD_MSGID,
            CommandError::Length { .. } | CommandError::FileName | CommandError::Header(_) => {
                event_ids::LEN_ERR
            }
        };
        self.event(id, EventSeverity::Error, format!("Command rejected for {msg_id}: {err}"));
        self.bus.note_command(false);
    }

    fn send_previous_subscriptions(&self) {
        for segment in self.bus.previous_subscriptions() {
            self.send_telemetry(msg_ids::ALLSUBS_TLM_MID, &segment);
            let id = if segment.is_full() {
                event_ids::FULL_SUB_PKT
            } else {
                event_ids::PART_SUB_PKT
            };
            self.event(
                id,
                EventSeverity::Debug,
                format!(
                    "Previous subscriptions segment {}/{}: {} entries",
                    segment.segment,
                    segment.total_segments,
                    segment.entries.len()
                ),
            );
        }
    }

    fn send_telemetry<T: Serialize>(&self, msg_id: MsgId, record: &T) {
        if let Err(err) = self.bus.transmit_telemetry(msg_id, record) {
            warn!(%msg_id, %err, "telemetry not sent");
        }
    }

    fn write_info<T: Serialize>(&self, path: &Path, what: &str, records: &[T]) -> Tally {
        match write_json_lines(path, records) {
            Ok(count) => {
                self.event(
                    event_ids::SND_RTG,
                    EventSeverity::Debug,
                    format!("Wrote {count} {what} entries to {}", path.display()),
                );
                Tally::Accepted
            }
            Err(err) => {
                let id = match err {
                    BusError::Io(_) => event_ids::SND_RTG_ERR,
                    _ => event_ids::FILEWRITE_ERR,
                };
                self.event(
                    id,
                    EventSeverity::Error,
                    format!("Writing {what} info to {} failed: {err}", path.display()),
                );
                Tally::Rejected
            }
        }
    }

    fn event(&self, id: u16, severity: EventSeverity, message: String) {
        self.bus
            .emit(BusEvent::new(id, severity, message).with_app(Some(self.app)));
    }
}

fn file_or_default(file: Option<&Path>, default: &str) -> PathBuf {
    file.map_or_else(|| PathBuf::from(default), Path::to_path_buf)
}

fn tally_of(ok: bool) -> Tally {
    if ok {
        Tally::Accepted
    } else {
        Tally::Rejected
    }
}
