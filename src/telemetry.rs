//! Bus telemetry records.
//!
//! Housekeeping and statistics snapshots, subscription reports and the
//! routing/pipe/map dumps. Packets carry a telemetry header followed by the
//! `serde_json` encoding of the record; dumps are written as JSON lines.

use crate::error::{BusError, Result};
use crate::header::{HeaderError, MessageHeader, TLM_HEADER_LEN};
use crate::ids::{AppId, MsgId, PipeId};
use crate::pipe::PipeOptions;
use crate::route::Qos;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod msg_ids {
    use crate::ids::MsgId;

    pub const CMD_MID: MsgId = MsgId::new(0x1803);
    pub const SEND_HK_MID: MsgId = MsgId::new(0x180B);
    pub const HK_TLM_MID: MsgId = MsgId::new(0x0803);
    pub const STATS_TLM_MID: MsgId = MsgId::new(0x080A);
    pub const ALLSUBS_TLM_MID: MsgId = MsgId::new(0x080D);
    pub const ONESUB_TLM_MID: MsgId = MsgId::new(0x080E);
}

/// Previous-subscription entries carried per packet.
pub const SUB_ENTRIES_PER_PKT: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusCounters {
    pub command_counter: u32,
    pub command_error_counter: u32,
    pub no_subscribers_counter: u32,
    pub msg_send_error_counter: u32,
    pub msg_receive_error_counter: u32,
    pub internal_error_counter: u32,
    pub create_pipe_error_counter: u32,
    pub subscribe_error_counter: u32,
    pub pipe_opts_error_counter: u32,
    pub duplicate_subscriptions_counter: u32,
    pub get_pipe_id_by_name_error_counter: u32,
    pub pipe_overflow_error_counter: u32,
    pub msg_limit_error_counter: u32,
    pub pipe_overflow_drop_counter: u32,
}

pub(crate) fn bump(counter: &mut u32) {
    *counter = counter.saturating_add(1);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeepingTlm {
    pub counters: BusCounters,
    pub mem_in_use: usize,
    /// Pool bytes not tied up in live blocks.
    pub unmarked_mem: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeDepthStats {
    pub pipe_id: PipeId,
    pub max_queue_depth: u16,
    pub current_queue_depth: u16,
    pub peak_queue_depth: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsTlm {
    pub msg_ids_in_use: u32,
    pub peak_msg_ids_in_use: u32,
    pub max_msg_ids_allowed: u32,
    pub pipes_in_use: u32,
    pub peak_pipes_in_use: u32,
    pub max_pipes_allowed: u32,
    pub mem_in_use: usize,
    pub peak_mem_in_use: usize,
    pub max_mem_allowed: usize,
    pub subscriptions_in_use: u32,
    pub peak_subscriptions_in_use: u32,
    pub max_subscriptions_allowed: u32,
    pub sb_buffers_in_use: u32,
    pub peak_sb_buffers_in_use: u32,
    pub max_pipe_depth_allowed: u16,
    pub pipe_depth_stats: Vec<PipeDepthStats>,
}

/// Sent on every new global subscription while reporting is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionReport {
    pub msg_id: MsgId,
    pub pipe_id: PipeId,
    pub qos: Qos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousSubscriptionEntry {
    pub msg_id: MsgId,
    pub pipe_id: PipeId,
    pub qos: Qos,
}

/// One segment of the previous-subscriptions listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllSubscriptionsTlm {
    pub segment: u32,
    pub total_segments: u32,
    pub entries: Vec<PreviousSubscriptionEntry>,
}

impl AllSubscriptionsTlm {
    pub fn is_full(&self) -> bool {
        self.entries.len() == SUB_ENTRIES_PER_PKT
    }
}

/// Split `entries` into numbered packets of [`SUB_ENTRIES_PER_PKT`].
pub fn segment_subscriptions(entries: &[PreviousSubscriptionEntry]) -> Vec<AllSubscriptionsTlm> {
    let total = entries.len().div_ceil(SUB_ENTRIES_PER_PKT) as u32;
    entries
        .chunks(SUB_ENTRIES_PER_PKT)
        .enumerate()
        .map(|(index, chunk)| AllSubscriptionsTlm {
            segment: index as u32 + 1,
            total_segments: total,
            entries: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingFileEntry {
    pub msg_id: MsgId,
    pub pipe_id: PipeId,
    /// 1 when the route is enabled for this pipe.
    pub state: u8,
    pub msg_cnt: u32,
    pub app_name: String,
    pub pipe_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeInfoEntry {
    pub pipe_id: PipeId,
    pub app_id: AppId,
    pub app_name: String,
    pub pipe_name: String,
    pub max_queue_depth: u16,
    pub current_queue_depth: u16,
    pub peak_queue_depth: u16,
    pub send_errors: u16,
    pub overflow_drops: u16,
    pub options: PipeOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgMapFileEntry {
    pub msg_id: MsgId,
    pub route_index: u16,
}

/// Seconds and 1/65536 fractions since the Unix epoch.
fn telemetry_time() -> (u32, u16) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seconds = now.as_secs() as u32;
    let subseconds = ((u64::from(now.subsec_nanos()) << 16) / 1_000_000_000) as u16;
    (seconds, subseconds)
}

/// Build a telemetry packet whose payload is the JSON encoding of `record`.
pub fn encode_packet<T: Serialize>(
    header: &dyn MessageHeader,
    msg_id: MsgId,
    record: &T,
) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)?;
    let mut message = vec![0u8; TLM_HEADER_LEN + payload.len()];
    let size = message.len();
    header.init(&mut message, msg_id, size)?;

    let (seconds, subseconds) = telemetry_time();
    message[6..10].copy_from_slice(&seconds.to_be_bytes());
    message[10..12].copy_from_slice(&subseconds.to_be_bytes());
    message[TLM_HEADER_LEN..].copy_from_slice(&payload);
    Ok(message)
}

pub fn decode_packet<T: DeserializeOwned>(message: &[u8]) -> Result<T> {
    let payload = message.get(TLM_HEADER_LEN..).ok_or(BusError::Header(HeaderError::TooShort {
        needed: TLM_HEADER_LEN,
        actual: message.len(),
    }))?;
    Ok(serde_json::from_slice(payload)?)
}

/// Write one JSON record per line. Returns the number of records written.
pub fn write_json_lines<T: Serialize>(path: &Path, records: &[T]) -> Result<usize> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CcsdsHeader;

    #[test]
    fn test_counters_saturate() {
        let mut counter = u32::MAX - 1;
        bump(&mut counter);
        bump(&mut counter);
        assert_eq!(counter, u32::MAX);
    }

    fn entry(n: u32) -> PreviousSubscriptionEntry {
        PreviousSubscriptionEntry {
            msg_id: MsgId::new(n),
            pipe_id: PipeId::new(1),
            qos: Qos::DEFAULT,
        }
    }

    #[test]
    fn test_packet_round_trip_keeps_header() {
        let header = CcsdsHeader::new();
        let report = SubscriptionReport {
            msg_id: MsgId::new(0x100),
            pipe_id: PipeId::new(3),
            qos: Qos::DEFAULT,
        };
        let packet = encode_packet(&header, msg_ids::ONESUB_TLM_MID, &report).unwrap();

        assert_eq!(header.msg_id(&packet).unwrap(), msg_ids::ONESUB_TLM_MID);
        assert_eq!(header.size(&packet).unwrap(), packet.len());
        let decoded: SubscriptionReport = decode_packet(&packet).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_segments_of_twenty() {
        let entries: Vec<_> = (1..=45).map(entry).collect();
        let segments = segment_subscriptions(&entries);

        assert_eq!(segments.len(), 3);
        assert!(segments[0].is_full());
        assert!(segments[1].is_full());
        assert!(!segments[2].is_full());
        assert_eq!(segments[2].entries.len(), 5);
        assert_eq!(segments[2].segment, 3);
        assert!(segments.iter().all(|s| s.total_segments == 3));
        assert!(segment_subscriptions(&[]).is_empty());
    }

    #[test]
    fn test_json_lines_file() {
        let path = std::env::temp_dir().join(format!("softbus_map_{}.json", std::process::id()));
        let records = [
            MsgMapFileEntry {
                msg_id: MsgId::new(0x100),
                route_index: 0,
            },
            MsgMapFileEntry {
                msg_id: MsgId::new(0x200),
                route_index: 1,
            },
        ];

        assert_eq!(write_json_lines(&path, &records).unwrap(), 2);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<MsgMapFileEntry> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines, records);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_short_packet_is_rejected() {
        assert!(matches!(
            decode_packet::<SubscriptionReport>(&[0u8; 4]),
            Err(BusError::Header(HeaderError::TooShort { .. }))
        ));
    }
}
