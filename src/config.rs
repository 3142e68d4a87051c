//! Bus configuration and platform limits.
//!
//! The `MAX_*` constants are compile-time ceilings that size the fixed tables;
//! [`BusConfig`] picks the runtime values at or below them.

use crate::events::{event_ids, EventFilter};
use crate::pipe::OverflowPolicy;
use crate::route::RouteMapKind;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const MAX_MSG_IDS: usize = 256;
pub const MAX_PIPES: usize = 64;
pub const MAX_DEST_PER_ROUTE: usize = 16;
pub const DEFAULT_MSG_LIMIT: u16 = 4;
pub const BUF_MEMORY_BYTES: usize = 524_288;
pub const HIGHEST_VALID_MSG_ID: u32 = 0x1FFF;
pub const MAX_SB_MSG_SIZE: usize = 32_768;
pub const MAX_PIPE_DEPTH: u16 = 256;
/// Longest pipe or application name, in bytes.
pub const MAX_NAME_LEN: usize = 20;
pub const MAX_MEM_BLOCK_SIZES: usize = 17;
/// Headroom on top of the largest message for the buffer descriptor.
pub const MAX_BLOCK_OVERHEAD: usize = 128;

pub const DEFAULT_MEM_BLOCK_SIZES: [usize; 16] = [
    8, 16, 20, 36, 64, 96, 128, 160, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

pub const DEFAULT_CMD_PIPE_DEPTH: u16 = 32;
pub const DEFAULT_CMD_PIPE_NAME: &str = "SB_CMD_PIPE";

const_assert!(MAX_PIPES <= u16::MAX as usize);
const_assert!(MAX_MSG_IDS <= u16::MAX as usize);
const_assert!(DEFAULT_MEM_BLOCK_SIZES.len() < MAX_MEM_BLOCK_SIZES);
const_assert!((DEFAULT_MSG_LIMIT as usize) <= MAX_PIPE_DEPTH as usize);
const_assert!(DEFAULT_CMD_PIPE_DEPTH <= MAX_PIPE_DEPTH);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} = {value} is outside 1..={max}")]
    OutOfRange {
        field: &'static str,
        value: usize,
        max: usize,
    },

    #[error("{field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub max_msg_ids: usize,
    pub max_pipes: usize,
    pub max_dest_per_route: usize,
    pub default_msg_limit: u16,
    pub buf_memory_bytes: usize,
    pub highest_valid_msg_id: u32,
    pub max_msg_size: usize,
    pub max_pipe_depth: u16,
    /// Ascending pool bucket sizes; the last must fit the largest buffer.
    pub mem_block_sizes: Vec<usize>,
    pub route_map: RouteMapKind,
    pub default_overflow: OverflowPolicy,
    pub subscription_reporting: bool,
    pub cmd_pipe_depth: u16,
    pub cmd_pipe_name: String,
    pub routing_info_file: String,
    pub pipe_info_file: String,
    pub map_info_file: String,
    pub event_filters: Vec<EventFilter>,
}

impl Default for BusConfig {
    fn default() -> Self {
        let mut mem_block_sizes = DEFAULT_MEM_BLOCK_SIZES.to_vec();
        mem_block_sizes.push(MAX_SB_MSG_SIZE + MAX_BLOCK_OVERHEAD);

        Self {
            max_msg_ids: MAX_MSG_IDS,
            max_pipes: MAX_PIPES,
            max_dest_per_route: MAX_DEST_PER_ROUTE,
            default_msg_limit: DEFAULT_MSG_LIMIT,
            buf_memory_bytes: BUF_MEMORY_BYTES,
            highest_valid_msg_id: HIGHEST_VALID_MSG_ID,
            max_msg_size: MAX_SB_MSG_SIZE,
            max_pipe_depth: MAX_PIPE_DEPTH,
            mem_block_sizes,
            route_map: RouteMapKind::Hashed,
            default_overflow: OverflowPolicy::Report,
            subscription_reporting: false,
            cmd_pipe_depth: DEFAULT_CMD_PIPE_DEPTH,
            cmd_pipe_name: DEFAULT_CMD_PIPE_NAME.to_string(),
            routing_info_file: "sb_route.json".to_string(),
            pipe_info_file: "sb_pipe.json".to_string(),
            map_info_file: "sb_msgmap.json".to_string(),
            event_filters: vec![
                EventFilter::first(event_ids::SEND_NO_SUBS, 4),
                EventFilter::first(event_ids::DUP_SUBSCRIPTION, 4),
                EventFilter::first(event_ids::MSGID_LIM_ERR, 16),
                EventFilter::first(event_ids::Q_FULL_ERR, 16),
            ],
        }
    }
}

impl BusConfig {
    /// Parse a JSON override document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_msg_ids", self.max_msg_ids, MAX_MSG_IDS)?;
        check_range("max_pipes", self.max_pipes, MAX_PIPES)?;
        check_range("max_dest_per_route", self.max_dest_per_route, MAX_DEST_PER_ROUTE)?;
        check_range(
            "max_pipe_depth",
            usize::from(self.max_pipe_depth),
            usize::from(MAX_PIPE_DEPTH),
        )?;
        check_range(
            "default_msg_limit",
            usize::from(self.default_msg_limit),
            usize::from(self.max_pipe_depth),
        )?;
        check_range(
            "cmd_pipe_depth",
            usize::from(self.cmd_pipe_depth),
            usize::from(self.max_pipe_depth),
        )?;

        if self.highest_valid_msg_id == 0 {
            return Err(ConfigError::Invalid {
                field: "highest_valid_msg_id",
                reason: "must be non-zero",
            });
        }

        if self.max_msg_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_msg_size",
                reason: "must be non-zero",
            });
        }

        if self.mem_block_sizes.is_empty() || self.mem_block_sizes.len() > MAX_MEM_BLOCK_SIZES {
            return Err(ConfigError::OutOfRange {
                field: "mem_block_sizes",
                value: self.mem_block_sizes.len(),
                max: MAX_MEM_BLOCK_SIZES,
            });
        }

        if self.mem_block_sizes.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::Invalid {
                field: "mem_block_sizes",
                reason: "must be strictly ascending",
            });
        }

        let largest = self.mem_block_sizes.last().copied().unwrap_or(0);
        if largest < crate::pool::BUFFER_CONTENT_OFFSET + self.max_msg_size {
            return Err(ConfigError::Invalid {
                field: "mem_block_sizes",
                reason: "largest block cannot hold a maximum-size message",
            });
        }

        if self.buf_memory_bytes < largest {
            return Err(ConfigError::Invalid {
                field: "buf_memory_bytes",
                reason: "pool is smaller than its largest block",
            });
        }

        if self.cmd_pipe_name.is_empty() || self.cmd_pipe_name.len() > MAX_NAME_LEN {
            return Err(ConfigError::Invalid {
                field: "cmd_pipe_name",
                reason: "must be 1 to 20 bytes",
            });
        }

        Ok(())
    }

    /// Upper bound on simultaneous subscriptions.
    pub fn max_subscriptions(&self) -> usize {
        self.max_msg_ids * self.max_dest_per_route
    }
}

fn check_range(field: &'static str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::OutOfRange { field, value, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mem_block_sizes.len(), 17);
        assert_eq!(config.mem_block_sizes[16], 32_768 + 128);
        assert_eq!(config.max_subscriptions(), 256 * 16);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = BusConfig::from_json(r#"{ "max_pipes": 8, "default_overflow": "Drop" }"#)
            .expect("valid override");
        assert_eq!(config.max_pipes, 8);
        assert_eq!(config.default_overflow, OverflowPolicy::Drop);
        assert_eq!(config.max_msg_ids, MAX_MSG_IDS);
    }

    #[test]
    fn test_rejects_capacity_above_ceiling() {
        let config = BusConfig {
            max_pipes: MAX_PIPES + 1,
            ..BusConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "max_pipes", .. })
        ));
    }

    #[test]
    fn test_rejects_unsorted_blocks() {
        let config = BusConfig {
            mem_block_sizes: vec![64, 32, 40000],
            ..BusConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "mem_block_sizes", .. })
        ));
    }

    #[test]
    fn test_rejects_block_too_small_for_max_message() {
        let config = BusConfig {
            mem_block_sizes: vec![64, 1024],
            ..BusConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        assert!(matches!(
            BusConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
