//! Message header codec.
//!
//! The bus treats message content as opaque except for the few header fields
//! it needs for routing and sizing. Those are read through [`MessageHeader`];
//! [`CcsdsHeader`] is the stock implementation for CCSDS space packets.

use crate::ids::MsgId;

/// Primary header: stream id, sequence word, length word.
pub const PRIMARY_HEADER_LEN: usize = 6;
/// Primary header plus function code and checksum.
pub const CMD_HEADER_LEN: usize = 8;
/// Primary header plus 6-byte time stamp.
pub const TLM_HEADER_LEN: usize = 12;

pub const SEQUENCE_COUNT_MASK: u16 = 0x3FFF;
const MSG_ID_MASK: u16 = 0x1FFF;
const TYPE_COMMAND: u16 = 0x1000;
const SEQ_FLAGS_UNSEGMENTED: u16 = 0xC000;
/// The length word stores `total - LENGTH_BIAS`.
const LENGTH_BIAS: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("message too short: need {needed} bytes, have {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("message size {0} cannot be encoded in a header")]
    SizeOverflow(usize),
}

pub trait MessageHeader: Send + Sync {
    fn msg_id(&self, message: &[u8]) -> Result<MsgId, HeaderError>;

    /// Total message size in bytes, header included.
    fn size(&self, message: &[u8]) -> Result<usize, HeaderError>;

    fn set_sequence_count(&self, message: &mut [u8], count: u16) -> Result<(), HeaderError>;

    fn sequence_count(&self, message: &[u8]) -> Result<u16, HeaderError>;

    /// Function code of a command message.
    fn fcn_code(&self, message: &[u8]) -> Result<u8, HeaderError>;

    /// Write a fresh header for a message of `size` total bytes.
    fn init(&self, message: &mut [u8], msg_id: MsgId, size: usize) -> Result<(), HeaderError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CcsdsHeader;

impl CcsdsHeader {
    pub const fn new() -> Self {
        Self
    }

    /// Build a complete command packet: header, function code, zero checksum, payload.
    /// Command ids carry the packet-type bit themselves (0x18xx).
    pub fn build_command(
        &self,
        msg_id: MsgId,
        fcn_code: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, HeaderError> {
        let total = CMD_HEADER_LEN + payload.len();
        let mut message = vec![0u8; total];
        self.init(&mut message, msg_id, total)?;
        message[6] = fcn_code;
        message[CMD_HEADER_LEN..].copy_from_slice(payload);
        Ok(message)
    }

    /// Build a telemetry packet stamped with `seconds`/`subseconds`.
    pub fn build_telemetry(
        &self,
        msg_id: MsgId,
        seconds: u32,
        subseconds: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, HeaderError> {
        let total = TLM_HEADER_LEN + payload.len();
        let mut message = vec![0u8; total];
        self.init(&mut message, msg_id, total)?;
        message[6..10].copy_from_slice(&seconds.to_be_bytes());
        message[10..12].copy_from_slice(&subseconds.to_be_bytes());
        message[TLM_HEADER_LEN..].copy_from_slice(payload);
        Ok(message)
    }

    pub fn is_command(&self, message: &[u8]) -> Result<bool, HeaderError> {
        Ok(read_word(message, 0)? & TYPE_COMMAND != 0)
    }
}

impl MessageHeader for CcsdsHeader {
    fn msg_id(&self, message: &[u8]) -> Result<MsgId, HeaderError> {
        Ok(MsgId::new(u32::from(read_word(message, 0)? & MSG_ID_MASK)))
    }

    fn size(&self, message: &[u8]) -> Result<usize, HeaderError> {
        Ok(usize::from(read_word(message, 4)?) + LENGTH_BIAS)
    }

    fn set_sequence_count(&self, message: &mut [u8], count: u16) -> Result<(), HeaderError> {
        let word = read_word(message, 2)?;
        let word = (word & !SEQUENCE_COUNT_MASK) | (count & SEQUENCE_COUNT_MASK);
        write_word(message, 2, word)
    }

    fn sequence_count(&self, message: &[u8]) -> Result<u16, HeaderError> {
        Ok(read_word(message, 2)? & SEQUENCE_COUNT_MASK)
    }

    fn fcn_code(&self, message: &[u8]) -> Result<u8, HeaderError> {
        if message.len() < CMD_HEADER_LEN {
            return Err(HeaderError::TooShort {
                needed: CMD_HEADER_LEN,
                actual: message.len(),
            });
        }
        Ok(message[6] & 0x7F)
    }

    fn init(&self, message: &mut [u8], msg_id: MsgId, size: usize) -> Result<(), HeaderError> {
        if size < PRIMARY_HEADER_LEN {
            return Err(HeaderError::TooShort {
                needed: PRIMARY_HEADER_LEN,
                actual: size,
            });
        }
        let length = u16::try_from(size - LENGTH_BIAS.min(size))
            .map_err(|_| HeaderError::SizeOverflow(size))?;

        // type and secondary-header flags are part of the message id
        let stream_id = (msg_id.value() as u16) & MSG_ID_MASK;
        write_word(message, 0, stream_id)?;
        write_word(message, 2, SEQ_FLAGS_UNSEGMENTED)?;
        write_word(message, 4, length)
    }
}

fn read_word(message: &[u8], offset: usize) -> Result<u16, HeaderError> {
    match message.get(offset..offset + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(HeaderError::TooShort {
            needed: PRIMARY_HEADER_LEN,
            actual: message.len(),
        }),
    }
}

fn write_word(message: &mut [u8], offset: usize, word: u16) -> Result<(), HeaderError> {
    let actual = message.len();
    match message.get_mut(offset..offset + 2) {
        Some(bytes) => {
            bytes.copy_from_slice(&word.to_be_bytes());
            Ok(())
        }
        None => Err(HeaderError::TooShort {
            needed: PRIMARY_HEADER_LEN,
            actual,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_read_back() {
        let header = CcsdsHeader::new();
        let mut message = [0u8; 16];
        header.init(&mut message, MsgId::new(0x0100), 16).unwrap();

        assert_eq!(header.msg_id(&message).unwrap(), MsgId::new(0x0100));
        assert_eq!(header.size(&message).unwrap(), 16);
        assert_eq!(header.sequence_count(&message).unwrap(), 0);
    }

    #[test]
    fn test_sequence_count_wraps_at_14_bits() {
        let header = CcsdsHeader::new();
        let mut message = [0u8; 8];
        header.init(&mut message, MsgId::new(0x0800), 8).unwrap();
        header.set_sequence_count(&mut message, 0x4001).unwrap();

        assert_eq!(header.sequence_count(&message).unwrap(), 0x0001);
        // sequence flags survive
        assert_eq!(message[2] & 0xC0, 0xC0);
    }

    #[test]
    fn test_command_packet_layout() {
        let header = CcsdsHeader::new();
        let message = header
            .build_command(MsgId::new(0x1803), 4, &[1, 2, 3, 4])
            .unwrap();

        assert_eq!(message.len(), 12);
        assert!(header.is_command(&message).unwrap());
        assert_eq!(header.fcn_code(&message).unwrap(), 4);
        assert_eq!(header.msg_id(&message).unwrap(), MsgId::new(0x1803));
        assert_eq!(header.size(&message).unwrap(), 12);
    }

    #[test]
    fn test_telemetry_packet_layout() {
        let header = CcsdsHeader::new();
        let message = header
            .build_telemetry(MsgId::new(0x0803), 100, 7, b"{}")
            .unwrap();

        assert_eq!(message.len(), TLM_HEADER_LEN + 2);
        assert!(!header.is_command(&message).unwrap());
        assert_eq!(&message[6..10], &100u32.to_be_bytes());
        assert_eq!(&message[TLM_HEADER_LEN..], b"{}");
        assert_eq!(header.size(&message).unwrap(), TLM_HEADER_LEN + 2);
    }

    #[test]
    fn test_short_message_is_rejected() {
        let header = CcsdsHeader::new();
        assert!(matches!(
            header.msg_id(&[0x01]),
            Err(HeaderError::TooShort { .. })
        ));
        assert!(header.fcn_code(&[0u8; 6]).is_err());
    }
}
