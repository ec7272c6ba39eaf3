//! MAVLink frame values and stream framing.
//!
//! A [`Frame`] is the unit the router moves around: the raw wire bytes of
//! one MAVLink v1/v2 message plus the header fields the routing decisions
//! need. Frames are parsed once at the reading endpoint and then forwarded
//! byte-for-byte, so the raw bytes are kept zero-copy ([`Bytes`]).
//!
//! [`StreamParser`] extracts complete frames from a byte stream, handling
//! partial packets and skipping malformed data until the next candidate
//! start byte.

use bytes::{Buf, Bytes, BytesMut};
use mavlink::common::MavMessage;
use mavlink::{MavHeader, MavlinkVersion, Message};
use memchr::memchr2;
use std::io::Cursor;
use tracing::warn;

// Maximum buffer size to prevent OOM from malformed streams
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Target address of a message: `-1` means the message type carries no
/// target field. Anything `<= 0` is routed as broadcast.
pub const NO_TARGET: i16 = -1;

/// One parsed MAVLink message with the metadata routing needs.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Raw wire bytes of the frame, exactly as received.
    pub raw: Bytes,
    /// MAVLink message header (source system/component, sequence).
    pub header: MavHeader,
    /// MAVLink message id.
    pub msg_id: u32,
    /// Protocol version this frame was framed with.
    pub version: MavlinkVersion,
    /// Target system id, [`NO_TARGET`] if the message has none.
    pub target_sysid: i16,
    /// Target component id, [`NO_TARGET`] if the message has none.
    pub target_compid: i16,
}

impl Frame {
    /// Builds a frame from a decoded message and its wire bytes.
    pub fn new(raw: Bytes, header: MavHeader, message: &MavMessage, version: MavlinkVersion) -> Self {
        let (target_sysid, target_compid) = extract_target(message);
        Self {
            raw,
            header,
            msg_id: message.message_id(),
            version,
            target_sysid,
            target_compid,
        }
    }

    /// Source system id.
    pub fn src_sysid(&self) -> u8 {
        self.header.system_id
    }

    /// Source component id.
    pub fn src_compid(&self) -> u8 {
        self.header.component_id
    }

    /// Wire length in bytes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// True if the frame has no bytes (never produced by the parser).
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// True for MAVLink v2 framing.
    pub fn is_v2(&self) -> bool {
        self.version == MavlinkVersion::V2
    }

    /// True if the message is addressed to everyone: either it carries no
    /// target field at all or it names system 0.
    pub fn is_broadcast(&self) -> bool {
        self.target_sysid <= 0
    }
}

/// Extracts the target system/component ids from a message, or
/// `(NO_TARGET, NO_TARGET)` for message types without target fields.
///
/// The match covers the targeted messages of the common dialect; anything
/// else is broadcast by construction.
pub fn extract_target(msg: &MavMessage) -> (i16, i16) {
    use MavMessage::*;

    let (sys, comp) = match msg {
        // Commands
        COMMAND_INT(m) => (m.target_system, m.target_component),
        COMMAND_LONG(m) => (m.target_system, m.target_component),
        COMMAND_CANCEL(m) => (m.target_system, m.target_component),

        // Mission protocol
        MISSION_REQUEST_LIST(m) => (m.target_system, m.target_component),
        MISSION_REQUEST_PARTIAL_LIST(m) => (m.target_system, m.target_component),
        MISSION_WRITE_PARTIAL_LIST(m) => (m.target_system, m.target_component),
        MISSION_COUNT(m) => (m.target_system, m.target_component),
        MISSION_REQUEST(m) => (m.target_system, m.target_component),
        MISSION_REQUEST_INT(m) => (m.target_system, m.target_component),
        MISSION_ITEM(m) => (m.target_system, m.target_component),
        MISSION_ITEM_INT(m) => (m.target_system, m.target_component),
        MISSION_ACK(m) => (m.target_system, m.target_component),
        MISSION_CLEAR_ALL(m) => (m.target_system, m.target_component),
        MISSION_SET_CURRENT(m) => (m.target_system, m.target_component),

        // Parameter protocol
        PARAM_REQUEST_READ(m) => (m.target_system, m.target_component),
        PARAM_REQUEST_LIST(m) => (m.target_system, m.target_component),
        PARAM_SET(m) => (m.target_system, m.target_component),
        PARAM_MAP_RC(m) => (m.target_system, m.target_component),
        PARAM_EXT_SET(m) => (m.target_system, m.target_component),
        PARAM_EXT_REQUEST_READ(m) => (m.target_system, m.target_component),
        PARAM_EXT_REQUEST_LIST(m) => (m.target_system, m.target_component),

        // Setpoints target a system only
        SET_MODE(m) => (m.target_system, 0),
        SET_POSITION_TARGET_LOCAL_NED(m) => (m.target_system, 0),
        SET_POSITION_TARGET_GLOBAL_INT(m) => (m.target_system, 0),
        SET_ATTITUDE_TARGET(m) => (m.target_system, 0),
        SET_GPS_GLOBAL_ORIGIN(m) => (m.target_system, 0),

        // Streams, ping, RC
        REQUEST_DATA_STREAM(m) => (m.target_system, m.target_component),
        PING(m) => (m.target_system, m.target_component),
        RC_CHANNELS_OVERRIDE(m) => (m.target_system, m.target_component),
        SAFETY_SET_ALLOWED_AREA(m) => (m.target_system, m.target_component),
        GPS_INJECT_DATA(m) => (m.target_system, m.target_component),

        // Operator control
        CHANGE_OPERATOR_CONTROL(m) => (m.target_system, 0),
        CHANGE_OPERATOR_CONTROL_ACK(m) => (m.gcs_system_id, 0),

        // Logging and file transfer
        LOG_REQUEST_LIST(m) => (m.target_system, m.target_component),
        LOG_REQUEST_DATA(m) => (m.target_system, m.target_component),
        LOG_ERASE(m) => (m.target_system, m.target_component),
        LOG_REQUEST_END(m) => (m.target_system, m.target_component),
        LOGGING_DATA(m) => (m.target_system, m.target_component),
        LOGGING_DATA_ACKED(m) => (m.target_system, m.target_component),
        FILE_TRANSFER_PROTOCOL(m) => (m.target_system, m.target_component),

        // Misc targeted messages
        PLAY_TUNE(m) => (m.target_system, m.target_component),
        PLAY_TUNE_V2(m) => (m.target_system, m.target_component),
        TUNNEL(m) => (m.target_system, m.target_component),
        SETUP_SIGNING(m) => (m.target_system, m.target_component),
        GIMBAL_MANAGER_SET_ATTITUDE(m) => (m.target_system, m.target_component),
        GIMBAL_MANAGER_SET_PITCHYAW(m) => (m.target_system, m.target_component),

        // Everything else is broadcast or has no explicit target
        _ => return (NO_TARGET, NO_TARGET),
    };

    (i16::from(sys), i16::from(comp))
}

/// A stateful parser for extracting MAVLink frames from a byte stream.
///
/// Accumulates incoming bytes and reconstructs v1/v2 messages. Partial
/// packets stay buffered until more data arrives; malformed data is skipped
/// a byte at a time until the next candidate start byte. The number of
/// bytes dropped as garbage is reported so endpoint stats can count
/// framing errors.
pub struct StreamParser {
    buffer: BytesMut,
    /// Bytes discarded since the last `take_garbage_bytes` call.
    garbage_bytes: usize,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Creates a new parser with an empty internal buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            garbage_bytes: 0,
        }
    }

    /// Appends new data to the internal buffer.
    ///
    /// If adding the new data would exceed the internal cap the oldest
    /// bytes are dropped, keeping memory bounded on garbage streams.
    pub fn push(&mut self, data: &[u8]) {
        let new_len = self.buffer.len() + data.len();
        if new_len > MAX_BUFFER_SIZE {
            let overflow = new_len - MAX_BUFFER_SIZE;
            warn!(
                "frame buffer full, dropping {} oldest bytes to make room",
                overflow
            );
            self.garbage_bytes += overflow.min(self.buffer.len());
            if overflow <= self.buffer.len() {
                self.buffer.advance(overflow);
            } else {
                self.buffer.clear();
            }
        }
        self.buffer.extend_from_slice(data);
    }

    /// Returns and resets the count of bytes discarded as garbage.
    pub fn take_garbage_bytes(&mut self) -> usize {
        std::mem::take(&mut self.garbage_bytes)
    }

    /// Attempts to parse the next complete MAVLink frame.
    ///
    /// Returns `None` when no complete message is available yet; the
    /// remaining bytes stay buffered for the next read.
    pub fn parse_next(&mut self) -> Option<Frame> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }

            // Find the next candidate STX (0xFD = v2, 0xFE = v1)
            match memchr2(0xFD, 0xFE, &self.buffer) {
                Some(idx) if idx > 0 => {
                    self.garbage_bytes += idx;
                    self.buffer.advance(idx);
                }
                Some(_) => {}
                None => {
                    self.garbage_bytes += self.buffer.len();
                    self.buffer.clear();
                    return None;
                }
            }

            let mut cursor = Cursor::new(&self.buffer[..]);
            let mut peek_reader = mavlink::peek_reader::PeekReader::new(&mut cursor);

            let res_v2 = mavlink::read_v2_msg::<MavMessage, _>(&mut peek_reader);
            match res_v2 {
                Ok((header, message)) => {
                    let len = cursor.position() as usize;
                    let raw = self.buffer.split_to(len).freeze();
                    return Some(Frame::new(raw, header, &message, MavlinkVersion::V2));
                }
                Err(e_v2) => {
                    cursor.set_position(0);
                    let mut peek_reader = mavlink::peek_reader::PeekReader::new(&mut cursor);
                    match mavlink::read_v1_msg::<MavMessage, _>(&mut peek_reader) {
                        Ok((header, message)) => {
                            let len = cursor.position() as usize;
                            let raw = self.buffer.split_to(len).freeze();
                            return Some(Frame::new(raw, header, &message, MavlinkVersion::V1));
                        }
                        Err(e_v1) => {
                            // EOF from either parser means "wait for more
                            // bytes"; anything else is a corrupt packet and
                            // the current STX byte gets skipped.
                            if is_eof(&e_v2) || is_eof(&e_v1) {
                                return None;
                            }
                            self.garbage_bytes += 1;
                            self.buffer.advance(1);
                            continue;
                        }
                    }
                }
            }
        }
    }
}

fn is_eof(e: &mavlink::error::MessageReadError) -> bool {
    match e {
        mavlink::error::MessageReadError::Io(io_err) => {
            io_err.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use mavlink::common::{COMMAND_LONG_DATA, HEARTBEAT_DATA};

    fn heartbeat_bytes_v2(header: MavHeader) -> Vec<u8> {
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA::default());
        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, header, &msg).expect("write v2");
        buf
    }

    #[test]
    fn test_partial_packet_waits_for_more_data() {
        let mut parser = StreamParser::new();
        let buf = heartbeat_bytes_v2(MavHeader::default());

        let split_idx = buf.len() / 2;
        parser.push(&buf[..split_idx]);
        assert!(parser.parse_next().is_none());

        parser.push(&buf[split_idx..]);
        let frame = parser.parse_next().expect("should parse after completion");
        assert_eq!(frame.msg_id, 0);
        assert_eq!(frame.raw.len(), buf.len());
    }

    #[test]
    fn test_v1_packet_parsing() {
        let mut parser = StreamParser::new();
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        };
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA::default());
        let mut buf = Vec::new();
        mavlink::write_v1_msg(&mut buf, header, &msg).expect("write v1");

        parser.push(&buf);
        let frame = parser.parse_next().expect("should parse v1");
        assert!(!frame.is_v2());
        assert_eq!(frame.src_sysid(), 1);
    }

    #[test]
    fn test_v2_packet_keeps_raw_bytes() {
        let mut parser = StreamParser::new();
        let header = MavHeader {
            system_id: 255,
            component_id: 190,
            sequence: 42,
        };
        let buf = heartbeat_bytes_v2(header);

        parser.push(&buf);
        let frame = parser.parse_next().expect("should parse v2");
        assert!(frame.is_v2());
        assert_eq!(frame.src_sysid(), 255);
        assert_eq!(frame.src_compid(), 190);
        assert_eq!(&frame.raw[..], &buf[..]);
    }

    #[test]
    fn test_garbage_before_packet_is_counted() {
        let mut parser = StreamParser::new();
        let buf = heartbeat_bytes_v2(MavHeader::default());

        let mut garbage = vec![0x00, 0x11, 0x22, 0x33, 0x44];
        garbage.extend_from_slice(&buf);

        parser.push(&garbage);
        assert!(parser.parse_next().is_some(), "should skip garbage");
        assert_eq!(parser.take_garbage_bytes(), 5);
        assert_eq!(parser.take_garbage_bytes(), 0);
    }

    #[test]
    fn test_multiple_packets_in_sequence() {
        let mut parser = StreamParser::new();
        let buf = heartbeat_bytes_v2(MavHeader::default());
        let mut stream = Vec::new();
        stream.extend_from_slice(&buf);
        stream.extend_from_slice(&buf);
        stream.extend_from_slice(&buf);

        parser.push(&stream);
        assert!(parser.parse_next().is_some());
        assert!(parser.parse_next().is_some());
        assert!(parser.parse_next().is_some());
        assert!(parser.parse_next().is_none());
    }

    #[test]
    fn test_heartbeat_is_broadcast() {
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA::default());
        assert_eq!(extract_target(&msg), (NO_TARGET, NO_TARGET));
    }

    #[test]
    fn test_command_long_target() {
        let cmd = COMMAND_LONG_DATA {
            target_system: 1,
            target_component: 2,
            command: mavlink::common::MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            confirmation: 0,
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        };
        let (sys, comp) = extract_target(&MavMessage::COMMAND_LONG(cmd));
        assert_eq!((sys, comp), (1, 2));
    }

    #[test]
    fn test_frame_broadcast_flag() {
        let buf = heartbeat_bytes_v2(MavHeader::default());
        let mut parser = StreamParser::new();
        parser.push(&buf);
        let frame = parser.parse_next().expect("parse");
        assert!(frame.is_broadcast());
        assert_eq!(frame.target_sysid, NO_TARGET);
    }
}
