//! MQTT 3.1.1 wire codec
//!
//! [`PacketCodec`] is the seam between the engine and the byte stream: the
//! engine only ever hands it packets to encode and a growing receive buffer to
//! decode from. [`Mqtt311Codec`] frames packets with rumqttc's v4 reader and
//! writers and adds the fixed-header checks rumqttc leaves to the caller, so
//! the same codec drives both the client engine and the in-process test broker.

use super::packet::Packet;
use bytes::{BufMut, BytesMut};
use rumqttc::mqttbytes::Error as WireError;
use thiserror::Error;

/// Largest value expressible by the four-byte remaining-length field
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const PUBLISH: u8 = 3;
const PUBREL: u8 = 6;
const SUBSCRIBE: u8 = 8;
const UNSUBSCRIBE: u8 = 10;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),

    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("cannot encode packet: {0}")]
    Unencodable(String),
}

/// Frame encoder/decoder used by the engine and the test broker
pub trait PacketCodec: Send + Sync {
    /// Append the wire form of `packet` to `dst`
    fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Take one complete packet off the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a whole frame; the
    /// buffer is left untouched in that case.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError>;
}

/// MQTT 3.1.1 codec with a configurable inbound size cap
#[derive(Debug, Clone)]
pub struct Mqtt311Codec {
    max_packet_size: usize,
}

impl Default for Mqtt311Codec {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }
}

impl Mqtt311Codec {
    /// Cap on the remaining length of inbound packets
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl PacketCodec for Mqtt311Codec {
    fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let written = match packet {
            Packet::Connect(connect) => connect.write(dst),
            Packet::ConnAck(connack) => connack.write(dst),
            Packet::Publish(publish) => publish.write(dst),
            Packet::PubAck(ack) => ack.write(dst),
            Packet::PubRec(rec) => rec.write(dst),
            Packet::PubRel(rel) => rel.write(dst),
            Packet::PubComp(comp) => comp.write(dst),
            Packet::Subscribe(subscribe) => subscribe.write(dst),
            Packet::SubAck(suback) => suback.write(dst),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(dst),
            Packet::UnsubAck(unsuback) => unsuback.write(dst),
            Packet::PingReq => Ok(write_empty(dst, PINGREQ)),
            Packet::PingResp => Ok(write_empty(dst, PINGRESP)),
            Packet::Disconnect => Ok(write_empty(dst, DISCONNECT)),
        };
        written
            .map(|_| ())
            .map_err(|e| CodecError::Unencodable(e.to_string()))
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        let Some(&first_byte) = src.first() else {
            return Ok(None);
        };
        check_fixed_header_flags(first_byte)?;

        match rumqttc::mqttbytes::v4::read(src, self.max_packet_size) {
            Ok(packet) => Ok(Some(packet)),
            Err(WireError::InsufficientBytes(_)) => Ok(None),
            Err(WireError::PayloadSizeLimitExceeded(size)) => Err(CodecError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            }),
            Err(e) => Err(CodecError::Malformed(e.to_string())),
        }
    }
}

/// Packets with no variable header or payload
fn write_empty(dst: &mut BytesMut, packet_type: u8) -> usize {
    dst.put_u8(packet_type << 4);
    dst.put_u8(0);
    2
}

/// Reject reserved packet types and reserved fixed-header flag values
fn check_fixed_header_flags(first_byte: u8) -> Result<(), CodecError> {
    let packet_type = first_byte >> 4;
    let flags = first_byte & 0x0F;
    match packet_type {
        0 | 15 => Err(CodecError::UnsupportedPacketType(packet_type)),
        PUBLISH if (flags >> 1) & 0b11 == 0b11 => {
            Err(CodecError::Malformed("PUBLISH with QoS 3".to_string()))
        }
        PUBLISH => Ok(()),
        PUBREL | SUBSCRIBE | UNSUBSCRIBE if flags != 0b0010 => Err(CodecError::Malformed(
            format!("reserved flags {flags:#06b} on packet type {packet_type}"),
        )),
        PUBREL | SUBSCRIBE | UNSUBSCRIBE => Ok(()),
        _ if flags != 0 => Err(CodecError::Malformed(format!(
            "reserved flags {flags:#06b} on packet type {packet_type}"
        ))),
        _ => Ok(()),
    }
}
