//! MQTT 3.1.1 control packet model
//!
//! The packet types are rumqttc's v4 `mqttbytes` model. This module re-exports
//! the ones the engine uses and adds the small conveniences it needs on top:
//! packet names for logs, packet identifiers that treat QoS 0 as "none", and
//! integer conversions for QoS in config files and on the command line.

use thiserror::Error;

pub use rumqttc::mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Login, Packet, PubAck, PubComp, PubRec,
    PubRel, Publish, SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode, UnsubAck,
    Unsubscribe,
};
pub use rumqttc::mqttbytes::QoS;

/// A QoS byte outside 0..=2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid QoS value {0}")]
pub struct InvalidQos(pub u8);

pub fn qos_from_u8(value: u8) -> Result<QoS, InvalidQos> {
    rumqttc::mqttbytes::qos(value).map_err(|_| InvalidQos(value))
}

/// Lower of two QoS levels
pub fn min_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) <= (b as u8) {
        a
    } else {
        b
    }
}

/// Names and identifiers of packets for logging and ack correlation
pub trait PacketExt {
    fn name(&self) -> &'static str;

    /// Packet identifier, `None` for packets without one and QoS 0 publishes
    fn packet_id(&self) -> Option<u16>;
}

impl PacketExt for Packet {
    fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) if publish.qos == QoS::AtMostOnce => None,
            Packet::Publish(publish) => Some(publish.pkid),
            Packet::PubAck(ack) => Some(ack.pkid),
            Packet::PubRec(rec) => Some(rec.pkid),
            Packet::PubRel(rel) => Some(rel.pkid),
            Packet::PubComp(comp) => Some(comp.pkid),
            Packet::Subscribe(subscribe) => Some(subscribe.pkid),
            Packet::SubAck(suback) => Some(suback.pkid),
            Packet::Unsubscribe(unsubscribe) => Some(unsubscribe.pkid),
            Packet::UnsubAck(unsuback) => Some(unsuback.pkid),
            _ => None,
        }
    }
}

/// Serde support for QoS fields written as integers 0..=2
pub mod qos_serde {
    use super::{qos_from_u8, QoS};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*qos as u8)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<QoS, D::Error> {
        let value = u8::deserialize(deserializer)?;
        qos_from_u8(value).map_err(serde::de::Error::custom)
    }
}
