//! MQTT 3.1.1 wire protocol
//!
//! Control packets (rumqttc's v4 model), the codec that frames them on a
//! byte stream, and topic name / filter rules.

pub mod codec;
pub mod packet;
pub mod topic;

pub use codec::{CodecError, Mqtt311Codec, PacketCodec};
pub use packet::{
    qos_from_u8, ConnAck, Connect, ConnectReturnCode, InvalidQos, LastWill, Packet, PacketExt,
    Publish, QoS, SubAck, Subscribe, SubscribeReasonCode, Unsubscribe,
};
pub use topic::TopicError;
