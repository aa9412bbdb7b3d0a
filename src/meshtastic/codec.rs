//! Frame codec: `ToRadio` encoding, `FromRadio` decoding, and builders for the packets
//! the core sends (text, admin, trace route, stream frames).

use base64::Engine;
use bytes::Bytes;
use prost::Message;
use rand::Rng;

use super::error::{MeshError, MeshResult};
use crate::protobuf as proto;
use proto::admin_message::{ConfigType, ModuleConfigType, PayloadVariant as AdminVariant};
use proto::mesh_packet::{PayloadVariant as PacketVariant, Priority};
use proto::{from_radio, to_radio, PortNum};

/// Node number meaning "everyone" (and the placeholder for "no node").
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;
/// Largest `Data.payload` the firmware accepts.
pub const MAX_PAYLOAD_LEN: usize = 237;
/// Largest protobuf body allowed inside a stream frame.
pub const MAX_STREAM_FRAME_LEN: usize = 512;
pub const STREAM_START1: u8 = 0x94;
pub const STREAM_START2: u8 = 0xC3;

/// Random packet id in `[256, 2^32)`; lower values are reserved by the firmware.
pub fn new_packet_id() -> u32 {
    rand::thread_rng().gen_range(256..=u32::MAX)
}

pub fn encode_to_radio(msg: &proto::ToRadio) -> Vec<u8> {
    msg.encode_to_vec()
}

/// Handshake request asking the radio to stream its full state, terminated by a
/// `config_complete_id` equal to `nonce`.
pub fn encode_want_config(nonce: u32) -> Vec<u8> {
    encode_to_radio(&proto::ToRadio {
        payload_variant: Some(to_radio::PayloadVariant::WantConfigId(nonce)),
    })
}

pub fn encode_packet(packet: proto::MeshPacket) -> Vec<u8> {
    encode_to_radio(&proto::ToRadio {
        payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
    })
}

/// Wrap an encoded protobuf in the `0x94 0xC3 <len_hi> <len_lo>` stream header.
pub fn encode_stream_frame(body: &[u8]) -> MeshResult<Vec<u8>> {
    if body.len() > MAX_STREAM_FRAME_LEN {
        return Err(MeshError::PayloadTooLarge {
            len: body.len(),
            max: MAX_STREAM_FRAME_LEN,
        });
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(STREAM_START1);
    out.push(STREAM_START2);
    out.push(((body.len() >> 8) & 0xFF) as u8);
    out.push((body.len() & 0xFF) as u8);
    out.extend_from_slice(body);
    Ok(out)
}

/// A decoded `FromRadio` envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Packet(proto::MeshPacket),
    MyInfo(proto::MyNodeInfo),
    NodeInfo(proto::NodeInfo),
    Channel(proto::Channel),
    Config(proto::Config),
    ModuleConfig(proto::ModuleConfig),
    ConfigComplete(u32),
    Metadata(proto::DeviceMetadata),
    Rebooted,
    /// A read of an empty FromRadio queue.
    Empty,
}

pub fn decode_from_radio(data: &[u8]) -> MeshResult<Inbound> {
    if data.is_empty() {
        return Ok(Inbound::Empty);
    }
    let msg = proto::FromRadio::decode(data)?;
    Ok(match msg.payload_variant {
        Some(from_radio::PayloadVariant::Packet(p)) => Inbound::Packet(p),
        Some(from_radio::PayloadVariant::MyInfo(i)) => Inbound::MyInfo(i),
        Some(from_radio::PayloadVariant::NodeInfo(n)) => Inbound::NodeInfo(n),
        Some(from_radio::PayloadVariant::Channel(c)) => Inbound::Channel(c),
        Some(from_radio::PayloadVariant::Config(c)) => Inbound::Config(c),
        Some(from_radio::PayloadVariant::ModuleConfig(m)) => Inbound::ModuleConfig(m),
        Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => Inbound::ConfigComplete(id),
        Some(from_radio::PayloadVariant::Metadata(m)) => Inbound::Metadata(m),
        Some(from_radio::PayloadVariant::Rebooted(_)) => Inbound::Rebooted,
        None => Inbound::Empty,
    })
}

/// Decode the typed payload of a data message (`Position`, `Routing`, `AdminMessage`, ...).
pub fn decode_payload<T: Message + Default>(data: &proto::Data) -> Result<T, prost::DecodeError> {
    T::decode(data.payload.as_ref())
}

/// Outbound application-data packet before it is wrapped in a `ToRadio`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPacket {
    pub to: u32,
    /// 0 lets the radio fill in its own node number.
    pub from: u32,
    pub channel: u32,
    pub id: u32,
    pub priority: Priority,
    pub want_ack: bool,
    pub port: PortNum,
    pub payload: Vec<u8>,
    pub want_response: bool,
    pub reply_id: u32,
    pub emoji: bool,
}

impl OutboundPacket {
    /// Broadcast packet from the radio itself with a fresh id.
    pub fn new(port: PortNum, payload: Vec<u8>) -> Self {
        Self {
            to: BROADCAST_NUM,
            from: 0,
            channel: 0,
            id: new_packet_id(),
            priority: Priority::Unset,
            want_ack: false,
            port,
            payload,
            want_response: false,
            reply_id: 0,
            emoji: false,
        }
    }

    pub fn into_mesh_packet(self) -> proto::MeshPacket {
        proto::MeshPacket {
            from: self.from,
            to: self.to,
            channel: self.channel,
            id: self.id,
            want_ack: self.want_ack,
            priority: self.priority as i32,
            payload_variant: Some(PacketVariant::Decoded(proto::Data {
                portnum: self.port as i32,
                payload: Bytes::from(self.payload),
                want_response: self.want_response,
                reply_id: self.reply_id,
                emoji: u32::from(self.emoji),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    pub fn encode(self) -> Vec<u8> {
        encode_packet(self.into_mesh_packet())
    }
}

/// Text message addressed to `to` (broadcast when `None` or 0).
pub fn text_packet(
    text: &str,
    to: Option<u32>,
    from: u32,
    channel: u32,
    is_emoji: bool,
    reply_id: Option<u32>,
) -> MeshResult<OutboundPacket> {
    if text.is_empty() {
        return Err(MeshError::EmptyMessage);
    }
    if text.len() > MAX_PAYLOAD_LEN {
        return Err(MeshError::PayloadTooLarge {
            len: text.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut pkt = OutboundPacket::new(PortNum::TextMessageApp, text.as_bytes().to_vec());
    pkt.to = match to {
        Some(0) | None => BROADCAST_NUM,
        Some(n) => n,
    };
    pkt.from = from;
    pkt.channel = channel;
    pkt.want_ack = true;
    pkt.emoji = is_emoji;
    pkt.reply_id = reply_id.unwrap_or(0);
    Ok(pkt)
}

/// Empty route discovery request; each hop appends itself on the way back.
pub fn trace_route_packet(dest: u32, from: u32, want_response: bool) -> OutboundPacket {
    let mut pkt = OutboundPacket::new(
        PortNum::TracerouteApp,
        proto::RouteDiscovery::default().encode_to_vec(),
    );
    pkt.to = dest;
    pkt.from = from;
    pkt.want_response = want_response;
    pkt
}

/// Admin packet: reliable priority, acknowledged, `from = 0`.
pub fn admin_packet(message: &proto::AdminMessage, to: u32, want_response: bool) -> OutboundPacket {
    let mut pkt = OutboundPacket::new(PortNum::AdminApp, message.encode_to_vec());
    pkt.to = to;
    pkt.priority = Priority::Reliable;
    pkt.want_ack = true;
    pkt.want_response = want_response;
    pkt
}

/// Reboot and shutdown delay used by the admin helpers.
pub const ADMIN_DELAY_SECS: i32 = 10;

/// Administrative operations understood by the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminRequest {
    GetChannel(u32),
    GetOwner,
    GetConfig(ConfigType),
    GetModuleConfig(ModuleConfigType),
    GetCannedMessages,
    GetDeviceMetadata,
    SetChannel(proto::Channel),
    SetOwner(proto::User),
    SetConfig(proto::Config),
    SetModuleConfig(proto::ModuleConfig),
    SetCannedMessages(String),
    Reboot { seconds: i32 },
    Shutdown { seconds: i32 },
    FactoryReset,
    NodeDbReset,
}

impl AdminRequest {
    /// Read requests want a reply from the radio.
    pub fn wants_response(&self) -> bool {
        matches!(
            self,
            AdminRequest::GetChannel(_)
                | AdminRequest::GetOwner
                | AdminRequest::GetConfig(_)
                | AdminRequest::GetModuleConfig(_)
                | AdminRequest::GetCannedMessages
                | AdminRequest::GetDeviceMetadata
        )
    }

    /// Human-readable summary recorded with the pending request.
    pub fn description(&self) -> String {
        match self {
            AdminRequest::GetChannel(i) => format!("Requested channel {}", i),
            AdminRequest::GetOwner => "Requested owner".to_string(),
            AdminRequest::GetConfig(t) => format!("Requested {:?}", t),
            AdminRequest::GetModuleConfig(t) => format!("Requested {:?}", t),
            AdminRequest::GetCannedMessages => "Requested canned messages".to_string(),
            AdminRequest::GetDeviceMetadata => "Requested device metadata".to_string(),
            AdminRequest::SetChannel(c) => format!("Saved channel {} config", c.index),
            AdminRequest::SetOwner(u) => format!("Saved owner {}", u.long_name),
            AdminRequest::SetConfig(c) => format!("Saved {} config", config_kind(c)),
            AdminRequest::SetModuleConfig(m) => {
                format!("Saved {} module config", module_config_kind(m))
            }
            AdminRequest::SetCannedMessages(_) => "Saved canned messages".to_string(),
            AdminRequest::Reboot { seconds } => format!("Reboot in {}s", seconds),
            AdminRequest::Shutdown { seconds } => format!("Shutdown in {}s", seconds),
            AdminRequest::FactoryReset => "Factory reset".to_string(),
            AdminRequest::NodeDbReset => "NodeDB reset".to_string(),
        }
    }

    pub fn into_message(self) -> proto::AdminMessage {
        let variant = match self {
            AdminRequest::GetChannel(index) => AdminVariant::GetChannelRequest(index),
            AdminRequest::GetOwner => AdminVariant::GetOwnerRequest(true),
            AdminRequest::GetConfig(t) => AdminVariant::GetConfigRequest(t as i32),
            AdminRequest::GetModuleConfig(t) => AdminVariant::GetModuleConfigRequest(t as i32),
            AdminRequest::GetCannedMessages => {
                AdminVariant::GetCannedMessageModuleMessagesRequest(true)
            }
            AdminRequest::GetDeviceMetadata => AdminVariant::GetDeviceMetadataRequest(true),
            AdminRequest::SetChannel(c) => AdminVariant::SetChannel(c),
            AdminRequest::SetOwner(u) => AdminVariant::SetOwner(u),
            AdminRequest::SetConfig(c) => AdminVariant::SetConfig(c),
            AdminRequest::SetModuleConfig(m) => AdminVariant::SetModuleConfig(m),
            AdminRequest::SetCannedMessages(m) => AdminVariant::SetCannedMessageModuleMessages(m),
            AdminRequest::Reboot { seconds } => AdminVariant::RebootSeconds(seconds),
            AdminRequest::Shutdown { seconds } => AdminVariant::ShutdownSeconds(seconds),
            AdminRequest::FactoryReset => AdminVariant::FactoryReset(1),
            AdminRequest::NodeDbReset => AdminVariant::NodedbReset(1),
        };
        proto::AdminMessage {
            payload_variant: Some(variant),
        }
    }
}

pub fn config_kind(config: &proto::Config) -> &'static str {
    use proto::config::PayloadVariant as C;
    match config.payload_variant {
        Some(C::Device(_)) => "device",
        Some(C::Position(_)) => "position",
        Some(C::Power(_)) => "power",
        Some(C::Network(_)) => "network",
        Some(C::Display(_)) => "display",
        Some(C::Lora(_)) => "lora",
        Some(C::Bluetooth(_)) => "bluetooth",
        None => "empty",
    }
}

pub fn module_config_kind(config: &proto::ModuleConfig) -> &'static str {
    use proto::module_config::PayloadVariant as M;
    match config.payload_variant {
        Some(M::Mqtt(_)) => "mqtt",
        Some(M::Serial(_)) => "serial",
        Some(M::ExternalNotification(_)) => "external notification",
        Some(M::StoreForward(_)) => "store & forward",
        Some(M::RangeTest(_)) => "range test",
        Some(M::Telemetry(_)) => "telemetry",
        Some(M::CannedMessage(_)) => "canned message",
        None => "empty",
    }
}

/// Decode the fragment of a shared channel URL (`https://meshtastic.org/e/#<fragment>`).
/// The fragment is URL-safe base64 with or without padding.
pub fn decode_channel_url(url: &str) -> MeshResult<proto::ChannelSet> {
    let fragment = url.rsplit('#').next().unwrap_or(url).trim();
    let fragment = fragment.trim_end_matches('=');
    if fragment.is_empty() {
        return Err(MeshError::InvalidChannelUrl("empty channel set".to_string()));
    }
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(fragment)
        .map_err(|e| MeshError::InvalidChannelUrl(e.to_string()))?;
    proto::ChannelSet::decode(raw.as_slice())
        .map_err(|e| MeshError::InvalidChannelUrl(e.to_string()))
}

pub fn encode_channel_url(set: &proto::ChannelSet) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(set.encode_to_vec())
}
