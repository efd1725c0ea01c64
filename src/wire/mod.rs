//! MCS wire protocol: constants, message schemas and framing.
//!
//! Every frame on the stream is a tag byte, a varint payload length and the
//! payload itself. The tag selects one of the registered schemas:
//!
//! | Tag | Message              | Tag | Message              |
//! |-----|----------------------|-----|----------------------|
//! | 0   | HeartbeatPing        | 8   | DataMessageStanza    |
//! | 1   | HeartbeatAck         | 9   | BatchPresenceStanza  |
//! | 2   | LoginRequest         | 10  | StreamErrorStanza    |
//! | 3   | LoginResponse        | 11  | HttpRequest          |
//! | 4   | Close                | 12  | HttpResponse         |
//! | 5   | MessageStanza        | 13  | BindAccountRequest   |
//! | 6   | PresenceStanza       | 14  | BindAccountResponse  |
//! | 7   | IqStanza             | 15  | TalkMetadata         |
//!
//! Only the subset a receiving client needs is modelled as a payload schema;
//! the remaining tags decode to [`Decoded::Unsupported`] and are skipped
//! without touching session state. A tag byte outside the table is a fatal
//! protocol error.

#![allow(missing_docs)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PushError, Result};

pub mod framer;
pub mod varint;

pub use framer::{framer_pair, read_frame, write_frame, FrameReader, FrameWriter, RawFrame};

/// Production MCS endpoint host.
pub const MCS_HOST: &str = "mtalk.google.com";

/// Production MCS endpoint port.
pub const MCS_PORT: u16 = 5228;

/// Protocol version this client speaks.
pub const MCS_VERSION: u8 = 41;

/// Oldest protocol version still accepted from servers.
pub const MCS_LEGACY_VERSION: u8 = 38;

/// Upper bound on a single frame payload. Anything larger is treated as a
/// framing desync rather than a legitimate message.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// IQ extension id carrying a selective acknowledgement.
pub const SELECTIVE_ACK_EXTENSION_ID: i32 = 12;

/// IQ extension id carrying a stream acknowledgement.
pub const STREAM_ACK_EXTENSION_ID: i32 = 13;

const LOGIN_CLIENT_ID: &str = "chrome-63.0.3234.0";
const LOGIN_DOMAIN: &str = "mcs.android.com";
const LOGIN_SETTING_NAME: &str = "new_vc";
const LOGIN_SETTING_VALUE: &str = "1";
const AUTH_SERVICE_ANDROID_ID: i32 = 2;
const NETWORK_TYPE_WIFI: i32 = 1;

/// Message tag bytes defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    HeartbeatPing = 0,
    HeartbeatAck = 1,
    LoginRequest = 2,
    LoginResponse = 3,
    Close = 4,
    MessageStanza = 5,
    PresenceStanza = 6,
    IqStanza = 7,
    DataMessageStanza = 8,
    BatchPresenceStanza = 9,
    StreamErrorStanza = 10,
    HttpRequest = 11,
    HttpResponse = 12,
    BindAccountRequest = 13,
    BindAccountResponse = 14,
    TalkMetadata = 15,
}

impl MessageTag {
    /// Map a wire tag byte to its enum value.
    pub fn from_byte(byte: u8) -> Result<Self> {
        let tag = match byte {
            0 => MessageTag::HeartbeatPing,
            1 => MessageTag::HeartbeatAck,
            2 => MessageTag::LoginRequest,
            3 => MessageTag::LoginResponse,
            4 => MessageTag::Close,
            5 => MessageTag::MessageStanza,
            6 => MessageTag::PresenceStanza,
            7 => MessageTag::IqStanza,
            8 => MessageTag::DataMessageStanza,
            9 => MessageTag::BatchPresenceStanza,
            10 => MessageTag::StreamErrorStanza,
            11 => MessageTag::HttpRequest,
            12 => MessageTag::HttpResponse,
            13 => MessageTag::BindAccountRequest,
            14 => MessageTag::BindAccountResponse,
            15 => MessageTag::TalkMetadata,
            other => return Err(PushError::UnknownTag(other)),
        };
        Ok(tag)
    }
}

/// Key/value attribute attached to a data message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppData {
    pub key: String,
    pub value: String,
}

/// Name/value pair sent with the login request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub name: String,
    pub value: String,
}

/// Client heartbeat report included with login when a server-side heartbeat
/// interval is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStat {
    pub ip: String,
    pub timeout: bool,
    pub interval_ms: u64,
}

/// Login request, the first message sent on every connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub id: String,
    pub domain: String,
    pub user: String,
    pub resource: String,
    pub auth_token: String,
    pub device_id: String,
    pub auth_service: i32,
    pub network_type: i32,
    pub adaptive_heartbeat: bool,
    pub use_rmq2: bool,
    pub setting: Vec<Setting>,
    /// Persistent ids received but not yet confirmed by a login, replayed so
    /// the server does not redeliver them.
    pub received_persistent_id: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_stat: Option<HeartbeatStat>,
}

impl LoginRequest {
    /// Build a login request for the given device credentials.
    pub fn new(
        android_id: u64,
        security_token: u64,
        received_persistent_ids: Vec<String>,
        server_heartbeat_interval: Option<Duration>,
    ) -> Self {
        Self {
            id: LOGIN_CLIENT_ID.to_string(),
            domain: LOGIN_DOMAIN.to_string(),
            user: android_id.to_string(),
            resource: android_id.to_string(),
            auth_token: security_token.to_string(),
            device_id: format!("android-{android_id:x}"),
            auth_service: AUTH_SERVICE_ANDROID_ID,
            network_type: NETWORK_TYPE_WIFI,
            adaptive_heartbeat: false,
            use_rmq2: true,
            setting: vec![Setting {
                name: LOGIN_SETTING_NAME.to_string(),
                value: LOGIN_SETTING_VALUE.to_string(),
            }],
            received_persistent_id: received_persistent_ids,
            heartbeat_stat: server_heartbeat_interval.map(|interval| HeartbeatStat {
                ip: String::new(),
                timeout: true,
                interval_ms: interval.as_millis() as u64,
            }),
        }
    }
}

/// Error detail attached to a rejected login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInfo {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Server reply to a [`LoginRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
}

/// Heartbeat probe, sent by either side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatPing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stream_id_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

/// Heartbeat reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatAck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stream_id_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

/// Server request to tear the connection down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {}

/// Opaque extension blob carried inside an [`IqStanza`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Extension {
    pub id: i32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// IQ stanza kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IqType {
    Get,
    #[default]
    Set,
    Result,
    Error,
}

/// Control stanza used for acknowledgements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IqStanza {
    #[serde(rename = "type")]
    pub iq_type: IqType,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<Extension>,
}

impl IqStanza {
    /// Build a selective acknowledgement for the given persistent ids.
    pub fn selective_ack(persistent_ids: Vec<String>) -> Result<Self> {
        let ack = SelectiveAck {
            id: persistent_ids,
        };
        Ok(Self {
            iq_type: IqType::Set,
            id: String::new(),
            extension: Some(Extension {
                id: SELECTIVE_ACK_EXTENSION_ID,
                data: serde_json::to_vec(&ack)?,
            }),
        })
    }
}

/// Payload of a selective acknowledgement extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectiveAck {
    pub id: Vec<String>,
}

/// An application push message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataMessageStanza {
    pub id: String,
    #[serde(rename = "from")]
    pub sender: String,
    pub category: String,
    /// Server-assigned id used for acknowledgement and replay suppression.
    pub persistent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stream_id_received: Option<u64>,
    pub app_data: Vec<AppData>,
    #[serde(with = "base64_bytes")]
    pub raw_data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl DataMessageStanza {
    /// Look up an app-data attribute by key.
    pub fn app_data_value(&self, key: &str) -> Option<&str> {
        self.app_data
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_str())
    }
}

/// A fully decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McsMessage {
    HeartbeatPing(HeartbeatPing),
    HeartbeatAck(HeartbeatAck),
    LoginRequest(Box<LoginRequest>),
    LoginResponse(LoginResponse),
    Close(Close),
    IqStanza(IqStanza),
    DataMessage(Box<DataMessageStanza>),
}

/// Outcome of decoding a frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A message with a modelled schema.
    Message(McsMessage),
    /// A valid tag this client does not act on; the frame is skipped.
    Unsupported(MessageTag),
}

impl McsMessage {
    /// The wire tag for this message.
    pub fn tag(&self) -> MessageTag {
        match self {
            McsMessage::HeartbeatPing(_) => MessageTag::HeartbeatPing,
            McsMessage::HeartbeatAck(_) => MessageTag::HeartbeatAck,
            McsMessage::LoginRequest(_) => MessageTag::LoginRequest,
            McsMessage::LoginResponse(_) => MessageTag::LoginResponse,
            McsMessage::Close(_) => MessageTag::Close,
            McsMessage::IqStanza(_) => MessageTag::IqStanza,
            McsMessage::DataMessage(_) => MessageTag::DataMessageStanza,
        }
    }

    /// Serialize the payload for framing.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            McsMessage::HeartbeatPing(m) => serde_json::to_vec(m)?,
            McsMessage::HeartbeatAck(m) => serde_json::to_vec(m)?,
            McsMessage::LoginRequest(m) => serde_json::to_vec(m)?,
            McsMessage::LoginResponse(m) => serde_json::to_vec(m)?,
            McsMessage::Close(m) => serde_json::to_vec(m)?,
            McsMessage::IqStanza(m) => serde_json::to_vec(m)?,
            McsMessage::DataMessage(m) => serde_json::to_vec(m)?,
        };
        Ok(bytes)
    }
}

/// Decode a frame payload according to its tag.
///
/// An unrecognized tag byte is a fatal [`PushError::UnknownTag`]; a known tag
/// without a modelled schema decodes to [`Decoded::Unsupported`]. An empty
/// payload decodes to the schema's default, mirroring how absent fields are
/// treated on the wire.
pub fn decode_message(tag: u8, payload: &[u8]) -> Result<Decoded> {
    let tag = MessageTag::from_byte(tag)?;
    let message = match tag {
        MessageTag::HeartbeatPing => McsMessage::HeartbeatPing(parse_payload(payload)?),
        MessageTag::HeartbeatAck => McsMessage::HeartbeatAck(parse_payload(payload)?),
        MessageTag::LoginRequest => McsMessage::LoginRequest(Box::new(parse_payload(payload)?)),
        MessageTag::LoginResponse => McsMessage::LoginResponse(parse_payload(payload)?),
        MessageTag::Close => McsMessage::Close(parse_payload(payload)?),
        MessageTag::IqStanza => McsMessage::IqStanza(parse_payload(payload)?),
        MessageTag::DataMessageStanza => McsMessage::DataMessage(Box::new(parse_payload(payload)?)),
        other => return Ok(Decoded::Unsupported(other)),
    };
    Ok(Decoded::Message(message))
}

fn parse_payload<T>(payload: &[u8]) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if payload.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(payload)?)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
