//! Signaling wire protocol
//!
//! Every frame is a tagged JSON object: `{"type": ..., "data": ...}`.
//! Requests additionally carry an `id`; the server answers them with an ack
//! frame `{"ack": <id>, "data"?: ..., "error"?: {code, message}}`.
//! Unknown message types deserialize to [`ServerMessage::Unknown`] so a newer
//! server never breaks the read loop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    SctpCapabilities, SctpParameters, TransportDirection,
};
use crate::error::{Error, Result};

/// Messages sent by the client
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    Join,
    EndpointCaps(EndpointCapsPayload),
    TransportCreate(TransportCreatePayload),
    TransportConnect(TransportConnectPayload),
    TransportClose(TransportClosePayload),
    IceRestart(IceRestartPayload),
    Produce(ProducePayload),
    ProducerToggle(ProducerTogglePayload),
    ProducerClose(ProducerClosePayload),
    ConsumerToggle(ConsumerTogglePayload),
    ConsumerKeyFrameRequest(ConsumerKeyFrameRequestPayload),
    ConsumerLayersSet(ConsumerLayersSetPayload),
    ConsumerPriority(ConsumerPriorityPayload),
}

/// Messages pushed by the server
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected(ConnectedPayload),
    Joined(JoinedPayload),
    RouterCaps(RouterCapsPayload),
    TransportCreated(TransportCreatedPayload),
    ConsumerCreated(ConsumerCreatedPayload),
    ConsumerState(ConsumerStatePayload),
    ConsumerClosed(ConsumerClosedPayload),
    ProducerState(ProducerStatePayload),
    ProducerClosed(ProducerClosedPayload),
    Permissions(PermissionsPayload),
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub peer_id: String,
    pub room_id: String,
    /// The server recovered the previous session state on reconnect
    #[serde(default)]
    pub recovered: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapsPayload {
    pub router_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCapsPayload {
    pub rtp_capabilities: RtpCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_capabilities: Option<SctpCapabilities>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatePayload {
    pub dir: TransportDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_capabilities: Option<SctpCapabilities>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedPayload {
    pub id: String,
    pub dir: TransportDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
    pub ice_parameters: IceParameters,
    #[serde(default)]
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectPayload {
    pub id: String,
    pub dtls_parameters: DtlsParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportClosePayload {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceRestartPayload {
    pub transport_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
}

/// Acknowledgement payload of an [`ClientMessage::IceRestart`] request
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceRestartAck {
    pub ice_parameters: IceParameters,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducePayload {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub label: String,
}

/// Acknowledgement payload of a [`ClientMessage::Produce`] request
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceAck {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerTogglePayload {
    pub id: String,
    pub paused: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosePayload {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStatePayload {
    pub id: String,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedPayload {
    pub id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCreatedPayload {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub label: String,
    pub peer_id: String,
    #[serde(default)]
    pub producer_paused: bool,
    pub transport_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerTogglePayload {
    pub id: String,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStatePayload {
    pub id: String,
    pub paused: bool,
    pub producer_paused: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosedPayload {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerKeyFrameRequestPayload {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayersSetPayload {
    pub id: String,
    pub spatial_layer: u8,
    pub temporal_layer: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerPriorityPayload {
    pub id: String,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
}

/// Media permissions by label: which the room offers and which are granted
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsPayload {
    pub available: HashMap<String, bool>,
    pub current: HashMap<String, bool>,
}

/// Error payload of a failed acknowledgement
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl From<ErrorPayload> for Error {
    fn from(e: ErrorPayload) -> Self {
        Error::Server {
            code: e.code,
            message: e.message,
        }
    }
}

/// Request frame: a client message with a correlation id
#[derive(Clone, Debug, Serialize)]
pub struct RequestEnvelope {
    pub id: String,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Acknowledgement frame for a request
#[derive(Clone, Debug, Deserialize)]
pub struct AckFrame {
    pub ack: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
}

/// One incoming frame: an ack for a pending request or a pushed message
#[derive(Debug)]
pub enum ServerFrame {
    Ack(AckFrame),
    Message(ServerMessage),
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("ack").is_some() {
            return Ok(ServerFrame::Ack(serde_json::from_value(value)?));
        }
        // `#[serde(other)]` only tolerates unknown tags without a payload, so
        // the tag is checked before the full deserialization.
        let known = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .is_some_and(known_message_type);
        if !known {
            return Ok(ServerFrame::Message(ServerMessage::Unknown));
        }
        Ok(ServerFrame::Message(serde_json::from_value(value)?))
    }
}

fn known_message_type(tag: &str) -> bool {
    matches!(
        tag,
        "connected"
            | "joined"
            | "routerCaps"
            | "transportCreated"
            | "consumerCreated"
            | "consumerState"
            | "consumerClosed"
            | "producerState"
            | "producerClosed"
            | "permissions"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::TransportCreate(TransportCreatePayload {
            dir: TransportDirection::Recv,
            sctp_capabilities: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transportCreate");
        assert_eq!(json["data"]["dir"], "recv");

        let join = serde_json::to_value(ClientMessage::Join).unwrap();
        assert_eq!(join["type"], "join");
    }

    #[test]
    fn test_request_envelope_flattens_message() {
        let req = RequestEnvelope {
            id: "42".to_string(),
            message: ClientMessage::ProducerToggle(ProducerTogglePayload {
                id: "p1".to_string(),
                paused: true,
            }),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], "42");
        assert_eq!(json["type"], "producerToggle");
        assert_eq!(json["data"]["paused"], true);
    }

    #[test]
    fn test_parse_server_message() {
        let text = r#"{
            "type": "consumerState",
            "data": { "id": "c1", "paused": false, "producerPaused": true }
        }"#;
        match ServerFrame::parse(text).unwrap() {
            ServerFrame::Message(ServerMessage::ConsumerState(state)) => {
                assert_eq!(state.id, "c1");
                assert!(!state.paused);
                assert!(state.producer_paused);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_ack_frame() {
        let ok = r#"{ "ack": "7", "data": { "id": "prod-1" } }"#;
        match ServerFrame::parse(ok).unwrap() {
            ServerFrame::Ack(ack) => {
                assert_eq!(ack.ack, "7");
                assert!(ack.error.is_none());
                let produce: ProduceAck = serde_json::from_value(ack.data).unwrap();
                assert_eq!(produce.id, "prod-1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let failed = r#"{ "ack": "8", "error": { "code": 20, "message": "no such transport" } }"#;
        match ServerFrame::parse(failed).unwrap() {
            ServerFrame::Ack(ack) => {
                let err: Error = ack.error.unwrap().into();
                assert_eq!(err.server_code(), Some(20));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_server_message() {
        // Unknown tag carrying a payload
        let text = r#"{ "type": "dominantSpeaker", "data": { "peerId": "p" } }"#;
        match ServerFrame::parse(text).unwrap() {
            ServerFrame::Message(ServerMessage::Unknown) => {}
            other => panic!("unexpected frame: {other:?}"),
        }

        // Unknown tag without one
        match ServerFrame::parse(r#"{ "type": "ping" }"#).unwrap() {
            ServerFrame::Message(ServerMessage::Unknown) => {}
            other => panic!("unexpected frame: {other:?}"),
        }

        // A known tag with a malformed payload is still an error
        let bad = r#"{ "type": "consumerState", "data": { "id": 7 } }"#;
        assert!(ServerFrame::parse(bad).is_err());
    }
}
