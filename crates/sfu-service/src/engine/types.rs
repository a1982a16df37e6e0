//! Wire types exchanged with the media engine and with signaling peers.
//!
//! Field names serialize in camelCase so payloads match what browser-side
//! SFU client libraries send and expect.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use common::types::{ConsumerId, ProducerId, TransportId};

/// Media kind of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// RTCP feedback mechanism supported by a codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

/// A codec the router (or a remote peer) is able to handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Whether this capability describes the given codec (mime type and clock rate).
    #[must_use]
    pub fn matches(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type) && self.clock_rate == clock_rate
    }
}

/// Negotiated codec/RTP capability description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// Codec entry of concrete RTP parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Encoding entry of concrete RTP parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_reduced_size")]
    pub reduced_size: bool,
}

fn default_reduced_size() -> bool {
    true
}

/// Concrete RTP parameters of a producer or consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default = "default_dtls_role")]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

fn default_dtls_role() -> DtlsRole {
    DtlsRole::Auto
}

/// Consumer type as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

/// Options for the one-way ingress endpoint an encoder pushes into.
#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: String,
    /// Separate RTCP port when false.
    pub rtcp_mux: bool,
    /// Learn the remote address from the first received packet.
    pub comedia: bool,
}

/// An allocated ingress endpoint and its negotiated local ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainTransportInfo {
    pub id: TransportId,
    pub local_ip: String,
    pub rtp_port: u16,
    /// Present when `rtcp_mux` was disabled.
    pub rtcp_port: Option<u16>,
}

/// Negotiation parameters of a bidirectional peer transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Result of creating a consumer on a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumer_type: ConsumerType,
    pub paused: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capabilities_accept_browser_shape() {
        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [{
                "kind": "video",
                "mimeType": "video/H264",
                "preferredPayloadType": 102,
                "clockRate": 90000,
                "parameters": { "packetization-mode": 1 },
                "rtcpFeedback": [{ "type": "nack" }, { "type": "nack", "parameter": "pli" }]
            }],
            "headerExtensions": []
        }))
        .unwrap();

        assert_eq!(caps.codecs.len(), 1);
        assert!(caps.codecs[0].matches("video/h264", 90000));
        assert_eq!(caps.codecs[0].rtcp_feedback[1].parameter, "pli");
    }

    #[test]
    fn test_dtls_role_defaults_to_auto() {
        let dtls: DtlsParameters = serde_json::from_value(json!({
            "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }]
        }))
        .unwrap();
        assert_eq!(dtls.role, DtlsRole::Auto);
    }

    #[test]
    fn test_transport_params_serialize_camel_case() {
        let params = WebRtcTransportParams {
            id: TransportId::new(),
            ice_parameters: IceParameters {
                username_fragment: "ufrag".to_string(),
                password: "pwd".to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![],
            },
        };

        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("iceParameters").is_some());
        assert_eq!(value["iceParameters"]["usernameFragment"], "ufrag");
        assert!(value.get("dtlsParameters").is_some());
    }
}
