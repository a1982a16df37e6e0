//! Signaling wire format.
//!
//! Request: `{"id": 7, "method": "consume", "data": {...}}`
//!
//! Replies echo the request id:
//!
//! ```text
//! {"id": 7, "ok": true,  "data": {...} | null}
//! {"id": 7, "ok": false, "error": {"code": "NOT_FOUND", "message": "..."}}
//! ```
//!
//! A frame whose id cannot be read is answered with `"id": null`.

use crate::engine::{DtlsParameters, RtpCapabilities};
use crate::errors::SfuError;
use common::types::{ConsumerId, TransportId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Signaling methods a peer may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    CreateSource,
    GetRouterRtpCapabilities,
    CreateConsumerTransport,
    ConnectConsumerTransport,
    Consume,
    Resume,
}

impl Method {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "createSource" => Some(Method::CreateSource),
            "getRouterRtpCapabilities" => Some(Method::GetRouterRtpCapabilities),
            "createConsumerTransport" => Some(Method::CreateConsumerTransport),
            "connectConsumerTransport" => Some(Method::ConnectConsumerTransport),
            "consume" => Some(Method::Consume),
            "resume" => Some(Method::Resume),
            _ => None,
        }
    }

    /// Wire name, also the `method` metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::CreateSource => "createSource",
            Method::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Method::CreateConsumerTransport => "createConsumerTransport",
            Method::ConnectConsumerTransport => "connectConsumerTransport",
            Method::Consume => "consume",
            Method::Resume => "resume",
        }
    }
}

/// Inbound request frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RequestFrame {
    /// Parse a text frame.
    ///
    /// On failure returns whatever id could be recovered so the error reply
    /// can still be correlated.
    pub fn parse(text: &str) -> Result<Self, (Option<u64>, SfuError)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| (None, SfuError::BadRequest(format!("invalid JSON: {e}"))))?;
        let id = value.get("id").and_then(Value::as_u64);

        serde_json::from_value(value)
            .map_err(|e| (id, SfuError::BadRequest(format!("invalid frame: {e}"))))
    }

    /// Decode the payload into a method's request type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, SfuError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| SfuError::BadRequest(format!("{} requires data", self.method)))?;
        serde_json::from_value(data)
            .map_err(|e| SfuError::BadRequest(format!("invalid {} data: {e}", self.method)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Outbound reply frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyFrame {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ReplyFrame {
    #[must_use]
    pub fn success(id: u64, data: Value) -> Self {
        Self {
            id: Some(id),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Error reply carrying only the client-safe message.
    #[must_use]
    pub fn failure(id: Option<u64>, error: &SfuError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.error_code(),
                message: error.client_message(),
            }),
        }
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"id":null,"ok":false,"error":{"code":"INTERNAL","message":"An internal error occurred"}}"#
                .to_string()
        })
    }
}

// ----------------------------------------------------------------------------
// Request payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSourceRequest {
    pub name: String,
    pub origin_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub source: String,
    pub transport_id: TransportId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub consumer_id: ConsumerId,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_names() {
        for method in [
            Method::CreateSource,
            Method::GetRouterRtpCapabilities,
            Method::CreateConsumerTransport,
            Method::ConnectConsumerTransport,
            Method::Consume,
            Method::Resume,
        ] {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("produce"), None);
    }

    #[test]
    fn test_parse_frame_without_data() {
        let frame = RequestFrame::parse(r#"{"id": 3, "method": "getRouterRtpCapabilities"}"#)
            .unwrap();
        assert_eq!(frame.id, 3);
        assert_eq!(frame.data, None);
    }

    #[test]
    fn test_parse_keeps_id_of_malformed_frame() {
        let (id, err) = RequestFrame::parse(r#"{"id": 9, "data": {}}"#).unwrap_err();
        assert_eq!(id, Some(9));
        assert_eq!(err.error_code(), "BAD_REQUEST");

        let (id, _) = RequestFrame::parse("not json").unwrap_err();
        assert_eq!(id, None);
    }

    #[test]
    fn test_payload_requires_fields() {
        let frame = RequestFrame::parse(
            r#"{"id": 1, "method": "createSource", "data": {"name": "cam1"}}"#,
        )
        .unwrap();
        let result: Result<CreateSourceRequest, _> = frame.payload();
        assert!(matches!(result, Err(SfuError::BadRequest(_))));

        let frame = RequestFrame::parse(r#"{"id": 2, "method": "resume"}"#).unwrap();
        let result: Result<ResumeRequest, _> = frame.payload();
        assert!(matches!(result, Err(SfuError::BadRequest(_))));
    }

    #[test]
    fn test_reply_shapes() {
        let ok = serde_json::to_value(ReplyFrame::success(4, Value::Null)).unwrap();
        assert_eq!(ok, json!({"id": 4, "ok": true, "data": null}));

        let err = serde_json::to_value(ReplyFrame::failure(
            Some(5),
            &SfuError::SourceNotFound("doesNotExist".to_string()),
        ))
        .unwrap();
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"]["code"], "NOT_FOUND");
        assert!(err.get("data").is_none());
    }

    #[test]
    fn test_failure_hides_internal_details() {
        let reply = ReplyFrame::failure(Some(1), &SfuError::Internal("db password".to_string()));
        let error = reply.error.unwrap();
        assert_eq!(error.code, "INTERNAL");
        assert!(!error.message.contains("password"));
    }
}
