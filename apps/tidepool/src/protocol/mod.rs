//! Envelopes exchanged with the signaling service.
//!
//! On the wire every message is a JSON object `{type, payload?, src?, dst?}`.
//! Inbound text is decoded into the closed [`Signal`] set; anything that does
//! not fit is a [`CodecError`] and gets dropped by the caller.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown envelope type {0}")]
    UnknownType(String),
    #[error("{0} envelope is missing its payload")]
    MissingPayload(&'static str),
    #[error("{kind} payload is malformed: {source}")]
    InvalidPayload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    #[default]
    Data,
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Serialization {
    #[default]
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "binary-utf8")]
    BinaryUtf8,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub connection_id: String,
    #[serde(rename = "type", default)]
    pub kind: LinkKind,
    pub sdp: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub serialization: Serialization,
    #[serde(default)]
    pub reliable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub connection_id: String,
    #[serde(rename = "type", default)]
    pub kind: LinkKind,
    pub sdp: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub connection_id: String,
    #[serde(rename = "type", default)]
    pub kind: LinkKind,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Open,
    Error(ErrorPayload),
    IdTaken,
    InvalidKey,
    Leave,
    Expire,
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Candidate(CandidatePayload),
}

impl Signal {
    pub fn type_name(&self) -> &'static str {
        match self {
            Signal::Open => "OPEN",
            Signal::Error(_) => "ERROR",
            Signal::IdTaken => "ID-TAKEN",
            Signal::InvalidKey => "INVALID-KEY",
            Signal::Leave => "LEAVE",
            Signal::Expire => "EXPIRE",
            Signal::Offer(_) => "OFFER",
            Signal::Answer(_) => "ANSWER",
            Signal::Candidate(_) => "CANDIDATE",
        }
    }

    /// Path segment used when the envelope travels as a one-shot POST.
    pub fn post_path(&self) -> String {
        self.type_name().to_ascii_lowercase()
    }

    /// Connection the signal belongs to, for the per-connection kinds.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Signal::Offer(payload) => Some(&payload.connection_id),
            Signal::Answer(payload) => Some(&payload.connection_id),
            Signal::Candidate(payload) => Some(&payload.connection_id),
            _ => None,
        }
    }

    fn payload_value(&self) -> Result<Option<Value>, serde_json::Error> {
        match self {
            Signal::Error(payload) => serde_json::to_value(payload).map(Some),
            Signal::Offer(payload) => serde_json::to_value(payload).map(Some),
            Signal::Answer(payload) => serde_json::to_value(payload).map(Some),
            Signal::Candidate(payload) => serde_json::to_value(payload).map(Some),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dst: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub signal: Signal,
    pub src: Option<String>,
    pub dst: Option<String>,
}

impl Envelope {
    pub fn new(signal: Signal) -> Self {
        Self {
            signal,
            src: None,
            dst: None,
        }
    }

    /// Outbound envelope addressed to `dst`; the server fills in `src`.
    pub fn to(dst: impl Into<String>, signal: Signal) -> Self {
        Self {
            signal,
            src: None,
            dst: Some(dst.into()),
        }
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.signal.type_name()
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let wire: WireEnvelope = serde_json::from_value(value)?;
        let signal = match wire.kind.as_str() {
            "OPEN" => Signal::Open,
            "ERROR" => Signal::Error(match wire.payload {
                Some(value) => parse_payload("ERROR", value)?,
                None => ErrorPayload::default(),
            }),
            "ID-TAKEN" => Signal::IdTaken,
            "INVALID-KEY" => Signal::InvalidKey,
            "LEAVE" => Signal::Leave,
            "EXPIRE" => Signal::Expire,
            "OFFER" => Signal::Offer(required_payload("OFFER", wire.payload)?),
            "ANSWER" => Signal::Answer(required_payload("ANSWER", wire.payload)?),
            "CANDIDATE" => Signal::Candidate(required_payload("CANDIDATE", wire.payload)?),
            other => return Err(CodecError::UnknownType(other.to_string())),
        };
        Ok(Self {
            signal,
            src: wire.src,
            dst: wire.dst,
        })
    }

    /// Single-line JSON, safe for newline-delimited framing.
    pub fn encode(&self) -> Result<String, CodecError> {
        let wire = WireEnvelope {
            kind: self.signal.type_name().to_string(),
            payload: self.signal.payload_value()?,
            src: self.src.clone(),
            dst: self.dst.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

fn required_payload<T: DeserializeOwned>(
    kind: &'static str,
    payload: Option<Value>,
) -> Result<T, CodecError> {
    match payload {
        Some(value) if !value.is_null() => parse_payload(kind, value),
        _ => Err(CodecError::MissingPayload(kind)),
    }
}

fn parse_payload<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|source| CodecError::InvalidPayload { kind, source })
}
