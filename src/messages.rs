//! # Wire Protocol Messages
//!
//! Control-plane messages exchanged between a site and the relay, and the
//! codec that maps them onto UDP datagrams. Every datagram starts with a
//! fixed five-byte header followed by a type-specific payload:
//!
//! ```text
//! [ type: u8 ][ correlation_id: u32 BE ][ payload ... ]
//! ```
//!
//! | Type | Message | Payload |
//! |------|---------|---------|
//! | 0x01 | `Join` | bincode `JoinBody` |
//! | 0x02 | `Configure` | bincode `LinkAdvert` |
//! | 0x03 | `Goodbye` | none |
//! | 0x04 | `KeepAlive` | one byte, request flag |
//! | 0x05 | `Bundle` | raw opaque bytes |
//! | 0x06 | `Response` | bincode `ResponsePayload` |
//!
//! Bincode payloads are decoded with size limits enforced to prevent memory
//! exhaustion from hostile datagrams. Encode and decode are total and
//! side-effect free: malformed input yields a [`CodecError`], never a panic,
//! and callers discard the offending datagram and continue.
//!
//! ## Correlation
//!
//! A request that expects a reply carries a fresh random nonzero correlation
//! ID, reused unchanged across retries of that request. A `Response` echoes
//! the ID of the request it answers. Traffic that expects no reply
//! (`Bundle`, `Goodbye`) uses ID 0.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::config::LinkAdvert;

/// Size of the datagram header: type(1) + correlation_id(4).
pub const HEADER_SIZE: usize = 5;

/// Minimum size of any control message; anything shorter is discarded.
pub const MIN_MESSAGE_SIZE: usize = HEADER_SIZE;

/// Maximum datagram this protocol will produce or accept (UDP payload limit).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

const TAG_JOIN: u8 = 0x01;
const TAG_CONFIGURE: u8 = 0x02;
const TAG_GOODBYE: u8 = 0x03;
const TAG_KEEPALIVE: u8 = 0x04;
const TAG_BUNDLE: u8 = 0x05;
const TAG_RESPONSE: u8 = 0x06;

/// Returns bincode options with size limits enforced.
/// Always used for payload deserialization to bound allocation.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .with_fixint_encoding()
}

fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode_options().deserialize(bytes).map_err(CodecError::Payload)
}

fn serialize_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode_options().serialize(value).map_err(CodecError::Payload)
}

/// Codec-level failures. All are protocol violations from the caller's
/// point of view: log, drop the datagram, keep the loop running.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Datagram shorter than the minimum control-message size.
    #[error("datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum acceptable length for the message in question.
        expected: usize,
        /// Actual datagram length.
        actual: usize,
    },

    /// Datagram (or encoded message) above the transport maximum.
    #[error("datagram too large: {actual} bytes (max {max})")]
    TooLarge {
        /// Offending length.
        actual: usize,
        /// The enforced maximum.
        max: usize,
    },

    /// Unrecognized message type tag.
    #[error("unknown message type tag: 0x{0:02x}")]
    UnknownTag(u8),

    /// Payload bytes did not decode as the tagged message's body.
    #[error("malformed payload: {0}")]
    Payload(#[source] bincode::Error),
}

/// Body of a `Join` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinBody {
    /// Requested site name, or [`crate::config::AUTO_ASSIGN`].
    pub site_name: String,
    /// The joining site's advertised configuration subset.
    pub config: LinkAdvert,
}

/// Body of a `Response`, correlated to a prior request by the envelope ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Whether the request was accepted.
    pub ok: bool,
    /// Human-readable detail; the rejection reason when `ok` is false.
    pub text: String,
}

impl ResponsePayload {
    /// An affirmative response with no detail text.
    pub fn ok() -> Self {
        Self { ok: true, text: String::new() }
    }

    /// A rejection carrying the given reason.
    pub fn error(text: impl Into<String>) -> Self {
        Self { ok: false, text: text.into() }
    }
}

/// The control messages of the relay link protocol.
///
/// Modeled as an exhaustive sum type so every variant must be handled at
/// each dispatch site; there is no silent "unsupported type" fallthrough.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request membership under a site name, advertising configuration.
    Join(JoinBody),
    /// Push the sender's advertised configuration to the peer.
    Configure(LinkAdvert),
    /// Graceful teardown notice; lets the peer release the site immediately.
    Goodbye,
    /// Liveness traffic. A request expects a correlated `Response`.
    KeepAlive {
        /// True when the sender expects an acknowledgment.
        is_request: bool,
    },
    /// Opaque forwarded simulation payload.
    Bundle {
        /// Payload bytes, never interpreted by this layer.
        payload: Vec<u8>,
    },
    /// Correlated answer to a prior request.
    Response(ResponsePayload),
}

impl Message {
    fn tag(&self) -> u8 {
        match self {
            Message::Join(_) => TAG_JOIN,
            Message::Configure(_) => TAG_CONFIGURE,
            Message::Goodbye => TAG_GOODBYE,
            Message::KeepAlive { .. } => TAG_KEEPALIVE,
            Message::Bundle { .. } => TAG_BUNDLE,
            Message::Response(_) => TAG_RESPONSE,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join(_) => "join",
            Message::Configure(_) => "configure",
            Message::Goodbye => "goodbye",
            Message::KeepAlive { .. } => "keep-alive",
            Message::Bundle { .. } => "bundle",
            Message::Response(_) => "response",
        }
    }
}

/// One datagram's worth of protocol traffic: a message plus its
/// correlation ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Pairs a request with its eventual response; 0 when uncorrelated.
    pub correlation_id: u32,
    /// The carried control message.
    pub message: Message,
}

impl Envelope {
    /// An envelope correlated under `id`.
    pub fn new(correlation_id: u32, message: Message) -> Self {
        Self { correlation_id, message }
    }

    /// An envelope for traffic that expects no reply.
    pub fn uncorrelated(message: Message) -> Self {
        Self { correlation_id: 0, message }
    }
}

/// Encode an envelope into a datagram payload.
///
/// Fails with [`CodecError::TooLarge`] rather than ever producing a
/// datagram above [`MAX_DATAGRAM_SIZE`].
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let payload = match &envelope.message {
        Message::Join(body) => serialize_payload(body)?,
        Message::Configure(advert) => serialize_payload(advert)?,
        Message::Goodbye => Vec::new(),
        Message::KeepAlive { is_request } => vec![u8::from(*is_request)],
        Message::Bundle { payload } => payload.clone(),
        Message::Response(body) => serialize_payload(body)?,
    };

    let total = HEADER_SIZE + payload.len();
    if total > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge { actual: total, max: MAX_DATAGRAM_SIZE });
    }

    let mut buf = Vec::with_capacity(total);
    buf.push(envelope.message.tag());
    buf.extend_from_slice(&envelope.correlation_id.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a datagram back into exactly one envelope.
pub fn decode(datagram: &[u8]) -> Result<Envelope, CodecError> {
    if datagram.len() < MIN_MESSAGE_SIZE {
        return Err(CodecError::TooShort { expected: MIN_MESSAGE_SIZE, actual: datagram.len() });
    }
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge { actual: datagram.len(), max: MAX_DATAGRAM_SIZE });
    }

    let tag = datagram[0];
    let correlation_id = u32::from_be_bytes(
        datagram[1..HEADER_SIZE].try_into().expect("header slice is 4 bytes"),
    );
    let payload = &datagram[HEADER_SIZE..];

    let message = match tag {
        TAG_JOIN => Message::Join(deserialize_bounded(payload)?),
        TAG_CONFIGURE => Message::Configure(deserialize_bounded(payload)?),
        TAG_GOODBYE => Message::Goodbye,
        TAG_KEEPALIVE => {
            let flag = payload.first().ok_or(CodecError::TooShort {
                expected: HEADER_SIZE + 1,
                actual: datagram.len(),
            })?;
            Message::KeepAlive { is_request: *flag != 0 }
        }
        TAG_BUNDLE => Message::Bundle { payload: payload.to_vec() },
        TAG_RESPONSE => Message::Response(deserialize_bounded(payload)?),
        other => return Err(CodecError::UnknownTag(other)),
    };

    Ok(Envelope { correlation_id, message })
}
