use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// The Phoenix-channel reference: a caller-chosen correlation id threaded
/// through a request and its reply. `None` marks a push with no reply
/// expected.
pub type EnvelopeRef = Option<u64>;

/// `{topic, event, ref?, payload}` — the framing every role speaks,
/// generalized over the event/payload union `M` (an adjacently-tagged enum
/// with `tag = "event", content = "payload"`). Matches the envelope this
/// product's agent software already speaks on the client side of this exact
/// protocol byte-for-byte; the broker is the other half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub topic: String,
    #[serde(flatten)]
    pub message: M,
    #[serde(rename = "ref")]
    pub reference: EnvelopeRef,
}

impl<M> Envelope<M> {
    pub fn new(topic: impl Into<String>, message: M, reference: EnvelopeRef) -> Self {
        Self {
            topic: topic.into(),
            message,
            reference,
        }
    }
}

/// The reply to a request-shaped inbound message, sent back on the same
/// `ref` as a `phx_reply` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    Ok { response: T },
    Error { response: ErrorResponse },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub reason: WireError,
}

impl<T> Reply<T> {
    pub fn ok(response: T) -> Self {
        Reply::Ok { response }
    }

    pub fn error(reason: WireError) -> Self {
        Reply::Error {
            response: ErrorResponse { reason },
        }
    }
}

pub const PHX_REPLY_EVENT: &str = "phx_reply";

/// A `phx_reply` frame. Unlike [`Envelope`], the event name is fixed, so
/// this is a distinct (non-generic-over-event) wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyFrame<T> {
    pub topic: String,
    pub event: String,
    #[serde(rename = "ref")]
    pub reference: EnvelopeRef,
    pub payload: Reply<T>,
}

impl<T> ReplyFrame<T> {
    pub fn new(topic: impl Into<String>, reference: EnvelopeRef, reply: Reply<T>) -> Self {
        Self {
            topic: topic.into(),
            event: PHX_REPLY_EVENT.to_string(),
            reference,
            payload: reply,
        }
    }
}
