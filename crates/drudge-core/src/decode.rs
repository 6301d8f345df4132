use crate::{DecodeError, Delivery, Message, ParserKind};
use bytes::Bytes;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Handler-facing representation of one message payload
#[derive(Clone)]
pub enum Body {
    Json(Value),
    Raw(Bytes),
    Custom(Arc<dyn Any + Send + Sync>),
}

impl Body {
    pub fn custom<T: Any + Send + Sync>(value: T) -> Self {
        Body::Custom(Arc::new(value))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Body::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Body::Custom(value) => value.downcast_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Body::Raw(bytes) => f.debug_tuple("Raw").field(bytes).finish(),
            Body::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for Body {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Body::Json(a), Body::Json(b)) => a == b,
            (Body::Raw(a), Body::Raw(b)) => a == b,
            (Body::Custom(a), Body::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Decoded payload of a delivery; batches keep one slot per message, in order
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    Single(Option<Body>),
    Batch(Vec<Option<Body>>),
}

impl DecodedBody {
    pub fn single(&self) -> Option<&Body> {
        match self {
            DecodedBody::Single(body) => body.as_ref(),
            DecodedBody::Batch(_) => None,
        }
    }

    pub fn batch(&self) -> Option<&[Option<Body>]> {
        match self {
            DecodedBody::Single(_) => None,
            DecodedBody::Batch(bodies) => Some(bodies),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DecodedBody::Single(_) => 1,
            DecodedBody::Batch(bodies) => bodies.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode every message of a delivery with the given parser.
///
/// Never fails: a body that cannot be decoded is logged and becomes `None`,
/// without affecting the other messages of a batch.
pub fn decode(parser: &ParserKind, delivery: &Delivery) -> DecodedBody {
    match delivery {
        Delivery::Single(message) => DecodedBody::Single(decode_message(parser, message)),
        Delivery::Batch(messages) => DecodedBody::Batch(
            messages.iter().map(|m| decode_message(parser, m)).collect(),
        ),
    }
}

/// Decode a single message, logging and discarding any failure
pub fn decode_message(parser: &ParserKind, message: &Message) -> Option<Body> {
    match try_decode(parser, message) {
        Ok(body) => Some(body),
        Err(e) => {
            error!(
                "Error parsing the message body: {} (parser: {}, body: {})",
                e,
                parser.name(),
                message.body_lossy()
            );
            None
        }
    }
}

fn try_decode(parser: &ParserKind, message: &Message) -> Result<Body, DecodeError> {
    match parser {
        ParserKind::Json => Ok(Body::Json(serde_json::from_slice(&message.body)?)),
        ParserKind::Text => Ok(Body::Raw(message.body.clone())),
        ParserKind::Callable(parse) => match catch_unwind(AssertUnwindSafe(|| parse(message))) {
            Ok(result) => result.map_err(DecodeError::Parser),
            Err(_) => Err(DecodeError::Parser(anyhow::anyhow!("parser panicked"))),
        },
        ParserKind::Codec(codec) => codec.load(&message.body),
    }
}
