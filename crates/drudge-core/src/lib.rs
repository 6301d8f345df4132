mod message;
mod error;
mod queue;
mod memory;
mod descriptor;
mod decode;

pub use message::{Message, MessageId, Delivery};
pub use error::{QueueError, DecodeError, Result};
pub use queue::QueueClient;
pub use memory::InMemoryQueue;
pub use descriptor::{Handler, ParserKind, BodyCodec, BodyParser, WorkerDescriptor, WorkerDescriptorBuilder};
pub use decode::{decode, decode_message, Body, DecodedBody};

/// Largest number of messages a single fetch may return
pub const MAX_BATCH_SIZE: usize = 10;
