use crate::{Body, DecodeError, DecodedBody, Delivery, Message};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// User code run against each delivery of a queue
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one delivery. `body` holds `None` for every message whose
    /// payload could not be decoded.
    async fn perform(&self, delivery: &Delivery, body: DecodedBody) -> anyhow::Result<()>;
}

/// Callable parser receiving the whole raw message
pub type BodyParser = Arc<dyn Fn(&Message) -> anyhow::Result<Body> + Send + Sync>;

/// Object-style parser operating on the raw body bytes
pub trait BodyCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Codecs that cannot load a body keep this default
    fn load(&self, _raw: &[u8]) -> Result<Body, DecodeError> {
        Err(DecodeError::Unsupported(self.name().to_string()))
    }
}

/// How a message body is turned into the value handed to the handler
#[derive(Clone, Default)]
pub enum ParserKind {
    Json,
    #[default]
    Text,
    Callable(BodyParser),
    Codec(Arc<dyn BodyCodec>),
}

impl ParserKind {
    pub fn callable<F>(f: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<Body> + Send + Sync + 'static,
    {
        ParserKind::Callable(Arc::new(f))
    }

    pub fn codec<C: BodyCodec + 'static>(codec: C) -> Self {
        ParserKind::Codec(Arc::new(codec))
    }

    pub fn name(&self) -> &str {
        match self {
            ParserKind::Json => "json",
            ParserKind::Text => "text",
            ParserKind::Callable(_) => "callable",
            ParserKind::Codec(codec) => codec.name(),
        }
    }
}

impl fmt::Debug for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParserKind({})", self.name())
    }
}

impl FromStr for ParserKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ParserKind::Json),
            "text" | "none" => Ok(ParserKind::Text),
            other => Err(format!("unknown parser: {}", other)),
        }
    }
}

/// Static registration of a worker for one queue
#[derive(Clone)]
pub struct WorkerDescriptor {
    queue_name: String,
    handler: Arc<dyn Handler>,
    parser: ParserKind,
    auto_delete: bool,
    auto_visibility_timeout: bool,
    batch: bool,
    concurrency: usize,
}

impl WorkerDescriptor {
    pub fn builder(queue_name: impl Into<String>, handler: impl Handler + 'static) -> WorkerDescriptorBuilder {
        WorkerDescriptorBuilder::new(queue_name.into(), Arc::new(handler))
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn parser(&self) -> &ParserKind {
        &self.parser
    }

    /// Delete the message after the handler returns successfully
    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Keep extending the visibility lease while the handler runs
    pub fn auto_visibility_timeout(&self) -> bool {
        self.auto_visibility_timeout
    }

    /// Receive batches instead of single messages
    pub fn batch(&self) -> bool {
        self.batch
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

impl fmt::Debug for WorkerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDescriptor")
            .field("queue_name", &self.queue_name)
            .field("parser", &self.parser)
            .field("auto_delete", &self.auto_delete)
            .field("auto_visibility_timeout", &self.auto_visibility_timeout)
            .field("batch", &self.batch)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Builder for worker descriptors
pub struct WorkerDescriptorBuilder {
    queue_name: String,
    handler: Arc<dyn Handler>,
    parser: ParserKind,
    auto_delete: bool,
    auto_visibility_timeout: bool,
    batch: bool,
    concurrency: usize,
}

impl WorkerDescriptorBuilder {
    pub fn new(queue_name: String, handler: Arc<dyn Handler>) -> Self {
        WorkerDescriptorBuilder {
            queue_name,
            handler,
            parser: ParserKind::default(),
            auto_delete: false,
            auto_visibility_timeout: false,
            batch: false,
            concurrency: 1,
        }
    }

    pub fn parser(mut self, parser: ParserKind) -> Self {
        self.parser = parser;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn auto_visibility_timeout(mut self, enabled: bool) -> Self {
        self.auto_visibility_timeout = enabled;
        self
    }

    pub fn batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn build(self) -> WorkerDescriptor {
        WorkerDescriptor {
            queue_name: self.queue_name,
            handler: self.handler,
            parser: self.parser,
            auto_delete: self.auto_delete,
            auto_visibility_timeout: self.auto_visibility_timeout,
            batch: self.batch,
            concurrency: self.concurrency,
        }
    }
}
