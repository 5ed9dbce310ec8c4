pub mod emitter;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod receiver;
pub mod transport;

pub use emitter::{DeadLetterSink, PublishError, TransportEmitter};
#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use memory::MemoryTransport;
pub use receiver::{
    ConnectError, QueueReceiver, ReceiverConfig, ReceiverError, ReceiverHandle, ShutdownMode,
};
pub use transport::{
    Delivery, PartitionFeed, Publisher, Session, SessionEvent, Transport, TransportError,
};
