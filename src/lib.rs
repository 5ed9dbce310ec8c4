pub mod contracts;
pub mod messaging;
pub mod metrics;
pub mod retry;
pub mod shutdown;

pub use contracts::{Outcome, Terminal, WorkItem};
pub use messaging::{QueueReceiver, ReceiverConfig, ReceiverHandle, ShutdownMode};
pub use retry::{BackoffPolicy, Constant, Exponential, RetryPolicy};
