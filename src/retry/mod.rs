pub mod backoff;
pub mod machine;

pub use backoff::{BackoffPolicy, Constant, Exponential, RetryPolicy};
pub use machine::RetryMachine;
