//! Delivery subsystem: the in-process event bus with JSONL persistence,
//! the file-backed dead-letter queue, and the outbound webhook adapters
//! that ride on both.

pub mod adapters;
pub mod bus;
pub mod dlq;

pub use bus::{EventBus, PipelineEvent};
pub use dlq::{DeadLetterQueue, DlqEntry, RetryStats};
