//! Durable, multi-subscriber fragment cache.

pub mod aggregate;
pub mod fragment;
pub mod log;
pub mod store;
pub mod subscription;

pub use aggregate::{Aggregator, ChatCompletionAggregator, ConcatAggregator};
pub use fragment::{FinalArtifact, Fragment};
pub use log::{FragmentLog, LogWriter};
pub use store::{DEFAULT_SUBSCRIBER_CAPACITY, FragmentCache};
pub use subscription::Subscription;
