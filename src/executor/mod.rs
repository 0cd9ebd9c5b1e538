//! Executors: the pluggable producers that feed a job's stream.
//!
//! The engine only requires an ordered stream of text fragments that ends
//! normally or with an error, plus an aggregator that turns the finished
//! fragment list into the artifact handed to history storage.

mod scripted;
mod upstream;

pub use scripted::{ChannelExecutor, ScriptedExecutor, ScriptedStep};
pub use upstream::{UpstreamConfig, UpstreamExecutor, chat_completions_url};

use futures::stream::BoxStream;

use crate::cache::{Aggregator, ConcatAggregator};
use crate::error::ExecutorError;
use crate::key::JobKey;
use crate::tasks::TaskParams;

/// Ordered output of one executor run.
pub type FragmentStream = BoxStream<'static, Result<String, ExecutorError>>;

/// Produces the fragments of a job.
pub trait Executor: Send + Sync {
    /// Short name used in logs and history metadata.
    fn name(&self) -> &str;

    /// Start producing fragments for `key`.
    ///
    /// Dropping the returned stream must stop the work.
    fn run(&self, key: &JobKey, params: &TaskParams) -> FragmentStream;

    /// How this executor's fragments combine into the final artifact.
    fn aggregator(&self) -> &dyn Aggregator {
        &ConcatAggregator
    }
}
