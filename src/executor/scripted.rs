//! Deterministic executors for tests and demos.

use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use super::{Executor, FragmentStream};
use crate::cache::{Aggregator, ConcatAggregator};
use crate::error::ExecutorError;
use crate::key::JobKey;
use crate::tasks::TaskParams;

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Yield a fragment.
    Emit(String),
    /// Wait before the next step.
    Delay(Duration),
    /// End the run with an executor error.
    Fail(String),
    /// Panic inside the executor.
    Panic(String),
    /// Never produce anything again.
    Hang,
}

/// Replays a fixed script on every run.
pub struct ScriptedExecutor {
    steps: Vec<ScriptedStep>,
    aggregator: Box<dyn Aggregator>,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps,
            aggregator: Box::new(ConcatAggregator),
        }
    }

    /// Emit each fragment in order, `delay` apart.
    pub fn fragments<I, S>(fragments: I, delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps = Vec::new();
        for fragment in fragments {
            if !delay.is_zero() {
                steps.push(ScriptedStep::Delay(delay));
            }
            steps.push(ScriptedStep::Emit(fragment.into()));
        }
        Self::new(steps)
    }

    pub fn then(mut self, step: ScriptedStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_aggregator(mut self, aggregator: impl Aggregator + 'static) -> Self {
        self.aggregator = Box::new(aggregator);
        self
    }
}

impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run(&self, _key: &JobKey, _params: &TaskParams) -> FragmentStream {
        let steps = self.steps.clone().into_iter();
        stream::unfold(Some(steps), |state| async move {
            let mut steps = state?;
            loop {
                match steps.next()? {
                    ScriptedStep::Emit(data) => return Some((Ok(data), Some(steps))),
                    ScriptedStep::Delay(d) => tokio::time::sleep(d).await,
                    ScriptedStep::Fail(message) => {
                        return Some((Err(ExecutorError::Failed(message)), None));
                    }
                    ScriptedStep::Panic(message) => panic!("{message}"),
                    ScriptedStep::Hang => std::future::pending::<()>().await,
                }
            }
        })
        .boxed()
    }

    fn aggregator(&self) -> &dyn Aggregator {
        self.aggregator.as_ref()
    }
}

/// Executor fed by hand through a channel.
///
/// The run ends when every sender is dropped. Only the first run receives
/// anything; later runs end immediately.
pub struct ChannelExecutor {
    rx: Mutex<Option<mpsc::Receiver<Result<String, ExecutorError>>>>,
}

impl ChannelExecutor {
    pub fn new(capacity: usize) -> (mpsc::Sender<Result<String, ExecutorError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                rx: Mutex::new(Some(rx)),
            },
        )
    }
}

impl Executor for ChannelExecutor {
    fn name(&self) -> &str {
        "channel"
    }

    fn run(&self, _key: &JobKey, _params: &TaskParams) -> FragmentStream {
        match self.rx.try_lock().ok().and_then(|mut rx| rx.take()) {
            Some(rx) => ReceiverStream::new(rx).boxed(),
            None => stream::empty().boxed(),
        }
    }
}
