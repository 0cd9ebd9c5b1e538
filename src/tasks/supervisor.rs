//! Task supervisor: one worker per job, cancellation, startup recovery.
//!
//! The supervisor is the only writer of job status apart from `cancel`, and
//! both go through the descriptor store's per-key read-modify-write lock.
//! Every worker ends on the same path: inject an error fragment if the run
//! did not finish cleanly, seal the stream, hand the artifact to history,
//! record the terminal status, then discard the cache state and log.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::descriptor::{DescriptorStore, strip_inline_images};
use super::state::{TaskDescriptor, TaskParams, TaskStatus};
use crate::cache::{Fragment, FragmentCache};
use crate::error::{ExecutorError, TaskError};
use crate::executor::Executor;
use crate::key::JobKey;
use crate::store::{ArtifactMetadata, HistoryStore};

/// Error fragment and descriptor error for a user-requested stop.
pub const STOPPED_BY_USER: &str = "Task was stopped by user.";
/// Descriptor error for jobs found running at startup.
pub const INTERRUPTED_BY_RESTART: &str =
    "Server was restarted while this task was running. Please re-trigger the task.";
/// Error fragment appended to the log of jobs found running at startup.
pub const RESTART_LOG_MESSAGE: &str =
    "Task was interrupted by a server restart. Please start a new session.";
/// Stop reason used by `shutdown`.
pub const STOPPED_BY_SHUTDOWN: &str = "Server shut down while this task was running.";

/// Supervisor settings.
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Upper bound on a job's run time. `None` lets jobs run indefinitely.
    pub job_timeout: Option<Duration>,
}

/// Who decided how a job ends. Set once, by a stop request or by the worker
/// leaving its drive loop, whichever comes first.
#[derive(Debug)]
enum Claim {
    Stopped(String),
    Finishing,
}

/// Live worker handle.
struct TrackedJob {
    token: CancellationToken,
    claim: Arc<OnceLock<Claim>>,
    handle: JoinHandle<()>,
}

type JobRegistry = Arc<RwLock<HashMap<JobKey, TrackedJob>>>;

/// Shared handles a worker needs after it is spawned.
#[derive(Clone)]
struct WorkerDeps {
    cache: Arc<FragmentCache>,
    descriptors: Arc<DescriptorStore>,
    history: Arc<dyn HistoryStore>,
    jobs: JobRegistry,
}

/// How a run ended.
enum Outcome {
    Exhausted,
    Stopped(String),
    Failed(ExecutorError),
}

/// Starts, tracks, cancels, and recovers background jobs.
pub struct TaskSupervisor {
    deps: WorkerDeps,
    config: SupervisorConfig,
}

impl TaskSupervisor {
    pub fn new(
        cache: Arc<FragmentCache>,
        descriptors: Arc<DescriptorStore>,
        history: Arc<dyn HistoryStore>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            deps: WorkerDeps {
                cache,
                descriptors,
                history,
                jobs: Arc::new(RwLock::new(HashMap::new())),
            },
            config,
        }
    }

    pub fn cache(&self) -> &Arc<FragmentCache> {
        &self.deps.cache
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.deps.history
    }

    /// Start a job for `key`.
    ///
    /// The registry lock is held from the active check until the worker is
    /// registered, so two concurrent starts for one key cannot both succeed.
    pub async fn start(
        &self,
        key: JobKey,
        params: TaskParams,
        executor: Arc<dyn Executor>,
    ) -> Result<(), TaskError> {
        self.launch(key, params, executor, None).await
    }

    /// Start a job and record `prompt` as the user turn of its conversation.
    ///
    /// The prompt is written only once the start is admitted, and before the
    /// worker can hand off its answer.
    pub async fn start_with_prompt(
        &self,
        key: JobKey,
        params: TaskParams,
        executor: Arc<dyn Executor>,
        prompt: &str,
    ) -> Result<(), TaskError> {
        self.launch(key, params, executor, Some(prompt)).await
    }

    async fn launch(
        &self,
        key: JobKey,
        params: TaskParams,
        executor: Arc<dyn Executor>,
        prompt: Option<&str>,
    ) -> Result<(), TaskError> {
        let mut jobs = self.deps.jobs.write().await;
        if jobs.contains_key(&key) || self.deps.cache.is_active(&key).await {
            return Err(TaskError::AlreadyRunning {
                key: key.to_string(),
            });
        }

        let stored = TaskParams {
            messages: strip_inline_images(&params.messages),
            ..params.clone()
        };
        self.deps
            .descriptors
            .create(&TaskDescriptor::running(key.clone(), stored))
            .await?;

        if let Err(e) = self.deps.cache.initialize(&key).await {
            let reason = e.to_string();
            if let Err(e) = self
                .deps
                .descriptors
                .update(&key, |d| d.finish_with_error(TaskStatus::Failed, reason))
                .await
            {
                warn!(job_key = %key, error = %e, "Could not record failed start");
            }
            return Err(e.into());
        }

        if let Some(text) = prompt {
            if let Err(e) = self.deps.history.add_message(&key, "user", text).await {
                warn!(job_key = %key, error = %e, "Could not store user message");
            }
        }

        let token = CancellationToken::new();
        let claim = Arc::new(OnceLock::new());
        let handle = tokio::spawn(run_job(
            self.deps.clone(),
            key.clone(),
            params,
            executor,
            token.clone(),
            Arc::clone(&claim),
            self.config.job_timeout,
        ));

        info!(job_key = %key, "Job started");
        jobs.insert(
            key,
            TrackedJob {
                token,
                claim,
                handle,
            },
        );
        Ok(())
    }

    /// Ask a running job to stop.
    ///
    /// Returns `true` if this call stopped a live job. Returns `false` when
    /// the job is unknown, already stopping, or its run has already ended.
    pub async fn cancel(&self, key: &JobKey) -> Result<bool, TaskError> {
        if !self.stop(key, STOPPED_BY_USER).await {
            return Ok(false);
        }

        self.deps
            .descriptors
            .update(key, |d| {
                if d.status == TaskStatus::Running {
                    d.finish_with_error(TaskStatus::Interrupted, STOPPED_BY_USER)
                } else {
                    Ok(())
                }
            })
            .await??;

        info!(job_key = %key, "Job cancelled");
        Ok(true)
    }

    /// Signal a live worker. Returns false if there was nothing to signal:
    /// no worker, a stop already requested, or a worker already finishing.
    async fn stop(&self, key: &JobKey, reason: &str) -> bool {
        let jobs = self.deps.jobs.read().await;
        let Some(job) = jobs.get(key) else {
            return false;
        };
        if job.claim.set(Claim::Stopped(reason.to_string())).is_err() {
            return false;
        }
        job.token.cancel();
        true
    }

    /// Persisted status, `None` if the key was never started.
    pub async fn status(&self, key: &JobKey) -> Result<Option<TaskStatus>, TaskError> {
        Ok(self.deps.descriptors.get(key).await?.map(|d| d.status))
    }

    pub async fn descriptor(&self, key: &JobKey) -> Result<Option<TaskDescriptor>, TaskError> {
        self.deps.descriptors.get(key).await
    }

    /// Active stream in the cache, or a descriptor still marked running.
    pub async fn is_running(&self, key: &JobKey) -> bool {
        if self.deps.cache.is_active(key).await {
            return true;
        }
        match self.deps.descriptors.get(key).await {
            Ok(Some(d)) => d.status == TaskStatus::Running,
            Ok(None) => false,
            Err(e) => {
                warn!(job_key = %key, error = %e, "Could not read descriptor");
                false
            }
        }
    }

    /// Keys with a live worker.
    pub async fn running_jobs(&self) -> Vec<JobKey> {
        self.deps.jobs.read().await.keys().cloned().collect()
    }

    /// Mark every job left `running` by a previous process as interrupted.
    ///
    /// Each such job also gets an error record in its fragment log, so a
    /// reader reconnecting to it sees the error followed by the end of the
    /// stream. Returns the number of recovered jobs.
    pub async fn recover_on_startup(&self) -> Result<usize, TaskError> {
        let live = self.running_jobs().await;
        let mut recovered = 0;

        for descriptor in self.deps.descriptors.list().await? {
            if descriptor.status != TaskStatus::Running || live.contains(&descriptor.key) {
                continue;
            }
            let key = descriptor.key;

            let marked = self
                .deps
                .descriptors
                .update(&key, |d| {
                    d.finish_with_error(TaskStatus::Interrupted, INTERRUPTED_BY_RESTART)
                })
                .await?;
            if let Err(e) = marked {
                debug!(job_key = %key, error = %e, "Descriptor changed during recovery");
                continue;
            }

            if let Err(e) = self
                .deps
                .cache
                .append_detached(&key, &Fragment::error(RESTART_LOG_MESSAGE))
                .await
            {
                warn!(job_key = %key, error = %e, "Could not record restart in fragment log");
            }

            warn!(job_key = %key, "Recovered job interrupted by restart");
            recovered += 1;
        }

        info!(recovered, "Startup recovery complete");
        Ok(recovered)
    }

    /// Stop every live worker and wait for each to finish its cleanup.
    pub async fn shutdown(&self) {
        let keys = self.running_jobs().await;
        for key in &keys {
            self.stop(key, STOPPED_BY_SHUTDOWN).await;
        }

        let handles: Vec<(JobKey, JoinHandle<()>)> = {
            let mut jobs = self.deps.jobs.write().await;
            jobs.drain().map(|(key, job)| (key, job.handle)).collect()
        };
        for (key, handle) in handles {
            if let Err(e) = handle.await {
                error!(job_key = %key, error = %e, "Worker ended abnormally during shutdown");
            }
        }
        info!(stopped = keys.len(), "Supervisor shut down");
    }
}

async fn run_job(
    deps: WorkerDeps,
    key: JobKey,
    params: TaskParams,
    executor: Arc<dyn Executor>,
    token: CancellationToken,
    claim: Arc<OnceLock<Claim>>,
    job_timeout: Option<Duration>,
) {
    let outcome = drive(&deps.cache, &key, &params, executor.as_ref(), &token, job_timeout).await;
    // A stop that claimed the job first wins, even if the run ended on its own.
    let outcome = match claim.set(Claim::Finishing) {
        Ok(()) => outcome,
        Err(_) => match claim.get() {
            Some(Claim::Stopped(reason)) => Outcome::Stopped(reason.clone()),
            _ => Outcome::Stopped(STOPPED_BY_USER.to_string()),
        },
    };
    finish(&deps, &key, &params, executor.as_ref(), outcome).await;
    deps.jobs.write().await.remove(&key);
}

/// Forward executor output into the cache until it ends, fails, or is stopped.
async fn drive(
    cache: &FragmentCache,
    key: &JobKey,
    params: &TaskParams,
    executor: &dyn Executor,
    token: &CancellationToken,
    job_timeout: Option<Duration>,
) -> Outcome {
    let stream = match std::panic::catch_unwind(AssertUnwindSafe(|| executor.run(key, params))) {
        Ok(stream) => stream,
        Err(panic) => return Outcome::Failed(ExecutorError::Panicked(panic_message(panic.as_ref()))),
    };
    let mut stream = AssertUnwindSafe(stream).catch_unwind();

    let deadline = async move {
        match job_timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => return Outcome::Stopped(STOPPED_BY_USER.to_string()),
            limit = &mut deadline => return Outcome::Failed(ExecutorError::TimedOut(limit)),
            item = stream.next() => match item {
                None => return Outcome::Exhausted,
                Some(Ok(Ok(data))) => {
                    if let Err(e) = cache.append(key, Fragment::chunk(data)).await {
                        return Outcome::Failed(ExecutorError::Failed(e.to_string()));
                    }
                }
                Some(Ok(Err(e))) => return Outcome::Failed(e),
                Some(Err(panic)) => {
                    return Outcome::Failed(ExecutorError::Panicked(panic_message(panic.as_ref())));
                }
            },
        }
    }
}

async fn finish(
    deps: &WorkerDeps,
    key: &JobKey,
    params: &TaskParams,
    executor: &dyn Executor,
    outcome: Outcome,
) {
    let (mut status, mut error) = match &outcome {
        Outcome::Exhausted => (TaskStatus::Completed, None),
        Outcome::Stopped(reason) => (TaskStatus::Interrupted, Some(reason.clone())),
        Outcome::Failed(e) => (TaskStatus::Failed, Some(e.to_string())),
    };

    if let Some(message) = &error {
        if let Err(e) = deps.cache.append(key, Fragment::error(message.clone())).await {
            warn!(job_key = %key, error = %e, "Could not inject error fragment");
        }
    }

    let artifact = match deps.cache.seal(key, executor.aggregator()).await {
        Ok(artifact) => Some(artifact),
        Err(e) => {
            warn!(job_key = %key, error = %e, "Could not seal job stream");
            None
        }
    };

    // Interrupted runs are not handed off; a failed run keeps whatever it produced.
    let hand_off = match (&outcome, &artifact) {
        (Outcome::Exhausted, Some(a)) => Some(a),
        (Outcome::Failed(_), Some(a)) if !a.is_empty() => Some(a),
        _ => None,
    };

    if let Some(artifact) = hand_off {
        let metadata = ArtifactMetadata {
            model: params.model.clone(),
            status,
            executor: executor.name().to_string(),
        };
        if let Err(e) = deps.history.persist(key, artifact, &metadata).await {
            error!(job_key = %key, error = %e, "History hand-off failed");
            if status == TaskStatus::Completed {
                status = TaskStatus::Failed;
                error = Some(TaskError::History(e).to_string());
            }
        }
    }

    let recorded = deps
        .descriptors
        .update(key, |d| match error {
            Some(message) => d.finish_with_error(status, message),
            None => d.transition_to(status, None),
        })
        .await;
    match recorded {
        Ok(Ok(())) => {}
        // `cancel` got there first.
        Ok(Err(e)) => debug!(job_key = %key, error = %e, "Descriptor already terminal"),
        Err(e) => warn!(job_key = %key, error = %e, "Could not record job status"),
    }

    if let Err(e) = deps.cache.discard(key).await {
        warn!(job_key = %key, error = %e, "Could not discard job stream");
    }

    match status {
        TaskStatus::Completed => info!(job_key = %key, "Job completed"),
        TaskStatus::Interrupted => info!(job_key = %key, "Job interrupted"),
        _ => warn!(job_key = %key, status = %status, "Job did not complete"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
