//! In-memory fragment buffers backed by the on-disk log.
//!
//! Every job key with an active stream owns one `JobBuffer` behind a single
//! async mutex. `append`, `subscribe`, and subscription resumption all take
//! that mutex, so a reader's snapshot and its channel registration happen at
//! one point in the append order: each fragment lands either in the snapshot
//! or in the channel, never both and never neither.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use super::aggregate::Aggregator;
use super::fragment::{FinalArtifact, Fragment};
use super::log::{FragmentLog, LogWriter};
use super::subscription::Subscription;
use crate::error::CacheError;
use crate::key::JobKey;

/// Default per-subscriber channel capacity.
///
/// A reader that falls this far behind is detached and catches up from the
/// buffer. If the job is sealed and discarded before it re-attaches, the
/// reader loses the tail of the stream and ends with a `StreamLost` error,
/// even when the job itself completed.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Fragment>,
}

/// Per-job state. Only ever touched under its mutex.
pub(super) struct JobBuffer {
    key: JobKey,
    fragments: Vec<Fragment>,
    subscribers: Vec<Subscriber>,
    writer: Option<LogWriter>,
    sealed: bool,
    discarded: bool,
    last_activity: DateTime<Utc>,
}

impl JobBuffer {
    fn new(key: JobKey, writer: Option<LogWriter>) -> Self {
        Self {
            key,
            fragments: Vec::new(),
            subscribers: Vec::new(),
            writer,
            sealed: false,
            discarded: false,
            last_activity: Utc::now(),
        }
    }

    /// Record, persist, then fan out one fragment.
    async fn push(&mut self, fragment: Fragment) {
        self.fragments.push(fragment.clone());
        self.last_activity = Utc::now();

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.append(&fragment).await {
                warn!(job_key = %self.key, error = %e, "Fragment log write failed; continuing in memory");
            }
        }

        let key = &self.key;
        self.subscribers.retain(|sub| match sub.tx.try_send(fragment.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(job_key = %key, subscriber = sub.id, "Subscriber channel full; detaching it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn register(&mut self, id: u64, capacity: usize) -> mpsc::Receiver<Fragment> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.push(Subscriber { id, tx });
        rx
    }

    pub(super) fn detach(&mut self, id: u64) {
        self.subscribers.retain(|sub| sub.id != id);
    }
}

/// Snapshot plus live channel handed to a (re)attaching subscription.
pub(super) struct Attachment {
    pub replay: Vec<Fragment>,
    pub live: Option<(u64, mpsc::Receiver<Fragment>)>,
}

/// Attach to a buffer starting at fragment index `from`.
///
/// Returns `None` when the buffer has been discarded.
pub(super) async fn attach(
    buffer: &Arc<Mutex<JobBuffer>>,
    from: usize,
    ids: &AtomicU64,
    capacity: usize,
) -> Option<Attachment> {
    let mut buf = buffer.lock().await;
    if buf.discarded {
        return None;
    }

    let start = from.min(buf.fragments.len());
    let replay = buf.fragments[start..].to_vec();
    let live = if buf.sealed {
        None
    } else {
        let id = ids.fetch_add(1, Ordering::Relaxed);
        Some((id, buf.register(id, capacity)))
    };

    Some(Attachment { replay, live })
}

/// Durable multi-subscriber fragment cache.
pub struct FragmentCache {
    log: FragmentLog,
    subscriber_capacity: usize,
    jobs: RwLock<HashMap<JobKey, Arc<Mutex<JobBuffer>>>>,
    subscriber_ids: Arc<AtomicU64>,
}

impl FragmentCache {
    /// Create a cache writing its logs under `log`.
    pub fn new(log: FragmentLog, subscriber_capacity: usize) -> Self {
        Self {
            log,
            subscriber_capacity: subscriber_capacity.max(1),
            jobs: RwLock::new(HashMap::new()),
            subscriber_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a cache whose logs live in `dir`.
    pub async fn open(
        dir: impl AsRef<std::path::Path>,
        subscriber_capacity: usize,
    ) -> Result<Self, CacheError> {
        let dir = dir.as_ref();
        let log = FragmentLog::open(dir).await.map_err(|source| CacheError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self::new(log, subscriber_capacity))
    }

    pub fn log(&self) -> &FragmentLog {
        &self.log
    }

    async fn buffer(&self, key: &JobKey) -> Option<Arc<Mutex<JobBuffer>>> {
        self.jobs.read().await.get(key).cloned()
    }

    /// Start a fresh stream for `key`, truncating any previous log.
    pub async fn initialize(&self, key: &JobKey) -> Result<(), CacheError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(key) {
            return Err(CacheError::AlreadyActive {
                key: key.to_string(),
            });
        }

        let writer = match self.log.create(key).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!(job_key = %key, error = %e, "Could not create fragment log; stream will not be durable");
                if let Err(e) = self.log.remove(key).await {
                    warn!(job_key = %key, error = %e, "Could not remove stale fragment log");
                }
                None
            }
        };

        jobs.insert(key.clone(), Arc::new(Mutex::new(JobBuffer::new(key.clone(), writer))));
        debug!(job_key = %key, "Fragment stream initialized");
        Ok(())
    }

    /// Append one fragment and deliver it to every attached subscriber.
    ///
    /// Never waits on a subscriber: a reader whose channel is full is detached
    /// and catches up from the buffer on its own.
    pub async fn append(&self, key: &JobKey, fragment: Fragment) -> Result<(), CacheError> {
        let buffer = self.buffer(key).await.ok_or_else(|| CacheError::UnknownJob {
            key: key.to_string(),
        })?;
        let mut buf = buffer.lock().await;
        if buf.sealed {
            return Err(CacheError::Sealed {
                key: key.to_string(),
            });
        }
        buf.push(fragment).await;
        Ok(())
    }

    /// Attach a reader: full history first, then live fragments until `Done`.
    ///
    /// A key with no in-memory state is served from its on-disk log as a
    /// finished, replay-only stream.
    pub async fn subscribe(&self, key: &JobKey) -> Result<Subscription, CacheError> {
        let jobs = self.jobs.read().await;

        let existing = jobs.get(key).cloned();
        if let Some(buffer) = existing {
            drop(jobs);
            let attachment = attach(&buffer, 0, &self.subscriber_ids, self.subscriber_capacity)
                .await
                .ok_or_else(|| CacheError::UnknownJob {
                    key: key.to_string(),
                })?;
            return Ok(Subscription::live(
                key.clone(),
                buffer,
                attachment,
                Arc::clone(&self.subscriber_ids),
                self.subscriber_capacity,
            ));
        }

        // Holding the registry read lock keeps `initialize` from truncating
        // the log underneath the replay.
        let recovered = self
            .log
            .replay(key)
            .await
            .map_err(|source| CacheError::Io {
                key: key.to_string(),
                source,
            })?;
        drop(jobs);

        match recovered {
            Some(mut fragments) => {
                // A crash between sealing and cleanup leaves `Done` ahead of
                // the restart error; only a final `Done` may end the replay.
                let last = fragments.len().saturating_sub(1);
                let mut index = 0;
                fragments.retain(|f| {
                    let keep = !f.is_done() || index == last;
                    index += 1;
                    keep
                });
                if !fragments.last().is_some_and(Fragment::is_done) {
                    fragments.push(Fragment::Done);
                }
                info!(job_key = %key, fragments = fragments.len(), "Serving stream recovered from log");
                Ok(Subscription::replay_only(key.clone(), fragments))
            }
            None => Err(CacheError::UnknownJob {
                key: key.to_string(),
            }),
        }
    }

    /// Append `Done`, close the stream to further appends, and aggregate it.
    pub async fn seal(
        &self,
        key: &JobKey,
        aggregator: &dyn Aggregator,
    ) -> Result<FinalArtifact, CacheError> {
        let buffer = self.buffer(key).await.ok_or_else(|| CacheError::UnknownJob {
            key: key.to_string(),
        })?;
        let mut buf = buffer.lock().await;
        if buf.sealed {
            return Err(CacheError::Sealed {
                key: key.to_string(),
            });
        }

        buf.push(Fragment::Done).await;
        buf.sealed = true;
        buf.writer = None;
        buf.subscribers.clear();

        Ok(aggregator.aggregate(&buf.fragments))
    }

    /// Drop the in-memory state and the on-disk log for `key`.
    pub async fn discard(&self, key: &JobKey) -> Result<(), CacheError> {
        let buffer = self
            .jobs
            .write()
            .await
            .remove(key)
            .ok_or_else(|| CacheError::UnknownJob {
                key: key.to_string(),
            })?;

        {
            let mut buf = buffer.lock().await;
            buf.discarded = true;
            buf.writer = None;
            buf.subscribers.clear();
        }

        if let Err(e) = self.log.remove(key).await {
            warn!(job_key = %key, error = %e, "Could not delete fragment log");
        }
        debug!(job_key = %key, "Fragment stream discarded");
        Ok(())
    }

    /// Seal, aggregate, and discard in one step.
    pub async fn finalize(
        &self,
        key: &JobKey,
        aggregator: &dyn Aggregator,
    ) -> Result<FinalArtifact, CacheError> {
        let artifact = self.seal(key, aggregator).await?;
        self.discard(key).await?;
        Ok(artifact)
    }

    /// Record a fragment in the log of a job that has no in-memory state.
    pub async fn append_detached(&self, key: &JobKey, fragment: &Fragment) -> Result<(), CacheError> {
        if self.is_active(key).await {
            return Err(CacheError::AlreadyActive {
                key: key.to_string(),
            });
        }
        self.log
            .append_detached(key, fragment)
            .await
            .map_err(|source| CacheError::Io {
                key: key.to_string(),
                source,
            })
    }

    pub async fn is_active(&self, key: &JobKey) -> bool {
        self.jobs.read().await.contains_key(key)
    }

    /// Copy of the in-memory fragment list.
    pub async fn snapshot(&self, key: &JobKey) -> Option<Vec<Fragment>> {
        let buffer = self.buffer(key).await?;
        let buf = buffer.lock().await;
        Some(buf.fragments.clone())
    }

    /// Time of the last append.
    pub async fn last_activity(&self, key: &JobKey) -> Option<DateTime<Utc>> {
        let buffer = self.buffer(key).await?;
        let buf = buffer.lock().await;
        Some(buf.last_activity)
    }

    /// Number of readers currently registered for live delivery.
    pub async fn subscriber_count(&self, key: &JobKey) -> usize {
        match self.buffer(key).await {
            Some(buffer) => buffer.lock().await.subscribers.len(),
            None => 0,
        }
    }

    /// Keys with in-memory state.
    pub async fn active_keys(&self) -> Vec<JobKey> {
        self.jobs.read().await.keys().cloned().collect()
    }
}
