//! Reader side of a job stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use futures::Stream;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::fragment::Fragment;
use super::store::{Attachment, JobBuffer, attach};
use crate::error::CacheError;
use crate::key::JobKey;

struct LiveFeed {
    buffer: Arc<Mutex<JobBuffer>>,
    channel: Option<(u64, mpsc::Receiver<Fragment>)>,
    ids: Arc<AtomicU64>,
    capacity: usize,
}

/// Ordered view of one job's fragments, ending with `Done`.
///
/// The history present at subscribe time is yielded first, then live
/// fragments. If the cache detaches this reader because it fell behind, the
/// subscription re-attaches at the position it had reached, so no fragment is
/// skipped or repeated.
pub struct Subscription {
    key: JobKey,
    replay: VecDeque<Fragment>,
    live: Option<LiveFeed>,
    delivered: usize,
    finished: bool,
}

impl Subscription {
    pub(super) fn live(
        key: JobKey,
        buffer: Arc<Mutex<JobBuffer>>,
        attachment: Attachment,
        ids: Arc<AtomicU64>,
        capacity: usize,
    ) -> Self {
        Self {
            key,
            replay: attachment.replay.into(),
            live: Some(LiveFeed {
                buffer,
                channel: attachment.live,
                ids,
                capacity,
            }),
            delivered: 0,
            finished: false,
        }
    }

    pub(super) fn replay_only(key: JobKey, fragments: Vec<Fragment>) -> Self {
        Self {
            key,
            replay: fragments.into(),
            live: None,
            delivered: 0,
            finished: false,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Next fragment, or `None` once `Done` has been yielded.
    pub async fn next(&mut self) -> Option<Fragment> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(fragment) = self.replay.pop_front() {
                return Some(self.deliver(fragment));
            }

            let Some(feed) = self.live.as_mut() else {
                // Replay ran out without a terminator.
                self.lost();
                continue;
            };

            if let Some((_, rx)) = feed.channel.as_mut() {
                if let Some(fragment) = rx.recv().await {
                    return Some(self.deliver(fragment));
                }
                debug!(job_key = %self.key, position = self.delivered, "Live channel closed; resuming from buffer");
            }

            // Channel closed (or never opened): pick up where we left off.
            let resumed = attach(&feed.buffer, self.delivered, &feed.ids, feed.capacity).await;
            match resumed {
                Some(Attachment { replay, live }) if !replay.is_empty() || live.is_some() => {
                    feed.channel = live;
                    self.replay.extend(replay);
                }
                _ => self.lost(),
            }
        }
    }

    /// Consume the subscription as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Fragment> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let fragment = sub.next().await?;
            Some((fragment, sub))
        })
    }

    fn deliver(&mut self, fragment: Fragment) -> Fragment {
        self.delivered += 1;
        if fragment.is_done() {
            self.finished = true;
            self.detach();
        }
        fragment
    }

    /// The buffer went away before `Done` reached us.
    fn lost(&mut self) {
        warn!(job_key = %self.key, position = self.delivered, "Stream lost before completion");
        self.detach();
        self.live = None;
        let message = CacheError::StreamLost {
            key: self.key.to_string(),
        }
        .to_string();
        self.replay.push_back(Fragment::error(message));
        self.replay.push_back(Fragment::Done);
    }

    fn detach(&mut self) {
        let Some(feed) = self.live.as_mut() else {
            return;
        };
        if let Some((id, _)) = feed.channel.take() {
            // A closed receiver is also pruned on the next append, so losing
            // the race for the lock here is harmless.
            if let Ok(mut buf) = feed.buffer.try_lock() {
                buf.detach(id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("delivered", &self.delivered)
            .field("finished", &self.finished)
            .finish()
    }
}
