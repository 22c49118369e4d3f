//! Reflector task — keeps one kind's cache in sync with the backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, warn};

use flotilla_api::{
    BackendError, EventKind, ObjectKind, StateBackend, WatchEvent,
};

use crate::cache::KindCache;

/// Shared cache map, one entry per kind after its first list.
pub(crate) type SharedCaches = Arc<RwLock<HashMap<ObjectKind, KindCache>>>;

/// Downstream subscribers per kind.
pub(crate) type Subscribers =
    Arc<RwLock<HashMap<ObjectKind, Vec<mpsc::Sender<WatchEvent>>>>>;

/// Exponential backoff for reconnects.
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

/// Drive one kind: list, watch, reconnect, relist on compaction.
///
/// Runs until the shutdown signal flips to true.
pub(crate) async fn run_reflector<B: StateBackend>(
    backend: B,
    kind: ObjectKind,
    caches: SharedCaches,
    subscribers: Subscribers,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
    // None forces a full relist; Some(v) resumes the watch at v.
    let mut resume: Option<u64> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let from_version = match resume {
            Some(v) => v,
            None => match relist(&backend, kind, &caches, &subscribers).await {
                Ok(version) => {
                    backoff.reset();
                    version
                }
                Err(e) => {
                    warn!(kind = kind.as_str(), error = %e, "list failed");
                    if !sleep_or_shutdown(backoff.next(), &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };
        resume = Some(from_version);

        match backend.watch(kind, from_version).await {
            Ok(rx) => {
                backoff.reset();
                debug!(kind = kind.as_str(), from_version, "watch established");
                let last = stream_events(kind, rx, &caches, &subscribers, &mut shutdown).await;
                if *shutdown.borrow() {
                    break;
                }
                // Stream ended: resume from the last acknowledged version.
                resume = Some(last);
                debug!(kind = kind.as_str(), last, "watch stream closed, reconnecting");
            }
            Err(BackendError::CompactedHistory { oldest }) => {
                warn!(
                    kind = kind.as_str(),
                    from_version, oldest, "watch history compacted, relisting"
                );
                resume = None;
                continue;
            }
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "watch failed");
            }
        }

        if !sleep_or_shutdown(backoff.next(), &mut shutdown).await {
            break;
        }
    }
    debug!(kind = kind.as_str(), "reflector stopped");
}

/// Full list: replace the cache and re-announce every object as
/// `Added` (consumers must reconcile idempotently). Returns the list
/// version.
async fn relist<B: StateBackend>(
    backend: &B,
    kind: ObjectKind,
    caches: &SharedCaches,
    subscribers: &Subscribers,
) -> Result<u64, BackendError> {
    let (objects, version) = backend.list(kind).await?;
    debug!(kind = kind.as_str(), count = objects.len(), version, "relist");

    let announcements: Vec<WatchEvent> = objects
        .iter()
        .cloned()
        .map(WatchEvent::added)
        .collect();

    {
        let mut caches = caches.write().await;
        let cache = caches.entry(kind).or_default();
        if !cache.replace_all(objects, version) {
            // Already ahead of this listing; keep what we have.
            return Ok(cache.version);
        }
    }

    for event in announcements {
        deliver(kind, &event, subscribers).await;
    }
    Ok(version)
}

/// Consume live events until the stream closes or shutdown. Returns
/// the last acknowledged resourceVersion.
async fn stream_events(
    kind: ObjectKind,
    mut rx: mpsc::Receiver<WatchEvent>,
    caches: &SharedCaches,
    subscribers: &Subscribers,
    shutdown: &mut watch::Receiver<bool>,
) -> u64 {
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    let caches = caches.read().await;
                    return caches.get(&kind).map(|c| c.version).unwrap_or(0);
                };
                {
                    let mut caches = caches.write().await;
                    let cache = caches.entry(kind).or_default();
                    cache.apply(&event);
                }
                if event.kind != EventKind::Bookmark {
                    deliver(kind, &event, subscribers).await;
                }
            }
            _ = shutdown.changed() => {
                let caches = caches.read().await;
                return caches.get(&kind).map(|c| c.version).unwrap_or(0);
            }
        }
    }
}

/// Fan an event out to this kind's subscribers. A subscriber that is
/// closed or has a full buffer is dropped.
async fn deliver(kind: ObjectKind, event: &WatchEvent, subscribers: &Subscribers) {
    let mut subscribers = subscribers.write().await;
    if let Some(list) = subscribers.get_mut(&kind) {
        list.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "dropping informer subscriber");
                false
            }
        });
    }
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}
