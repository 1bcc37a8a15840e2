use crate::{cache::key_of, queue::Queue};
use futures::prelude::*;
use kube::{
    runtime::{
        reflector::{self, store::Writer, Store},
        watcher::Event,
    },
    Resource,
};
use std::{collections::HashSet, fmt, hash::Hash};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Mirrors one resource kind into a local store and enqueues the key of every
/// changed object.
///
/// Objects are never handed downstream directly: sync functions re-read the
/// store by key so that they always act on the latest observed state.
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    writer: Writer<K>,
    queue: Queue,
    resync: time::Duration,
}

// === impl Informer ===

impl<K> Informer<K>
where
    K: Resource + Clone + fmt::Debug + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new(queue: Queue, resync: time::Duration) -> Self {
        let (_, writer) = reflector::store();
        Self {
            writer,
            queue,
            resync,
        }
    }

    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Processes watch events until the stream ends or `shutdown` fires.
    ///
    /// Every `resync` period all cached keys are enqueued again, so that a sync
    /// that was dropped after failing is eventually retried. A zero period
    /// disables resyncs.
    pub async fn run<S>(mut self, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Event<K>>,
    {
        tokio::pin!(events);
        let mut resync = (!self.resync.is_zero()).then(|| {
            let mut interval = time::interval_at(time::Instant::now() + self.resync, self.resync);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            interval
        });
        if resync.is_none() {
            tracing::debug!(queue = %self.queue.name(), "resync disabled");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = events.next() => match ev {
                    Some(ev) => self.apply(ev),
                    None => {
                        tracing::debug!(queue = %self.queue.name(), "watch stream ended");
                        break;
                    }
                },
                _ = tick(&mut resync) => self.resync(),
            }
        }

        tracing::debug!(queue = %self.queue.name(), "informer stopped");
    }

    /// Applies a single watch event to the store, enqueueing affected keys.
    pub fn apply(&mut self, ev: Event<K>) {
        match ev {
            Event::Applied(ref obj) | Event::Deleted(ref obj) => {
                let key = key_of(obj);
                self.writer.apply_watcher_event(&ev);
                tracing::trace!(queue = %self.queue.name(), %key, "observed change");
                self.queue.enqueue(key);
            }

            Event::Restarted(ref objs) => {
                let mut stale = self
                    .writer
                    .as_reader()
                    .state()
                    .iter()
                    .map(|obj| key_of(&**obj))
                    .collect::<HashSet<_>>();
                self.writer.apply_watcher_event(&ev);

                tracing::debug!(queue = %self.queue.name(), objects = objs.len(), "watch restarted");
                for obj in objs {
                    let key = key_of(obj);
                    stale.remove(&key);
                    self.queue.enqueue(key);
                }
                // Objects that disappeared while the watch was down.
                for key in stale {
                    tracing::trace!(queue = %self.queue.name(), %key, "removed during restart");
                    self.queue.enqueue(key);
                }
            }
        }
    }

    fn resync(&self) {
        let objs = self.writer.as_reader().state();
        tracing::trace!(queue = %self.queue.name(), objects = objs.len(), "resync");
        for obj in objs {
            self.queue.enqueue(key_of(&*obj));
        }
    }
}

async fn tick(interval: &mut Option<time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
