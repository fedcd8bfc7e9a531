//! Watch-driven change feed
//!
//! A reflector keeps a local mirror of every object of one kind and each watch event
//! enqueues the object's key. Deleted objects are enqueued too; the reconciler finds
//! them gone from the mirror and stops there. A periodic resync re-enqueues every
//! cached key so drift in children is eventually corrected.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::workqueue::WorkQueue;
use crate::error::Result;
use crate::store::{ObjectKey, StoredObject};

/// Read-only view of the last observed state of a kind
pub trait Indexer<K>: Send + Sync {
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<K>>;
}

impl<K: StoredObject> Indexer<K> for reflector::Store<K> {
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<K>> {
        let oref = ObjectRef::new(&key.name).within(&key.namespace);
        Ok(self.get(&oref).map(|obj| obj.as_ref().clone()))
    }
}

/// Start watching `api` and feed keys into `queue` until `shutdown` fires.
///
/// Returns the reflector's reader, which serves as the reconciler's indexer.
pub fn spawn_change_feed<K: StoredObject>(
    api: Api<K>,
    queue: Arc<WorkQueue<ObjectKey>>,
    resync: Duration,
    shutdown: CancellationToken,
) -> reflector::Store<K> {
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects();

    {
        let queue = Arc::clone(&queue);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(obj)) => match ObjectKey::from_resource(&obj) {
                            Ok(key) => queue.add(key),
                            Err(e) => warn!("Ignoring watch event: {}", e),
                        },
                        Some(Err(e)) => warn!(queue = %queue.name(), "Watch error: {}", e),
                        None => break,
                    },
                }
            }
            info!(queue = %queue.name(), "Change feed stopped");
        });
    }

    if !resync.is_zero() {
        let reader = reader.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(resync);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let objects = reader.state();
                        debug!(queue = %queue.name(), count = objects.len(), "Resync");
                        for obj in objects {
                            if let Ok(key) = ObjectKey::from_resource(obj.as_ref()) {
                                queue.add(key);
                            }
                        }
                    }
                }
            }
        });
    }

    reader
}
