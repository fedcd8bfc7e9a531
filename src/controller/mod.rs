//! Controllers for the KubeDB database kinds
//!
//! Every database kind runs the same engine: a change feed fills a rate-limited work
//! queue and a fixed pool of workers drives the generic [`Reconciler`] for that kind.
//! DormantDatabase records get their own queue and [`DormantReconciler`].

pub mod change_feed;
pub mod convergence;
pub mod dormant;
mod dormant_controller;
pub mod events;
pub mod finalizers;
pub mod metrics;
pub mod monitor;
mod reconciler;
pub mod resources;
pub mod workqueue;

use std::sync::Arc;
use std::time::Duration;

use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::crd::{Database, DatabaseKind, DormantDatabase, Memcached, PgBouncer, Redis};
use crate::store::{ClusterStores, KubeStore, ObjectKey};

pub use change_feed::{spawn_change_feed, Indexer};
pub use dormant_controller::DormantReconciler;
pub use events::{EventSink, KubeEventSink, MemoryEventSink};
pub use reconciler::{Reconciler, Settings};
pub use workqueue::{run_workers, Process, RateLimiter, WorkQueue};

/// Knobs for one controller's queue and worker pool
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub workers: usize,
    pub max_requeues: u32,
    pub limiter: RateLimiter,
    pub resync: Duration,
    pub settings: Settings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_requeues: 5,
            limiter: RateLimiter::default(),
            resync: Duration::from_secs(300),
            settings: Settings::default(),
        }
    }
}

/// Run the controller for database kind `D` until `shutdown` fires
pub async fn run_controller<D: Database>(
    client: Client,
    stores: ClusterStores,
    events: Arc<dyn EventSink>,
    config: ControllerConfig,
    shutdown: CancellationToken,
) {
    let queue = Arc::new(WorkQueue::<ObjectKey>::new(D::KIND.plural(), config.limiter));
    let indexer = spawn_change_feed(
        Api::<D>::all(client.clone()),
        Arc::clone(&queue),
        config.resync,
        shutdown.clone(),
    );
    let reconciler = Reconciler::<D>::new(
        Arc::new(KubeStore::<D>::new(client)),
        stores,
        Arc::new(indexer),
        events,
        config.settings,
    );

    info!(
        "Starting {} controller with {} workers",
        D::KIND,
        config.workers
    );
    run_workers(
        queue,
        Arc::new(reconciler),
        config.workers,
        config.max_requeues,
        shutdown,
    )
    .await;
}

/// Run the controller for a kind chosen at runtime
pub async fn run_kind(
    kind: DatabaseKind,
    client: Client,
    stores: ClusterStores,
    events: Arc<dyn EventSink>,
    config: ControllerConfig,
    shutdown: CancellationToken,
) {
    match kind {
        DatabaseKind::Redis => {
            run_controller::<Redis>(client, stores, events, config, shutdown).await
        }
        DatabaseKind::Memcached => {
            run_controller::<Memcached>(client, stores, events, config, shutdown).await
        }
        DatabaseKind::PgBouncer => {
            run_controller::<PgBouncer>(client, stores, events, config, shutdown).await
        }
    }
}

/// Run the DormantDatabase controller until `shutdown` fires
pub async fn run_dormant_controller(
    client: Client,
    stores: ClusterStores,
    events: Arc<dyn EventSink>,
    config: ControllerConfig,
    shutdown: CancellationToken,
) {
    let queue = Arc::new(WorkQueue::<ObjectKey>::new(
        "dormantdatabases",
        config.limiter,
    ));
    let indexer = spawn_change_feed(
        Api::<DormantDatabase>::all(client),
        Arc::clone(&queue),
        config.resync,
        shutdown.clone(),
    );
    let reconciler = DormantReconciler::new(
        Arc::clone(&stores.dormant_databases),
        stores,
        Arc::new(indexer),
        events,
    );

    info!("Starting DormantDatabase controller with {} workers", config.workers);
    run_workers(
        queue,
        Arc::new(reconciler),
        config.workers,
        config.max_requeues,
        shutdown,
    )
    .await;
}
