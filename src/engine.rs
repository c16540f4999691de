//! The engine handle: one instance per app-data directory.
//!
//! Owns every core component and is passed into the HTTP adapter at
//! startup. Components couple only through this handle and the event bus;
//! the adapter is a pure consumer.

use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

use crate::bundle::BundleStore;
use crate::cache::HashCache;
use crate::config::Config;
use crate::dedupe::DedupeStore;
use crate::diff;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::executor;
use crate::hasher::{HashCtx, HashPool};
use crate::index::IndexStore;
use crate::mirror::{self, MirrorPlan};
use crate::paths::RelPath;
use crate::queue::Queue;
use crate::scan;
use crate::sources::SourceStore;
use crate::types::{DiffEntry, Side};

pub struct Engine {
    pub config: Arc<Config>,
    pub index: Arc<IndexStore>,
    pub cache: Arc<HashCache>,
    pub sources: Arc<SourceStore>,
    pub bus: Arc<EventBus>,
    pub queue: Arc<Queue>,
    pub dedupe: Arc<DedupeStore>,
    pub bundles: BundleStore,
    pub hasher: HashPool,
}

impl Engine {
    /// Open every store under the app data dir and spawn the hash pool.
    /// The caller is responsible for the data dir existing.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let data = &config.app_data_dir;

        let bus = Arc::new(EventBus::new());
        let index = Arc::new(IndexStore::new());
        let cache = Arc::new(HashCache::open(&data.join("hash_cache.db"))?);
        let sources = Arc::new(SourceStore::open(&config.lake.root));
        let queue =
            Arc::new(Queue::open(&data.join("queue.db"), Arc::clone(&bus), config.queue_retry_count)?);
        let dedupe = Arc::new(DedupeStore::open(&data.join("dedupe.db"))?);
        let bundles = BundleStore::open(data)?;

        let hasher = HashPool::spawn(
            config.hash_workers,
            HashCtx {
                config: Arc::clone(&config),
                index: Arc::clone(&index),
                cache: Arc::clone(&cache),
                sources: Arc::clone(&sources),
                bus: Arc::clone(&bus),
            },
        );

        Ok(Arc::new(Self { config, index, cache, sources, bus, queue, dedupe, bundles, hasher }))
    }

    /// Sweep crash leftovers and start the transfer workers. The caller
    /// kicks off the initial scans once it is ready for snapshots to move.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        for side in Side::ALL {
            let removed = scan::sweep_part_files(self.config.root(side));
            if removed > 0 {
                info!(side = %side, removed, "Removed stray part files");
            }
        }
        executor::spawn_workers(self)
    }

    /// Re-scan one side in the background and swap its snapshot in.
    pub fn refresh_index(self: &Arc<Self>, side: Side) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("scan-{side}"))
            .spawn(move || {
                match scan::scan_side(engine.config.root(side), side, &engine.cache, &engine.bus) {
                    Ok(map) => {
                        engine.index.replace(side, map);
                        let stats = engine.index.stats(side);
                        info!(side = %side, files = stats.file_count, bytes = stats.total_bytes, "Index refreshed");
                        engine.bus.publish(Event::IndexRefreshed {
                            side,
                            file_count: stats.file_count,
                            total_bytes: stats.total_bytes,
                        });
                    }
                    Err(e) => error!(side = %side, error = %e, "Index refresh failed"),
                }
            })
            .expect("failed to spawn scanner")
    }

    /// Full diff over the current snapshots.
    pub fn diff(&self) -> Vec<DiffEntry> {
        diff::diff_snapshots(
            &self.index.snapshot(Side::Local),
            &self.index.snapshot(Side::Lake),
        )
    }

    pub fn mirror_plan(
        &self,
        src_side: Side,
        src_folder: Option<&RelPath>,
        dst_side: Side,
        dst_folder: Option<&RelPath>,
    ) -> MirrorPlan {
        mirror::plan(
            &self.index.snapshot(src_side),
            &self.index.snapshot(dst_side),
            src_side,
            src_folder,
            dst_side,
            dst_folder,
            self.config.allow_delete_from_sync(dst_side),
        )
    }

    /// Stop claiming tasks; the running task finishes first.
    pub fn stop(&self) {
        self.queue.shutdown();
    }
}
