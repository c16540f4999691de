//! Hash worker pool: streams file bytes through BLAKE3 and maintains the
//! hash cache.
//!
//! Workers are plain threads fed by a bounded channel so hashing never
//! shares a thread with transfer I/O. A request first consults the cache
//! (unless forced); a file that mutates between the opening and closing
//! stat fails with `HashRaced`, which the queue treats as retryable.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs;
use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::cache::HashCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, Throttle, PROGRESS_INTERVAL};
use crate::index::IndexStore;
use crate::paths::{join, RelPath};
use crate::sources::SourceStore;
use crate::types::{mtime_ms, CancelToken, Side};

/// Streaming chunk size for hash reads.
pub const HASH_CHUNK: usize = 1024 * 1024;

/// Result of one hash request.
#[derive(Debug, Clone)]
pub struct HashOutcome {
    pub hash: String,
    pub size: u64,
    pub mtime_ms: i64,
    /// True when the cache answered without touching file bytes.
    pub from_cache: bool,
}

/// Everything a worker needs to satisfy a request.
#[derive(Clone)]
pub struct HashCtx {
    pub config: Arc<Config>,
    pub index: Arc<IndexStore>,
    pub cache: Arc<HashCache>,
    pub sources: Arc<SourceStore>,
    pub bus: Arc<EventBus>,
}

struct HashJob {
    side: Side,
    relpath: RelPath,
    /// Skip the cache short-circuit and cross-check the stored digest.
    force: bool,
    cancel: CancelToken,
    reply: Sender<Result<HashOutcome>>,
}

pub struct HashPool {
    tx: Sender<HashJob>,
    workers: Vec<JoinHandle<()>>,
}

impl HashPool {
    /// Spawn `workers` hashing threads over a bounded feed channel.
    pub fn spawn(workers: usize, ctx: HashCtx) -> Self {
        let (tx, rx) = bounded::<HashJob>(workers.max(1) * 4);
        let handles = (0..workers.max(1))
            .map(|i| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                std::thread::Builder::new()
                    .name(format!("hash-{i}"))
                    .spawn(move || worker_loop(rx, ctx))
                    .expect("failed to spawn hash worker")
            })
            .collect();
        Self { tx, workers: handles }
    }

    /// Queue a hash request; the receiver yields exactly one reply.
    pub fn submit(
        &self,
        side: Side,
        relpath: RelPath,
        force: bool,
        cancel: CancelToken,
    ) -> Receiver<Result<HashOutcome>> {
        let (reply, rx) = bounded(1);
        let job = HashJob { side, relpath, force, cancel, reply };
        if let Err(e) = self.tx.send(job) {
            // Pool shut down; surface through the reply channel.
            let _ = e.into_inner().reply.send(Err(Error::Invalid("hash pool stopped".into())));
        }
        rx
    }

    /// Stop accepting work and join the workers.
    pub fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<HashJob>, ctx: HashCtx) {
    for job in rx.iter() {
        let result = hash_one(&ctx, job.side, &job.relpath, job.force, &job.cancel);
        if let Err(e) = &result {
            debug!(side = %job.side, relpath = %job.relpath, error = %e, "Hash request failed");
        }
        let _ = job.reply.send(result);
    }
}

/// Hash a single file per the pool contract. Shared with the dedupe engine,
/// which calls through [`HashPool::submit`].
fn hash_one(
    ctx: &HashCtx,
    side: Side,
    relpath: &RelPath,
    force: bool,
    cancel: &CancelToken,
) -> Result<HashOutcome> {
    let abs = join(ctx.config.root(side), relpath)?;

    let open_meta = fs::metadata(&abs).map_err(|_| Error::NotFound {
        side,
        relpath: relpath.to_string(),
    })?;
    let size = open_meta.len();
    let mtime = mtime_ms(&open_meta);

    if !force {
        if let Some(hash) = ctx.cache.get(side, relpath, size, mtime)? {
            ctx.index.set_hash(side, relpath, size, mtime, &hash);
            ctx.bus.publish(Event::HashProgress {
                side,
                relpath: relpath.clone(),
                bytes_hashed: size,
                total_bytes: size,
            });
            return Ok(HashOutcome { hash, size, mtime_ms: mtime, from_cache: true });
        }
    }

    // What the cache believed before this pass, for mismatch detection.
    let prior = ctx.cache.get(side, relpath, size, mtime)?;

    let mut file = fs::File::open(&abs).map_err(|e| Error::from_io(e, "open for hashing"))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut hashed: u64 = 0;
    let mut throttle = Throttle::new(PROGRESS_INTERVAL);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::TransientIo(format!("hashing cancelled: {relpath}")));
        }
        let n = file.read(&mut buf).map_err(|e| Error::from_io(e, "read for hashing"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        hashed += n as u64;
        if throttle.ready() {
            ctx.bus.publish(Event::HashProgress {
                side,
                relpath: relpath.clone(),
                bytes_hashed: hashed,
                total_bytes: size,
            });
        }
    }

    // The file must not have changed while we were reading it.
    let close_meta = fs::metadata(&abs).map_err(|e| Error::from_io(e, "re-stat after hashing"))?;
    if close_meta.len() != size || mtime_ms(&close_meta) != mtime {
        return Err(Error::HashRaced(relpath.to_string()));
    }

    let hash = hasher.finalize().to_hex().to_string();

    if let Some(cached) = prior {
        if cached != hash {
            ctx.cache.invalidate(side, relpath)?;
            return Err(Error::HashMismatch {
                side,
                relpath: relpath.to_string(),
                cached,
                computed: hash,
            });
        }
    }

    ctx.cache.put(side, relpath, size, mtime, &hash)?;
    ctx.index.set_hash(side, relpath, size, mtime, &hash);
    ctx.bus.publish(Event::HashProgress {
        side,
        relpath: relpath.clone(),
        bytes_hashed: size,
        total_bytes: size,
    });

    // A relpath-keyed source URL can move onto its hash now.
    if let Err(e) = ctx.sources.promote_to_hash(relpath, &hash) {
        warn!(relpath = %relpath, error = %e, "Failed to promote source URL key");
    }

    Ok(HashOutcome { hash, size, mtime_ms: mtime, from_cache: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SideConfig;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_ctx() -> (TempDir, TempDir, HashCtx) {
        let local = TempDir::new().unwrap();
        let lake = TempDir::new().unwrap();
        let config = Config {
            local: SideConfig { root: local.path().to_path_buf(), allow_delete_from_sync: true },
            lake: SideConfig { root: lake.path().to_path_buf(), allow_delete_from_sync: false },
            queue_concurrency: 1,
            queue_retry_count: 3,
            hash_workers: 1,
            app_data_dir: local.path().to_path_buf(),
        };
        let ctx = HashCtx {
            config: Arc::new(config),
            index: Arc::new(IndexStore::new()),
            cache: Arc::new(HashCache::open_in_memory().unwrap()),
            sources: Arc::new(SourceStore::open(lake.path())),
            bus: Arc::new(EventBus::new()),
        };
        (local, lake, ctx)
    }

    fn write(root: &Path, rel: &str, bytes: &[u8]) {
        std::fs::write(root.join(rel), bytes).unwrap();
    }

    #[test]
    fn hashes_bytes_and_fills_cache() {
        let (local, _lake, ctx) = test_ctx();
        write(local.path(), "a.bin", b"hello world");
        let rp = RelPath::new("a.bin").unwrap();

        let out = hash_one(&ctx, Side::Local, &rp, false, &CancelToken::new()).unwrap();
        assert_eq!(out.hash, blake3::hash(b"hello world").to_hex().to_string());
        assert!(!out.from_cache);

        // Second pass answers from the cache.
        let out2 = hash_one(&ctx, Side::Local, &rp, false, &CancelToken::new()).unwrap();
        assert!(out2.from_cache);
        assert_eq!(out2.hash, out.hash);
    }

    #[test]
    fn empty_file_hashes_to_empty_digest() {
        let (local, _lake, ctx) = test_ctx();
        write(local.path(), "zero.bin", b"");
        let rp = RelPath::new("zero.bin").unwrap();

        let out = hash_one(&ctx, Side::Local, &rp, false, &CancelToken::new()).unwrap();
        assert_eq!(out.hash, blake3::hash(b"").to_hex().to_string());
        assert_eq!(out.size, 0);
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_local, _lake, ctx) = test_ctx();
        let rp = RelPath::new("ghost.bin").unwrap();
        let err = hash_one(&ctx, Side::Local, &rp, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn forced_rehash_detects_mismatch_and_invalidates() {
        let (local, _lake, ctx) = test_ctx();
        write(local.path(), "v.bin", b"contents");
        let rp = RelPath::new("v.bin").unwrap();
        let meta = std::fs::metadata(local.path().join("v.bin")).unwrap();

        // Poison the cache at the live coordinates.
        ctx.cache.put(Side::Local, &rp, meta.len(), mtime_ms(&meta), "bogus").unwrap();

        let err = hash_one(&ctx, Side::Local, &rp, true, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        // The bad row is gone; a fresh pass succeeds and repopulates.
        assert_eq!(ctx.cache.get(Side::Local, &rp, meta.len(), mtime_ms(&meta)).unwrap(), None);
        let out = hash_one(&ctx, Side::Local, &rp, true, &CancelToken::new()).unwrap();
        assert_eq!(out.hash, blake3::hash(b"contents").to_hex().to_string());
    }

    #[test]
    fn cancelled_request_fails_fast() {
        let (local, _lake, ctx) = test_ctx();
        write(local.path(), "c.bin", b"some bytes");
        let rp = RelPath::new("c.bin").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(hash_one(&ctx, Side::Local, &rp, false, &cancel).is_err());
    }

    #[test]
    fn pool_round_trip() {
        let (local, _lake, ctx) = test_ctx();
        write(local.path(), "p.bin", b"pool bytes");
        let pool = HashPool::spawn(2, ctx);

        let rx = pool.submit(
            Side::Local,
            RelPath::new("p.bin").unwrap(),
            false,
            CancelToken::new(),
        );
        let out = rx.recv().unwrap().unwrap();
        assert_eq!(out.hash, blake3::hash(b"pool bytes").to_hex().to_string());
        pool.shutdown();
    }
}
