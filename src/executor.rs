//! Executor: the transfer worker loop.
//!
//! Each worker claims the next runnable task and dispatches to a
//! type-specific handler. Copy streams through a `.part` staging file that
//! is fsynced and atomically renamed into place; failure and cancellation
//! remove the staging file. Transient errors re-enqueue at the head with
//! exponential backoff until the retry budget is spent; cancelled tasks do
//! not consume retries.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::dedupe;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::{Event, Throttle, PROGRESS_INTERVAL};
use crate::paths::{join, RelPath};
use crate::queue::{Task, TaskPayload};
use crate::scan::PART_SUFFIX;
use crate::types::{ms_to_system_time, mtime_ms, CancelToken, IndexEntry, Side};

/// Streaming chunk size for copies.
const COPY_CHUNK: usize = 1024 * 1024;

/// Cap on exponential retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Spawn the configured number of transfer workers.
pub fn spawn_workers(engine: &Arc<Engine>) -> Vec<JoinHandle<()>> {
    (0..engine.config.queue_concurrency)
        .map(|i| {
            let engine = Arc::clone(engine);
            std::thread::Builder::new()
                .name(format!("executor-{i}"))
                .spawn(move || worker_loop(engine))
                .expect("failed to spawn executor worker")
        })
        .collect()
}

fn worker_loop(engine: Arc<Engine>) {
    while let Some((task, cancel)) = engine.queue.claim_next() {
        engine.bus.publish(Event::TaskStarted {
            task_id: task.id.clone(),
            kind: task.payload.kind().to_string(),
        });
        info!(task_id = task.id.as_str(), kind = task.payload.kind(), "Task started");

        match dispatch(&engine, &task, &cancel) {
            Ok(result) => engine.queue.complete(&task.id, result),
            Err(_) if cancel.is_cancelled() => {
                // Cancellation does not consume the retry budget.
                engine.queue.mark_cancelled(&task.id);
            }
            Err(e) if e.is_transient() && task.retry_count < engine.queue.retry_limit() => {
                let backoff = backoff_for(task.retry_count);
                warn!(task_id = task.id.as_str(), error = %e, backoff_ms = backoff.as_millis() as u64, "Transient failure, re-enqueueing");
                engine.queue.requeue_transient(&task.id, e.to_string(), backoff);
            }
            Err(e) => {
                warn!(task_id = task.id.as_str(), error = %e, "Task failed");
                engine.queue.fail(&task.id, e.to_string());
            }
        }
    }
}

fn dispatch(engine: &Engine, task: &Task, cancel: &CancelToken) -> Result<Option<serde_json::Value>> {
    match &task.payload {
        TaskPayload::Copy { src_side, src_relpath, dst_side, dst_relpath } => {
            run_copy(engine, &task.id, *src_side, src_relpath, *dst_side, dst_relpath, cancel)
        }
        TaskPayload::Delete { side, relpath, from_dedupe } => {
            run_delete(engine, *side, relpath, *from_dedupe)?;
            Ok(None)
        }
        TaskPayload::Verify { side, folder, relpath } => {
            run_verify(engine, *side, folder.as_ref(), relpath.as_ref(), cancel)
        }
        TaskPayload::HashFile { side, relpath } => {
            let outcome = wait_for_hash(engine, *side, relpath.clone(), false, cancel)?;
            Ok(Some(serde_json::json!({
                "hash": outcome.hash,
                "size": outcome.size,
                "from_cache": outcome.from_cache,
            })))
        }
        TaskPayload::DedupeScan { side, mode, min_size_bytes } => {
            let summary = dedupe::run_scan(engine, *side, *mode, *min_size_bytes, cancel)?;
            Ok(Some(serde_json::to_value(summary).unwrap_or_default()))
        }
    }
}

fn backoff_for(retry_count: u32) -> Duration {
    let exp = Duration::from_millis(500u64.saturating_mul(1 << retry_count.min(16)));
    exp.min(MAX_BACKOFF)
}

// ---------------------------------------------------------------------------
// Copy
// ---------------------------------------------------------------------------

/// Staging path for an in-flight copy: `<dst>.part` next to the target.
fn part_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PART_SUFFIX);
    dst.with_file_name(name)
}

/// Confirmed conflict between the source file and what already sits at the
/// destination: both hashes known and unequal, or sizes unequal.
fn is_confirmed_conflict(src: &IndexEntry, dst: &IndexEntry) -> bool {
    match (&src.hash, &dst.hash) {
        (Some(a), Some(b)) => a != b,
        _ => src.size != dst.size,
    }
}

fn run_copy(
    engine: &Engine,
    task_id: &str,
    src_side: Side,
    src_relpath: &RelPath,
    dst_side: Side,
    dst_relpath: &RelPath,
    cancel: &CancelToken,
) -> Result<Option<serde_json::Value>> {
    if src_side == dst_side {
        return Err(Error::Invalid("copy source and destination sides must differ".into()));
    }

    let src_abs = join(engine.config.root(src_side), src_relpath)?;
    let dst_abs = join(engine.config.root(dst_side), dst_relpath)?;

    let src_meta = fs::metadata(&src_abs).map_err(|_| Error::NotFound {
        side: src_side,
        relpath: src_relpath.to_string(),
    })?;
    let total = src_meta.len();
    let src_mtime = mtime_ms(&src_meta);

    // Refuse only a confirmed conflict; probable_same proceeds.
    if let Some(dst_entry) = engine.index.get(dst_side, dst_relpath) {
        let src_entry = engine
            .index
            .get(src_side, src_relpath)
            .unwrap_or(IndexEntry {
                relpath: src_relpath.clone(),
                size: total,
                mtime_ms: src_mtime,
                hash: None,
            });
        if is_confirmed_conflict(&src_entry, &dst_entry) {
            return Err(Error::ConflictRefused(dst_relpath.to_string()));
        }
    }

    if let Some(parent) = dst_abs.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::from_io(e, "create destination dirs"))?;
    }

    engine.queue.update_progress(task_id, 0, Some(total));
    let part = part_path(&dst_abs);

    let streamed = stream_to_part(engine, task_id, &src_abs, &part, total, src_mtime, cancel);
    let (bytes, stream_hash) = match streamed {
        Ok(out) => out,
        Err(e) => {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&part, &dst_abs) {
        let _ = fs::remove_file(&part);
        return Err(Error::from_io(e, "finalize copy rename"));
    }

    // Fresh stat picks up the destination filesystem's mtime resolution.
    let dst_meta = fs::metadata(&dst_abs).map_err(|e| Error::from_io(e, "stat destination"))?;
    let dst_mtime = mtime_ms(&dst_meta);

    // The streamed digest is the destination's hash by construction, and
    // the source's too unless the source mutated mid-copy.
    engine.cache.put(dst_side, dst_relpath, dst_meta.len(), dst_mtime, &stream_hash)?;
    if let Ok(fresh) = fs::metadata(&src_abs) {
        if fresh.len() == total && mtime_ms(&fresh) == src_mtime {
            engine.cache.put(src_side, src_relpath, total, src_mtime, &stream_hash)?;
            engine.index.set_hash(src_side, src_relpath, total, src_mtime, &stream_hash);
        }
    }
    engine.index.upsert(
        dst_side,
        IndexEntry {
            relpath: dst_relpath.clone(),
            size: dst_meta.len(),
            mtime_ms: dst_mtime,
            hash: Some(stream_hash),
        },
    );

    engine.queue.update_progress(task_id, bytes, Some(total));
    engine.bus.publish(Event::QueueProgress {
        task_id: task_id.to_string(),
        bytes_transferred: bytes,
        total_bytes: total,
        progress_pct: 100.0,
    });
    Ok(None)
}

/// Stream source bytes into the staging file, hashing them on the way,
/// fsync it, and stamp the source mtime on it so the rename carries both
/// content and time. Returns the byte count and the streamed BLAKE3 digest.
fn stream_to_part(
    engine: &Engine,
    task_id: &str,
    src_abs: &Path,
    part: &Path,
    total: u64,
    src_mtime: i64,
    cancel: &CancelToken,
) -> Result<(u64, String)> {
    let mut src = fs::File::open(src_abs).map_err(|e| Error::from_io(e, "open copy source"))?;
    let mut out = fs::File::create(part).map_err(|e| Error::from_io(e, "create part file"))?;

    let mut buf = vec![0u8; COPY_CHUNK];
    let mut hasher = blake3::Hasher::new();
    let mut bytes: u64 = 0;
    let mut throttle = Throttle::new(PROGRESS_INTERVAL);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::TransientIo("copy cancelled".into()));
        }
        let n = src.read(&mut buf).map_err(|e| Error::from_io(e, "read copy source"))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(|e| Error::from_io(e, "write part file"))?;
        hasher.update(&buf[..n]);
        bytes += n as u64;
        if throttle.ready() {
            engine.queue.update_progress(task_id, bytes, Some(total));
            engine.bus.publish(Event::QueueProgress {
                task_id: task_id.to_string(),
                bytes_transferred: bytes,
                total_bytes: total,
                progress_pct: if total == 0 { 100.0 } else { bytes as f64 * 100.0 / total as f64 },
            });
        }
    }

    out.sync_all().map_err(|e| Error::from_io(e, "fsync part file"))?;
    out.set_modified(ms_to_system_time(src_mtime))
        .map_err(|e| Error::from_io(e, "set part mtime"))?;
    Ok((bytes, hasher.finalize().to_hex().to_string()))
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

fn run_delete(engine: &Engine, side: Side, relpath: &RelPath, from_dedupe: bool) -> Result<()> {
    if !from_dedupe && !engine.config.allow_delete_from_sync(side) {
        return Err(Error::PolicyDenied(side));
    }
    let abs = join(engine.config.root(side), relpath)?;
    match fs::remove_file(&abs) {
        Ok(()) => {}
        // Already gone counts as success.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::from_io(e, "delete file")),
    }
    engine.cache.invalidate(side, relpath)?;
    engine.index.remove(side, relpath);
    Ok(())
}

// ---------------------------------------------------------------------------
// Verify and hash
// ---------------------------------------------------------------------------

fn wait_for_hash(
    engine: &Engine,
    side: Side,
    relpath: RelPath,
    force: bool,
    cancel: &CancelToken,
) -> Result<crate::hasher::HashOutcome> {
    let rx = engine.hasher.submit(side, relpath, force, cancel.clone());
    rx.recv().map_err(|_| Error::Invalid("hash pool stopped".into()))?
}

/// Force re-hash over the requested scope. Per-file work emits
/// `hash_progress`; a folder scope additionally rolls up `verify_progress`.
fn run_verify(
    engine: &Engine,
    side: Option<Side>,
    folder: Option<&RelPath>,
    relpath: Option<&RelPath>,
    cancel: &CancelToken,
) -> Result<Option<serde_json::Value>> {
    let sides: Vec<Side> = match side {
        Some(s) => vec![s],
        None => Side::ALL.to_vec(),
    };

    let mut targets: Vec<(Side, RelPath)> = Vec::new();
    for s in sides {
        let snap = engine.index.snapshot(s);
        match (relpath, folder) {
            (Some(rp), _) => {
                if snap.contains_key(rp) {
                    targets.push((s, rp.clone()));
                }
            }
            (None, Some(f)) => {
                targets.extend(
                    snap.keys().filter(|k| k.is_under(f)).map(|k| (s, k.clone())),
                );
            }
            (None, None) => targets.extend(snap.keys().map(|k| (s, k.clone()))),
        }
    }

    if relpath.is_some() && targets.is_empty() {
        let rp = relpath.unwrap();
        return Err(Error::NotFound { side: side.unwrap_or(Side::Local), relpath: rp.to_string() });
    }

    let total = targets.len();
    let mut verified = 0usize;
    for (i, (s, rp)) in targets.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::TransientIo("verify cancelled".into()));
        }
        match wait_for_hash(engine, s, rp.clone(), true, cancel) {
            Ok(_) => verified += 1,
            // The file disappeared between snapshot and hash; skip it.
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        if let Some(f) = folder {
            engine.bus.publish(Event::VerifyProgress {
                folder: f.to_string(),
                current: i + 1,
                total,
            });
        }
    }
    Ok(Some(serde_json::json!({ "verified": verified })))
}
