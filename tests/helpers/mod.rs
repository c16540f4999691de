//! Test harness: a full engine over temp directories with running workers.
#![allow(dead_code)] // each integration test binary uses a subset

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use modeldepot::config::{Config, SideConfig};
use modeldepot::paths::RelPath;
use modeldepot::queue::{Task, TaskPayload};
use modeldepot::types::{DiffStatus, Side};
use modeldepot::Engine;

pub struct TestHarness {
    pub engine: Arc<Engine>,
    // Held for their Drop; the dirs outlive the engine.
    _local: TempDir,
    _lake: TempDir,
    _data: TempDir,
}

impl TestHarness {
    /// Engine over fresh temp roots with sync deletes disabled everywhere.
    pub fn new() -> Self {
        Self::with_policy(false, false)
    }

    pub fn with_policy(local_allow_delete: bool, lake_allow_delete: bool) -> Self {
        let local = TempDir::new().expect("local root");
        let lake = TempDir::new().expect("lake root");
        let data = TempDir::new().expect("data dir");

        let config = Config {
            local: SideConfig {
                root: local.path().canonicalize().unwrap(),
                allow_delete_from_sync: local_allow_delete,
            },
            lake: SideConfig {
                root: lake.path().canonicalize().unwrap(),
                allow_delete_from_sync: lake_allow_delete,
            },
            queue_concurrency: 1,
            queue_retry_count: 3,
            hash_workers: 2,
            app_data_dir: data.path().to_path_buf(),
        };

        let engine = Engine::open(config).expect("engine open");
        let _workers = engine.start();
        Self { engine, _local: local, _lake: lake, _data: data }
    }

    pub fn root(&self, side: Side) -> PathBuf {
        self.engine.config.root(side).to_path_buf()
    }

    pub fn abs(&self, side: Side, rel: &str) -> PathBuf {
        self.root(side).join(rel)
    }

    /// Write a file under a side's root.
    pub fn write(&self, side: Side, rel: &str, bytes: &[u8]) {
        let path = self.abs(side, rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, bytes).unwrap();
    }

    /// Re-scan both sides and wait for the snapshots to land.
    pub fn refresh(&self) {
        for side in Side::ALL {
            self.engine.refresh_index(side).join().unwrap();
        }
    }

    /// Poll until the task reaches a terminal state.
    pub fn wait_task(&self, id: &str) -> Task {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let task = self.engine.queue.get(id).expect("task exists");
            if task.status.is_terminal() {
                return task;
            }
            assert!(Instant::now() < deadline, "task {id} did not finish in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn enqueue_wait(&self, payload: TaskPayload) -> Task {
        let task = self.engine.queue.enqueue(payload).expect("enqueue");
        self.wait_task(&task.id)
    }

    pub fn copy_payload(&self, src: Side, rel: &str) -> TaskPayload {
        TaskPayload::Copy {
            src_side: src,
            src_relpath: RelPath::new(rel).unwrap(),
            dst_side: src.other(),
            dst_relpath: RelPath::new(rel).unwrap(),
        }
    }

    pub fn diff_status(&self, rel: &str) -> Option<DiffStatus> {
        self.engine
            .diff()
            .into_iter()
            .find(|d| d.relpath.as_str() == rel)
            .map(|d| d.status)
    }

    /// No `.part` staging files anywhere under either root.
    pub fn assert_no_part_files(&self) {
        for side in Side::ALL {
            for entry in walk(&self.root(side)) {
                assert!(
                    !entry.to_string_lossy().ends_with(".part"),
                    "stray part file: {}",
                    entry.display()
                );
            }
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.engine.stop();
    }
}

fn walk(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else { return out };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk(&path));
        } else {
            out.push(path);
        }
    }
    out
}
