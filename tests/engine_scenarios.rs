//! End-to-end scenarios driving the full engine: scan, copy, conflict
//! refusal, mirror, dedupe, verify, and cancellation.

mod helpers;

use helpers::TestHarness;
use std::time::{Duration, Instant};

use modeldepot::dedupe::{self, DedupeMode, Selection};
use modeldepot::events::Event;
use modeldepot::mirror;
use modeldepot::paths::RelPath;
use modeldepot::queue::{TaskPayload, TaskStatus};
use modeldepot::types::{mtime_ms, DiffStatus, Side};

// ---------------------------------------------------------------------------
// Copy
// ---------------------------------------------------------------------------

#[test]
fn only_local_file_copies_to_lake_and_diffs_same() {
    let h = TestHarness::new();
    let bytes = vec![7u8; 1024];
    h.write(Side::Local, "checkpoints/a.safetensors", &bytes);
    h.refresh();
    assert_eq!(h.diff_status("checkpoints/a.safetensors"), Some(DiffStatus::OnlyLocal));

    let task = h.enqueue_wait(h.copy_payload(Side::Local, "checkpoints/a.safetensors"));
    assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);

    let dst = h.abs(Side::Lake, "checkpoints/a.safetensors");
    let dst_meta = std::fs::metadata(&dst).unwrap();
    assert_eq!(dst_meta.len(), 1024);

    // mtime preserved within filesystem resolution.
    let src_meta = std::fs::metadata(h.abs(Side::Local, "checkpoints/a.safetensors")).unwrap();
    assert!((mtime_ms(&dst_meta) - mtime_ms(&src_meta)).abs() < 2000);

    // The streamed hash lands on both sides, so the diff is `same` already.
    assert_eq!(h.diff_status("checkpoints/a.safetensors"), Some(DiffStatus::Same));
    h.assert_no_part_files();
}

#[test]
fn copy_refuses_confirmed_conflict() {
    let h = TestHarness::new();
    h.write(Side::Local, "x.bin", b"local-version");
    h.write(Side::Lake, "x.bin", b"lake--version"); // same size, different bytes
    h.refresh();

    // Hash both sides so the conflict is confirmed.
    let verify = h.enqueue_wait(TaskPayload::Verify {
        side: None,
        folder: None,
        relpath: Some(RelPath::new("x.bin").unwrap()),
    });
    assert_eq!(verify.status, TaskStatus::Completed);
    assert_eq!(h.diff_status("x.bin"), Some(DiffStatus::Conflict));

    let task = h.enqueue_wait(h.copy_payload(Side::Local, "x.bin"));
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("conflict"));

    // Destination untouched, no staging leftovers.
    assert_eq!(std::fs::read(h.abs(Side::Lake, "x.bin")).unwrap(), b"lake--version");
    h.assert_no_part_files();
}

#[test]
fn copy_round_trip_restores_identical_content() {
    let h = TestHarness::with_policy(false, true);
    let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
    h.write(Side::Local, "models/big.bin", &payload);
    h.refresh();

    let there = h.enqueue_wait(h.copy_payload(Side::Local, "models/big.bin"));
    assert_eq!(there.status, TaskStatus::Completed);
    let original_hash = h
        .engine
        .index
        .get(Side::Lake, &RelPath::new("models/big.bin").unwrap())
        .unwrap()
        .hash
        .unwrap();

    // Copy back over an identical file is a no-op on content.
    let back = h.enqueue_wait(h.copy_payload(Side::Lake, "models/big.bin"));
    assert_eq!(back.status, TaskStatus::Completed);
    assert_eq!(std::fs::read(h.abs(Side::Local, "models/big.bin")).unwrap(), payload);

    // Delete then re-copy restores the same hash.
    let deleted = h.enqueue_wait(TaskPayload::Delete {
        side: Side::Lake,
        relpath: RelPath::new("models/big.bin").unwrap(),
        from_dedupe: false,
    });
    assert_eq!(deleted.status, TaskStatus::Completed);
    assert!(!h.abs(Side::Lake, "models/big.bin").exists());

    let again = h.enqueue_wait(h.copy_payload(Side::Local, "models/big.bin"));
    assert_eq!(again.status, TaskStatus::Completed);
    let restored_hash = h
        .engine
        .index
        .get(Side::Lake, &RelPath::new("models/big.bin").unwrap())
        .unwrap()
        .hash
        .unwrap();
    assert_eq!(restored_hash, original_hash);
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

#[test]
fn additive_mirror_fills_local_from_lake() {
    let h = TestHarness::new(); // deletes disallowed on both sides
    h.write(Side::Lake, "sd/a.bin", b"aaaa");
    h.write(Side::Lake, "sd/b.bin", b"bbbbbb");
    h.write(Side::Lake, "sd/c.bin", b"cc");
    h.write(Side::Local, "sd/a.bin", b"aaaa");
    h.refresh();

    let plan = h.engine.mirror_plan(Side::Lake, None, Side::Local, None);
    let copies: Vec<&str> = plan.copy.iter().map(|e| e.rel.as_str()).collect();
    assert_eq!(copies, vec!["sd/b.bin", "sd/c.bin"]);
    assert!(plan.delete.is_empty());
    assert!(plan.extras.is_empty());
    assert!(plan.conflicts.is_empty());
    assert_eq!(plan.totals.copy_bytes, 8);

    let task_ids = mirror::execute(&h.engine, &plan).unwrap();
    assert_eq!(task_ids.len(), 2);
    for id in &task_ids {
        assert_eq!(h.wait_task(id).status, TaskStatus::Completed);
    }

    // The two copies are `same` via the streamed hash; `a` needs a verify
    // to upgrade from probable_same.
    let verify = h.enqueue_wait(TaskPayload::Verify { side: None, folder: None, relpath: None });
    assert_eq!(verify.status, TaskStatus::Completed);
    for rel in ["sd/a.bin", "sd/b.bin", "sd/c.bin"] {
        assert_eq!(h.diff_status(rel), Some(DiffStatus::Same), "diff for {rel}");
    }
}

// ---------------------------------------------------------------------------
// Dedupe
// ---------------------------------------------------------------------------

#[test]
fn dedupe_scan_and_execute_frees_duplicates() {
    // Sync deletes disabled everywhere: dedupe bypasses the policy.
    let h = TestHarness::new();
    let body = vec![42u8; 4096];
    h.write(Side::Local, "d/1", &body);
    h.write(Side::Local, "d/2", &body);
    h.write(Side::Local, "e/3", &body);
    h.write(Side::Local, "e/unique", b"different");
    h.refresh();

    let scan_task = h.enqueue_wait(TaskPayload::DedupeScan {
        side: Side::Local,
        mode: DedupeMode::Full,
        min_size_bytes: 0,
    });
    assert_eq!(scan_task.status, TaskStatus::Completed);
    let result = scan_task.result.unwrap();
    let scan_id = result["scan_id"].as_str().unwrap().to_string();
    assert_eq!(result["duplicate_groups"], 1);
    assert_eq!(result["total_bytes_redundant"], 2 * 4096);

    let groups = h.engine.dedupe.groups(&scan_id).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].files.len(), 3);

    let report = dedupe::execute(
        &h.engine,
        &scan_id,
        &[Selection { group_id: groups[0].id, keep_relpath: RelPath::new("d/1").unwrap() }],
    )
    .unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.freed_bytes, 2 * 4096);
    assert!(report.skipped.is_empty());

    // Deletions run as ordinary queue tasks; wait for the files to go.
    let deadline = Instant::now() + Duration::from_secs(30);
    while h.abs(Side::Local, "d/2").exists() || h.abs(Side::Local, "e/3").exists() {
        assert!(Instant::now() < deadline, "dedupe deletions did not land");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(h.abs(Side::Local, "d/1").exists());

    // A second scan over the deduplicated side finds nothing.
    let rescan = h.enqueue_wait(TaskPayload::DedupeScan {
        side: Side::Local,
        mode: DedupeMode::Full,
        min_size_bytes: 0,
    });
    assert_eq!(rescan.result.unwrap()["duplicate_groups"], 0);
}

#[test]
fn dedupe_skips_stale_groups() {
    let h = TestHarness::new();
    let body = vec![9u8; 2048];
    h.write(Side::Local, "p/one", &body);
    h.write(Side::Local, "p/two", &body);
    // Fast mode pre-groups by (size, mtime); pin the mtimes together.
    let stamp = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    for rel in ["p/one", "p/two"] {
        let f = std::fs::File::options().write(true).open(h.abs(Side::Local, rel)).unwrap();
        f.set_modified(stamp).unwrap();
    }
    h.refresh();

    let scan_task = h.enqueue_wait(TaskPayload::DedupeScan {
        side: Side::Local,
        mode: DedupeMode::Fast,
        min_size_bytes: 0,
    });
    let scan_id = scan_task.result.unwrap()["scan_id"].as_str().unwrap().to_string();
    let groups = h.engine.dedupe.groups(&scan_id).unwrap();
    assert_eq!(groups.len(), 1);

    // Mutate one member after the scan.
    h.write(Side::Local, "p/two", b"changed since the scan");

    let report = dedupe::execute(
        &h.engine,
        &scan_id,
        &[Selection { group_id: groups[0].id, keep_relpath: RelPath::new("p/one").unwrap() }],
    )
    .unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.skipped.len(), 1);
    assert!(h.abs(Side::Local, "p/two").exists());
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

#[test]
fn verify_upgrades_probable_same() {
    let h = TestHarness::new();
    h.write(Side::Local, "m.safetensors", b"model weights");
    std::thread::sleep(Duration::from_millis(20)); // force an mtime drift
    h.write(Side::Lake, "m.safetensors", b"model weights");
    h.refresh();
    assert_eq!(h.diff_status("m.safetensors"), Some(DiffStatus::ProbableSame));

    let task = h.enqueue_wait(TaskPayload::Verify {
        side: None,
        folder: None,
        relpath: Some(RelPath::new("m.safetensors").unwrap()),
    });
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(h.diff_status("m.safetensors"), Some(DiffStatus::Same));

    // The cache holds both sides at their live coordinates.
    let rp = RelPath::new("m.safetensors").unwrap();
    for side in Side::ALL {
        let entry = h.engine.index.get(side, &rp).unwrap();
        let cached = h.engine.cache.get(side, &rp, entry.size, entry.mtime_ms).unwrap();
        assert!(cached.is_some(), "cache missing for {side}");
    }
}

#[test]
fn empty_files_verify_as_same() {
    let h = TestHarness::new();
    h.write(Side::Local, "zero.bin", b"");
    std::thread::sleep(Duration::from_millis(20));
    h.write(Side::Lake, "zero.bin", b"");
    h.refresh();

    let task = h.enqueue_wait(TaskPayload::Verify {
        side: None,
        folder: None,
        relpath: Some(RelPath::new("zero.bin").unwrap()),
    });
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(h.diff_status("zero.bin"), Some(DiffStatus::Same));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn cancel_mid_copy_cleans_up() {
    let h = TestHarness::new();

    // A large sparse source keeps the copy busy long enough to cancel.
    let src = h.abs(Side::Local, "huge.bin");
    let f = std::fs::File::create(&src).unwrap();
    f.set_len(256 * 1024 * 1024).unwrap();
    drop(f);
    h.refresh();

    let (sub, mut events) = h.engine.bus.subscribe(1024);
    let task = h.engine.queue.enqueue(h.copy_payload(Side::Local, "huge.bin")).unwrap();

    // Cancel as soon as the first progress frame arrives.
    loop {
        match events.blocking_recv().expect("bus closed before progress") {
            Event::QueueProgress { task_id, .. } if task_id == task.id => break,
            _ => {}
        }
    }
    h.engine.queue.cancel(&task.id);
    h.engine.bus.unsubscribe(sub);

    let done = h.wait_task(&task.id);
    assert_eq!(done.status, TaskStatus::Cancelled);
    assert!(!h.abs(Side::Lake, "huge.bin").exists());
    h.assert_no_part_files();
    // Source untouched.
    assert_eq!(std::fs::metadata(&src).unwrap().len(), 256 * 1024 * 1024);
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[test]
fn sync_delete_respects_policy_and_dedupe_bypasses_it() {
    let h = TestHarness::new(); // allow_delete_from_sync = false on both sides
    h.write(Side::Lake, "keep.bin", b"precious");
    h.refresh();

    let denied = h.enqueue_wait(TaskPayload::Delete {
        side: Side::Lake,
        relpath: RelPath::new("keep.bin").unwrap(),
        from_dedupe: false,
    });
    assert_eq!(denied.status, TaskStatus::Failed);
    assert!(h.abs(Side::Lake, "keep.bin").exists());

    let bypassed = h.enqueue_wait(TaskPayload::Delete {
        side: Side::Lake,
        relpath: RelPath::new("keep.bin").unwrap(),
        from_dedupe: true,
    });
    assert_eq!(bypassed.status, TaskStatus::Completed);
    assert!(!h.abs(Side::Lake, "keep.bin").exists());

    // Deleting an already-absent file is idempotent success.
    let again = h.enqueue_wait(TaskPayload::Delete {
        side: Side::Lake,
        relpath: RelPath::new("keep.bin").unwrap(),
        from_dedupe: true,
    });
    assert_eq!(again.status, TaskStatus::Completed);
}
