//! End-to-end hashing pipeline: hash_file tasks, cache reuse, and
//! source-URL key promotion.

mod helpers;

use helpers::TestHarness;

use modeldepot::paths::RelPath;
use modeldepot::queue::{TaskPayload, TaskStatus};
use modeldepot::sources::relpath_key;
use modeldepot::types::Side;

#[test]
fn hash_file_task_populates_cache_and_index() {
    let h = TestHarness::new();
    h.write(Side::Local, "loras/style.safetensors", b"lora weights here");
    h.refresh();
    let rp = RelPath::new("loras/style.safetensors").unwrap();

    let first = h.enqueue_wait(TaskPayload::HashFile { side: Side::Local, relpath: rp.clone() });
    assert_eq!(first.status, TaskStatus::Completed, "error: {:?}", first.error);
    let result = first.result.unwrap();
    let expected = blake3::hash(b"lora weights here").to_hex().to_string();
    assert_eq!(result["hash"].as_str().unwrap(), expected);
    assert_eq!(result["from_cache"], false);

    // The index entry carries the hash now.
    let entry = h.engine.index.get(Side::Local, &rp).unwrap();
    assert_eq!(entry.hash.as_deref(), Some(expected.as_str()));

    // A second pass is answered by the cache.
    let second = h.enqueue_wait(TaskPayload::HashFile { side: Side::Local, relpath: rp });
    assert_eq!(second.result.unwrap()["from_cache"], true);
}

#[test]
fn hashing_promotes_relpath_source_keys() {
    let h = TestHarness::new();
    h.write(Side::Local, "checkpoints/sd.safetensors", b"checkpoint bytes");
    h.refresh();
    let rp = RelPath::new("checkpoints/sd.safetensors").unwrap();

    // URL recorded before the hash is known, under the relpath key.
    h.engine
        .sources
        .put(&relpath_key(&rp), "https://example.com/sd.safetensors", None, None)
        .unwrap();

    let task = h.enqueue_wait(TaskPayload::HashFile { side: Side::Local, relpath: rp.clone() });
    assert_eq!(task.status, TaskStatus::Completed);
    let hash = task.result.unwrap()["hash"].as_str().unwrap().to_string();

    // The sidecar entry moved onto its content hash.
    assert!(h.engine.sources.get(&relpath_key(&rp)).is_none());
    assert_eq!(h.engine.sources.get(&hash).unwrap().url, "https://example.com/sd.safetensors");
}

#[test]
fn missing_file_fails_the_task() {
    let h = TestHarness::new();
    let task = h.enqueue_wait(TaskPayload::HashFile {
        side: Side::Lake,
        relpath: RelPath::new("ghost.bin").unwrap(),
    });
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("not found"));
}
