//! Integration tests for the save store.

use serde_json::json;
use storyline::{
    Bookmark, ContentHash, GameStateCheckpoint, Offset, ReachedDialogueData, Restorable,
    SaveConfig, SaveStore, Screenshot, ScriptNode, SlotOrder,
};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> SaveConfig {
    SaveConfig {
        header_capacity: 16 * 1024,
        bookmark_cache_size: 8,
        ..SaveConfig::new(dir.path().join("profile"))
    }
}

fn test_store(dir: &TempDir) -> SaveStore {
    SaveStore::open_or_create(test_config(dir)).unwrap()
}

fn checkpoint(node: &str, index: u32) -> GameStateCheckpoint {
    let mut checkpoint = GameStateCheckpoint::new(node, index);
    checkpoint.variables.insert("gold".into(), 10i64.into());
    checkpoint.variables.insert("met_guide".into(), true.into());
    checkpoint
}

// --- Scenarios ---

#[test]
fn test_fresh_root_node_dedup_and_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut store = test_store(&dir);

    let region = store.header().checkpoint_region();
    assert!(region.is_empty());
    assert!(store.header().reached_region().is_empty());

    let first = store.get_or_create_child(None, "start", 0, 0).unwrap();
    let second = store.get_or_create_child(None, "start", 0, 0).unwrap();
    assert_eq!(first.offset, second.offset);

    let log_end = store.stats().log_size_bytes;
    store.get_or_create_child(None, "start", 0, 0).unwrap();
    assert_eq!(store.stats().log_size_bytes, log_end);

    let payload = checkpoint("start", 5);
    let reference = store.append_checkpoint(&payload).unwrap();
    assert_eq!(store.get_checkpoint(reference).unwrap(), payload);
}

#[test]
fn test_reached_survives_reload() {
    let dir = TempDir::new().unwrap();

    {
        let mut store = test_store(&dir);
        assert!(store.set_reached(ReachedDialogueData::new("start", 0, 100)).unwrap());
        assert!(store.set_reached(ReachedDialogueData::new("start", 1, 101)).unwrap());
        store.close().unwrap();
    }

    let store = test_store(&dir);
    let reached = store.reached().reached_dialogues("start");
    assert_eq!(reached.len(), 2);
    assert_eq!(reached[0].text_hash, 100);
    assert_eq!(reached[1].text_hash, 101);
    assert!(store.is_reached_any_history("start", 1));
    assert!(!store.is_reached_any_history("start", 2));
}

#[test]
fn test_bookmark_invalidated_by_reset() {
    let dir = TempDir::new().unwrap();
    let mut store = test_store(&dir);

    let node = store.get_or_create_child(None, "start", 0, 0).unwrap();
    let payload = checkpoint("start", 0);
    let reference = store.save_checkpoint(node.offset, &payload).unwrap();
    store
        .save_bookmark(1, &Bookmark::new(node.offset, reference, payload))
        .unwrap();
    assert!(store.load_bookmark(1).unwrap().is_some());

    store.reset().unwrap();

    assert!(store.load_bookmark(1).unwrap().is_none());
    assert!(store.bookmark(1).unwrap().is_none());
    // Invalidated, not deleted.
    assert!(store.bookmarks().slot_path(1).exists());

    assert!(store.delete_bookmark(1).unwrap());
    assert_eq!(store.bookmarks().query_max_used_id(0), 0);
}

// --- Workflows ---

#[test]
fn test_branching_playthrough() {
    let dir = TempDir::new().unwrap();
    let mut store = test_store(&dir);

    let start = store.get_or_create_child(None, "start", 1, 0).unwrap();
    let forest = store
        .get_or_create_child(Some(start.offset), "forest", 2, 3)
        .unwrap();
    let town = store
        .get_or_create_child(Some(start.offset), "town", 2, 3)
        .unwrap();
    // Same scene entered with different variables is a separate branch.
    let town_rich = store
        .get_or_create_child(Some(start.offset), "town", 9, 3)
        .unwrap();
    assert_ne!(town.offset, town_rich.offset);

    let children: Vec<String> = store
        .tree()
        .children(Some(start.offset))
        .unwrap()
        .into_iter()
        .map(|n| format!("{}:{}", n.name, n.variables_hash))
        .collect();
    assert_eq!(children, vec!["forest:2", "town:2", "town:9"]);

    let cave = store
        .get_or_create_child(Some(forest.offset), "cave", 2, 0)
        .unwrap();
    let path: Vec<String> = store
        .tree()
        .path_to_root(cave.offset)
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert_eq!(path, vec!["cave", "forest", "start"]);

    store.close().unwrap();

    // Replaying the same choices after a reload reuses every node.
    let mut store = test_store(&dir);
    let start_again = store.get_or_create_child(None, "start", 1, 0).unwrap();
    let forest_again = store
        .get_or_create_child(Some(start_again.offset), "forest", 2, 3)
        .unwrap();
    let cave_again = store
        .get_or_create_child(Some(forest_again.offset), "cave", 2, 0)
        .unwrap();
    assert_eq!(start_again.offset, start.offset);
    assert_eq!(cave_again.offset, cave.offset);
}

#[test]
fn test_saved_checkpoints_are_immutable() {
    let dir = TempDir::new().unwrap();
    let mut store = test_store(&dir);

    let node = store.get_or_create_child(None, "start", 0, 0).unwrap();
    let original = checkpoint("start", 4);
    let first = store.save_checkpoint(node.offset, &original).unwrap();
    let log_end = store.stats().log_size_bytes;

    // Saving the same state again reuses the trailing pair.
    assert_eq!(store.save_checkpoint(node.offset, &original).unwrap(), first);
    assert_eq!(store.stats().log_size_bytes, log_end);

    // A bookmark taken now keeps pointing at the original payload.
    store
        .save_bookmark(0, &Bookmark::new(node.offset, first, original.clone()))
        .unwrap();

    let mut updated = checkpoint("start", 4);
    updated.variables.insert("gold".into(), 20i64.into());
    let second = store.save_checkpoint(node.offset, &updated).unwrap();

    assert_ne!(first, second);
    assert!(store.stats().log_size_bytes > log_end);
    assert_eq!(store.get_checkpoint(first).unwrap(), original);
    assert_eq!(store.get_checkpoint(second).unwrap(), updated);
    let bookmark = store.load_bookmark(0).unwrap().unwrap();
    assert_eq!(store.get_checkpoint(bookmark.checkpoint_ref).unwrap(), original);
    assert_eq!(bookmark.checkpoint, original);

    // A later dialogue index always gets a new pair.
    let third = store.save_checkpoint(node.offset, &checkpoint("start", 5)).unwrap();
    assert_ne!(third, second);
    assert_eq!(store.tree().node(node.offset).unwrap().last_checkpoint, third);
    assert_eq!(store.tree().node(node.offset).unwrap().end_dialogue, 6);
}

#[test]
fn test_interleaved_regions_reload() {
    let dir = TempDir::new().unwrap();

    let (node, reference) = {
        let mut store = test_store(&dir);
        let node = store.get_or_create_child(None, "start", 0, 0).unwrap();
        store.set_reached(ReachedDialogueData::new("start", 0, 1)).unwrap();
        let reference = store.append_checkpoint(&checkpoint("start", 0)).unwrap();
        store.set_reached(ReachedDialogueData::new("start", 1, 2)).unwrap();
        store.set_end_reached("early_end").unwrap();
        let child = store
            .get_or_create_child(Some(node.offset), "end", 0, 0)
            .unwrap();
        assert!(child.offset.is_some());
        store.close().unwrap();
        (node, reference)
    };

    let mut store = test_store(&dir);
    assert_eq!(store.reached().reached_count("start"), 2);
    assert!(store.is_end_reached("early_end"));
    assert_eq!(store.get_checkpoint(reference).unwrap(), checkpoint("start", 0));
    assert_eq!(store.tree().children(Some(node.offset)).unwrap().len(), 1);

    let stats = store.stats();
    assert_eq!(stats.reached_dialogue_count, 2);
    assert_eq!(stats.ending_count, 1);
}

struct Portrait {
    expression: String,
}

impl Restorable for Portrait {
    fn restore_key(&self) -> &str {
        "portrait"
    }

    fn capture(&self) -> serde_json::Value {
        json!({ "expression": self.expression })
    }

    fn restore(&mut self, blob: &serde_json::Value) -> storyline::Result<()> {
        self.expression = blob["expression"].as_str().unwrap_or_default().to_string();
        Ok(())
    }
}

#[test]
fn test_restore_blobs_through_bookmark() {
    let dir = TempDir::new().unwrap();
    let mut store = test_store(&dir);

    let node = store.get_or_create_child(None, "start", 0, 0).unwrap();
    let portrait = Portrait {
        expression: "smile".into(),
    };
    let mut payload = checkpoint("start", 2);
    payload.capture_from([&portrait as &dyn Restorable]);
    let reference = store.save_checkpoint(node.offset, &payload).unwrap();

    let mut pixels = vec![7u8; 2 * 2 * 4];
    pixels.extend_from_slice(&[0, 0, 0, 0]);
    let screenshot = Screenshot {
        width: 2,
        height: 2,
        rgba: pixels,
    };
    store
        .save_bookmark(
            3,
            &Bookmark::new(node.offset, reference, payload)
                .with_screenshot(screenshot)
                .with_description("Before the bridge"),
        )
        .unwrap();
    store.close().unwrap();

    let mut store = test_store(&dir);
    let bookmark = store.load_bookmark(3).unwrap().unwrap();
    assert_eq!(bookmark.description, "Before the bridge");
    assert_eq!(bookmark.screenshot.as_ref().unwrap().rgba.len(), 16);

    let from_log = store.bookmark_checkpoint(&bookmark).unwrap();
    assert_eq!(from_log, bookmark.checkpoint);

    let mut restored = Portrait {
        expression: String::new(),
    };
    assert!(from_log.restore_into(&mut restored).unwrap());
    assert_eq!(restored.expression, "smile");
}

#[test]
fn test_slot_queries() {
    let dir = TempDir::new().unwrap();
    let mut store = test_store(&dir);

    let node = store.get_or_create_child(None, "start", 0, 0).unwrap();
    let payload = checkpoint("start", 0);
    let reference = store.save_checkpoint(node.offset, &payload).unwrap();
    let bookmark = Bookmark::new(node.offset, reference, payload);

    for id in [0, 1, 2, 5] {
        store.save_bookmark(id, &bookmark).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let slots = store.bookmarks();
    assert_eq!(slots.query_min_unused_id(0, 10), Some(3));
    assert_eq!(slots.query_min_unused_id(6, 10), Some(6));
    assert_eq!(slots.query_max_used_id(0), 5);
    assert_eq!(slots.query_max_used_id(6), 6);
    assert_eq!(slots.query_by_modified_time(0, 10, SlotOrder::Earliest), 0);
    assert_eq!(slots.query_by_modified_time(0, 10, SlotOrder::Latest), 5);
    assert_eq!(slots.query_by_modified_time(6, 10, SlotOrder::Latest), 6);
    store.close().unwrap();

    // Metadata comes back from the directory listing alone.
    let store = test_store(&dir);
    assert_eq!(store.bookmarks().ids(), vec![0, 1, 2, 5]);
    assert_eq!(store.bookmarks().cached_len(), 0);
    assert_eq!(store.eager_load_bookmarks(0, 3).unwrap(), 3);
    assert_eq!(store.bookmarks().cached_len(), 3);
    assert!(store.bookmark(7).unwrap().is_none());
}

#[test]
fn test_script_update_reports_stale_history() {
    let dir = TempDir::new().unwrap();
    let mut store = test_store(&dir);

    let v1 = ContentHash::from_bytes(b"start v1");
    let script = vec![ScriptNode {
        name: "start".into(),
        content_hash: v1,
        dialogues: vec![10, 20, 30],
    }];
    assert!(store.diff_script(&script).is_empty());

    for (i, text) in [10u64, 20, 30].into_iter().enumerate() {
        store
            .set_reached(ReachedDialogueData::new("start", i as u32, text))
            .unwrap();
    }
    store.close().unwrap();

    let mut store = test_store(&dir);
    assert_eq!(store.header().node_hash("start"), Some(v1));

    let v2 = ContentHash::from_bytes(b"start v2");
    let updated = vec![ScriptNode {
        name: "start".into(),
        content_hash: v2,
        dialogues: vec![10, 20, 25, 30],
    }];
    let changes = store.diff_script(&updated);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].valid_prefix, 2);
    assert_eq!(changes[0].stale_indices(), 2..3);

    // The next run sees no change.
    assert!(store.diff_script(&updated).is_empty());
    assert_eq!(store.reached().reached_count("start"), 3);
}

#[test]
fn test_root_offsets_are_absent_until_created() {
    let dir = TempDir::new().unwrap();
    let mut store = test_store(&dir);
    assert!(store.tree().first_root().is_none());
    assert!(store.tree().children(None).unwrap().is_empty());
    assert_eq!(Offset::NONE.0, 0);
}
