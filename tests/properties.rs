//! Property tests over the public save API.

use proptest::prelude::*;
use std::collections::BTreeSet;
use storyline::{
    Bookmark, BookmarkStore, GameStateCheckpoint, Offset, ReachedDialogueData, SaveConfig, SaveId,
    SaveStore, SlotOrder,
};
use tempfile::TempDir;

fn fresh_store(dir: &TempDir) -> SaveStore {
    SaveStore::open_or_create(SaveConfig {
        header_capacity: 4096,
        sync_interval: 10_000,
        ..SaveConfig::new(dir.path())
    })
    .unwrap()
}

fn touch_slots(store: &BookmarkStore, ids: &BTreeSet<u32>) {
    for id in ids {
        std::fs::write(store.slot_path(*id), b"").unwrap();
    }
    store.rescan().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn get_or_create_child_deduplicates(
        visits in prop::collection::vec((0usize..4, 0u64..3), 1..40),
    ) {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        let names = ["start", "forest", "town", "cave"];

        let root = store.get_or_create_child(None, "root", 0, 0).unwrap();
        let mut first_seen = std::collections::HashMap::new();

        for (name, hash) in visits {
            let node = store
                .get_or_create_child(Some(root.offset), names[name], hash, 0)
                .unwrap();
            let offset = *first_seen.entry((name, hash)).or_insert(node.offset);
            prop_assert_eq!(node.offset, offset);
        }

        let children = store.tree().children(Some(root.offset)).unwrap();
        prop_assert_eq!(children.len(), first_seen.len());
    }

    #[test]
    fn set_reached_twice_writes_once(count in 1u32..20, repeat in 0u32..20) {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);

        for i in 0..count {
            prop_assert!(store.set_reached(ReachedDialogueData::new("start", i, i as u64)).unwrap());
        }
        let region = store.stats().reached_region_bytes;

        let again = repeat % count;
        prop_assert!(!store.set_reached(ReachedDialogueData::new("start", again, 0)).unwrap());
        prop_assert_eq!(store.stats().reached_region_bytes, region);
        prop_assert!(store.is_reached_any_history("start", again));
        prop_assert_eq!(store.reached().reached_count("start"), count as usize);
    }

    #[test]
    fn checkpoint_roundtrip(index in 0u32..1000, gold in any::<i64>(), flag in any::<bool>(), label in "[a-z ]{0,24}") {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        store.get_or_create_child(None, "start", 0, 0).unwrap();

        let mut payload = GameStateCheckpoint::new("start", index);
        payload.variables.insert("gold".into(), gold.into());
        payload.variables.insert("flag".into(), flag.into());
        payload.variables.insert("label".into(), label.into());

        let reference = store.append_checkpoint(&payload).unwrap();
        prop_assert_eq!(store.get_checkpoint(reference).unwrap(), payload);
    }

    #[test]
    fn saved_checkpoints_are_immutable(
        saves in prop::collection::vec((0u32..4, 0i64..3), 1..24),
    ) {
        let dir = TempDir::new().unwrap();
        let mut store = fresh_store(&dir);
        let node = store.get_or_create_child(None, "start", 0, 0).unwrap();

        let mut saved: Vec<(Offset, GameStateCheckpoint)> = Vec::new();
        let mut end = store.header().checkpoint_region().end;

        for (index, gold) in saves {
            let mut payload = GameStateCheckpoint::new("start", index);
            payload.variables.insert("gold".into(), gold.into());
            let reference = store.save_checkpoint(node.offset, &payload).unwrap();

            let new_end = store.header().checkpoint_region().end;
            prop_assert!(new_end >= end);
            end = new_end;

            if let Some((_, earlier)) = saved.iter().find(|(r, _)| *r == reference) {
                prop_assert_eq!(earlier, &payload);
            }
            saved.push((reference, payload));
        }

        let (first, payload) = saved[0].clone();
        store
            .save_bookmark(0, &Bookmark::new(node.offset, first, payload.clone()))
            .unwrap();
        let bookmark = store.load_bookmark(0).unwrap().unwrap();
        prop_assert_eq!(store.bookmark_checkpoint(&bookmark).unwrap(), payload);

        for (reference, payload) in saved {
            prop_assert_eq!(store.get_checkpoint(reference).unwrap(), payload);
        }
    }

    #[test]
    fn min_unused_id_is_unused(
        used in prop::collection::btree_set(0u32..50, 0..30),
        begin in 0u32..50,
        span in 0u32..60,
    ) {
        let dir = TempDir::new().unwrap();
        let slots = BookmarkStore::new(dir.path(), "dat", 4).unwrap();
        touch_slots(&slots, &used);

        let end = begin + span;
        match slots.query_min_unused_id(begin, end) {
            Some(id) => {
                prop_assert!(id >= begin && id <= end);
                prop_assert!(!used.contains(&id));
                prop_assert!((begin..id).all(|i| used.contains(&i)));
            }
            None => prop_assert!((begin..=end).all(|i| used.contains(&i))),
        }
        if !used.contains(&begin) {
            prop_assert_eq!(slots.query_min_unused_id(begin, end), Some(begin));
        }
    }

    #[test]
    fn slot_queries_stay_in_range(
        used in prop::collection::btree_set(0u32..50, 0..30),
        begin in 0u32..50,
        span in 0u32..60,
    ) {
        let dir = TempDir::new().unwrap();
        let slots = BookmarkStore::new(dir.path(), "dat", 4).unwrap();
        touch_slots(&slots, &used);

        let end = begin + span;
        let in_range: Vec<u32> = used.range(begin..end).copied().collect();
        for order in [SlotOrder::Earliest, SlotOrder::Latest] {
            let id = slots.query_by_modified_time(begin, end, order);
            if in_range.is_empty() {
                prop_assert_eq!(id, begin);
            } else {
                prop_assert!(in_range.contains(&id));
            }
        }

        let max_used = slots.query_max_used_id(begin);
        prop_assert_eq!(max_used, used.range(begin..).next_back().copied().unwrap_or(begin));

        // Ids without metadata are absent.
        prop_assert!(slots.get(begin + span + 100, SaveId::generate()).unwrap().is_none());
    }
}
