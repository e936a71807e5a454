//! Randomized checks of container and page cache behaviour

use clustore::config::{CacheCapacity, PageCacheConfig};
use clustore::object::{BytesSerializer, ItemOperation, ObjectContainer, U64Serializer};
use clustore::paging::MemoryPagedList;
use clustore::storage::{ClusteredStreams, MemoryBackend, StreamsOptions};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Item(Option<Vec<u8>>),
    Reaped,
}

#[derive(Debug, Clone)]
enum Op {
    Add(Option<Vec<u8>>),
    Insert(usize, Option<Vec<u8>>),
    Update(usize, Option<Vec<u8>>),
    Remove(usize),
    Reap(usize),
}

fn item() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::of(prop::collection::vec(any::<u8>(), 0..80))
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => item().prop_map(Op::Add),
        1 => (any::<usize>(), item()).prop_map(|(i, v)| Op::Insert(i, v)),
        1 => (any::<usize>(), item()).prop_map(|(i, v)| Op::Update(i, v)),
        1 => any::<usize>().prop_map(Op::Remove),
        1 => any::<usize>().prop_map(Op::Reap),
    ]
}

fn container(cluster_size: u32, reserved: u32) -> ObjectContainer<Vec<u8>> {
    let streams = ClusteredStreams::create(
        Arc::new(MemoryBackend::new()),
        &StreamsOptions {
            cluster_size,
            reserved_streams: reserved,
        },
    )
    .expect("create store");
    ObjectContainer::new(Arc::new(streams), BytesSerializer)
}

fn apply(container: &ObjectContainer<Vec<u8>>, model: &mut Vec<Slot>, op: &Op) {
    let len = model.len();
    match op {
        Op::Add(value) => {
            container
                .save_item(len as u64, value.as_ref(), ItemOperation::Add)
                .expect("add");
            model.push(Slot::Item(value.clone()));
        }
        Op::Insert(at, value) => {
            let at = at % (len + 1);
            container
                .save_item(at as u64, value.as_ref(), ItemOperation::Insert)
                .expect("insert");
            model.insert(at, Slot::Item(value.clone()));
        }
        Op::Update(at, value) if len > 0 => {
            let at = at % len;
            container
                .save_item(at as u64, value.as_ref(), ItemOperation::Update)
                .expect("update");
            model[at] = Slot::Item(value.clone());
        }
        Op::Remove(at) if len > 0 => {
            let at = at % len;
            container.remove_item(at as u64).expect("remove");
            model.remove(at);
        }
        Op::Reap(at) if len > 0 => {
            let at = at % len;
            container.reap_item(at as u64).expect("reap");
            model[at] = Slot::Reaped;
        }
        _ => {}
    }
}

fn check(container: &ObjectContainer<Vec<u8>>, model: &[Slot]) {
    let streams = container.streams();
    assert_eq!(container.count(), model.len() as u64);
    assert_eq!(streams.count(), streams.reserved_streams() + model.len() as u64);

    for (index, slot) in model.iter().enumerate() {
        let index = index as u64;
        let loaded = container.load_item(index).expect("load");
        match slot {
            Slot::Reaped => {
                assert!(container.is_reaped(index).expect("is_reaped"));
                assert_eq!(loaded, None);
            }
            Slot::Item(value) => {
                assert!(!container.is_reaped(index).expect("is_reaped"));
                assert_eq!(container.is_null(index).expect("is_null"), value.is_none());
                assert_eq!(&loaded, value);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_container_matches_model(
        cluster_size in prop::sample::select(vec![16u32, 24, 64, 256]),
        reserved in 0u32..3,
        ops in prop::collection::vec(op(), 1..40),
    ) {
        let container = container(cluster_size, reserved);
        let mut model = Vec::new();
        for op in &ops {
            apply(&container, &mut model, op);
        }
        check(&container, &model);
        prop_assert!(container.streams().verify().expect("verify").is_consistent());
    }

    #[test]
    fn prop_null_and_empty_stay_distinct(cluster_size in 16u32..128) {
        let container = container(cluster_size, 0);
        container.save_item(0, None, ItemOperation::Add).expect("add null");
        container.save_item(1, Some(&Vec::new()), ItemOperation::Add).expect("add empty");

        prop_assert_eq!(container.load_item(0).expect("load"), None);
        prop_assert_eq!(container.load_item(1).expect("load"), Some(Vec::new()));
        prop_assert!(container.is_null(0).expect("is_null"));
        prop_assert!(!container.is_null(1).expect("is_null"));
    }

    #[test]
    fn prop_reap_keeps_other_indices(values in prop::collection::vec(any::<u64>(), 2..20), pick in any::<usize>()) {
        let container = container(32, 0);
        for (i, v) in values.iter().enumerate() {
            let bytes = v.to_le_bytes().to_vec();
            container.save_item(i as u64, Some(&bytes), ItemOperation::Add).expect("add");
        }
        let reaped = pick % values.len();
        container.reap_item(reaped as u64).expect("reap");

        prop_assert_eq!(container.count(), values.len() as u64);
        for (i, v) in values.iter().enumerate() {
            let loaded = container.load_item(i as u64).expect("load");
            if i == reaped {
                prop_assert_eq!(loaded, None);
            } else {
                prop_assert_eq!(loaded, Some(v.to_le_bytes().to_vec()));
            }
        }
    }

    #[test]
    fn prop_remove_shifts_later_indices(values in prop::collection::vec(any::<u64>(), 1..20), pick in any::<usize>()) {
        let container = container(48, 1);
        for (i, v) in values.iter().enumerate() {
            let bytes = v.to_le_bytes().to_vec();
            container.save_item(i as u64, Some(&bytes), ItemOperation::Add).expect("add");
        }
        let removed = pick % values.len();
        container.remove_item(removed as u64).expect("remove");

        let mut expected = values.clone();
        expected.remove(removed);
        prop_assert_eq!(container.count(), expected.len() as u64);
        for (i, v) in expected.iter().enumerate() {
            prop_assert_eq!(container.load_item(i as u64).expect("load"), Some(v.to_le_bytes().to_vec()));
        }
    }

    #[test]
    fn prop_paged_list_reads_last_write(
        page_size in 8usize..64,
        pages in 1usize..4,
        writes in prop::collection::vec((any::<usize>(), any::<u64>()), 0..60),
    ) {
        let config = PageCacheConfig {
            page_size,
            capacity: CacheCapacity::Pages(pages),
        };
        let mut list: MemoryPagedList<u64> = MemoryPagedList::in_memory(Arc::new(U64Serializer), &config);
        let mut model: Vec<u64> = (0..50).collect();
        for &v in &model {
            list.push(v).expect("push");
        }
        for (at, value) in writes {
            let at = at % model.len();
            list.set(at as u64, value).expect("set");
            model[at] = value;
            prop_assert!(list.cache().loaded_pages() <= pages);
        }
        prop_assert_eq!(list.to_vec().expect("to_vec"), model);
    }
}
