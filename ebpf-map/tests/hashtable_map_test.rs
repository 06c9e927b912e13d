use ebpf_map::{
    HostPlatform, MAP_TYPE_HASHTABLE, Map, MapAttr, MapError, MapTypeRegistry, UpdateFlags, epoch,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn hashtable(key_size: u32, value_size: u32, max_entries: u32) -> (Arc<MapTypeRegistry>, Map) {
    let registry = MapTypeRegistry::new(Arc::new(HostPlatform::new(1)));
    let attr = MapAttr::new(MAP_TYPE_HASHTABLE, key_size, value_size, max_entries);
    let map = Map::init(&registry, &attr).unwrap();
    (registry, map)
}

fn k(i: u32) -> [u8; 4] {
    i.to_ne_bytes()
}

fn collect_keys(map: &Map) -> Vec<u32> {
    let mut keys = Vec::new();
    let mut next = [0u8; 4];
    let mut cursor: Option<[u8; 4]> = None;
    while map
        .get_next_key_from_user(cursor.as_ref().map(|c| &c[..]), &mut next)
        .is_ok()
    {
        keys.push(u32::from_ne_bytes(next));
        cursor = Some(next);
    }
    keys
}

#[test]
fn test_insert_until_full() {
    let (_registry, map) = hashtable(4, 4, 100);
    for i in 0..100 {
        map.update_elem_from_user(&k(i), &k(i), UpdateFlags::Any.into())
            .unwrap();
    }
    let err = map
        .update_elem_from_user(&k(100), &k(100), UpdateFlags::Any.into())
        .unwrap_err();
    assert_eq!(err, MapError::Busy);
    assert_eq!(err.errno(), 16);

    // Overwriting an existing key is still allowed when full.
    map.update_elem_from_user(&k(5), &k(55), UpdateFlags::Exist.into())
        .unwrap();
}

#[test]
fn test_delete_makes_room() {
    let (_registry, map) = hashtable(4, 4, 2);
    map.update_elem_from_user(&k(1), &k(1), 0).unwrap();
    map.update_elem_from_user(&k(2), &k(2), 0).unwrap();
    assert_eq!(map.update_elem_from_user(&k(3), &k(3), 0), Err(MapError::Busy));

    map.delete_elem_from_user(&k(1)).unwrap();
    map.update_elem_from_user(&k(3), &k(3), 0).unwrap();

    let mut out = [0u8; 4];
    assert_eq!(map.lookup_elem_from_user(&k(1), &mut out), Err(MapError::NotFound));
    map.lookup_elem_from_user(&k(3), &mut out).unwrap();
    assert_eq!(out, k(3));
}

#[test]
fn test_update_flag_semantics() {
    let (_registry, map) = hashtable(4, 4, 8);
    assert_eq!(
        map.update_elem_from_user(&k(50), &k(100), UpdateFlags::Exist.into()),
        Err(MapError::NotFound)
    );
    map.update_elem_from_user(&k(50), &k(100), UpdateFlags::NoExist.into())
        .unwrap();
    assert_eq!(
        map.update_elem_from_user(&k(50), &k(100), UpdateFlags::NoExist.into()),
        Err(MapError::AlreadyExists)
    );
    map.update_elem_from_user(&k(50), &k(101), UpdateFlags::Exist.into())
        .unwrap();

    let guard = epoch::enter();
    assert_eq!(map.lookup_elem(&k(50), &guard), Some(&k(101)[..]));
}

#[test]
fn test_delete_missing() {
    let (_registry, map) = hashtable(4, 4, 8);
    assert_eq!(map.delete_elem_from_user(&k(1)), Err(MapError::NotFound));
    let guard = epoch::enter();
    assert_eq!(map.delete_elem(&k(1), &guard), Err(MapError::NotFound));
}

#[test]
fn test_empty_iteration() {
    let (_registry, map) = hashtable(4, 4, 8);
    let mut next = [0u8; 4];
    assert_eq!(map.get_next_key_from_user(None, &mut next), Err(MapError::NotFound));
}

#[test]
fn test_get_first_key() {
    let (_registry, map) = hashtable(4, 4, 8);
    map.update_elem_from_user(&k(100), &k(200), 0).unwrap();
    let mut next = [0u8; 4];
    map.get_next_key_from_user(None, &mut next).unwrap();
    assert_eq!(next, k(100));
}

#[test]
fn test_drain_by_first_key() {
    let (_registry, map) = hashtable(4, 4, 40);
    for i in 0..40 {
        map.update_elem_from_user(&k(i), &k(i), 0).unwrap();
    }

    let mut removed = 0;
    let mut next = [0u8; 4];
    while map.get_next_key_from_user(None, &mut next).is_ok() {
        map.delete_elem_from_user(&next).unwrap();
        removed += 1;
    }
    assert_eq!(removed, 40);
}

#[test]
fn test_wide_keys() {
    let (_registry, map) = hashtable(16, 2, 8);
    let a = *b"0123456789abcdef";
    let b = *b"0123456789abcdeg";
    map.update_elem_from_user(&a, &[1, 1], 0).unwrap();
    map.update_elem_from_user(&b, &[2, 2], 0).unwrap();

    let guard = epoch::enter();
    assert_eq!(map.lookup_elem(&a, &guard), Some(&[1u8, 1][..]));
    assert_eq!(map.lookup_elem(&b, &guard), Some(&[2u8, 2][..]));
}

#[test]
fn test_trusted_view_survives_delete() {
    let (_registry, map) = hashtable(4, 4, 8);
    map.update_elem_from_user(&k(9), &k(90), 0).unwrap();

    let guard = epoch::enter();
    let view = map.lookup_elem(&k(9), &guard).unwrap();
    map.delete_elem(&k(9), &guard).unwrap();
    assert_eq!(view, &k(90)[..]);
    assert_eq!(map.lookup_elem(&k(9), &guard), None);
}

proptest! {
    /// Iteration visits every live key exactly once.
    #[test]
    fn prop_iteration_is_complete(keys in proptest::collection::hash_set(any::<u32>(), 0..64)) {
        let (_registry, map) = hashtable(4, 4, 64);
        for key in &keys {
            map.update_elem_from_user(&k(*key), &k(*key), 0).unwrap();
        }

        let seen = collect_keys(&map);
        let unique: HashSet<u32> = seen.iter().copied().collect();
        prop_assert_eq!(seen.len(), keys.len());
        prop_assert_eq!(unique, keys);
    }

    /// A table sized to the key set accepts every key, then only overwrites.
    #[test]
    fn prop_capacity_matches_key_set(keys in proptest::collection::btree_set(0u32..1_000_000, 1..80)) {
        let (_registry, map) = hashtable(4, 4, keys.len() as u32);
        for key in &keys {
            map.update_elem_from_user(&k(*key), &k(1), 0).unwrap();
        }

        let outsider = keys.iter().next_back().copied().unwrap_or(0) + 1;
        prop_assert_eq!(map.update_elem_from_user(&k(outsider), &k(1), 0), Err(MapError::Busy));
        for key in &keys {
            prop_assert!(map.update_elem_from_user(&k(*key), &k(2), 0).is_ok());
        }
    }

    /// Deleting a subset leaves exactly the complement visible.
    #[test]
    fn prop_delete_subset(keys in proptest::collection::hash_set(any::<u32>(), 1..48), stride in 1usize..4) {
        let (_registry, map) = hashtable(4, 4, 48);
        for key in &keys {
            map.update_elem_from_user(&k(*key), &k(key.wrapping_mul(3)), 0).unwrap();
        }

        let mut expected = HashSet::new();
        for (i, key) in keys.iter().enumerate() {
            if i % stride == 0 {
                map.delete_elem_from_user(&k(*key)).unwrap();
            } else {
                expected.insert(*key);
            }
        }

        let seen: HashSet<u32> = collect_keys(&map).into_iter().collect();
        prop_assert_eq!(&seen, &expected);

        let mut out = [0u8; 4];
        for key in &expected {
            map.lookup_elem_from_user(&k(*key), &mut out).unwrap();
            prop_assert_eq!(out, k(key.wrapping_mul(3)));
        }
    }
}
