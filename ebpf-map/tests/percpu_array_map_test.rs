use ebpf_map::{
    HostPlatform, MAP_TYPE_PERCPU_ARRAY, Map, MapAttr, MapError, MapTypeRegistry, epoch,
};
use std::sync::Arc;

const CPUS: u16 = 4;

fn percpu_array(max_entries: u32) -> (Arc<MapTypeRegistry>, Map) {
    let registry = MapTypeRegistry::new(Arc::new(HostPlatform::new(CPUS)));
    let attr = MapAttr::new(MAP_TYPE_PERCPU_ARRAY, 4, 4, max_entries);
    let map = Map::init(&registry, &attr).unwrap();
    (registry, map)
}

fn k(i: u32) -> [u8; 4] {
    i.to_ne_bytes()
}

fn per_cpu(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4)
        .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn test_update_with_max_plus_one_key() {
    let (_registry, map) = percpu_array(100);
    let guard = epoch::enter();
    let err = map.update_elem(&k(100), &k(100), 0, &guard).unwrap_err();
    assert_eq!(err.errno(), 22);
}

#[test]
fn test_correct_update_and_overwrite() {
    let (_registry, map) = percpu_array(100);
    let guard = epoch::enter();
    map.update_elem(&k(50), &k(100), 0, &guard).unwrap();
    map.update_elem(&k(50), &k(101), 0, &guard).unwrap();
    assert_eq!(map.lookup_elem(&k(50), &guard), Some(&k(101)[..]));
}

#[test]
fn test_fill_every_index() {
    let (_registry, map) = percpu_array(100);
    let guard = epoch::enter();
    for i in 0..100 {
        map.update_elem(&k(i), &k(i), 0, &guard).unwrap();
    }
    assert!(matches!(
        map.update_elem(&k(100), &k(100), 0, &guard),
        Err(MapError::InvalidArgument(_))
    ));
}

#[test]
fn test_trusted_path_touches_local_replica() {
    let (_registry, map) = percpu_array(8);
    let guard = epoch::enter();

    HostPlatform::set_current_cpu(1);
    map.update_elem(&k(3), &k(77), 0, &guard).unwrap();
    assert_eq!(map.lookup_elem(&k(3), &guard), Some(&k(77)[..]));

    HostPlatform::set_current_cpu(2);
    assert_eq!(map.lookup_elem(&k(3), &guard), Some(&k(0)[..]));
    drop(guard);

    let mut all = vec![0u8; map.user_value_size()];
    map.lookup_elem_from_user(&k(3), &mut all).unwrap();
    assert_eq!(per_cpu(&all), vec![0, 77, 0, 0]);
}

#[test]
fn test_user_update_writes_every_replica() {
    let (_registry, map) = percpu_array(8);
    assert_eq!(map.user_value_size(), 4 * CPUS as usize);

    map.update_elem_from_user(&k(5), &k(9), 0).unwrap();
    let mut all = vec![0u8; map.user_value_size()];
    map.lookup_elem_from_user(&k(5), &mut all).unwrap();
    assert_eq!(per_cpu(&all), vec![9; CPUS as usize]);

    let guard = epoch::enter();
    for cpu in 0..CPUS {
        HostPlatform::set_current_cpu(cpu);
        assert_eq!(map.lookup_elem(&k(5), &guard), Some(&k(9)[..]));
    }
}

#[test]
fn test_user_lookup_needs_full_buffer() {
    let (_registry, map) = percpu_array(8);
    let mut one = [0u8; 4];
    assert!(matches!(
        map.lookup_elem_from_user(&k(0), &mut one),
        Err(MapError::InvalidArgument(_))
    ));

    let mut all = vec![0u8; map.user_value_size()];
    assert_eq!(map.lookup_elem_from_user(&k(8), &mut all), Err(MapError::NotFound));
}

#[test]
fn test_delete_unsupported_and_iteration() {
    let (_registry, map) = percpu_array(3);
    assert!(matches!(
        map.delete_elem_from_user(&k(0)),
        Err(MapError::InvalidArgument(_))
    ));

    let mut next = [0u8; 4];
    map.get_next_key_from_user(Some(&k(1)), &mut next).unwrap();
    assert_eq!(next, k(2));
    assert_eq!(
        map.get_next_key_from_user(Some(&k(2)), &mut next),
        Err(MapError::NotFound)
    );
}
