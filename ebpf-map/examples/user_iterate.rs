//! Walks a per-CPU hash table from the user side.
//!
//! Run with `RUST_LOG=ebpf_map=trace` to see the lifecycle events.

use ebpf_map::{
    HostPlatform, MAP_TYPE_PERCPU_HASHTABLE, Map, MapAttr, MapTypeRegistry, UpdateFlags, epoch,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let registry = MapTypeRegistry::new(Arc::new(HostPlatform::new(4)));
    let map = Map::init(&registry, &MapAttr::new(MAP_TYPE_PERCPU_HASHTABLE, 4, 8, 32))?;

    // Seed every CPU from the user side, then bump a few counters from
    // pretend per-CPU program contexts.
    for port in [22u32, 80, 443] {
        map.update_elem_from_user(&port.to_ne_bytes(), &0u64.to_ne_bytes(), UpdateFlags::Any.into())?;
    }
    for cpu in 0..4u16 {
        HostPlatform::set_current_cpu(cpu);
        let guard = epoch::enter();
        for port in [22u32, 80, 443] {
            let key = port.to_ne_bytes();
            let hits = map
                .lookup_elem(&key, &guard)
                .and_then(|v| v.try_into().ok())
                .map(u64::from_ne_bytes)
                .unwrap_or(0);
            map.update_elem(&key, &(hits + u64::from(cpu) + 1).to_ne_bytes(), 0, &guard)?;
        }
    }

    let mut cursor: Option<[u8; 4]> = None;
    let mut next = [0u8; 4];
    let mut values = vec![0u8; map.user_value_size()];
    while map
        .get_next_key_from_user(cursor.as_ref().map(|c| &c[..]), &mut next)
        .is_ok()
    {
        map.lookup_elem_from_user(&next, &mut values)?;
        let per_cpu: Vec<u64> = values
            .chunks_exact(8)
            .filter_map(|c| c.try_into().ok().map(u64::from_ne_bytes))
            .collect();
        println!("port {:>5}: {:?}", u32::from_ne_bytes(next), per_cpu);
        cursor = Some(next);
    }

    map.deinit(None);
    registry.deinit()?;
    Ok(())
}
