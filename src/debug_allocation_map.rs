//! This module tracks the liveness of allocated addresses in debug
//! builds.  It backs the entry layer's contracts: an address must
//! never be handed out twice without an intervening release, and only
//! live addresses may be released.
use std::collections::HashMap;
use std::sync::Mutex;

struct AllocationInfo {
    live: bool, // True if owned by the mutator
}

lazy_static::lazy_static! {
    static ref ALLOCATION_STATE_MAP: Mutex<HashMap<usize, AllocationInfo>> = Default::default();
}

/// Marks this address as returned to the mutator.
pub fn mark_allocated(address: usize) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map.entry(address).or_insert(AllocationInfo { live: false });

    if info.live {
        return Err("double allocation");
    }

    info.live = true;
    Ok(())
}

/// Marks this address as released by the mutator.
pub fn mark_released(address: usize) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map.get_mut(&address).ok_or("released unknown address")?;

    if !info.live {
        return Err("double free");
    }

    info.live = false;
    Ok(())
}
