//! Process-wide string intern pool.
//!
//! Constant-table strings and `TYPEOF` names are immutable and may be shared
//! across VM instances on different threads, so one `Arc<str>` per distinct
//! content is enough for the whole process.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

static POOL: Lazy<DashMap<String, Arc<str>>> = Lazy::new(DashMap::new);

pub fn intern(s: &str) -> Arc<str> {
    if let Some(hit) = POOL.get(s) {
        return hit.value().clone();
    }
    let arc: Arc<str> = Arc::from(s);
    POOL.insert(s.to_string(), arc.clone());
    arc
}
