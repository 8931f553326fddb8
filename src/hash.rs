use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub fn stable_hash_with(f: impl FnOnce(&mut DefaultHasher)) -> u64 {
    let mut hasher = DefaultHasher::new();
    f(&mut hasher);
    hasher.finish()
}

/// Seed for the per-row draws that populate `table`.
pub fn table_draw_seed(seed: u64, table: &str) -> u64 {
    stable_hash_with(|hasher| {
        seed.hash(hasher);
        table.hash(hasher);
    })
}
