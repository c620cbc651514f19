//! Rough allocation accounting behind `dynamic_memory_usage`.
//!
//! These are estimates of what the allocator hands out for a requested size,
//! not exact figures. They only need to be stable and honest enough that the
//! size limiter reacts to real growth.

use std::mem;

/// Approximate the allocated size for a `alloc`-byte request (16-byte bins).
pub(crate) const fn malloc_usage(alloc: usize) -> usize {
    if alloc == 0 {
        0
    } else {
        ((alloc + 31) >> 4) << 4
    }
}

/// Per-element overhead of a hash set of `T` (element + bucket metadata).
pub(crate) const fn hash_set_entry_usage<T>() -> usize {
    malloc_usage(mem::size_of::<T>() + 2 * mem::size_of::<usize>())
}

/// Approximate usage of a hash map with `len` entries.
pub(crate) const fn hash_map_usage<K, V>(len: usize) -> usize {
    malloc_usage(mem::size_of::<K>() + mem::size_of::<V>() + 3 * mem::size_of::<usize>()) * len
}

/// Approximate usage of a vector with the given capacity.
pub(crate) const fn vec_usage<T>(capacity: usize) -> usize {
    malloc_usage(mem::size_of::<T>() * capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_usage_rounds_up_to_bins() {
        assert_eq!(malloc_usage(0), 0);
        assert_eq!(malloc_usage(1), 32);
        assert_eq!(malloc_usage(32), 48);
        assert_eq!(malloc_usage(33), 64);
    }
}
