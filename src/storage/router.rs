use xxhash_rust::xxh32::xxh32;

/// Map a key to the shard that owns it.
///
/// xxh32 over the UTF-8 bytes is deterministic for the process lifetime and
/// spreads string keys evenly, so every key lives on exactly one shard from
/// first write to eviction.
pub fn shard_index(key: &str, shards: usize) -> usize {
    xxh32(key.as_bytes(), 0) as usize % shards
}
