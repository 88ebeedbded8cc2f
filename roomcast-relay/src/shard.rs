//! Deterministic room-to-shard routing.
//!
//! Every process sharing the broker must agree on the shard count and
//! region prefix, otherwise rooms published on one process become
//! unreachable from another. The hash here is the cross-process
//! contract: a rolling multiply-and-add over the room id with explicit
//! 32-bit wraparound, so independently deployed processes always map
//! the same room to the same shard channel.

/// Compute the shard index for a room identifier.
///
/// Pure and deterministic: no I/O, no per-process state. Collisions are
/// expected; rooms sharing a shard are told apart by subscribers, not
/// by the relay. An empty room id hashes to 0 and lands on shard 0.
///
/// `shard_count` must be nonzero; relay paths enforce this through
/// config validation, direct callers through the assertion below.
#[must_use]
pub fn shard_index(room_id: &str, shard_count: u32) -> u32 {
    debug_assert!(shard_count > 0, "shard_count must be nonzero");
    let mut hash: i32 = 0;
    for unit in room_id.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    // unsigned_abs: abs() would overflow on i32::MIN
    hash.unsigned_abs() % shard_count
}

/// Format the broker channel name for a shard index.
#[must_use]
pub fn shard_channel(region_prefix: &str, index: u32) -> String {
    format!("{region_prefix}:signal:shard:{index}")
}

/// The full fixed set of shard channel names for this deployment.
///
/// Computed once at subscribe time; the set never changes for the
/// lifetime of the process.
#[must_use]
pub fn shard_channels(region_prefix: &str, shard_count: u32) -> Vec<String> {
    (0..shard_count)
        .map(|index| shard_channel(region_prefix, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_index_in_range() {
        for n in [1, 2, 8, 13, 64] {
            for room in ["room-42", "a", "call:xyz", "presence/123", ""] {
                assert!(shard_index(room, n) < n, "room {room:?} with {n} shards");
            }
        }
    }

    #[test]
    fn test_shard_index_deterministic() {
        assert_eq!(shard_index("room-42", 8), shard_index("room-42", 8));
        assert_eq!(shard_index("room-42", 13), shard_index("room-42", 13));
    }

    #[test]
    fn test_empty_room_id_maps_to_shard_zero() {
        for n in [1, 4, 8, 100] {
            assert_eq!(shard_index("", n), 0);
        }
    }

    #[test]
    fn test_long_room_id_wraps_without_panic() {
        // Long ids overflow 32 bits many times over; wraparound must be silent
        let room = "r".repeat(10_000);
        assert!(shard_index(&room, 8) < 8);
        assert_eq!(shard_index(&room, 8), shard_index(&room, 8));
    }

    #[test]
    #[should_panic(expected = "shard_count must be nonzero")]
    fn test_zero_shard_count_is_rejected() {
        let _ = shard_index("room-1", 0);
    }

    #[test]
    fn test_single_char_is_code_unit_mod_n() {
        // One iteration: hash = 0 * 31 + code unit
        assert_eq!(shard_index("a", 8), u32::from('a' as u16) % 8);
    }

    #[test]
    fn test_channel_name_format() {
        assert_eq!(shard_channel("us-east-1", 3), "us-east-1:signal:shard:3");
        assert_eq!(shard_channel("test", 0), "test:signal:shard:0");
    }

    #[test]
    fn test_room_42_targets_one_of_eight_test_channels() {
        let channels = shard_channels("test", 8);
        assert_eq!(channels.len(), 8);
        assert_eq!(channels[0], "test:signal:shard:0");
        assert_eq!(channels[7], "test:signal:shard:7");

        let target = shard_channel("test", shard_index("room-42", 8));
        assert!(channels.contains(&target));

        // Two identically configured processes agree on the target
        let other_process = shard_channel("test", shard_index("room-42", 8));
        assert_eq!(target, other_process);
    }
}
