//! Capacity conversions between the orchestration layer (bytes) and the
//! array (KiB).

pub const KIB: u64 = 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// The K2 recommended minimum volume size, 1 GiB in bytes.
pub fn allocation_unit() -> u64 {
    GIB
}

/// Converts a byte count to KiB, rounding up so the array never
/// allocates less than the orchestration layer asked for.
pub fn bytes_to_kib(size: u64) -> u64 {
    size.div_ceil(KIB)
}

/// Converts an array KiB count back to bytes.
pub fn kib_to_bytes(size: u64) -> u64 {
    size * KIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_at_kib_granularity() {
        for kib in [0u64, 1, 7, 1024, 1048576, u32::MAX as u64] {
            assert_eq!(bytes_to_kib(kib_to_bytes(kib)), kib);
        }
    }

    #[test]
    fn test_bytes_round_up() {
        assert_eq!(bytes_to_kib(1), 1);
        assert_eq!(bytes_to_kib(1023), 1);
        assert_eq!(bytes_to_kib(1025), 2);
        assert_eq!(bytes_to_kib(0), 0);
    }

    #[test]
    fn test_allocation_unit_is_one_gib() {
        assert_eq!(allocation_unit(), 1073741824);
        assert_eq!(kib_to_bytes(bytes_to_kib(allocation_unit())), 1073741824);
    }
}
