use ruint::aliases::U256;

/// Exponent applied to the difficulty when deriving the target.
pub const TARGET_EXPONENT: u64 = 10;

/// target = (2^256 - 1) / (difficulty^TARGET_EXPONENT + 1)
///
/// A hash is a valid proof-of-work when, read as a big-endian integer, it is
/// strictly below the target. Higher difficulty => lower target => harder.
pub fn calculate_target(difficulty: u32) -> U256 {
    let denominator = U256::from(difficulty)
        .saturating_pow(U256::from(TARGET_EXPONENT))
        .saturating_add(U256::from(1u64));
    U256::MAX / denominator
}

/// Interpret a hex digest as a big-endian 256-bit integer.
/// Malformed digests map to `U256::MAX`, which never meets any target.
pub fn hash_to_u256(hash_hex: &str) -> U256 {
    let mut bytes = [0u8; 32];
    match hex::decode_to_slice(hash_hex, &mut bytes) {
        Ok(()) => U256::from_be_bytes(bytes),
        Err(_) => U256::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_one_halves_the_hash_space() {
        assert_eq!(calculate_target(1), U256::MAX / U256::from(2u64));
    }

    #[test]
    fn higher_difficulty_lowers_target() {
        assert!(calculate_target(3) < calculate_target(2));
        assert!(calculate_target(2) < calculate_target(1));
    }

    #[test]
    fn huge_difficulty_does_not_overflow() {
        let t = calculate_target(u32::MAX);
        assert!(t < calculate_target(1_000));
    }

    #[test]
    fn hash_parsing() {
        let zero = "0".repeat(64);
        assert_eq!(hash_to_u256(&zero), U256::ZERO);
        let max = "f".repeat(64);
        assert_eq!(hash_to_u256(&max), U256::MAX);
        assert_eq!(hash_to_u256("not-hex"), U256::MAX);

        let mut one = "0".repeat(63);
        one.push('1');
        assert_eq!(hash_to_u256(&one), U256::from(1u64));
    }
}
