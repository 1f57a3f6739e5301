use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of the hash part of generated ids, in hex characters.
const ID_HASH_LEN: usize = 16;

/// Clamps a requested priority into the range AMQP priority queues accept.
///
/// Negative values become 0 and anything above 255 becomes 255.
pub fn normalize_priority(priority: i64) -> u8 {
    priority.clamp(0, u8::MAX.into()) as u8
}

/// Generates `prefix` followed by a short hash of `seed`, the current time
/// and a random salt.
///
/// Ids are unpredictable and collisions are practically impossible, they are
/// not meant to be cryptographically unique.
pub fn generate_id(prefix: &str, seed: &[u8]) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);

    let digest = Sha256::new()
        .chain_update(seed)
        .chain_update(nanos.to_le_bytes())
        .chain_update(salt)
        .finalize();

    let mut hash = hex::encode(digest);
    hash.truncate(ID_HASH_LEN);
    format!("{prefix}{hash}")
}

/// Whether `id` looks like something [`generate_id`] produced with `prefix`.
pub(crate) fn is_generated_id(prefix: &str, id: &str) -> bool {
    id.strip_prefix(prefix)
        .is_some_and(|hash| !hash.is_empty() && hash.len() <= 64 && hash.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Cuts `text` down to at most `max_bytes`, on a character boundary.
pub(crate) fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn priority_edges() {
        assert_eq!(normalize_priority(-1), 0);
        assert_eq!(normalize_priority(0), 0);
        assert_eq!(normalize_priority(200), 200);
        assert_eq!(normalize_priority(255), 255);
        assert_eq!(normalize_priority(256), 255);
        assert_eq!(normalize_priority(i64::MIN), 0);
    }

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let a = generate_id("job-", b"payload");
        let b = generate_id("job-", b"payload");
        assert_ne!(a, b);
        assert!(a.starts_with("job-"));
        assert_eq!(a.len(), "job-".len() + ID_HASH_LEN);
        assert!(is_generated_id("job-", &a));
        assert!(!is_generated_id("failed-job-", &a));
        assert!(!is_generated_id("job-", "job-"));
        assert!(!is_generated_id("job-", "job-xyz"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_utf8("short", 10), "short");
        assert_eq!(truncate_utf8("abcdef", 3), "abc");
        // 'é' is two bytes, cutting through it backs off
        assert_eq!(truncate_utf8("aé", 2), "a");
    }

    proptest! {
        #[test]
        fn priority_is_clamped(p in any::<i64>()) {
            prop_assert_eq!(i64::from(normalize_priority(p)), p.clamp(0, 255));
        }
    }
}
