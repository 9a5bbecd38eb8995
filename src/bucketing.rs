//! User bucketing: a deterministic SHA-1-based hash of `(key, salt,
//! attribute, secondary, seed)` into `[0, 1)`.
//!
//! The divisor and hex-truncation scheme are part of the cross-SDK wire
//! contract: every implementation must use `1152921504606846975.0`, not the
//! `0xFFFFFFFFFFFFFFF` integer variant some older ports carry.

use crate::user::{valid_attribute_value, User};
use hex::ToHex;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;

const LONG_SCALE: f64 = 1152921504606846975.0;

/// Default bucketing attribute when a rollout or segment rule does not
/// specify `bucketBy`.
pub const DEFAULT_BUCKET_ATTRIBUTE: &str = "key";

/// Computes the bucket value for `user` under `key`/`salt`, optionally
/// using `seed` instead of the key/salt framing, and `attribute` instead of
/// the default `"key"`.
///
/// Returns `None` when the attribute is missing or not bucketable (not text
/// or number) — callers must treat that as "the user falls in no bucket".
pub fn bucket(user: &User, key: &str, attribute: &str, salt: &str, seed: Option<i64>) -> Option<f64> {
    let value = user.value_of(attribute)?;
    let bucketable = bucketable_string(&value)?;

    let mut raw = String::with_capacity(64);
    if let Some(seed) = seed {
        let _ = write!(raw, "{}.{}", seed, bucketable);
    } else {
        let _ = write!(raw, "{}.{}.{}", key, salt, bucketable);
    }
    if let Some(secondary) = user.secondary.as_deref() {
        let _ = write!(raw, ".{}", secondary);
    }

    let digest = Sha1::new().chain(raw.as_bytes()).finalize();
    let hex: String = digest.encode_hex();
    let truncated = &hex[..15];
    let numerator = u64::from_str_radix(truncated, 16).ok()? as f64;
    Some(numerator / LONG_SCALE)
}

fn bucketable_string(value: &serde_json::Value) -> Option<String> {
    if !valid_attribute_value(value) {
        return None;
    }
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => n.as_f64().map(|f| format!("{:.6}", f)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::User;

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Bucketing is a pure function of its inputs: the same
            /// key/salt/attribute/seed always lands on the same value, and
            /// that value is always inside the documented `[0, 1)` range.
            #[test]
            fn bucket_is_deterministic_and_in_unit_range(
                user_key in "[a-zA-Z0-9_-]{1,20}",
                flag_key in "[a-zA-Z0-9_-]{1,20}",
                salt in "[a-zA-Z0-9_-]{0,20}",
                seed in proptest::option::of(0i64..1_000_000),
            ) {
                let user = User::new(user_key);
                let first = bucket(&user, &flag_key, DEFAULT_BUCKET_ATTRIBUTE, &salt, seed);
                let second = bucket(&user, &flag_key, DEFAULT_BUCKET_ATTRIBUTE, &salt, seed);
                prop_assert_eq!(first, second);
                if let Some(value) = first {
                    prop_assert!((0.0..1.0).contains(&value));
                }
            }
        }
    }

    #[test]
    fn vector_user_a() {
        let user = User::new("userKeyA");
        let b = bucket(&user, "hashKey", "key", "saltyA", None).unwrap();
        assert!((0.42..0.43).contains(&b), "bucket was {}", b);
    }

    #[test]
    fn vector_user_b() {
        let user = User::new("userKeyB");
        let b = bucket(&user, "hashKey", "key", "saltyA", None).unwrap();
        assert!((0.55..0.56).contains(&b), "bucket was {}", b);
    }

    #[test]
    fn missing_attribute_is_none() {
        let user = User::new("userKeyA");
        assert!(bucket(&user, "hashKey", "does-not-exist", "saltyA", None).is_none());
    }

    #[test]
    fn deterministic_across_calls() {
        let user = User::new("userKeyA");
        let a = bucket(&user, "hashKey", "key", "saltyA", None);
        let b = bucket(&user, "hashKey", "key", "saltyA", None);
        assert_eq!(a, b);
    }

    #[test]
    fn seed_changes_result() {
        let user = User::new("userKeyA");
        let unseeded = bucket(&user, "hashKey", "key", "saltyA", None).unwrap();
        let seeded = bucket(&user, "hashKey", "key", "saltyA", Some(42)).unwrap();
        assert_ne!(unseeded, seeded);
    }
}
