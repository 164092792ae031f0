//! Small derived-value helpers shared by the execution store and its mocks.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// `SHA256(rule_id ‖ triggered_at_iso)` — the identity of a single trigger
/// attempt. Two calls with the same `(rule_id, triggered_at)` always collide,
/// which is the whole point: it's what makes `create_or_get` idempotent.
pub fn idempotency_key(rule_id: &str, triggered_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());
    hasher.update(triggered_at.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_collide() {
        let t = Utc::now();
        assert_eq!(idempotency_key("r1", t), idempotency_key("r1", t));
    }

    #[test]
    fn different_rule_diverges() {
        let t = Utc::now();
        assert_ne!(idempotency_key("r1", t), idempotency_key("r2", t));
    }
}
