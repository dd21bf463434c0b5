//! Message ID generation.
//!
//! Every message gets a globally unique identifier that embeds its origin
//! server, so IDs never collide across replicas and a log line alone tells
//! you where a message was born.
//!
//! Format: `{origin}-{timestamp_hex}{random_hex}`, with 16 hex chars of
//! microseconds since epoch plus 8 hex chars of randomness.

use rand::Rng;

use crate::proto::now_micros;

/// Generate a new message ID for a message originating on `origin`.
pub fn generate(origin: &str) -> String {
    let mut rng = rand::thread_rng();
    let tail: u32 = rng.r#gen();
    format!("{origin}-{:016x}{tail:08x}", now_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = generate("s1");
        let b = generate("s1");
        assert_ne!(a, b);
    }

    #[test]
    fn ids_carry_origin_prefix() {
        let id = generate("alpha");
        assert!(id.starts_with("alpha-"));
        let hex = &id["alpha-".len()..];
        assert_eq!(hex.len(), 24);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_sort_chronologically_per_origin() {
        let a = generate("s1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate("s1");
        assert!(a < b, "time-prefixed ids should sort by creation: {a} vs {b}");
    }
}
