use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Unambiguous characters for referral code suffixes (no 0/O, 1/I).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_SUFFIX_LEN: usize = 4;
const CODE_PREFIX_LEN: usize = 3;

/// Produces a candidate referral code from the owner's name.
pub type CodeGenerator = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub fn random_code_generator() -> CodeGenerator {
    Arc::new(|name| referral_code_candidate(name, &mut rand::thread_rng()))
}

/// First three letters of the name, upper-cased and padded with `X`.
pub fn referral_code_prefix(name: &str) -> String {
    let mut prefix: String = name
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .take(CODE_PREFIX_LEN)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    while prefix.len() < CODE_PREFIX_LEN {
        prefix.push('X');
    }

    prefix
}

pub fn referral_code_candidate<R: Rng + ?Sized>(name: &str, rng: &mut R) -> String {
    let mut code = referral_code_prefix(name);
    for _ in 0..CODE_SUFFIX_LEN {
        let idx = rng.gen_range(0..CODE_ALPHABET.len());
        code.push(CODE_ALPHABET[idx] as char);
    }

    code
}

/// Human-readable order id: creation millis plus a random suffix.
pub fn order_id<R: Rng + ?Sized>(now: DateTime<Utc>, rng: &mut R) -> String {
    format!("ORD-{}-{:04}", now.timestamp_millis(), rng.gen_range(0..10_000))
}

/// Next value for an `updated_at` style field: never moves backwards and
/// always moves forward by at least a microsecond.
pub fn advance(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn prefix_uses_letters_only_and_pads_short_names() {
        assert_eq!(referral_code_prefix("ravi kumar"), "RAV");
        assert_eq!(referral_code_prefix("Jo"), "JOX");
        assert_eq!(referral_code_prefix("  4 "), "XXX");
    }

    #[test]
    fn candidates_have_prefix_and_four_char_suffix() {
        let mut rng = StdRng::seed_from_u64(7);
        let code = referral_code_candidate("Asha", &mut rng);

        assert_eq!(code.len(), 7);
        assert!(code.starts_with("ASH"));
        assert!(code[3..].bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn order_ids_embed_the_timestamp() {
        let mut rng = StdRng::seed_from_u64(1);
        let now = Utc::now();
        let id = order_id(now, &mut rng);
        assert!(id.starts_with(&format!("ORD-{}-", now.timestamp_millis())));
    }

    #[test]
    fn advance_is_strictly_monotonic() {
        let now = Utc::now();
        assert!(advance(now, now) > now);
        assert!(advance(now, now - Duration::seconds(3)) > now);
        let later = now + Duration::seconds(3);
        assert_eq!(advance(now, later), later);
    }
}
