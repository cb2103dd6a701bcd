//! Session code generation.
//!
//! Codes are read over voice chat and typed on a couch, so the alphabet
//! drops the lookalike characters (no `0`/`O`, no `1`/`I`). 32 symbols ×
//! 6 positions ≈ one billion codes; uniqueness is still enforced by the
//! signaling server, not assumed here.

use rand::Rng;

/// The unambiguous code alphabet.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of every session code.
pub const CODE_LENGTH: usize = 6;

/// Generates a fresh session code from the OS random source.
pub fn generate_session_code() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Whether `code` could have been produced by [`generate_session_code`].
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_codes_are_six_chars_from_the_alphabet() {
        for _ in 0..100 {
            let code = generate_session_code();
            assert!(is_valid_code(&code), "invalid code generated: {code}");
        }
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_characters() {
        for forbidden in [b'0', b'O', b'1', b'I'] {
            assert!(!CODE_ALPHABET.contains(&forbidden));
        }
        assert_eq!(CODE_ALPHABET.len(), 32);
    }

    #[test]
    fn test_codes_vary_between_calls() {
        // 32^6 codes; 10 consecutive identical draws means a broken RNG.
        let first = generate_session_code();
        let all_same = (0..10).all(|_| generate_session_code() == first);
        assert!(!all_same);
    }

    #[test]
    fn test_is_valid_code_rejects_wrong_shapes() {
        assert!(!is_valid_code("ABC12"));
        assert!(!is_valid_code("ABC1234"));
        assert!(!is_valid_code("ABC10O"));
        assert!(!is_valid_code("abc234"));
        assert!(is_valid_code("ABCDEF"));
    }
}
