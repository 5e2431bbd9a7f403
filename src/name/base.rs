//! Filesystem-safe base encodings for ciphertext names.
//!
//! Encoded names must survive any POSIX filesystem, so the base64 alphabet
//! avoids `/` (and `.`-leading outputs); the base32 variant serves
//! case-insensitive filesystems. Bits are packed least-significant-first and
//! no padding characters are emitted, keeping encoded names as short as the
//! radix allows.

use std::sync::LazyLock;

use data_encoding::{BitOrder, Encoding, Specification};

/// 64-symbol alphabet: `,`, `-`, digits, upper case, lower case.
pub static NAME_B64: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols
        .push_str(",-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz");
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.encoding().expect("static base64 specification")
});

/// 32-symbol alphabet for case-insensitive filesystems.
pub static NAME_B32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.encoding().expect("static base32 specification")
});

/// Encoded length of `n` raw bytes in the base64 alphabet.
pub fn b64_len(n: usize) -> usize {
    (n * 8).div_ceil(6)
}

/// Encoded length of `n` raw bytes in the base32 alphabet.
pub fn b32_len(n: usize) -> usize {
    (n * 8).div_ceil(5)
}

/// Raw bytes recoverable from `n` base64 symbols.
pub fn b64_raw_len(n: usize) -> usize {
    n * 6 / 8
}

/// Raw bytes recoverable from `n` base32 symbols.
pub fn b32_raw_len(n: usize) -> usize {
    n * 5 / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b64_round_trip() {
        for len in 0..40usize {
            let raw: Vec<u8> = (0..len).map(|i| (i * 13 + 7) as u8).collect();
            let enc = NAME_B64.encode(&raw);
            assert_eq!(enc.len(), b64_len(len));
            assert!(!enc.contains('/'));
            assert_eq!(NAME_B64.decode(enc.as_bytes()).unwrap(), raw);
        }
    }

    #[test]
    fn b32_round_trip() {
        for len in 0..40usize {
            let raw: Vec<u8> = (0..len).map(|i| (i * 31 + 3) as u8).collect();
            let enc = NAME_B32.encode(&raw);
            assert_eq!(enc.len(), b32_len(len));
            assert_eq!(NAME_B32.decode(enc.as_bytes()).unwrap(), raw);
        }
    }

    #[test]
    fn b32_is_case_insensitive_alphabet_only() {
        let raw = b"case test";
        let enc = NAME_B32.encode(raw);
        assert!(enc
            .chars()
            .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
    }

    #[test]
    fn length_helpers_are_inverses() {
        for n in 0..64 {
            assert_eq!(b64_raw_len(b64_len(n)), n);
            assert_eq!(b32_raw_len(b32_len(n)), n);
        }
    }

    #[test]
    fn invalid_symbols_rejected() {
        assert!(NAME_B64.decode(b"abc/def").is_err());
        assert!(NAME_B32.decode(b"lowercase").is_err());
    }
}
