//! Key derivation.
//!
//! Two derivation paths coexist:
//!
//! - PBKDF2-HMAC-SHA1 with a salt and an explicit or auto-tuned iteration
//!   count. Auto-tuning scales the count until one derivation takes roughly
//!   the requested wall-clock time, so stored configurations keep pace with
//!   hardware.
//! - An iterated-digest scheme retained for version-1 volumes, which derives
//!   key and IV material from the password alone with an explicit output
//!   size.

use std::time::{Duration, Instant};

use pbkdf2::pbkdf2_hmac;
use sha1::{Digest, Sha1};
use zeroize::Zeroize;

/// Iteration count used for the first timing probe.
const INITIAL_ITERATIONS: u32 = 1000;

/// Digest rounds applied by the legacy derivation.
pub(crate) const LEGACY_KDF_ROUNDS: u32 = 16;

/// One PBKDF2-HMAC-SHA1 pass with a fixed iteration count.
pub(crate) fn derive(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    pbkdf2_hmac::<Sha1>(password, salt, iterations, out);
}

/// Derive with an auto-tuned iteration count and return the count used.
///
/// Runs PBKDF2 with a growing iteration count until a single derivation
/// lands in roughly `[desired / 6, desired]`. Counts grow fourfold while far
/// off target and proportionally once close, so the loop converges in a few
/// probes. The returned count reproduces the final output deterministically.
pub(crate) fn derive_timed(
    password: &[u8],
    salt: &[u8],
    desired: Duration,
    out: &mut [u8],
) -> u32 {
    let mut iterations = INITIAL_ITERATIONS;
    loop {
        let start = Instant::now();
        pbkdf2_hmac::<Sha1>(password, salt, iterations, out);
        let elapsed = start.elapsed();

        if elapsed < desired / 8 {
            iterations = iterations.saturating_mul(4);
        } else if elapsed < desired * 5 / 6 {
            let scaled =
                (f64::from(iterations) * desired.as_secs_f64() / elapsed.as_secs_f64()) as u32;
            iterations = scaled.max(iterations + 1);
        } else {
            return iterations;
        }
    }
}

/// Size-explicit iterated-digest derivation (legacy volumes).
///
/// Fills `key` and then `iv` from a SHA-1 chain over the password. Unlike
/// the library equivalent it takes the output sizes from the caller, so
/// ciphers whose native key length differs from the configured one still
/// receive full-length material.
pub(crate) fn bytes_to_key(password: &[u8], rounds: u32, key: &mut [u8], iv: &mut [u8]) {
    let mut digest: Vec<u8> = Vec::new();
    let mut key_off = 0;
    let mut iv_off = 0;

    while key_off < key.len() || iv_off < iv.len() {
        let mut hasher = Sha1::new();
        if !digest.is_empty() {
            hasher.update(&digest);
        }
        hasher.update(password);
        let mut md = hasher.finalize();
        for _ in 1..rounds {
            md = Sha1::digest(md);
        }
        digest.zeroize();
        digest = md.to_vec();

        let mut offset = 0;
        let n = (key.len() - key_off).min(digest.len());
        key[key_off..key_off + n].copy_from_slice(&digest[..n]);
        key_off += n;
        offset += n;

        let n = (iv.len() - iv_off).min(digest.len() - offset);
        iv[iv_off..iv_off + n].copy_from_slice(&digest[offset..offset + n]);
        iv_off += n;
    }

    digest.zeroize();
}
