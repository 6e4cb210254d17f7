//! One-time credentials handed to invited members.

use rand::Rng;
use rand::seq::SliceRandom;

pub const CREDENTIAL_LENGTH: usize = 10;

const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Issues a temporary credential of [`CREDENTIAL_LENGTH`] alphanumeric
/// characters with at least one uppercase letter, one lowercase letter and one
/// digit. The guaranteed characters are shuffled into the result so their
/// position carries no information.
pub fn issue_temporary_credential() -> String {
    issue_with(&mut rand::thread_rng())
}

pub fn issue_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut chars: Vec<u8> = Vec::with_capacity(CREDENTIAL_LENGTH);
    for class in [UPPERCASE, LOWERCASE, DIGITS] {
        chars.push(class[rng.gen_range(0..class.len())]);
    }
    while chars.len() < CREDENTIAL_LENGTH {
        chars.push(ALPHABET[rng.gen_range(0..ALPHABET.len())]);
    }
    chars.shuffle(rng);
    chars.into_iter().map(char::from).collect()
}

pub fn is_strong_credential(value: &str) -> bool {
    value.chars().count() >= CREDENTIAL_LENGTH
        && value.chars().all(|ch| ch.is_ascii_alphanumeric())
        && value.chars().any(|ch| ch.is_ascii_uppercase())
        && value.chars().any(|ch| ch.is_ascii_lowercase())
        && value.chars().any(|ch| ch.is_ascii_digit())
}
