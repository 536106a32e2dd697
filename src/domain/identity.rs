use rand::{Rng, RngExt};
use rand::distr::Alphanumeric;
use rand::seq::IndexedRandom;

pub const PARTICIPANT_ID_LEN: usize = 16;
pub const INVITE_CODE_LEN: usize = 8;

const INVITE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const ADJECTIVES: &[&str] = &["Happy", "Cool", "Swift", "Bright", "Epic", "Bold", "Wise", "Zen"];
const NOUNS: &[&str] = &["Traveler", "Explorer", "Wanderer", "Adventurer", "Nomad", "Voyager"];

/// Opaque participant id: 16 random alphanumeric characters.
pub fn generate_participant_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..PARTICIPANT_ID_LEN)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect()
}

/// Random "Adjective Noun" display name.
pub fn compose_display_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("Happy");
    let noun = NOUNS.choose(rng).copied().unwrap_or("Traveler");
    format!("{adjective} {noun}")
}

/// Human-shareable invite code: 8 uppercase alphanumerics.
pub fn generate_invite_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.random_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}

/// Canonical form used for invite-code lookups.
pub fn normalize_invite_code(code: &str) -> String {
    code.trim().to_uppercase()
}
