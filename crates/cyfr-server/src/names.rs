//! Human-readable peer id generation.
//!
//! Ids look like `neon_pulse_417`: adjective, noun and a number below 1000.
//! Uniqueness is not guaranteed here; the hub re-rolls on collision.

use rand::seq::SliceRandom;
use rand::Rng;

use cyfr_shared::PeerId;

const ADJECTIVES: &[&str] = &[
    "swift", "cyber", "neon", "quantum", "shadow", "echo", "flux", "nova",
];

const NOUNS: &[&str] = &[
    "node", "pulse", "wave", "core", "link", "nexus", "cipher", "ghost",
];

const MAX_NUMBER: u32 = 1000;

/// Number of distinct ids the vocabulary can produce.
pub const ID_SPACE: usize = ADJECTIVES.len() * NOUNS.len() * MAX_NUMBER as usize;

/// Roll a random id from the vocabulary.
pub fn random_peer_id<R: Rng + ?Sized>(rng: &mut R) -> PeerId {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("swift");
    let noun = NOUNS.choose(rng).copied().unwrap_or("node");
    let number = rng.gen_range(0..MAX_NUMBER);
    PeerId(format!("{adjective}_{noun}_{number}"))
}
