//! Step identifier derivation.
//!
//! A step is addressed by the hex MD5 digest of its human-readable title.
//! The digest is scoped to a single execution's step namespace, so the
//! only collision that matters is between two distinct titles inside one
//! handler; titles are short human strings and this is accepted as a
//! practical impossibility. Not a cryptographic identifier.

use md5::{Digest, Md5};

/// Returns the stable identifier for a step title.
pub fn step_id(title: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(title.as_bytes());
    hex::encode(hasher.finalize())
}
