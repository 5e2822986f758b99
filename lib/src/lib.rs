// Shared Rust library: the identifier ring and the wire protocol
pub mod messages;

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use sha1::{Digest, Sha1};

/// Position on the identifier ring, always in `[0, RING_SIZE)`.
pub type Identifier = u64;

pub const M: usize = 7; // Number of bits in the identifier space
pub const RING_SIZE: Identifier = 1 << M;

/// Hashes a canonical string (`host|port` for nodes, the raw key for data)
/// onto the ring. Every node must compute the same value for the same input.
pub fn hash_identifier(input: &str) -> Identifier {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    let digest = BigUint::from_bytes_be(&hasher.finalize());
    (digest % BigUint::from(RING_SIZE))
        .to_u64()
        .unwrap_or_default()
}

// Checks if an ID is between two other IDs in the circular ID space.
// `id` is between `start` and `end` if `start < id <= end` in the circular space.
// When `start == end` the interval wraps the whole ring.
pub fn is_between(id: Identifier, start: Identifier, end: Identifier) -> bool {
    if start == end {
        return true;
    }
    if start < end {
        start < id && id <= end
    } else {
        // Wraps around (start > end)
        start < id || id <= end
    }
}

// Same as `is_between` but exclusive of `end`: `start < id < end`.
// When `start == end` every ID except `start` itself is inside.
pub fn is_strictly_between(id: Identifier, start: Identifier, end: Identifier) -> bool {
    if start == end {
        return id != start;
    }
    if start < end {
        start < id && id < end
    } else {
        start < id || id < end
    }
}

/// Clockwise distance travelled going from `from` to `to`.
pub fn distance(from: Identifier, to: Identifier) -> Identifier {
    (to + RING_SIZE - from % RING_SIZE) % RING_SIZE
}

/// Start of finger `i` for a node at `id`: `(id + 2^i) mod RING_SIZE`.
pub fn finger_start(id: Identifier, i: usize) -> Identifier {
    (id + (1 << i)) % RING_SIZE
}
