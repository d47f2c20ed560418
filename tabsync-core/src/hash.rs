//! Content hashing for stamps.
//!
//! All hashes are 32-bit FNV-1a over the UTF-8 bytes of a string. Aggregate
//! hashes are combined with XOR so a child's contribution can be removed and
//! re-added without recomputing its siblings.

/// A 32-bit content hash.
pub type Hash = u32;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Hashes a string with 32-bit FNV-1a.
pub fn get_hash(value: &str) -> Hash {
    value.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// The contribution a child makes to its parent's aggregate hash.
pub fn hash_id_and_hash(id: &str, hash: Hash) -> Hash {
    get_hash(&format!("{id}:{hash}"))
}

/// Hash of a leaf from its JSON-encoded value and its timestamp.
pub fn hash_leaf(value_json: &str, time: &str) -> Hash {
    get_hash(&format!("{value_json}:{time}"))
}
