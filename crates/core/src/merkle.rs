//! Merkle root construction over ordered record hashes.
//!
//! The tree is the unbalanced-duplication variant: at every level an odd
//! tail element is paired with itself. Parents are computed over the
//! concatenated lowercase-hex child strings, in the same text domain as the
//! canonical record hash, so a root can be recomputed from the hex hashes
//! alone without decoding.

use crate::hash::sha256_hex;

/// Reduce an ordered list of record hashes to the batch Merkle root.
///
/// Returns `None` for an empty slice. A single hash is its own root.
pub fn merkle_root(hashes: &[String]) -> Option<String> {
    if hashes.is_empty() {
        return None;
    }
    let mut level: Vec<String> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(sha256_hex(format!("{left}{right}").as_bytes()));
        }
        level = next;
    }
    level.pop()
}
