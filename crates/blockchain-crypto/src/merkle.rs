// blockchain-crypto/src/merkle.rs

use crate::{hash::Hashable, Hash};

/// Merkle root over transaction ids.
///
/// Levels with an odd number of nodes duplicate their last node. An empty
/// list has the zero root.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::zero();
    }

    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = Vec::with_capacity(64);
                buf.extend_from_slice(pair[0].as_bytes());
                buf.extend_from_slice(pair[1].as_bytes());
                buf.sha256d()
            })
            .collect();
    }
    level[0]
}
