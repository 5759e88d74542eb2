//! SPV merkle proof verification.
//!
//! The only trusted anchor is a block header fetched by height; a root
//! supplied by the caller or the server is never used. A branch that does
//! not reproduce the header's merkle root is reported as unproven, not as
//! an error. Only failing to fetch the header is an error.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{TxMerkleNode, Txid};
use tracing::{debug, warn};

use crate::electrum::ChainQuery;
use crate::error::CoreError;
use crate::types::MerkleProofResult;

/// Fold `branch` into a root, starting at the transaction hash. Bit `i` of
/// `pos` set means the running hash is the right-hand node at level `i`.
pub fn merkle_root_from_branch(tx_hash: &Txid, branch: &[TxMerkleNode], pos: u32) -> TxMerkleNode {
    let mut current = tx_hash.to_byte_array();
    for (level, sibling) in branch.iter().enumerate() {
        let sibling = sibling.to_byte_array();
        let mut concat = [0u8; 64];
        let bit = u32::try_from(level)
            .ok()
            .and_then(|shift| pos.checked_shr(shift))
            .unwrap_or(0);
        if bit & 1 == 1 {
            concat[..32].copy_from_slice(&sibling);
            concat[32..].copy_from_slice(&current);
        } else {
            concat[..32].copy_from_slice(&current);
            concat[32..].copy_from_slice(&sibling);
        }
        current = sha256d::Hash::hash(&concat).to_byte_array();
    }
    TxMerkleNode::from_byte_array(current)
}

/// Check `branch` against the header at `height`.
pub async fn verify<Q: ChainQuery + ?Sized>(
    query: &Q,
    tx_hash: &Txid,
    branch: &[TxMerkleNode],
    pos: u32,
    height: u32,
) -> Result<bool, CoreError> {
    let header = query
        .block_header(height)
        .await
        .map_err(|e| CoreError::ProofUnavailable {
            height,
            reason: e.to_string(),
        })?;

    // No block holds 2^32 transactions.
    if branch.len() > 32 {
        debug!(%tx_hash, depth = branch.len(), "merkle branch deeper than any block");
        return Ok(false);
    }

    // A position wider than the branch cannot belong to this tree.
    if branch.len() < 32 && pos >> branch.len() != 0 {
        debug!(%tx_hash, pos, depth = branch.len(), "merkle position exceeds branch depth");
        return Ok(false);
    }

    let root = merkle_root_from_branch(tx_hash, branch, pos);
    let proven = root == header.merkle_root;
    debug!(%tx_hash, height, proven, "merkle proof checked");
    Ok(proven)
}

/// Fetch the branch for `tx_hash` at `height` and verify it. A server
/// refusing to produce a branch counts as unproven.
pub async fn prove<Q: ChainQuery + ?Sized>(
    query: &Q,
    tx_hash: &Txid,
    height: u32,
) -> Result<MerkleProofResult, CoreError> {
    if height == 0 {
        return Ok(MerkleProofResult {
            tx_hash: *tx_hash,
            proven: false,
        });
    }

    let branch = match query.get_merkle(tx_hash, height).await {
        Ok(branch) => branch,
        Err(CoreError::ServerError { code, message }) => {
            warn!(%tx_hash, height, code, message = %message, "server refused merkle branch");
            return Ok(MerkleProofResult {
                tx_hash: *tx_hash,
                proven: false,
            });
        }
        Err(err) => return Err(err),
    };

    let proven = if branch.block_height != height {
        warn!(
            %tx_hash,
            claimed = height,
            reported = branch.block_height,
            "merkle branch is for a different height"
        );
        false
    } else {
        verify(query, tx_hash, &branch.merkle, branch.pos, branch.block_height).await?
    };

    Ok(MerkleProofResult {
        tx_hash: *tx_hash,
        proven,
    })
}
