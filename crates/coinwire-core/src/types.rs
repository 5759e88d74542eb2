//! Domain types shared by the transaction engine and the query client.
//!
//! Contains the locking-script classification (`ScriptType`) and the
//! typed shapes of ElectrumX responses:
//! unspent outputs, history entries, balances, block headers, merkle proof
//! results and subscription notifications.

use bitcoin::block::Header;
use bitcoin::{BlockHash, TxMerkleNode, Txid};
use serde::{Deserialize, Serialize};

// ==============================================================================
// Script Type Classification
// ==============================================================================

/// Classifies a locking script. Detection is delegated to the `bitcoin`
/// crate's `Script::is_p2pkh()`, `is_p2sh()`, etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pk,
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    BareMultisig,
    OpReturn,
    Unknown,
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P2pk => write!(f, "p2pk"),
            Self::P2pkh => write!(f, "p2pkh"),
            Self::P2sh => write!(f, "p2sh"),
            Self::P2wpkh => write!(f, "p2wpkh"),
            Self::P2wsh => write!(f, "p2wsh"),
            Self::P2tr => write!(f, "p2tr"),
            Self::BareMultisig => write!(f, "bare_multisig"),
            Self::OpReturn => write!(f, "op_return"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ==============================================================================
// Address Queries
// ==============================================================================

/// An output that can be spent, as reported by `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub tx_hash: Txid,
    pub tx_pos: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Confirmation height; 0 for unconfirmed.
    pub height: u32,
    pub address: String,
    /// Set only when the query ran in merkle-proof mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proven: Option<bool>,
}

impl UnspentOutput {
    pub fn outpoint(&self) -> bitcoin::OutPoint {
        bitcoin::OutPoint::new(self.tx_hash, self.tx_pos)
    }

    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// One entry of `blockchain.scripthash.get_history`.
///
/// `height > 0` is confirmed, `0` is in the mempool, `-1` is in the mempool
/// with unconfirmed parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: Txid,
    pub height: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proven: Option<bool>,
}

/// History of a single address, yielded by the multi-address fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressHistory {
    pub address: String,
    pub history: Vec<HistoryEntry>,
}

/// Unspent outputs of a single address, yielded by the multi-address fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressUnspents {
    pub address: String,
    pub unspents: Vec<UnspentOutput>,
}

/// Balance of one address in satoshis. `unconfirmed` may be negative when
/// mempool transactions spend confirmed outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBalance {
    pub address: String,
    pub confirmed: i64,
    pub unconfirmed: i64,
}

/// Sum of the confirmed unspent outputs of an address whose merkle proofs
/// checked out against the fetched headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenBalance {
    pub address: String,
    pub balance: u64,
}

// ==============================================================================
// Block Headers
// ==============================================================================

/// A decoded block header. The serialized form is exactly
/// `{bits, hash, merkle_root, nonce, prevhash, timestamp, version}`; the
/// height is carried alongside but not serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    #[serde(skip)]
    pub height: u32,
    pub bits: u32,
    pub hash: BlockHash,
    pub merkle_root: TxMerkleNode,
    pub nonce: u32,
    pub prevhash: BlockHash,
    pub timestamp: u32,
    pub version: i32,
}

impl BlockHeader {
    pub fn from_raw(height: u32, raw: &Header) -> Self {
        Self {
            height,
            bits: raw.bits.to_consensus(),
            hash: raw.block_hash(),
            merkle_root: raw.merkle_root,
            nonce: raw.nonce,
            prevhash: raw.prev_blockhash,
            timestamp: raw.time,
            version: raw.version.to_consensus(),
        }
    }
}

// ==============================================================================
// Merkle Proofs
// ==============================================================================

/// Outcome of checking a transaction's inclusion proof. `proven` is true
/// only when the recomputed root equals the header's merkle root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProofResult {
    pub tx_hash: Txid,
    pub proven: bool,
}

/// Raw `blockchain.transaction.get_merkle` answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MerkleBranch {
    pub block_height: u32,
    pub merkle: Vec<TxMerkleNode>,
    pub pos: u32,
}

// ==============================================================================
// Subscription Notifications
// ==============================================================================

/// Envelope delivered to subscribers: the typed payload plus the raw
/// notification fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification<T> {
    pub data: T,
    pub error: Option<String>,
    pub method: String,
    pub params: Vec<serde_json::Value>,
}

/// Payload of a block header notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNotification {
    pub block_height: u32,
    pub version: i32,
    pub prev_block_hash: BlockHash,
    pub merkle_root: TxMerkleNode,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl HeaderNotification {
    pub fn from_raw(height: u32, raw: &Header) -> Self {
        Self {
            block_height: height,
            version: raw.version.to_consensus(),
            prev_block_hash: raw.prev_blockhash,
            merkle_root: raw.merkle_root,
            timestamp: raw.time,
            bits: raw.bits.to_consensus(),
            nonce: raw.nonce,
        }
    }
}

/// Payload of an address notification. `status` is an opaque digest of the
/// address history, `None` when the address has never been used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressStatus {
    pub address: String,
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::Network;

    #[test]
    fn block_header_serializes_exact_key_set() {
        let genesis = genesis_block(Network::Bitcoin);
        let header = BlockHeader::from_raw(0, &genesis.header);
        let value = serde_json::to_value(&header).expect("header must serialize");
        let mut keys: Vec<_> = value
            .as_object()
            .expect("header is an object")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        assert_eq!(
            keys,
            ["bits", "hash", "merkle_root", "nonce", "prevhash", "timestamp", "version"]
        );
        assert_eq!(
            value["hash"],
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(value["nonce"], 2083236893);
    }

    #[test]
    fn header_notification_key_order() {
        let genesis = genesis_block(Network::Bitcoin);
        let data = HeaderNotification::from_raw(0, &genesis.header);
        let text = serde_json::to_string(&data).expect("must serialize");
        let order = [
            "block_height",
            "version",
            "prev_block_hash",
            "merkle_root",
            "timestamp",
            "bits",
            "nonce",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|k| text.find(&format!("\"{k}\"")).expect("key present"))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn unspent_omits_proven_unless_requested() {
        let utxo = UnspentOutput {
            tx_hash: "a".repeat(64).parse().expect("valid txid"),
            tx_pos: 1,
            value: 5_000,
            height: 10,
            address: "addr".into(),
            proven: None,
        };
        let value = serde_json::to_value(&utxo).expect("must serialize");
        assert!(value.get("proven").is_none());
        assert!(utxo.is_confirmed());
    }
}
