//! Shared test helpers for `coinwire-core` unit tests.
//!
//! Deterministic keys, txids, unspent outputs and unsigned transactions so
//! that tests across modules share one source of dummy data.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Network, OutPoint, PrivateKey, PublicKey, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};

use crate::types::UnspentOutput;

/// Compressed encoding of the secp256k1 generator point (private key 1).
pub const GENERATOR_PUBKEY: &str =
    "0279BE667EF9DCBBAC55A06295CE870B07029BFCDB2DCE28D959F2815B16F81798";

// ==============================================================================
// Txid Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

// ==============================================================================
// Keys
// ==============================================================================

/// A compressed private key whose secret is `[b; 32]`. `b` must be nonzero.
pub fn privkey_from_byte(b: u8) -> PrivateKey {
    let secret = SecretKey::from_slice(&[b; 32]).expect("nonzero secret below curve order");
    PrivateKey::new(secret, Network::Regtest)
}

pub fn pubkey_from_byte(b: u8) -> PublicKey {
    privkey_from_byte(b).public_key(&Secp256k1::new())
}

// ==============================================================================
// Unspents And Transactions
// ==============================================================================

pub fn make_unspent(b: u8, tx_pos: u32, value: u64, height: u32, address: &str) -> UnspentOutput {
    UnspentOutput {
        tx_hash: txid_from_byte(b),
        tx_pos,
        value,
        height,
        address: address.to_string(),
        proven: None,
    }
}

/// Unsigned transaction with `inputs` inputs and `outputs` outputs of
/// distinct values, sequences and scripts.
pub fn sample_spend_tx(inputs: usize, outputs: usize) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(0),
        input: (0..inputs)
            .map(|i| TxIn {
                previous_output: OutPoint::new(txid_from_byte(i as u8 + 1), i as u32),
                script_sig: ScriptBuf::new(),
                sequence: Sequence(0xffff_fffd - i as u32),
                witness: Witness::default(),
            })
            .collect(),
        output: (0..outputs)
            .map(|o| TxOut {
                value: Amount::from_sat(10_000 * (o as u64 + 1)),
                script_pubkey: ScriptBuf::new_p2pkh(&pubkey_from_byte(o as u8 + 10).pubkey_hash()),
            })
            .collect(),
    }
}
