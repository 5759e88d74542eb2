//! Transaction model used by the builder and signer, plus the raw codec.
//!
//! A [`WalletTx`] is a `bitcoin::Transaction` paired with the outputs its
//! inputs spend. The spent values travel with the transaction so that the
//! segwit sighash never has to guess them.

use bitcoin::consensus::encode;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid, Wtxid};

use crate::error::CoreError;

// ==============================================================================
// Outputs
// ==============================================================================

/// Where a payment goes. Addresses are resolved to scripts at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Address(String),
    Script(ScriptBuf),
}

/// A requested output: value in satoshis and its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub value: Amount,
    pub destination: Destination,
}

impl Payment {
    pub fn to_address(address: impl Into<String>, sats: u64) -> Self {
        Self {
            value: Amount::from_sat(sats),
            destination: Destination::Address(address.into()),
        }
    }

    pub fn to_script(script: ScriptBuf, sats: u64) -> Self {
        Self {
            value: Amount::from_sat(sats),
            destination: Destination::Script(script),
        }
    }
}

// ==============================================================================
// Wallet Transaction
// ==============================================================================

/// A transaction together with the previous outputs its inputs spend,
/// in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTx {
    pub tx: Transaction,
    pub spent: Vec<TxOut>,
}

impl WalletTx {
    pub fn new(tx: Transaction, spent: Vec<TxOut>) -> Result<Self, CoreError> {
        if tx.input.len() != spent.len() {
            return Err(CoreError::InvalidTxData(format!(
                "{} inputs but {} spent outputs",
                tx.input.len(),
                spent.len()
            )));
        }
        Ok(Self { tx, spent })
    }

    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn serialize(&self) -> Vec<u8> {
        serialize(&self.tx)
    }

    pub fn to_hex(&self) -> String {
        serialize_hex(&self.tx)
    }

    /// Implicit fee: spent value minus output value.
    pub fn fee(&self) -> Option<Amount> {
        let total_in = self
            .spent
            .iter()
            .try_fold(Amount::ZERO, |acc, out| acc.checked_add(out.value))?;
        let total_out = self
            .tx
            .output
            .iter()
            .try_fold(Amount::ZERO, |acc, out| acc.checked_add(out.value))?;
        total_in.checked_sub(total_out)
    }

    /// Whether any input carries witness data.
    pub fn is_segwit(&self) -> bool {
        self.tx.input.iter().any(|input| !input.witness.is_empty())
    }
}

// ==============================================================================
// Codec
// ==============================================================================

/// Consensus serialization. Segwit marker, flag and witnesses are emitted
/// only when at least one input has a witness.
pub fn serialize(tx: &Transaction) -> Vec<u8> {
    encode::serialize(tx)
}

pub fn serialize_hex(tx: &Transaction) -> String {
    encode::serialize_hex(tx)
}

/// Decode a transaction, rejecting trailing bytes.
pub fn deserialize(bytes: &[u8]) -> Result<Transaction, CoreError> {
    encode::deserialize(bytes).map_err(|e| CoreError::InvalidTxData(format!("decode transaction: {e}")))
}

pub fn deserialize_hex(raw: &str) -> Result<Transaction, CoreError> {
    let bytes = hex::decode(raw.trim())
        .map_err(|e| CoreError::InvalidTxData(format!("transaction hex: {e}")))?;
    deserialize(&bytes)
}

/// Hash over the non-witness serialization; stable while witnesses change.
pub fn txid(tx: &Transaction) -> Txid {
    tx.compute_txid()
}

pub fn wtxid(tx: &Transaction) -> Wtxid {
    tx.compute_wtxid()
}

/// The txid a server will report after broadcasting `raw`.
pub fn public_txhash(raw: &str) -> Result<Txid, CoreError> {
    Ok(deserialize_hex(raw)?.compute_txid())
}
