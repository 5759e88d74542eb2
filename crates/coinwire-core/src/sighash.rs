//! Signature hash computation.
//!
//! Two rules exist and they are never interchangeable: the original
//! (legacy) rule for pre-segwit spends and the BIP143 rule for native and
//! P2SH-wrapped segwit spends. The BIP143 rule commits to the value of the
//! spent output, which callers must take from the unspent output record.

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Amount, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::error::CoreError;

/// Digest signed when a legacy `SIGHASH_SINGLE` input has no matching
/// output: the integer 1, little endian.
const SINGLE_WITHOUT_OUTPUT: [u8; 32] = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseType {
    All,
    None,
    Single,
}

fn split(hash_type: EcdsaSighashType) -> (BaseType, bool) {
    match hash_type {
        EcdsaSighashType::All => (BaseType::All, false),
        EcdsaSighashType::None => (BaseType::None, false),
        EcdsaSighashType::Single => (BaseType::Single, false),
        EcdsaSighashType::AllPlusAnyoneCanPay => (BaseType::All, true),
        EcdsaSighashType::NonePlusAnyoneCanPay => (BaseType::None, true),
        EcdsaSighashType::SinglePlusAnyoneCanPay => (BaseType::Single, true),
    }
}

/// Compute the digest to sign for `input_index`, choosing the rule from
/// `is_segwit`. `value` is only committed to by the segwit rule.
pub fn sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: Amount,
    hash_type: EcdsaSighashType,
    is_segwit: bool,
) -> Result<[u8; 32], CoreError> {
    if is_segwit {
        segwit_sighash(tx, input_index, script_code, value, hash_type)
    } else {
        legacy_sighash(tx, input_index, script_code, hash_type)
    }
}

fn check_index(tx: &Transaction, input_index: usize) -> Result<(), CoreError> {
    if input_index >= tx.input.len() {
        return Err(CoreError::InputOutOfRange {
            index: input_index,
            count: tx.input.len(),
        });
    }
    Ok(())
}

// ==============================================================================
// Legacy Rule
// ==============================================================================

/// Legacy digest: serialize a copy of the transaction with every input
/// script emptied except the signed one (set to `script_code`), adjust
/// inputs/outputs for the hash type, append the 4-byte hash type, double
/// hash.
pub fn legacy_sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    hash_type: EcdsaSighashType,
) -> Result<[u8; 32], CoreError> {
    check_index(tx, input_index)?;
    let (base, anyone_can_pay) = split(hash_type);

    if base == BaseType::Single && input_index >= tx.output.len() {
        return Ok(SINGLE_WITHOUT_OUTPUT);
    }

    let blank_input = |index: usize, input: &TxIn| {
        let signed = index == input_index;
        TxIn {
            previous_output: input.previous_output,
            script_sig: if signed {
                script_code.to_owned()
            } else {
                ScriptBuf::new()
            },
            sequence: if signed || base == BaseType::All {
                input.sequence
            } else {
                Sequence::ZERO
            },
            witness: Witness::default(),
        }
    };

    let input = if anyone_can_pay {
        vec![blank_input(input_index, &tx.input[input_index])]
    } else {
        tx.input
            .iter()
            .enumerate()
            .map(|(index, input)| blank_input(index, input))
            .collect()
    };

    let output = match base {
        BaseType::All => tx.output.clone(),
        BaseType::None => Vec::new(),
        BaseType::Single => tx.output[..=input_index]
            .iter()
            .enumerate()
            .map(|(index, out)| {
                if index == input_index {
                    out.clone()
                } else {
                    TxOut {
                        value: Amount::from_sat(u64::MAX),
                        script_pubkey: ScriptBuf::new(),
                    }
                }
            })
            .collect(),
    };

    let stripped = Transaction {
        version: tx.version,
        lock_time: tx.lock_time,
        input,
        output,
    };

    let mut preimage = serialize(&stripped);
    preimage.extend_from_slice(&hash_type.to_u32().to_le_bytes());
    Ok(sha256d::Hash::hash(&preimage).to_byte_array())
}

// ==============================================================================
// Segwit (BIP143) Rule
// ==============================================================================

/// BIP143 digest.
pub fn segwit_sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: Amount,
    hash_type: EcdsaSighashType,
) -> Result<[u8; 32], CoreError> {
    Ok(sha256d::Hash::hash(&segwit_preimage(tx, input_index, script_code, value, hash_type)?)
        .to_byte_array())
}

/// The BIP143 preimage:
/// version | hashPrevouts | hashSequence | outpoint | scriptCode | value |
/// nSequence | hashOutputs | locktime | hash type.
pub fn segwit_preimage(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: Amount,
    hash_type: EcdsaSighashType,
) -> Result<Vec<u8>, CoreError> {
    check_index(tx, input_index)?;
    let (base, anyone_can_pay) = split(hash_type);
    let input = &tx.input[input_index];

    let hash_prevouts = if anyone_can_pay {
        [0u8; 32]
    } else {
        double_hash(tx.input.iter().flat_map(|i| serialize(&i.previous_output)))
    };

    let hash_sequence = if !anyone_can_pay && base == BaseType::All {
        double_hash(
            tx.input
                .iter()
                .flat_map(|i| i.sequence.to_consensus_u32().to_le_bytes()),
        )
    } else {
        [0u8; 32]
    };

    let hash_outputs = match base {
        BaseType::All => double_hash(tx.output.iter().flat_map(serialize)),
        BaseType::Single if input_index < tx.output.len() => {
            double_hash(serialize(&tx.output[input_index]))
        }
        _ => [0u8; 32],
    };

    let mut preimage = Vec::with_capacity(156 + script_code.len());
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend(serialize(&input.previous_output));
    preimage.extend(serialize(&script_code.to_owned()));
    preimage.extend_from_slice(&value.to_sat().to_le_bytes());
    preimage.extend_from_slice(&input.sequence.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&hash_type.to_u32().to_le_bytes());
    Ok(preimage)
}

fn double_hash(bytes: impl IntoIterator<Item = u8>) -> [u8; 32] {
    let data: Vec<u8> = bytes.into_iter().collect();
    sha256d::Hash::hash(&data).to_byte_array()
}
