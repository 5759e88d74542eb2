//! Input signing and multisig combination.
//!
//! Signatures are deterministic (RFC6979, low-S), so re-signing an input
//! with the same key reproduces the same unlocking data byte for byte.

use bitcoin::ecdsa;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Network, PrivateKey, PublicKey, Script, ScriptBuf, TxIn, Witness};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::script::{parse_multisig, ScriptSpec};
use crate::sighash::sighash;
use crate::tx::WalletTx;

/// Parse a private key from WIF, or from 64 hex characters (compressed
/// public key, `network`).
pub fn parse_private_key(raw: &str, network: Network) -> Result<PrivateKey, CoreError> {
    let raw = raw.trim();
    if let Ok(key) = PrivateKey::from_wif(raw) {
        return Ok(key);
    }
    let bytes = hex::decode(raw).map_err(|_| CoreError::InvalidKey("neither WIF nor hex".into()))?;
    PrivateKey::from_slice(&bytes, network).map_err(|e| CoreError::InvalidKey(e.to_string()))
}

fn push_bytes(data: impl Into<Vec<u8>>) -> Result<PushBytesBuf, CoreError> {
    PushBytesBuf::try_from(data.into())
        .map_err(|_| CoreError::InvalidScript("push exceeds the maximum size".into()))
}

fn push_script(script: &Script) -> Result<ScriptBuf, CoreError> {
    Ok(Builder::new()
        .push_slice(push_bytes(script.to_bytes())?)
        .into_script())
}

pub struct Signer {
    secp: Secp256k1<All>,
    hash_type: EcdsaSighashType,
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer {
    pub fn new() -> Self {
        Self::with_hash_type(EcdsaSighashType::All)
    }

    pub fn with_hash_type(hash_type: EcdsaSighashType) -> Self {
        Self {
            secp: Secp256k1::new(),
            hash_type,
        }
    }

    pub fn public_key(&self, key: &PrivateKey) -> PublicKey {
        key.public_key(&self.secp)
    }

    // ==========================================================================
    // Single-Key Spends
    // ==========================================================================

    /// Sign input `input_index` in place. The spend type is resolved from
    /// the spent output's locking script; `KeyMismatch` when the key does
    /// not control it.
    pub fn sign(
        &self,
        wtx: &mut WalletTx,
        input_index: usize,
        key: &PrivateKey,
    ) -> Result<(), CoreError> {
        let pubkey = self.public_key(key);
        let spec = self.resolve_key(wtx, input_index, &pubkey)?;
        let signature = self.signature(wtx, input_index, &spec, self.hash_type, key)?;
        let unlocking = unlock_single(&spec, &signature, &pubkey)?;
        apply(&mut wtx.tx.input[input_index], unlocking);
        debug!(input = input_index, spend = %spec.script_type(), "signed input");
        Ok(())
    }

    /// Sign every input the key controls and return how many were signed.
    /// Either all of them are signed or the transaction is left untouched.
    pub fn sign_all(&self, wtx: &mut WalletTx, key: &PrivateKey) -> Result<usize, CoreError> {
        let pubkey = self.public_key(key);
        let mut draft = wtx.clone();
        let mut signed = 0;
        for index in 0..draft.tx.input.len() {
            if ScriptSpec::resolve_key(&draft.spent[index].script_pubkey, &pubkey).is_some() {
                self.sign(&mut draft, index, key)?;
                signed += 1;
            }
        }
        if signed == 0 {
            return Err(CoreError::KeyMismatch(0));
        }
        *wtx = draft;
        Ok(signed)
    }

    fn resolve_key(
        &self,
        wtx: &WalletTx,
        input_index: usize,
        pubkey: &PublicKey,
    ) -> Result<ScriptSpec, CoreError> {
        let spent = wtx.spent.get(input_index).ok_or(CoreError::InputOutOfRange {
            index: input_index,
            count: wtx.spent.len(),
        })?;
        ScriptSpec::resolve_key(&spent.script_pubkey, pubkey)
            .ok_or(CoreError::KeyMismatch(input_index))
    }

    fn signature(
        &self,
        wtx: &WalletTx,
        input_index: usize,
        spec: &ScriptSpec,
        hash_type: EcdsaSighashType,
        key: &PrivateKey,
    ) -> Result<ecdsa::Signature, CoreError> {
        let msg = self.message(wtx, input_index, spec, hash_type)?;
        Ok(ecdsa::Signature {
            signature: self.secp.sign_ecdsa(&msg, &key.inner),
            sighash_type: hash_type,
        })
    }

    fn message(
        &self,
        wtx: &WalletTx,
        input_index: usize,
        spec: &ScriptSpec,
        hash_type: EcdsaSighashType,
    ) -> Result<Message, CoreError> {
        let digest = sighash(
            &wtx.tx,
            input_index,
            &spec.script_code(),
            wtx.spent
                .get(input_index)
                .ok_or(CoreError::InputOutOfRange {
                    index: input_index,
                    count: wtx.spent.len(),
                })?
                .value,
            hash_type,
            spec.is_segwit(),
        )?;
        Ok(Message::from_digest(digest))
    }

    // ==========================================================================
    // Multisig
    // ==========================================================================

    /// Produce this key's signature for a multisig input locked by
    /// `redeem_script` (bare, P2SH, P2WSH or P2SH-wrapped P2WSH).
    pub fn multisign(
        &self,
        wtx: &WalletTx,
        input_index: usize,
        redeem_script: &Script,
        key: &PrivateKey,
    ) -> Result<ecdsa::Signature, CoreError> {
        let spec = self.resolve_redeem(wtx, input_index, redeem_script)?;
        let (_, pubkeys) = parse_multisig(redeem_script)?;
        if !pubkeys.contains(&self.public_key(key)) {
            return Err(CoreError::KeyMismatch(input_index));
        }
        self.signature(wtx, input_index, &spec, self.hash_type, key)
    }

    /// Install the unlocking data for a multisig input from signatures
    /// ordered like the keys of `redeem_script`.
    ///
    /// Signatures are matched against keys with a forward-only cursor. A
    /// signature that only verifies against a key already passed is a
    /// `SignatureOrder` error; one that verifies against no key is skipped.
    /// Fewer than `m` matches is `InsufficientSignatures` and leaves the
    /// input untouched.
    pub fn combine_multisig(
        &self,
        wtx: &mut WalletTx,
        input_index: usize,
        redeem_script: &Script,
        signatures: &[ecdsa::Signature],
    ) -> Result<(), CoreError> {
        let spec = self.resolve_redeem(wtx, input_index, redeem_script)?;
        let (threshold, pubkeys) = parse_multisig(redeem_script)?;

        let mut cursor = 0;
        let mut valid: Vec<ecdsa::Signature> = Vec::with_capacity(threshold);
        for (position, signature) in signatures.iter().enumerate() {
            if valid.len() == threshold {
                break;
            }
            let msg = self.message(wtx, input_index, &spec, signature.sighash_type)?;
            let verifies = |pk: &PublicKey| {
                self.secp
                    .verify_ecdsa(&msg, &signature.signature, &pk.inner)
                    .is_ok()
            };
            if let Some(offset) = pubkeys[cursor..].iter().position(verifies) {
                cursor += offset + 1;
                valid.push(*signature);
            } else if pubkeys[..cursor].iter().any(verifies) {
                return Err(CoreError::SignatureOrder {
                    signature: position,
                });
            } else {
                warn!(input = input_index, signature = position, "signature matches no key");
            }
        }

        if valid.len() < threshold {
            return Err(CoreError::InsufficientSignatures {
                valid: valid.len(),
                required: threshold,
            });
        }

        let sigs: Vec<Vec<u8>> = valid.iter().map(|s| s.to_vec()).collect();
        let unlocking = match &spec {
            ScriptSpec::BareMultisig { .. } => Unlocking {
                script_sig: multisig_script_sig(&sigs, None)?,
                witness: Witness::default(),
            },
            ScriptSpec::P2sh { redeem_script } => Unlocking {
                script_sig: multisig_script_sig(&sigs, Some(redeem_script))?,
                witness: Witness::default(),
            },
            ScriptSpec::P2wsh { witness_script } => Unlocking {
                script_sig: ScriptBuf::new(),
                witness: multisig_witness(&sigs, witness_script),
            },
            ScriptSpec::P2shP2wsh { witness_script } => Unlocking {
                script_sig: push_script(&ScriptBuf::new_p2wsh(&witness_script.wscript_hash()))?,
                witness: multisig_witness(&sigs, witness_script),
            },
            other => {
                return Err(CoreError::InvalidScript(format!(
                    "{} is not a multisig spend",
                    other.script_type()
                )))
            }
        };
        apply(&mut wtx.tx.input[input_index], unlocking);
        debug!(input = input_index, signatures = valid.len(), "combined multisig");
        Ok(())
    }

    fn resolve_redeem(
        &self,
        wtx: &WalletTx,
        input_index: usize,
        redeem_script: &Script,
    ) -> Result<ScriptSpec, CoreError> {
        let spent = wtx.spent.get(input_index).ok_or(CoreError::InputOutOfRange {
            index: input_index,
            count: wtx.spent.len(),
        })?;
        ScriptSpec::resolve_redeem(&spent.script_pubkey, redeem_script).ok_or_else(|| {
            CoreError::InvalidScript(format!(
                "redeem script is not committed to by input {input_index}"
            ))
        })
    }

    // ==========================================================================
    // Verification
    // ==========================================================================

    /// Check the unlocking data of input `input_index` against its spent
    /// output. Single-key spends (p2pkh, p2wpkh, p2sh-p2wpkh) and multisig
    /// spends (bare, p2sh, p2wsh, p2sh-p2wsh) are understood. Unsigned or
    /// malformed unlocking data is reported as `false`.
    pub fn verify_input(&self, wtx: &WalletTx, input_index: usize) -> Result<bool, CoreError> {
        let input = wtx.tx.input.get(input_index).ok_or(CoreError::InputOutOfRange {
            index: input_index,
            count: wtx.tx.input.len(),
        })?;
        let spent = wtx.spent.get(input_index).ok_or_else(|| {
            CoreError::InvalidTxData(format!("no spent output recorded for input {input_index}"))
        })?;
        let locking = &spent.script_pubkey;

        if let Some((spec, items)) = multisig_unlocking(locking, input) {
            return self.verify_multisig(wtx, input_index, &spec, &items);
        }

        let pushes: Vec<Vec<u8>> = if locking.is_p2pkh() {
            match script_pushes(&input.script_sig) {
                Some(pushes) => pushes,
                None => return Ok(false),
            }
        } else if locking.is_p2wpkh() || locking.is_p2sh() || locking.is_p2wsh() {
            input.witness.iter().map(<[u8]>::to_vec).collect()
        } else if parse_multisig(locking).is_ok() {
            return Ok(false);
        } else {
            return Err(CoreError::InvalidScript(format!(
                "cannot verify input {input_index}: unsupported spend"
            )));
        };

        let [sig_bytes, key_bytes] = pushes.as_slice() else {
            return Ok(false);
        };
        let (Ok(signature), Ok(pubkey)) = (
            ecdsa::Signature::from_slice(sig_bytes),
            PublicKey::from_slice(key_bytes),
        ) else {
            return Ok(false);
        };
        let Some(spec) = ScriptSpec::resolve_key(locking, &pubkey) else {
            return Ok(false);
        };
        if let Some(redeem) = spec.redeem_script() {
            if input.script_sig != push_script(&redeem)? {
                return Ok(false);
            }
        }

        let msg = self.message(wtx, input_index, &spec, signature.sighash_type)?;
        Ok(self
            .secp
            .verify_ecdsa(&msg, &signature.signature, &pubkey.inner)
            .is_ok())
    }

    /// `items` is the unlocking stack without the script: the dummy empty
    /// element followed by exactly `m` signatures in key order.
    fn verify_multisig(
        &self,
        wtx: &WalletTx,
        input_index: usize,
        spec: &ScriptSpec,
        items: &[Vec<u8>],
    ) -> Result<bool, CoreError> {
        let (threshold, pubkeys) = match spec {
            ScriptSpec::BareMultisig { threshold, pubkeys } => (*threshold, pubkeys.clone()),
            ScriptSpec::P2sh { redeem_script: script }
            | ScriptSpec::P2wsh { witness_script: script }
            | ScriptSpec::P2shP2wsh { witness_script: script } => parse_multisig(script)?,
            _ => return Ok(false),
        };
        let Some((dummy, sigs)) = items.split_first() else {
            return Ok(false);
        };
        if !dummy.is_empty() || sigs.len() != threshold {
            return Ok(false);
        }

        let mut cursor = 0;
        for raw in sigs {
            let Ok(signature) = ecdsa::Signature::from_slice(raw) else {
                return Ok(false);
            };
            let msg = self.message(wtx, input_index, spec, signature.sighash_type)?;
            let found = pubkeys[cursor..].iter().position(|pk| {
                self.secp
                    .verify_ecdsa(&msg, &signature.signature, &pk.inner)
                    .is_ok()
            });
            match found {
                Some(offset) => cursor += offset + 1,
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// Recognise a multisig unlocking of `locking` in `input`, returning the
/// resolved spend and the stack items preceding the script.
fn multisig_unlocking(locking: &Script, input: &TxIn) -> Option<(ScriptSpec, Vec<Vec<u8>>)> {
    if parse_multisig(locking).is_ok() {
        let spec = ScriptSpec::resolve_redeem(locking, locking)?;
        return Some((spec, script_pushes(&input.script_sig)?));
    }

    if locking.is_p2wsh() || (locking.is_p2sh() && !input.witness.is_empty()) {
        let mut items: Vec<Vec<u8>> = input.witness.iter().map(<[u8]>::to_vec).collect();
        let script = ScriptBuf::from_bytes(items.pop()?);
        let spec = ScriptSpec::resolve_redeem(locking, &script)?;
        let expected_sig = match spec.redeem_script() {
            Some(program) => push_script(&program).ok()?,
            None => ScriptBuf::new(),
        };
        if !matches!(spec, ScriptSpec::P2wsh { .. } | ScriptSpec::P2shP2wsh { .. })
            || parse_multisig(&script).is_err()
            || input.script_sig != expected_sig
        {
            return None;
        }
        return Some((spec, items));
    }

    if locking.is_p2sh() {
        let mut items = script_pushes(&input.script_sig)?;
        let script = ScriptBuf::from_bytes(items.pop()?);
        let spec = ScriptSpec::resolve_redeem(locking, &script)?;
        if !matches!(spec, ScriptSpec::P2sh { .. }) || parse_multisig(&script).is_err() {
            return None;
        }
        return Some((spec, items));
    }
    None
}

// ==============================================================================
// Unlocking Data
// ==============================================================================

struct Unlocking {
    script_sig: ScriptBuf,
    witness: Witness,
}

/// Replaces, never appends.
fn apply(input: &mut TxIn, unlocking: Unlocking) {
    input.script_sig = unlocking.script_sig;
    input.witness = unlocking.witness;
}

fn unlock_single(
    spec: &ScriptSpec,
    signature: &ecdsa::Signature,
    pubkey: &PublicKey,
) -> Result<Unlocking, CoreError> {
    match spec {
        ScriptSpec::P2pkh { .. } => Ok(Unlocking {
            script_sig: Builder::new()
                .push_slice(push_bytes(signature.to_vec())?)
                .push_key(pubkey)
                .into_script(),
            witness: Witness::default(),
        }),
        ScriptSpec::P2wpkh { pubkey } => Ok(Unlocking {
            script_sig: ScriptBuf::new(),
            witness: Witness::from_slice(&[signature.to_vec(), pubkey.to_bytes().to_vec()]),
        }),
        ScriptSpec::P2shP2wpkh { pubkey } => {
            let redeem = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
            Ok(Unlocking {
                script_sig: push_script(&redeem)?,
                witness: Witness::from_slice(&[signature.to_vec(), pubkey.to_bytes().to_vec()]),
            })
        }
        other => Err(CoreError::InvalidScript(format!(
            "{} needs a multisig combination",
            other.script_type()
        ))),
    }
}

/// `OP_0 <sig>... [<redeem>]`; the leading `OP_0` absorbs the extra item
/// `OP_CHECKMULTISIG` pops.
fn multisig_script_sig(sigs: &[Vec<u8>], redeem: Option<&ScriptBuf>) -> Result<ScriptBuf, CoreError> {
    let mut builder = Builder::new().push_int(0);
    for sig in sigs {
        builder = builder.push_slice(push_bytes(sig.clone())?);
    }
    if let Some(redeem) = redeem {
        builder = builder.push_slice(push_bytes(redeem.to_bytes())?);
    }
    Ok(builder.into_script())
}

fn multisig_witness(sigs: &[Vec<u8>], witness_script: &ScriptBuf) -> Witness {
    let mut items: Vec<Vec<u8>> = Vec::with_capacity(sigs.len() + 2);
    items.push(Vec::new());
    items.extend(sigs.iter().cloned());
    items.push(witness_script.to_bytes());
    Witness::from_slice(&items)
}

fn script_pushes(script: &Script) -> Option<Vec<Vec<u8>>> {
    script
        .instructions()
        .map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, Network};

    use crate::builder::TxBuilder;
    use crate::params::ChainParams;
    use crate::script::{
        multisig_redeem_script, p2pkh_address, p2sh_p2wpkh_address, p2wpkh_address,
    };
    use crate::test_util::{make_unspent, privkey_from_byte, pubkey_from_byte};
    use crate::tx::{Payment, WalletTx};

    const NET: Network = Network::Regtest;

    fn unsigned(from: &str, values: &[u64]) -> WalletTx {
        let unspents: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, v)| make_unspent(i as u8 + 1, 0, *v, 10, from))
            .collect();
        let to = p2wpkh_address(&pubkey_from_byte(9), NET).unwrap();
        TxBuilder::new(&ChainParams::regtest())
            .build_with_change(&unspents, &[Payment::to_address(to, 20_000)], from, Amount::from_sat(1_000))
            .unwrap()
    }

    fn multisig_tx(locking: ScriptBuf) -> WalletTx {
        let mut wtx = unsigned(&p2pkh_address(&pubkey_from_byte(1), NET), &[50_000]);
        wtx.spent[0].script_pubkey = locking;
        wtx
    }

    #[test]
    fn legacy_input_gets_inline_script() {
        let key = privkey_from_byte(1);
        let from = p2pkh_address(&pubkey_from_byte(1), NET);
        let mut wtx = unsigned(&from, &[50_000, 30_000]);

        let signed = Signer::new().sign_all(&mut wtx, &key).unwrap();
        assert_eq!(signed, 2);
        for (index, input) in wtx.tx.input.iter().enumerate() {
            assert!(!input.script_sig.is_empty());
            assert!(input.witness.is_empty());
            assert!(Signer::new().verify_input(&wtx, index).unwrap());
        }
    }

    #[test]
    fn native_segwit_input_gets_witness_only() {
        let key = privkey_from_byte(2);
        let from = p2wpkh_address(&pubkey_from_byte(2), NET).unwrap();
        let mut wtx = unsigned(&from, &[50_000, 30_000, 10_000]);

        Signer::new().sign_all(&mut wtx, &key).unwrap();
        for (index, input) in wtx.tx.input.iter().enumerate() {
            assert!(input.script_sig.is_empty());
            assert_eq!(input.witness.len(), 2);
            assert!(Signer::new().verify_input(&wtx, index).unwrap());
        }
        let witnesses = wtx.tx.input.iter().filter(|i| !i.witness.is_empty()).count();
        assert_eq!(witnesses, wtx.tx.input.len());
    }

    #[test]
    fn wrapped_segwit_input_gets_both() {
        let key = privkey_from_byte(3);
        let from = p2sh_p2wpkh_address(&pubkey_from_byte(3), NET).unwrap();
        let mut wtx = unsigned(&from, &[50_000]);

        Signer::new().sign(&mut wtx, 0, &key).unwrap();
        assert_eq!(wtx.tx.input[0].script_sig.len(), 23);
        assert_eq!(wtx.tx.input[0].witness.len(), 2);
        assert!(Signer::new().verify_input(&wtx, 0).unwrap());
    }

    #[test]
    fn resigning_is_idempotent() {
        let key = privkey_from_byte(2);
        let from = p2wpkh_address(&pubkey_from_byte(2), NET).unwrap();
        let mut wtx = unsigned(&from, &[50_000]);
        let signer = Signer::new();

        signer.sign(&mut wtx, 0, &key).unwrap();
        let first = wtx.tx.input[0].clone();
        signer.sign(&mut wtx, 0, &key).unwrap();
        assert_eq!(wtx.tx.input[0], first);
    }

    #[test]
    fn tampered_output_fails_verification() {
        let key = privkey_from_byte(1);
        let from = p2pkh_address(&pubkey_from_byte(1), NET);
        let mut wtx = unsigned(&from, &[50_000]);
        let signer = Signer::new();
        signer.sign_all(&mut wtx, &key).unwrap();

        wtx.tx.output[0].value = Amount::from_sat(19_999);
        assert!(!signer.verify_input(&wtx, 0).unwrap());
    }

    #[test]
    fn foreign_key_is_a_mismatch_and_leaves_tx_untouched() {
        let from = p2pkh_address(&pubkey_from_byte(1), NET);
        let mut wtx = unsigned(&from, &[50_000]);
        let before = wtx.clone();

        let err = Signer::new().sign(&mut wtx, 0, &privkey_from_byte(4)).unwrap_err();
        assert!(matches!(err, CoreError::KeyMismatch(0)));
        let err = Signer::new().sign_all(&mut wtx, &privkey_from_byte(4)).unwrap_err();
        assert!(matches!(err, CoreError::KeyMismatch(_)));
        assert_eq!(wtx, before);
    }

    #[test]
    fn unsigned_input_does_not_verify() {
        let from = p2wpkh_address(&pubkey_from_byte(2), NET).unwrap();
        let wtx = unsigned(&from, &[50_000]);
        assert!(!Signer::new().verify_input(&wtx, 0).unwrap());
    }

    #[test]
    fn parse_private_key_accepts_wif_and_hex() {
        let key = privkey_from_byte(5);
        let from_wif = parse_private_key(&key.to_wif(), NET).unwrap();
        assert_eq!(from_wif.inner, key.inner);

        let from_hex = parse_private_key(&hex::encode([5u8; 32]), NET).unwrap();
        assert_eq!(from_hex.inner, key.inner);
        assert!(from_hex.compressed);

        assert!(matches!(
            parse_private_key("zz", NET),
            Err(CoreError::InvalidKey(_))
        ));
    }

    // ==========================================================================
    // Multisig
    // ==========================================================================

    fn two_of_three() -> ScriptBuf {
        let keys = [pubkey_from_byte(1), pubkey_from_byte(2), pubkey_from_byte(3)];
        multisig_redeem_script(2, &keys).unwrap()
    }

    #[test]
    fn p2sh_two_of_three_combines() {
        let redeem = two_of_three();
        let mut wtx = multisig_tx(ScriptBuf::new_p2sh(&redeem.script_hash()));
        let signer = Signer::new();

        let a = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(1)).unwrap();
        let c = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(3)).unwrap();
        signer.combine_multisig(&mut wtx, 0, &redeem, &[a, c]).unwrap();

        let pushes = script_pushes(&wtx.tx.input[0].script_sig).unwrap();
        assert_eq!(pushes.len(), 4);
        assert!(pushes[0].is_empty());
        assert_eq!(pushes[3], redeem.to_bytes());
        assert!(wtx.tx.input[0].witness.is_empty());
        assert!(signer.verify_input(&wtx, 0).unwrap());
    }

    #[test]
    fn p2wsh_two_of_three_combines_into_witness() {
        let redeem = two_of_three();
        let mut wtx = multisig_tx(ScriptBuf::new_p2wsh(&redeem.wscript_hash()));
        let signer = Signer::new();

        let a = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(1)).unwrap();
        let b = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(2)).unwrap();
        signer.combine_multisig(&mut wtx, 0, &redeem, &[a, b]).unwrap();

        let input = &wtx.tx.input[0];
        assert!(input.script_sig.is_empty());
        assert_eq!(input.witness.len(), 4);
        assert_eq!(input.witness.nth(0), Some(&[][..]));
        assert_eq!(input.witness.last(), Some(redeem.as_bytes()));
        assert!(signer.verify_input(&wtx, 0).unwrap());
    }

    #[test]
    fn bare_two_of_three_combines_without_redeem_push() {
        let redeem = two_of_three();
        let mut wtx = multisig_tx(redeem.clone());
        let signer = Signer::new();
        assert!(!signer.verify_input(&wtx, 0).unwrap());

        let b = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(2)).unwrap();
        let c = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(3)).unwrap();
        signer.combine_multisig(&mut wtx, 0, &redeem, &[b, c]).unwrap();

        let input = &wtx.tx.input[0];
        let pushes = script_pushes(&input.script_sig).unwrap();
        assert_eq!(pushes.len(), 3);
        assert!(pushes[0].is_empty());
        assert_eq!(pushes[1], b.to_vec());
        assert_eq!(pushes[2], c.to_vec());
        assert!(input.witness.is_empty());
        assert!(signer.verify_input(&wtx, 0).unwrap());
    }

    #[test]
    fn wrapped_p2wsh_two_of_three_combines_into_both() {
        let redeem = two_of_three();
        let program = ScriptBuf::new_p2wsh(&redeem.wscript_hash());
        let mut wtx = multisig_tx(ScriptBuf::new_p2sh(&program.script_hash()));
        let signer = Signer::new();

        let a = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(1)).unwrap();
        let c = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(3)).unwrap();
        signer.combine_multisig(&mut wtx, 0, &redeem, &[a, c]).unwrap();

        let input = &wtx.tx.input[0];
        assert_eq!(script_pushes(&input.script_sig).unwrap(), vec![program.to_bytes()]);
        assert_eq!(input.witness.len(), 4);
        assert_eq!(input.witness.nth(0), Some(&[][..]));
        assert_eq!(input.witness.nth(1), Some(&a.to_vec()[..]));
        assert_eq!(input.witness.nth(2), Some(&c.to_vec()[..]));
        assert_eq!(input.witness.last(), Some(redeem.as_bytes()));
        assert!(signer.verify_input(&wtx, 0).unwrap());

        // one bad signature byte breaks the whole input
        let mut items: Vec<Vec<u8>> = input.witness.iter().map(<[u8]>::to_vec).collect();
        items[1][10] ^= 0x01;
        wtx.tx.input[0].witness = Witness::from_slice(&items);
        assert!(!signer.verify_input(&wtx, 0).unwrap());
    }

    #[test]
    fn wrapped_p2wsh_needs_multisign_not_sign() {
        let redeem = two_of_three();
        let program = ScriptBuf::new_p2wsh(&redeem.wscript_hash());
        let mut wtx = multisig_tx(ScriptBuf::new_p2sh(&program.script_hash()));
        let before = wtx.clone();

        let err = Signer::new().sign(&mut wtx, 0, &privkey_from_byte(1)).unwrap_err();
        assert!(matches!(err, CoreError::KeyMismatch(0)));
        assert_eq!(wtx, before);
    }

    #[test]
    fn wrapped_p2wsh_rejects_misordered_signatures() {
        let redeem = two_of_three();
        let program = ScriptBuf::new_p2wsh(&redeem.wscript_hash());
        let mut wtx = multisig_tx(ScriptBuf::new_p2sh(&program.script_hash()));
        let before = wtx.clone();
        let signer = Signer::new();

        let b = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(2)).unwrap();
        let c = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(3)).unwrap();
        let err = signer.combine_multisig(&mut wtx, 0, &redeem, &[c, b]).unwrap_err();
        assert!(matches!(err, CoreError::SignatureOrder { signature: 1 }));
        assert_eq!(wtx, before);
    }

    #[test]
    fn missing_spent_output_is_an_error() {
        let key = privkey_from_byte(1);
        let from = p2pkh_address(&pubkey_from_byte(1), NET);
        let mut wtx = unsigned(&from, &[50_000]);
        Signer::new().sign_all(&mut wtx, &key).unwrap();

        wtx.spent.clear();
        assert!(matches!(
            Signer::new().verify_input(&wtx, 0),
            Err(CoreError::InvalidTxData(_))
        ));
    }

    #[test]
    fn one_signature_is_insufficient() {
        let redeem = two_of_three();
        let mut wtx = multisig_tx(ScriptBuf::new_p2sh(&redeem.script_hash()));
        let before = wtx.clone();
        let signer = Signer::new();

        let a = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(1)).unwrap();
        let err = signer.combine_multisig(&mut wtx, 0, &redeem, &[a]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InsufficientSignatures {
                valid: 1,
                required: 2
            }
        ));
        assert_eq!(wtx, before);
    }

    #[test]
    fn misordered_signatures_are_rejected() {
        let redeem = two_of_three();
        let mut wtx = multisig_tx(ScriptBuf::new_p2sh(&redeem.script_hash()));
        let signer = Signer::new();

        let a = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(1)).unwrap();
        let c = signer.multisign(&wtx, 0, &redeem, &privkey_from_byte(3)).unwrap();
        let err = signer.combine_multisig(&mut wtx, 0, &redeem, &[c, a]).unwrap_err();
        assert!(matches!(err, CoreError::SignatureOrder { signature: 1 }));
    }

    #[test]
    fn outsider_cannot_multisign() {
        let redeem = two_of_three();
        let wtx = multisig_tx(ScriptBuf::new_p2sh(&redeem.script_hash()));
        let err = Signer::new()
            .multisign(&wtx, 0, &redeem, &privkey_from_byte(7))
            .unwrap_err();
        assert!(matches!(err, CoreError::KeyMismatch(0)));
    }

    #[test]
    fn redeem_script_must_match_spent_output() {
        let redeem = two_of_three();
        let wtx = multisig_tx(ScriptBuf::new_p2sh(&redeem.script_hash()));
        let other = multisig_redeem_script(1, &[pubkey_from_byte(1)]).unwrap();
        assert!(matches!(
            Signer::new().multisign(&wtx, 0, &other, &privkey_from_byte(1)),
            Err(CoreError::InvalidScript(_))
        ));
    }
}
