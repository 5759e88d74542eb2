//! Address and locking-script classification.
//!
//! Maps addresses and key material to the closed set of spend types the
//! signer understands ([`ScriptSpec`]), and builds the corresponding
//! locking scripts, script codes and multisig redeem scripts.

use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, Instruction};
use bitcoin::{Address, CompressedPublicKey, Network, PublicKey, Script, ScriptBuf};

use crate::error::CoreError;
use crate::types::ScriptType;

/// Largest key count a standard `OP_CHECKMULTISIG` redeem script may carry.
pub const MAX_MULTISIG_KEYS: usize = 16;

// ==============================================================================
// Script Classification
// ==============================================================================

/// Classify a locking script using the `bitcoin` crate's detection methods.
#[must_use]
pub fn classify_script(script: &Script) -> ScriptType {
    if script.is_p2pkh() {
        ScriptType::P2pkh
    } else if script.is_p2sh() {
        ScriptType::P2sh
    } else if script.is_p2wpkh() {
        ScriptType::P2wpkh
    } else if script.is_p2wsh() {
        ScriptType::P2wsh
    } else if script.is_p2tr() {
        ScriptType::P2tr
    } else if script.is_p2pk() {
        ScriptType::P2pk
    } else if script.is_multisig() {
        ScriptType::BareMultisig
    } else if script.is_op_return() {
        ScriptType::OpReturn
    } else {
        ScriptType::Unknown
    }
}

/// Parse an address and check it belongs to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, CoreError> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| CoreError::InvalidAddress(format!("`{address}`: {e}")))?
        .require_network(network)
        .map_err(|e| CoreError::InvalidAddress(format!("`{address}` on {network}: {e}")))
}

/// Resolve an address to the locking script outputs paying it must carry.
pub fn address_to_script(address: &str, network: Network) -> Result<ScriptBuf, CoreError> {
    Ok(parse_address(address, network)?.script_pubkey())
}

/// Classify the spend type of an address.
pub fn classify_address(address: &str, network: Network) -> Result<ScriptType, CoreError> {
    Ok(classify_script(address_to_script(address, network)?.as_script()))
}

/// Render a locking script as an address. Scripts without an address form
/// (bare multisig, `OP_RETURN`, non-standard) are rejected.
pub fn script_to_address(script: &Script, network: Network) -> Result<String, CoreError> {
    Address::from_script(script, network)
        .map(|addr| addr.to_string())
        .map_err(|e| CoreError::InvalidScript(format!("script has no address form: {e}")))
}

/// ElectrumX channel key for a locking script: sha256 of the script,
/// byte-reversed, hex encoded.
#[must_use]
pub fn scripthash(script: &Script) -> String {
    let mut digest = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    digest.reverse();
    hex::encode(digest)
}

// ==============================================================================
// Multisig Redeem Scripts
// ==============================================================================

/// Build `m <pubkey>... n OP_CHECKMULTISIG`. Keys are kept in the order
/// given; reordering them would change the resulting address.
pub fn multisig_redeem_script(threshold: usize, pubkeys: &[PublicKey]) -> Result<ScriptBuf, CoreError> {
    if pubkeys.is_empty() || pubkeys.len() > MAX_MULTISIG_KEYS {
        return Err(CoreError::InvalidScript(format!(
            "multisig needs 1..={MAX_MULTISIG_KEYS} keys, got {}",
            pubkeys.len()
        )));
    }
    if threshold == 0 || threshold > pubkeys.len() {
        return Err(CoreError::InvalidScript(format!(
            "multisig threshold {threshold} out of range for {} keys",
            pubkeys.len()
        )));
    }

    let mut builder = Builder::new().push_int(threshold as i64);
    for pubkey in pubkeys {
        builder = builder.push_key(pubkey);
    }
    Ok(builder
        .push_int(pubkeys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Decode a redeem script built by [`multisig_redeem_script`] back into its
/// threshold and ordered keys.
pub fn parse_multisig(script: &Script) -> Result<(usize, Vec<PublicKey>), CoreError> {
    let invalid = |why: &str| CoreError::InvalidScript(format!("not a multisig script: {why}"));

    let mut instructions = script.instructions();
    let threshold = match instructions.next() {
        Some(Ok(Instruction::Op(op))) => small_int(op.to_u8()).ok_or_else(|| invalid("threshold"))?,
        _ => return Err(invalid("threshold")),
    };

    let mut pubkeys = Vec::new();
    let key_count = loop {
        match instructions.next() {
            Some(Ok(Instruction::PushBytes(bytes))) => {
                let pubkey = PublicKey::from_slice(bytes.as_bytes())
                    .map_err(|e| CoreError::InvalidScript(format!("bad multisig key: {e}")))?;
                pubkeys.push(pubkey);
            }
            Some(Ok(Instruction::Op(op))) => {
                break small_int(op.to_u8()).ok_or_else(|| invalid("key count"))?;
            }
            _ => return Err(invalid("truncated")),
        }
    };

    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_CHECKMULTISIG => {}
        _ => return Err(invalid("missing OP_CHECKMULTISIG")),
    }
    if instructions.next().is_some() {
        return Err(invalid("trailing data"));
    }
    if key_count != pubkeys.len() || threshold == 0 || threshold > key_count {
        return Err(invalid("threshold/key count mismatch"));
    }
    Ok((threshold, pubkeys))
}

// OP_1..OP_16
fn small_int(op: u8) -> Option<usize> {
    (0x51..=0x60).contains(&op).then(|| usize::from(op - 0x50))
}

/// P2SH multisig address for `pubkeys`, returned with its redeem script.
pub fn multisig_address(
    pubkeys: &[PublicKey],
    threshold: usize,
    network: Network,
) -> Result<(ScriptBuf, String), CoreError> {
    let redeem_script = multisig_redeem_script(threshold, pubkeys)?;
    let address = Address::p2sh(&redeem_script, network)
        .map_err(|e| CoreError::InvalidScript(format!("redeem script too large: {e}")))?;
    Ok((redeem_script, address.to_string()))
}

/// Native segwit (P2WSH) multisig address for `pubkeys`, returned with its
/// witness script.
pub fn multisig_segwit_address(
    pubkeys: &[PublicKey],
    threshold: usize,
    network: Network,
) -> Result<(ScriptBuf, String), CoreError> {
    let witness_script = multisig_redeem_script(threshold, pubkeys)?;
    let address = Address::p2wsh(&witness_script, network);
    Ok((witness_script, address.to_string()))
}

// ==============================================================================
// Key-derived Addresses
// ==============================================================================

fn compressed(pubkey: &PublicKey) -> Result<CompressedPublicKey, CoreError> {
    CompressedPublicKey::try_from(*pubkey)
        .map_err(|_| CoreError::InvalidKey("segwit requires a compressed public key".into()))
}

pub fn p2pkh_address(pubkey: &PublicKey, network: Network) -> String {
    Address::p2pkh(pubkey.pubkey_hash(), network).to_string()
}

pub fn p2sh_p2wpkh_address(pubkey: &PublicKey, network: Network) -> Result<String, CoreError> {
    Ok(Address::p2shwpkh(&compressed(pubkey)?, network).to_string())
}

pub fn p2wpkh_address(pubkey: &PublicKey, network: Network) -> Result<String, CoreError> {
    Ok(Address::p2wpkh(&compressed(pubkey)?, network).to_string())
}

/// Whether `address` is one of the segwit forms controlled by `pubkey`.
pub fn is_segwit(pubkey: &PublicKey, address: &str, network: Network) -> Result<bool, CoreError> {
    Ok(classify(address, pubkey, network)?.is_segwit())
}

/// Determine how `pubkey` spends outputs paying `address`.
pub fn classify(address: &str, pubkey: &PublicKey, network: Network) -> Result<ScriptSpec, CoreError> {
    let script = address_to_script(address, network)?;
    ScriptSpec::resolve_key(&script, pubkey).ok_or_else(|| {
        CoreError::InvalidAddress(format!("`{address}` is not controlled by the given key"))
    })
}

// ==============================================================================
// Script Spec
// ==============================================================================

/// The spend types the signer supports, each carrying what is needed to
/// build its locking script and to satisfy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSpec {
    /// Legacy pay-to-pubkey-hash.
    P2pkh { pubkey: PublicKey },
    /// Legacy pay-to-script-hash (P2SH multisig).
    P2sh { redeem_script: ScriptBuf },
    /// P2WPKH wrapped in P2SH.
    P2shP2wpkh { pubkey: CompressedPublicKey },
    /// P2WSH wrapped in P2SH.
    P2shP2wsh { witness_script: ScriptBuf },
    /// Native segwit pay-to-witness-pubkey-hash.
    P2wpkh { pubkey: CompressedPublicKey },
    /// Native segwit pay-to-witness-script-hash.
    P2wsh { witness_script: ScriptBuf },
    /// `m`-of-`n` multisig placed directly in the locking script.
    BareMultisig { threshold: usize, pubkeys: Vec<PublicKey> },
}

impl ScriptSpec {
    /// Single-key spec of the requested type.
    pub fn for_key(pubkey: PublicKey, kind: ScriptType) -> Result<Self, CoreError> {
        match kind {
            ScriptType::P2pkh => Ok(Self::P2pkh { pubkey }),
            ScriptType::P2wpkh => Ok(Self::P2wpkh {
                pubkey: compressed(&pubkey)?,
            }),
            ScriptType::P2sh => Ok(Self::P2shP2wpkh {
                pubkey: compressed(&pubkey)?,
            }),
            other => Err(CoreError::InvalidScript(format!(
                "no single-key spend for {other}"
            ))),
        }
    }

    /// Find the single-key spec of `pubkey` whose locking script equals
    /// `locking_script`.
    pub fn resolve_key(locking_script: &Script, pubkey: &PublicKey) -> Option<Self> {
        let mut candidates = vec![Self::P2pkh { pubkey: *pubkey }];
        if let Ok(cpk) = CompressedPublicKey::try_from(*pubkey) {
            candidates.push(Self::P2wpkh { pubkey: cpk });
            candidates.push(Self::P2shP2wpkh { pubkey: cpk });
        }
        candidates
            .into_iter()
            .find(|spec| spec.locking_script().as_script() == locking_script)
    }

    /// Find how `redeem_script` is committed to by `locking_script`: bare,
    /// behind P2SH, behind P2WSH, or behind P2SH-wrapped P2WSH.
    pub fn resolve_redeem(locking_script: &Script, redeem_script: &Script) -> Option<Self> {
        let owned = redeem_script.to_owned();
        let mut candidates = vec![
            Self::P2sh {
                redeem_script: owned.clone(),
            },
            Self::P2wsh {
                witness_script: owned.clone(),
            },
            Self::P2shP2wsh {
                witness_script: owned,
            },
        ];
        if let Ok((threshold, pubkeys)) = parse_multisig(redeem_script) {
            candidates.push(Self::BareMultisig { threshold, pubkeys });
        }
        candidates
            .into_iter()
            .find(|spec| spec.locking_script().as_script() == locking_script)
    }

    /// The script outputs paying this spec carry.
    pub fn locking_script(&self) -> ScriptBuf {
        match self {
            Self::P2pkh { pubkey } => ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()),
            Self::P2sh { redeem_script } => ScriptBuf::new_p2sh(&redeem_script.script_hash()),
            Self::P2shP2wpkh { pubkey } => {
                let redeem = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
                ScriptBuf::new_p2sh(&redeem.script_hash())
            }
            Self::P2shP2wsh { witness_script } => {
                let redeem = ScriptBuf::new_p2wsh(&witness_script.wscript_hash());
                ScriptBuf::new_p2sh(&redeem.script_hash())
            }
            Self::P2wpkh { pubkey } => ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()),
            Self::P2wsh { witness_script } => ScriptBuf::new_p2wsh(&witness_script.wscript_hash()),
            Self::BareMultisig { threshold, pubkeys } => {
                // Constructed through `multisig`, so the bounds already hold.
                multisig_redeem_script(*threshold, pubkeys).unwrap_or_default()
            }
        }
    }

    /// The script pushed in the unlocking script of P2SH-wrapped spends.
    pub fn redeem_script(&self) -> Option<ScriptBuf> {
        match self {
            Self::P2sh { redeem_script } => Some(redeem_script.clone()),
            Self::P2shP2wpkh { pubkey } => Some(ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())),
            Self::P2shP2wsh { witness_script } => {
                Some(ScriptBuf::new_p2wsh(&witness_script.wscript_hash()))
            }
            _ => None,
        }
    }

    /// The `script_code` committed to by the sighash for this spend.
    pub fn script_code(&self) -> ScriptBuf {
        match self {
            Self::P2pkh { pubkey } => ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()),
            Self::P2shP2wpkh { pubkey } | Self::P2wpkh { pubkey } => {
                ScriptBuf::new_p2pkh(&pubkey.pubkey_hash())
            }
            Self::P2sh { redeem_script } => redeem_script.clone(),
            Self::P2shP2wsh { witness_script } | Self::P2wsh { witness_script } => {
                witness_script.clone()
            }
            Self::BareMultisig { .. } => self.locking_script(),
        }
    }

    /// Whether this spend is signed under the segwit (BIP143) rule.
    pub fn is_segwit(&self) -> bool {
        matches!(
            self,
            Self::P2shP2wpkh { .. } | Self::P2shP2wsh { .. } | Self::P2wpkh { .. } | Self::P2wsh { .. }
        )
    }

    pub fn script_type(&self) -> ScriptType {
        match self {
            Self::P2pkh { .. } => ScriptType::P2pkh,
            Self::P2sh { .. } | Self::P2shP2wpkh { .. } | Self::P2shP2wsh { .. } => ScriptType::P2sh,
            Self::P2wpkh { .. } => ScriptType::P2wpkh,
            Self::P2wsh { .. } => ScriptType::P2wsh,
            Self::BareMultisig { .. } => ScriptType::BareMultisig,
        }
    }

    /// Address form of the locking script; `None` for bare multisig.
    pub fn address(&self, network: Network) -> Option<String> {
        script_to_address(&self.locking_script(), network).ok()
    }

    /// A bare multisig spec with validated bounds.
    pub fn multisig(threshold: usize, pubkeys: Vec<PublicKey>) -> Result<Self, CoreError> {
        multisig_redeem_script(threshold, &pubkeys)?;
        Ok(Self::BareMultisig { threshold, pubkeys })
    }
}
