//! Unsigned transaction assembly.
//!
//! Input selection is caller supplied; [`select_unspents`] is only a helper
//! for the wallet compositions. Builds are deterministic: the same inputs,
//! outputs and fee always produce byte-identical unsigned transactions.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use tracing::debug;

use crate::error::CoreError;
use crate::params::ChainParams;
use crate::script::address_to_script;
use crate::tx::{Destination, Payment, WalletTx};
use crate::types::UnspentOutput;

#[derive(Debug, Clone)]
pub struct TxBuilder {
    network: Network,
    dust_threshold: Amount,
    version: Version,
    lock_time: LockTime,
    sequence: Sequence,
}

impl TxBuilder {
    pub fn new(params: &ChainParams) -> Self {
        Self {
            network: params.network,
            dust_threshold: params.dust_threshold,
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            sequence: Sequence::MAX,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_lock_time(mut self, lock_time: LockTime) -> Self {
        self.lock_time = lock_time;
        self
    }

    /// Sequence applied to every input.
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn dust_threshold(&self) -> Amount {
        self.dust_threshold
    }

    /// Build a transaction spending every unspent in order and paying
    /// exactly `outputs`. Anything left over after `fee` stays implicit.
    pub fn build(
        &self,
        unspents: &[UnspentOutput],
        outputs: &[Payment],
        fee: Amount,
    ) -> Result<WalletTx, CoreError> {
        let total_in = sum_unspents(unspents)?;
        let total_out = sum_payments(outputs)?;
        let required = total_out
            .checked_add(fee)
            .ok_or_else(|| CoreError::InvalidTxData("output total overflows".into()))?;
        if total_in < required {
            return Err(CoreError::InsufficientFunds {
                available: total_in.to_sat(),
                required: required.to_sat(),
            });
        }

        let (input, spent) = self.inputs(unspents)?;
        let output = outputs
            .iter()
            .map(|payment| self.output(payment))
            .collect::<Result<Vec<_>, _>>()?;

        let tx = Transaction {
            version: self.version,
            lock_time: self.lock_time,
            input,
            output,
        };
        debug!(
            inputs = tx.input.len(),
            outputs = tx.output.len(),
            total_in = total_in.to_sat(),
            total_out = total_out.to_sat(),
            "built transaction"
        );
        WalletTx::new(tx, spent)
    }

    /// Like [`build`](Self::build), appending a change output to
    /// `change_address` when the change exceeds the dust threshold. Smaller
    /// change is left to the fee.
    pub fn build_with_change(
        &self,
        unspents: &[UnspentOutput],
        outputs: &[Payment],
        change_address: &str,
        fee: Amount,
    ) -> Result<WalletTx, CoreError> {
        let change_script = address_to_script(change_address, self.network)?;
        let total_in = sum_unspents(unspents)?;
        let total_out = sum_payments(outputs)?;
        let required = total_out
            .checked_add(fee)
            .ok_or_else(|| CoreError::InvalidTxData("output total overflows".into()))?;
        let change = total_in
            .checked_sub(required)
            .ok_or(CoreError::InsufficientFunds {
                available: total_in.to_sat(),
                required: required.to_sat(),
            })?;

        let mut payments = outputs.to_vec();
        if change > self.dust_threshold {
            payments.push(Payment::to_script(change_script, change.to_sat()));
        } else {
            debug!(change = change.to_sat(), "change at or below dust, folded into fee");
        }
        self.build(unspents, &payments, fee)
    }

    fn inputs(&self, unspents: &[UnspentOutput]) -> Result<(Vec<TxIn>, Vec<TxOut>), CoreError> {
        unspents
            .iter()
            .map(|utxo| {
                let script_pubkey = address_to_script(&utxo.address, self.network)?;
                let input = TxIn {
                    previous_output: utxo.outpoint(),
                    script_sig: ScriptBuf::new(),
                    sequence: self.sequence,
                    witness: Witness::default(),
                };
                let spent = TxOut {
                    value: Amount::from_sat(utxo.value),
                    script_pubkey,
                };
                Ok((input, spent))
            })
            .collect::<Result<Vec<_>, CoreError>>()
            .map(|pairs| pairs.into_iter().unzip())
    }

    fn output(&self, payment: &Payment) -> Result<TxOut, CoreError> {
        let script_pubkey = match &payment.destination {
            Destination::Address(address) => address_to_script(address, self.network)?,
            Destination::Script(script) => script.clone(),
        };
        Ok(TxOut {
            value: payment.value,
            script_pubkey,
        })
    }
}

fn sum_unspents(unspents: &[UnspentOutput]) -> Result<Amount, CoreError> {
    unspents
        .iter()
        .try_fold(Amount::ZERO, |acc, u| acc.checked_add(Amount::from_sat(u.value)))
        .ok_or_else(|| CoreError::InvalidTxData("input total overflows".into()))
}

fn sum_payments(outputs: &[Payment]) -> Result<Amount, CoreError> {
    outputs
        .iter()
        .try_fold(Amount::ZERO, |acc, p| acc.checked_add(p.value))
        .ok_or_else(|| CoreError::InvalidTxData("output total overflows".into()))
}

/// Largest-first selection of unspents covering `target` satoshis.
pub fn select_unspents(
    unspents: &[UnspentOutput],
    target: u64,
) -> Result<Vec<UnspentOutput>, CoreError> {
    let mut sorted: Vec<&UnspentOutput> = unspents.iter().collect();
    // Ties broken by outpoint so selection never depends on input order.
    sorted.sort_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then_with(|| a.outpoint().cmp(&b.outpoint()))
    });

    let mut selected = Vec::new();
    let mut total: u64 = 0;
    for utxo in sorted {
        if total >= target && !selected.is_empty() {
            break;
        }
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.value);
    }

    if total < target || selected.is_empty() {
        return Err(CoreError::InsufficientFunds {
            available: total,
            required: target,
        });
    }
    Ok(selected)
}
