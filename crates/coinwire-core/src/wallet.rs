//! Build, sign and broadcast in one call.
//!
//! These compose the builder, the signer and a [`ChainQuery`] backend. All
//! construction errors surface before anything is sent: a transaction is
//! only broadcast once every input is signed and verifies.

use bitcoin::{Amount, PrivateKey, Txid};
use tracing::{info, warn};

use crate::builder::{select_unspents, TxBuilder};
use crate::electrum::ChainQuery;
use crate::error::CoreError;
use crate::params::ChainParams;
use crate::script::address_to_script;
use crate::sign::Signer;
use crate::tx::{Destination, Payment, WalletTx};

/// Unsigned transaction from `from` paying `outputs`, with change back to
/// `from`. Unspents are fetched and selected largest first.
pub async fn prepare_tx<Q: ChainQuery + ?Sized>(
    query: &Q,
    params: &ChainParams,
    from: &str,
    outputs: &[Payment],
    fee: Amount,
) -> Result<WalletTx, CoreError> {
    address_to_script(from, params.network)?;
    for payment in outputs {
        if let Destination::Address(address) = &payment.destination {
            address_to_script(address, params.network)?;
        }
    }
    let target = outputs
        .iter()
        .try_fold(fee, |acc, p| acc.checked_add(p.value))
        .ok_or_else(|| CoreError::InvalidTxData("output total overflows".into()))?;

    let unspents = query.unspent(from).await?;
    let selected = select_unspents(&unspents, target.to_sat())?;
    TxBuilder::new(params).build_with_change(&selected, outputs, from, fee)
}

/// Pay `value` satoshis from `from` to `to`.
pub async fn send<Q: ChainQuery + ?Sized>(
    query: &Q,
    params: &ChainParams,
    key: &PrivateKey,
    from: &str,
    to: &str,
    value: u64,
    fee: Amount,
) -> Result<Txid, CoreError> {
    send_multi(query, params, key, from, &[Payment::to_address(to, value)], fee).await
}

/// Pay every output in one transaction, signed with `key`. Returns the hash
/// the server reports for the broadcast.
pub async fn send_multi<Q: ChainQuery + ?Sized>(
    query: &Q,
    params: &ChainParams,
    key: &PrivateKey,
    from: &str,
    outputs: &[Payment],
    fee: Amount,
) -> Result<Txid, CoreError> {
    let mut wtx = prepare_tx(query, params, from, outputs, fee).await?;
    let signer = Signer::new();
    signer.sign_all(&mut wtx, key)?;
    for index in 0..wtx.tx.input.len() {
        if !signer.verify_input(&wtx, index)? {
            return Err(CoreError::KeyMismatch(index));
        }
    }

    let local = wtx.txid();
    let reported = query.pushtx(&wtx.to_hex()).await?;
    if reported != local {
        warn!(%local, %reported, "server reported a different transaction hash");
    }
    info!(txid = %reported, inputs = wtx.tx.input.len(), "transaction sent");
    Ok(reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;

    use crate::electrum::mock::MockChain;
    use crate::script::{p2pkh_address, p2wpkh_address};
    use crate::test_util::{make_unspent, privkey_from_byte, pubkey_from_byte};
    use crate::tx::deserialize_hex;

    fn native(b: u8) -> String {
        p2wpkh_address(&pubkey_from_byte(b), Network::Regtest).unwrap()
    }

    fn funded(from: &str) -> MockChain {
        MockChain::builder()
            .with_unspents(
                from,
                vec![
                    make_unspent(1, 0, 40_000, 10, from),
                    make_unspent(2, 1, 25_000, 11, from),
                    make_unspent(3, 0, 5_000, 12, from),
                ],
            )
            .build()
    }

    #[tokio::test]
    async fn prepare_selects_largest_first_with_change() {
        let from = native(1);
        let chain = funded(&from);
        let params = ChainParams::regtest();
        let wtx = prepare_tx(
            &chain,
            &params,
            &from,
            &[Payment::to_address(native(2), 50_000)],
            Amount::from_sat(1_000),
        )
        .await
        .unwrap();

        assert_eq!(wtx.tx.input.len(), 2);
        assert_eq!(wtx.tx.output.len(), 2);
        assert_eq!(wtx.tx.output[1].value, Amount::from_sat(14_000));
        assert_eq!(wtx.fee(), Some(Amount::from_sat(1_000)));
    }

    #[tokio::test]
    async fn bad_destination_is_rejected_before_fetching() {
        let from = native(1);
        let chain = funded(&from);
        let err = prepare_tx(
            &chain,
            &ChainParams::regtest(),
            &from,
            &[Payment::to_address("bc1qnotanaddress", 1_000)],
            Amount::from_sat(500),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn send_broadcasts_signed_transaction() {
        let from = native(1);
        let chain = funded(&from);
        let txid = send(
            &chain,
            &ChainParams::regtest(),
            &privkey_from_byte(1),
            &from,
            &native(2),
            30_000,
            Amount::from_sat(800),
        )
        .await
        .unwrap();

        let pushed = chain.broadcasts();
        assert_eq!(pushed.len(), 1);
        let tx = deserialize_hex(&pushed[0]).unwrap();
        assert_eq!(tx.compute_txid(), txid);
        assert!(tx.input.iter().all(|i| i.script_sig.is_empty() && i.witness.len() == 2));
    }

    #[tokio::test]
    async fn legacy_source_gets_script_sigs() {
        let from = p2pkh_address(&pubkey_from_byte(5), Network::Regtest);
        let chain = funded(&from);
        send(
            &chain,
            &ChainParams::regtest(),
            &privkey_from_byte(5),
            &from,
            &native(2),
            10_000,
            Amount::from_sat(800),
        )
        .await
        .unwrap();
        let tx = deserialize_hex(&chain.broadcasts()[0]).unwrap();
        assert!(tx.input.iter().all(|i| !i.script_sig.is_empty() && i.witness.is_empty()));
    }

    #[tokio::test]
    async fn nothing_is_sent_on_construction_errors() {
        let from = native(1);
        let chain = funded(&from);
        let params = ChainParams::regtest();

        let short = send(&chain, &params, &privkey_from_byte(1), &from, &native(2), 70_000, Amount::from_sat(1))
            .await
            .unwrap_err();
        assert!(matches!(short, CoreError::InsufficientFunds { available: 70_000, required: 70_001 }));

        let foreign = send(&chain, &params, &privkey_from_byte(9), &from, &native(2), 1_000, Amount::from_sat(500))
            .await
            .unwrap_err();
        assert!(matches!(foreign, CoreError::KeyMismatch(_)));

        assert!(chain.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn rejection_is_reported_as_such() {
        let from = native(1);
        let chain = MockChain::builder()
            .with_unspents(&from, vec![make_unspent(1, 0, 40_000, 10, &from)])
            .rejecting("min relay fee not met")
            .build();
        let err = send(
            &chain,
            &ChainParams::regtest(),
            &privkey_from_byte(1),
            &from,
            &native(2),
            1_000,
            Amount::from_sat(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::BroadcastRejected(reason) if reason.contains("relay fee")));
    }
}
