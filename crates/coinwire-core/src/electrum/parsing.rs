use bitcoin::block::Header;
use bitcoin::consensus::encode;
use bitcoin::{Transaction, Txid};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CoreError;
use crate::tx::deserialize_hex;
use crate::types::{
    AddressStatus, Balance, BlockHeader, HeaderNotification, HistoryEntry, MerkleBranch,
    UnspentOutput,
};

const HEADER_SIZE: usize = 80;

fn from_value<T: DeserializeOwned>(raw: Value, what: &str) -> Result<T, CoreError> {
    serde_json::from_value(raw).map_err(|e| CoreError::Protocol(format!("invalid {what}: {e}")))
}

pub(super) fn parse_balance(raw: Value) -> Result<Balance, CoreError> {
    from_value(raw, "balance")
}

pub(super) fn parse_history(raw: Value) -> Result<Vec<HistoryEntry>, CoreError> {
    from_value(raw, "history")
}

#[derive(serde::Deserialize)]
struct ListUnspentItem {
    tx_hash: Txid,
    tx_pos: u32,
    height: u32,
    value: u64,
}

pub(super) fn parse_unspents(raw: Value, address: &str) -> Result<Vec<UnspentOutput>, CoreError> {
    let items: Vec<ListUnspentItem> = from_value(raw, "listunspent result")?;
    Ok(items
        .into_iter()
        .map(|item| UnspentOutput {
            tx_hash: item.tx_hash,
            tx_pos: item.tx_pos,
            value: item.value,
            height: item.height,
            address: address.to_owned(),
            proven: None,
        })
        .collect())
}

fn decode_raw_header(bytes: &[u8]) -> Result<Header, CoreError> {
    encode::deserialize(bytes).map_err(|e| CoreError::Protocol(format!("invalid block header: {e}")))
}

/// `blockchain.block.header` answers the header as 160 hex characters.
pub(super) fn parse_header(height: u32, raw: Value) -> Result<BlockHeader, CoreError> {
    let hex_str: String = from_value(raw, "block header")?;
    let bytes = hex::decode(&hex_str)
        .map_err(|e| CoreError::Protocol(format!("block header hex: {e}")))?;
    Ok(BlockHeader::from_raw(height, &decode_raw_header(&bytes)?))
}

#[derive(serde::Deserialize)]
struct HeadersChunk {
    count: u32,
    hex: String,
    max: u32,
}

/// `blockchain.block.headers` answers `{count, hex, max}` with the headers
/// concatenated. Returns the headers and the server's chunk limit.
pub(super) fn parse_headers(start: u32, raw: Value) -> Result<(Vec<BlockHeader>, u32), CoreError> {
    let chunk: HeadersChunk = from_value(raw, "block headers")?;
    let bytes = hex::decode(&chunk.hex)
        .map_err(|e| CoreError::Protocol(format!("block headers hex: {e}")))?;
    if bytes.len() != chunk.count as usize * HEADER_SIZE {
        return Err(CoreError::Protocol(format!(
            "block headers: expected {} headers, got {} bytes",
            chunk.count,
            bytes.len()
        )));
    }
    let headers = bytes
        .chunks_exact(HEADER_SIZE)
        .zip(start..)
        .map(|(raw, height)| Ok(BlockHeader::from_raw(height, &decode_raw_header(raw)?)))
        .collect::<Result<Vec<_>, CoreError>>()?;
    Ok((headers, chunk.max))
}

#[derive(serde::Deserialize)]
struct RawHeaderNotification {
    height: u32,
    hex: String,
}

/// Payload of `blockchain.headers.subscribe`: `{height, hex}`.
pub(super) fn parse_header_notification(raw: Value) -> Result<HeaderNotification, CoreError> {
    let tip: RawHeaderNotification = from_value(raw, "header notification")?;
    let bytes = hex::decode(&tip.hex)
        .map_err(|e| CoreError::Protocol(format!("header notification hex: {e}")))?;
    Ok(HeaderNotification::from_raw(tip.height, &decode_raw_header(&bytes)?))
}

pub(super) fn parse_tip_height(raw: Value) -> Result<u32, CoreError> {
    Ok(from_value::<RawHeaderNotification>(raw, "header notification")?.height)
}

pub(super) fn parse_address_status(address: &str, raw: Value) -> Result<AddressStatus, CoreError> {
    Ok(AddressStatus {
        address: address.to_owned(),
        status: from_value(raw, "address status")?,
    })
}

pub(super) fn parse_merkle(raw: Value) -> Result<MerkleBranch, CoreError> {
    from_value(raw, "merkle branch")
}

pub(super) fn parse_txid(raw: Value) -> Result<Txid, CoreError> {
    from_value(raw, "transaction hash")
}

pub(super) fn parse_transaction(raw: Value) -> Result<Transaction, CoreError> {
    let hex_str: String = from_value(raw, "raw transaction")?;
    deserialize_hex(&hex_str)
}
