mod cli;

use std::sync::Arc;
use std::time::Duration;

use bitcoin::Amount;
use clap::Parser;
use eyre::{eyre, WrapErr};
use futures::{Stream, StreamExt};
use serde::Serialize;

use coinwire_core::electrum::{Connector, TcpConnector};
use coinwire_core::sign::parse_private_key;
use coinwire_core::{merkle, wallet, ChainParams, CoreError, ElectrumClient, SessionConfig};

use cli::Command;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let params = ChainParams::from_name(&args.chain)
        .ok_or_else(|| eyre!("unknown chain `{}`; expected mainnet, testnet, signet or regtest", args.chain))?;
    let server = match &args.server {
        Some(server) => server.clone(),
        None => params
            .default_servers
            .first()
            .map(|s| (*s).to_owned())
            .ok_or_else(|| eyre!("no default server for {}; pass --server", params.display_name))?,
    };

    let config = SessionConfig {
        request_timeout: Duration::from_secs(args.timeout_secs),
        requests_per_second: args.requests_per_second,
        ..SessionConfig::default()
    };
    let client = ElectrumClient::connect(params.clone(), connector(&server, args.tls)?, config)
        .await
        .map_err(|err| eyre!(format_connect_error(&server, &err)))
        .wrap_err("while connecting to the ElectrumX server")?;

    if let Some(version) = client.session().server_version() {
        tracing::info!(
            server = %server,
            software = %version.software,
            protocol = %version.protocol,
            chain = params.display_name,
            "connected"
        );
    }

    let outcome = run(&client, &params, args.command).await;
    client.close().await;
    outcome
}

async fn run(client: &ElectrumClient, params: &ChainParams, command: Command) -> eyre::Result<()> {
    match command {
        Command::Balance {
            addresses,
            merkle_proof,
        } => {
            if merkle_proof {
                print_each(client.balances_merkle_proven(&addresses)).await
            } else {
                print_each(client.get_balances(&addresses)).await
            }
        }
        Command::History {
            address,
            merkle_proof,
        } => print_json(&client.history(&address, merkle_proof).await.wrap_err("fetch history")?),
        Command::Unspent {
            address,
            merkle_proof,
        } => print_json(&client.unspent(&address, merkle_proof).await.wrap_err("fetch unspents")?),
        Command::Header { height } => {
            print_json(&client.block_header(height).await.wrap_err("fetch block header")?)
        }
        Command::Headers { start, count } => print_each(client.block_headers(start, count)).await,
        Command::MerkleProof { txid, height } => {
            print_json(&merkle::prove(client, &txid, height).await.wrap_err("check merkle proof")?)
        }
        Command::Tx { txid } => print_json(&client.get_tx(&txid).await.wrap_err("fetch transaction")?),
        Command::Broadcast { raw_tx } => {
            let txid = client.pushtx(&raw_tx).await.wrap_err("broadcast transaction")?;
            print_json(&txid)
        }
        Command::Send {
            key,
            from,
            to,
            value,
            fee,
        } => {
            let key = parse_private_key(&key, params.network).wrap_err("parse private key")?;
            let txid = wallet::send(client, params, &key, &from, &to, value, Amount::from_sat(fee))
                .await
                .wrap_err("send transaction")?;
            print_json(&txid)
        }
        Command::WatchHeaders => {
            let tips = client
                .subscribe_to_block_headers()
                .await
                .wrap_err("subscribe to block headers")?;
            watch(tips).await
        }
        Command::WatchAddress { address } => {
            let updates = client
                .subscribe_to_address(&address)
                .await
                .wrap_err("subscribe to address")?;
            watch(updates).await
        }
    }
}

fn connector(server: &str, tls: bool) -> eyre::Result<Arc<dyn Connector>> {
    if tls {
        #[cfg(feature = "tls")]
        return Ok(Arc::new(
            coinwire_core::electrum::TlsConnector::new(server).wrap_err("configure TLS")?,
        ));
        #[cfg(not(feature = "tls"))]
        return Err(eyre!("--tls needs a build with the `tls` feature"));
    }
    Ok(Arc::new(TcpConnector::new(server)))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).wrap_err("encode output")?);
    Ok(())
}

/// One JSON line per item, in arrival order.
async fn print_each<T, S>(stream: S) -> eyre::Result<()>
where
    T: Serialize,
    S: Stream<Item = Result<T, CoreError>>,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(item) = stream.next().await {
        println!("{}", serde_json::to_string(&item?).wrap_err("encode output")?);
    }
    Ok(())
}

/// Print notifications until the stream ends or Ctrl-C.
async fn watch<T: Serialize>(mut stream: impl Stream<Item = T> + Unpin) -> eyre::Result<()> {
    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(item) => println!("{}", serde_json::to_string(&item).wrap_err("encode output")?),
                None => {
                    tracing::warn!("subscription ended; the connection was lost or closed");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn format_connect_error(server: &str, err: &CoreError) -> String {
    let mut lines = vec![
        format!("could not open a session with `{server}`"),
        format!("error: {err}"),
    ];
    match err {
        CoreError::ConnectionLost(_) | CoreError::Io(_) => lines.push(
            "hint: check that the host is reachable and the port is the plain TCP one (usually 50001)"
                .into(),
        ),
        CoreError::Timeout(_) => lines.push(
            "hint: the server accepted the connection but did not answer; TLS ports (usually 50002) need --tls"
                .into(),
        ),
        CoreError::ServerError { .. } => lines.push(
            "hint: the server refused the handshake; it may not support protocol 1.4".into(),
        ),
        _ => {}
    }
    lines.join("\n")
}
