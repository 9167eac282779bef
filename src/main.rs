//! Hashgraph demo node.
//!
//! Usage: `hashgraph-node <port> [peer-port ...]`
//!
//! Each node listens on `127.0.0.1:<port>` and uses that address as its peer id, so peers can be
//! named directly in ACLs. Commands are read from stdin, one per line:
//!
//! ```text
//! create [read=a,b] [write=c]   start a topic
//! append <topic> <text...>      append to a topic
//! subscribe <topic>             subscribe to a topic
//! fetch <peer> <hash...>        ask a peer for blocks (e.g. a topic root)
//! tip <topic> | subs <topic> | get <hash>
//! ```
//!
//! Set `RUST_LOG=debug` to watch admission and backfill.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hashgraph::network::{make_endpoint, QuicListener, QuicTransport};
use hashgraph::{BlockEventAcl, Hashgraph, SyncAdapter, SyncConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = env::args().skip(1);
    let port = args
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(5000);
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let peer_id = addr.to_string();

    let endpoint = make_endpoint(addr)?;
    let transport = QuicTransport::new(peer_id.clone(), endpoint.clone());
    for peer_port in args {
        let peer_addr: SocketAddr = format!("127.0.0.1:{peer_port}")
            .parse()
            .with_context(|| format!("bad peer port {peer_port}"))?;
        transport.add_peer(peer_addr.to_string(), peer_addr);
    }

    let config = SyncConfig::default();
    let hashgraph = Hashgraph::new(peer_id.clone(), &config);
    let sync = SyncAdapter::new(hashgraph, Arc::new(transport), config);

    sync.handle_block(|block| {
        info!(
            hash = %block.hash,
            kind = %block.event.kind,
            author = %block.event.author,
            data = %block.event.data,
            "Committed"
        );
        Ok(())
    });

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(QuicListener::new(endpoint, inbox_tx).run());
    tokio::spawn(sync.clone().run(inbox_rx));

    info!(peer = %peer_id, "Node ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Err(err) = run_command(&sync, line.trim()).await {
            eprintln!("error: {err:#}");
        }
    }

    Ok(())
}

async fn run_command(sync: &SyncAdapter, line: &str) -> Result<()> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(());
    };

    match command {
        "create" => {
            let mut acl = BlockEventAcl::default();
            for arg in words {
                match arg.split_once('=') {
                    Some(("read", peers)) => acl.read.extend(peers.split(',').map(String::from)),
                    Some(("write", peers)) => acl.write.extend(peers.split(',').map(String::from)),
                    _ => bail!("expected read=... or write=..., got {arg}"),
                }
            }
            let block = sync.create_graph(acl).await?;
            println!("topic {}", block.hash);
        }
        "append" => {
            let topic = words.next().context("append <topic> <text>")?;
            let text = words.collect::<Vec<_>>().join(" ");
            let block = sync.append(topic, text).await?;
            println!("appended {}", block.hash);
        }
        "subscribe" => {
            let topic = words.next().context("subscribe <topic>")?;
            let block = sync.subscribe(topic).await?;
            println!("subscribed {}", block.hash);
        }
        "fetch" => {
            let peer = words.next().context("fetch <peer> <hash...>")?;
            sync.fetch(peer, words.map(String::from).collect()).await;
        }
        "tip" => {
            let topic = words.next().context("tip <topic>")?;
            for tip in sync.hashgraph().find_tip(topic).await? {
                println!("{tip}");
            }
        }
        "subs" => {
            let topic = words.next().context("subs <topic>")?;
            for peer in sync.hashgraph().find_subscribers(topic).await? {
                println!("{peer}");
            }
        }
        "get" => {
            let hash = words.next().context("get <hash>")?;
            let block = sync.get(hash).await?;
            println!("{}", serde_json::to_string_pretty(&block)?);
        }
        other => bail!("unknown command {other}"),
    }

    Ok(())
}
