//! DHT node binary.
//!
//! Starts a node on a UDP socket, bootstraps from the given peers and then
//! periodically refreshes quiet buckets until interrupted.
//!
//! # Usage
//!
//! ```bash
//! kademlia-dht --bind 127.0.0.1:8468 --bootstrap 127.0.0.1:8469
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kademlia_dht::config::{DEFAULT_KSIZE, DEFAULT_REFRESH_INTERVAL};
use kademlia_dht::{
    serve, BlobStore, Contact, DhtNode, ForgetfulStorage, NodeConfig, NodeId, Request, Response,
    Storage, Transport, UdpTransport,
};

#[derive(Parser, Debug)]
#[command(name = "kademlia-dht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:8468")]
    bind: SocketAddr,

    /// Directory holding the blob store.
    #[arg(short, long, default_value = "store")]
    data_dir: PathBuf,

    /// Bucket size and replication factor.
    #[arg(short, long, default_value_t = DEFAULT_KSIZE)]
    ksize: usize,

    /// Node id as 40 hex characters; random when omitted.
    #[arg(long)]
    id: Option<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Seconds between bucket refresh rounds.
    #[arg(short, long, default_value_t = DEFAULT_REFRESH_INTERVAL.as_secs())]
    refresh_secs: u64,
}

impl Args {
    fn config(&self) -> NodeConfig {
        NodeConfig {
            bind: self.bind,
            data_dir: self.data_dir.clone(),
            ksize: self.ksize.max(1),
            refresh_interval: Duration::from_secs(self.refresh_secs.max(1)),
            ..NodeConfig::default()
        }
    }
}

type Node = DhtNode<UdpTransport, ForgetfulStorage>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = args.config();
    let id = match &args.id {
        Some(hex) => NodeId::from_hex(hex).context("invalid --id")?,
        None => NodeId::random(),
    };

    let transport = UdpTransport::bind(config.bind, config.rpc_timeout)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let blobs = BlobStore::open(&config.data_dir)
        .with_context(|| format!("failed to open blob store at {}", config.data_dir.display()))?;
    let storage = ForgetfulStorage::new(config.storage_ttl, config.storage_capacity);
    let node = DhtNode::new(id, transport.clone(), storage, blobs, config.ksize, config.staleness);

    info!("DHT node started");
    info!("  NodeId (hex): {}", id);
    info!("  Listening on: {}", transport.local_addr()?);

    let server = tokio::spawn(serve(transport.clone(), Arc::new(node.clone())));

    for addr in &args.bootstrap {
        bootstrap(&node, &transport, *addr).await;
    }

    let mut interval = time::interval(config.refresh_interval);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, waiting for detached calls");
                node.settle().await;
                break;
            }
            _ = interval.tick() => {
                refresh(&node, config.alpha).await;
                info!(
                    contacts = node.contacts().len(),
                    stored_keys = node.with_storage(|storage| storage.len()),
                    in_flight = transport.in_flight(),
                    "refresh round complete"
                );
            }
        }
    }

    server.abort();
    Ok(())
}

/// Ping a peer known only by address and admit it if it answers.
async fn bootstrap(node: &Node, transport: &UdpTransport, addr: SocketAddr) {
    info!("Bootstrapping from {}", addr);
    let result = match transport.call(addr, Request::Ping { sender_id: node.id() }).await {
        Ok(result) => result,
        Err(err) => {
            warn!(%addr, error = %err, "Bootstrap failed");
            return;
        }
    };
    match &result.payload {
        Some(Response::Pong(peer_id)) => {
            let contact = Contact::new(*peer_id, addr);
            node.handle_call_response(result.clone(), &contact);
            info!(peer = %contact, "Bootstrap complete");
        }
        _ => warn!(%addr, "Bootstrap failed: no pong"),
    }
}

/// Ask the nearest known peers about each lonely bucket's refresh target and
/// ping whatever new contacts they report.
async fn refresh(node: &Node, alpha: usize) {
    let targets = node.get_refresh_ids();
    for target in targets {
        let askees: Vec<Contact> = node.neighbors(&target).into_iter().take(alpha).collect();
        let results =
            future::join_all(askees.iter().map(|peer| node.call_find_node(peer, &target))).await;

        let discovered: Vec<Contact> = results
            .into_iter()
            .filter_map(|result| match result.ok()?.payload {
                Some(Response::Nodes(contacts)) => Some(contacts),
                _ => None,
            })
            .flatten()
            .filter(|contact| contact.id != node.id() && !node.knows(&contact.id))
            .collect();

        future::join_all(discovered.iter().map(|contact| node.call_ping(contact))).await;
    }
}
