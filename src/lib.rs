//! # Kademlia DHT
//!
//! This crate implements the protocol core of a Kademlia distributed hash
//! table node: a 160-bit XOR routing table with lazily split k-buckets and
//! replacement caches, the RPC handlers a node answers, liveness tracking of
//! peers, replication of stored keys to newly discovered peers, and the
//! selection of refresh targets for quiet buckets.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: node ids, XOR distance, contacts, k-buckets and the
//!   [`RoutingTable`].
//! - [`storage`]: the [`Storage`] trait with the TTL bounded
//!   [`ForgetfulStorage`], and the on-disk [`BlobStore`] for bulk values.
//! - [`node`]: the transport-agnostic [`DhtNode`] state machine and the
//!   [`Transport`] trait it sends through.
//! - [`protocol`]: the JSON serialisable wire messages exchanged between peers.
//! - [`framing`]: datagram encoding with a hard size bound.
//! - [`net`]: a UDP [`Transport`] implementation.
//! - [`server`]: the receive loop hosting a node on a [`UdpTransport`].
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use kademlia_dht::{serve, BlobStore, DhtNode, ForgetfulStorage, NodeConfig, NodeId, UdpTransport};
//!
//! # async fn launch(config: NodeConfig) -> Result<()> {
//! let transport = UdpTransport::bind(config.bind, config.rpc_timeout).await?;
//! let node = DhtNode::new(
//!     NodeId::random(),
//!     transport.clone(),
//!     ForgetfulStorage::new(config.storage_ttl, config.storage_capacity),
//!     BlobStore::open(&config.data_dir)?,
//!     config.ksize,
//!     config.staleness,
//! );
//! tokio::spawn(serve(transport, Arc::new(node.clone())));
//! // Peers that contact us are now admitted into the routing table.
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces together with bootstrap
//! and a periodic bucket refresh.

pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod net;
pub mod node;
pub mod protocol;
pub mod server;
pub mod storage;

pub use config::NodeConfig;
pub use core::{distance_cmp, AddOutcome, Contact, KBucket, NodeId, RoutingTable};
pub use error::DhtError;
pub use net::UdpTransport;
pub use node::{DhtNode, Transport, ValueOrNodes};
pub use protocol::{CallResult, Request, Response};
pub use server::{serve, RequestHandler};
pub use storage::{Blob, BlobLookup, BlobStore, ForgetfulStorage, Storage, WriteOutcome};
