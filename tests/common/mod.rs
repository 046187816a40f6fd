#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;

use kademlia_dht::framing::encode_frame;
use kademlia_dht::protocol::Envelope;
use kademlia_dht::{
    BlobStore, CallResult, Contact, DhtError, DhtNode, ForgetfulStorage, NodeId, Request,
    Transport,
};

pub type TestDht = DhtNode<TestNetwork, ForgetfulStorage>;

pub const STALENESS: Duration = Duration::from_secs(3600);

/// In-memory transport: calls are delivered straight to the peer registered
/// under the destination address. Requests that would not fit in a datagram
/// are rejected the way the UDP transport rejects them.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_addr: SocketAddr,
    failures: Arc<Mutex<HashSet<SocketAddr>>>,
    stores: Arc<Mutex<Vec<(SocketAddr, NodeId, usize)>>>,
    pings: Arc<Mutex<Vec<SocketAddr>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_addr: SocketAddr) -> Self {
        Self {
            registry,
            self_addr,
            failures: Arc::new(Mutex::new(HashSet::new())),
            stores: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_failure(&self, addr: SocketAddr, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(addr);
        } else {
            failures.remove(&addr);
        }
    }

    /// Store calls sent through this transport as `(to, key, value length)`.
    pub async fn store_calls(&self) -> Vec<(SocketAddr, NodeId, usize)> {
        let stores = self.stores.lock().await;
        stores.clone()
    }

    pub async fn ping_calls(&self) -> Vec<SocketAddr> {
        let calls = self.pings.lock().await;
        calls.clone()
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<SocketAddr, TestDht>>,
}

impl NetworkRegistry {
    pub async fn register(&self, addr: SocketAddr, node: &TestDht) {
        let mut peers = self.peers.write().await;
        peers.insert(addr, node.clone());
    }

    pub async fn unregister(&self, addr: &SocketAddr) {
        let mut peers = self.peers.write().await;
        peers.remove(addr);
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<TestDht> {
        let peers = self.peers.read().await;
        peers.get(addr).cloned()
    }
}

#[async_trait::async_trait]
impl Transport for TestNetwork {
    async fn call(&self, to: SocketAddr, request: Request) -> Result<CallResult, DhtError> {
        encode_frame(&Envelope::request(request.clone()))?;
        if self.failures.lock().await.contains(&to) {
            return Ok(CallResult::failure());
        }
        match &request {
            Request::Store { key, value, .. } => {
                self.stores.lock().await.push((to, *key, value.len()));
            }
            Request::Ping { .. } => self.pings.lock().await.push(to),
            _ => {}
        }
        match self.registry.get(&to).await {
            Some(peer) => Ok(CallResult::success(
                peer.handle_request(self.self_addr, request).await,
            )),
            None => Ok(CallResult::failure()),
        }
    }
}

pub struct TestNode {
    pub node: TestDht,
    pub network: TestNetwork,
    pub addr: SocketAddr,
    _data_dir: TempDir,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, k: usize) -> Self {
        Self::with_id(registry, make_node_id(index), index, k).await
    }

    pub async fn with_id(registry: Arc<NetworkRegistry>, id: NodeId, index: u32, k: usize) -> Self {
        let addr = make_addr(index);
        let data_dir = TempDir::new().expect("temp dir");
        let network = TestNetwork::new(registry.clone(), addr);
        let node = DhtNode::new(
            id,
            Arc::new(network.clone()),
            ForgetfulStorage::new(
                Duration::from_secs(604_800),
                NonZeroUsize::new(1024).expect("non-zero"),
            ),
            BlobStore::open(data_dir.path()).expect("blob store"),
            k,
            STALENESS,
        );
        registry.register(addr, &node).await;
        Self {
            node,
            network,
            addr,
            _data_dir: data_dir,
        }
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.node.id(), self.addr)
    }
}

pub fn make_addr(index: u32) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10_000 + (index % 50_000) as u16))
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 20];
    id[..4].copy_from_slice(&index.to_be_bytes());
    NodeId(id)
}

/// An id whose first byte is `byte` and every other byte is zero.
pub fn id_with_first_byte(byte: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[0] = byte;
    NodeId(id)
}

pub fn make_contact(index: u32) -> Contact {
    Contact::new(make_node_id(index), make_addr(index))
}
