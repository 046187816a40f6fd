//! The protocol brain of a single node.
//!
//! [`DhtNode`] answers inbound RPCs, wraps outbound ones, and keeps the
//! routing table honest: every peer that talks to us, or answers us, is
//! admitted through [`DhtNode::welcome_if_new`], and every peer that fails to
//! answer is evicted through [`DhtNode::handle_call_response`]. Admission of a
//! genuinely new peer also decides which locally held keys the newcomer should
//! help store and pushes them with detached `store` calls.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, info, warn, Instrument, Span};

use crate::core::{AddOutcome, Contact, NodeId, RoutingTable};
use crate::error::DhtError;
use crate::protocol::{CallResult, Request, Response};
use crate::storage::{Blob, BlobStore, Storage};

// ─────────────────────────────────────────────────────────────────────────────
// Transport Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Request/response transport used for outbound RPCs.
///
/// Implementations deliver `request` to `to` and wait for the answer. A peer
/// that does not answer in time yields `Ok(CallResult::failure())`; the
/// transport owns timeouts and retries, the node adds none of its own.
///
/// `Err` means the request never left this node (it could not be encoded or
/// does not fit a datagram). That says nothing about the peer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, to: SocketAddr, request: Request) -> Result<CallResult, DhtError>;
}

/// Answer to `find_value`: the value itself, or the nearest contacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueOrNodes {
    Value(Vec<u8>),
    Nodes(Vec<Contact>),
}

impl From<ValueOrNodes> for Response {
    fn from(result: ValueOrNodes) -> Self {
        match result {
            ValueOrNodes::Value(value) => Response::Value(value),
            ValueOrNodes::Nodes(nodes) => Response::Nodes(nodes),
        }
    }
}

/// Decide whether `newcomer` should receive a copy of `key`.
///
/// `neighbors` are the k nearest contacts to `key` known before the newcomer
/// is admitted, nearest first. With no neighbors at all the key is always
/// pushed. Otherwise it is pushed only when the newcomer is closer than the
/// farthest neighbor and the local node is closer than the nearest one, i.e.
/// the local node is the current authority for the key.
fn should_replicate(newcomer: &Contact, local: &NodeId, key: &NodeId, neighbors: &[Contact]) -> bool {
    let (Some(first), Some(last)) = (neighbors.first(), neighbors.last()) else {
        return true;
    };
    let newcomer_is_close = newcomer.distance_to(key) < last.distance_to(key);
    let local_is_closest = local.distance(key) < first.distance_to(key);
    newcomer_is_close && local_is_closest
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT Node
// ─────────────────────────────────────────────────────────────────────────────

/// A Kademlia node: routing table, RPC handlers and liveness bookkeeping.
///
/// The type is generic over the [`Transport`] so tests can use an in-memory
/// network while production uses [`crate::net::UdpTransport`], and over the
/// [`Storage`] collaborator holding small values.
///
/// # Key Methods
///
/// * [`handle_request`](Self::handle_request) - dispatch an inbound RPC
/// * [`call_find_node`](Self::call_find_node) and friends - outbound RPCs
/// * [`welcome_if_new`](Self::welcome_if_new) - admit a peer, replicating keys to it
/// * [`get_refresh_ids`](Self::get_refresh_ids) - lookup targets for lonely buckets
/// * [`settle`](Self::settle) - wait for detached replication calls
///
/// Cloning is cheap; clones share all state. The routing table lock is never
/// held across an await point, so each admission decision is computed from a
/// single consistent snapshot of the table.
pub struct DhtNode<T: Transport, S: Storage> {
    id: NodeId,
    ksize: usize,
    router: Arc<Mutex<RoutingTable>>,
    storage: Arc<Mutex<S>>,
    blobs: Arc<BlobStore>,
    transport: Arc<T>,
    /// Detached replication and ping-before-evict calls.
    tasks: Arc<Mutex<JoinSet<()>>>,
    /// Parent span of every event this node logs.
    span: Span,
}

impl<T: Transport, S: Storage> Clone for DhtNode<T, S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            ksize: self.ksize,
            router: self.router.clone(),
            storage: self.storage.clone(),
            blobs: self.blobs.clone(),
            transport: self.transport.clone(),
            tasks: self.tasks.clone(),
            span: self.span.clone(),
        }
    }
}

impl<T: Transport, S: Storage> DhtNode<T, S> {
    /// Create a node with an empty routing table.
    ///
    /// `ksize` bounds every bucket and is the replication factor; buckets not
    /// updated for `staleness` are reported by [`get_refresh_ids`](Self::get_refresh_ids).
    pub fn new(
        id: NodeId,
        transport: Arc<T>,
        storage: S,
        blobs: BlobStore,
        ksize: usize,
        staleness: Duration,
    ) -> Self {
        let span = tracing::info_span!("dht", node = %&id.to_hex()[..8]);
        Self {
            id,
            ksize,
            router: Arc::new(Mutex::new(RoutingTable::new(id, ksize, staleness))),
            storage: Arc::new(Mutex::new(storage)),
            blobs: Arc::new(blobs),
            transport,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            span,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn ksize(&self) -> usize {
        self.ksize
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Whether `id` is currently a live contact in the routing table.
    pub fn knows(&self, id: &NodeId) -> bool {
        self.router.lock().contains(id)
    }

    /// Snapshot of every contact in the routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        self.router.lock().contacts()
    }

    /// The k nearest known contacts to `target`.
    pub fn neighbors(&self, target: &NodeId) -> Vec<Contact> {
        self.router.lock().find_neighbors(target, None, self.ksize)
    }

    /// Run `f` against the routing table.
    pub fn with_router<R>(&self, f: impl FnOnce(&mut RoutingTable) -> R) -> R {
        f(&mut self.router.lock())
    }

    /// Run `f` against the key/value storage.
    pub fn with_storage<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.storage.lock())
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    // ─────────────────────────────────────────────────────────────────────
    // Refresh
    // ─────────────────────────────────────────────────────────────────────

    /// One lookup target per lonely bucket.
    ///
    /// Each target is drawn uniformly from its bucket's distance range and
    /// translated back into the id space, so `distance(self, target)` falls in
    /// that range. Looking the targets up repopulates the quiet buckets.
    pub fn get_refresh_ids(&self) -> Vec<NodeId> {
        let router = self.router.lock();
        let mut rng = rand::thread_rng();
        router
            .lonely_buckets()
            .into_iter()
            .map(|bucket| {
                let (low, high) = bucket.range();
                NodeId::random_in_range(&low, &high, &mut rng).distance(&self.id)
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound RPCs
    // ─────────────────────────────────────────────────────────────────────

    /// Dispatch an inbound request to its handler.
    pub async fn handle_request(&self, sender: SocketAddr, request: Request) -> Response {
        match request {
            Request::Stun => Response::Stun(self.rpc_stun(sender)),
            Request::Ping { sender_id } => Response::Pong(self.rpc_ping(sender, sender_id)),
            Request::Store {
                sender_id,
                key,
                value,
            } => Response::Stored(self.rpc_store(sender, sender_id, key, value)),
            Request::FindNode { sender_id, target } => {
                Response::Nodes(self.rpc_find_node(sender, sender_id, target))
            }
            Request::FindValue { sender_id, key } => {
                self.rpc_find_value(sender, sender_id, key).into()
            }
            Request::StoreBlob {
                sender_id,
                key,
                value,
            } => Response::Stored(self.rpc_store_blob(sender, sender_id, key, value).await),
            Request::FindBlob { sender_id, key } => {
                Response::Blob(self.rpc_find_blob(sender, sender_id, key).await)
            }
        }
    }

    /// Echo the caller's observed address.
    pub fn rpc_stun(&self, sender: SocketAddr) -> SocketAddr {
        sender
    }

    pub fn rpc_ping(&self, sender: SocketAddr, sender_id: NodeId) -> NodeId {
        self.welcome_if_new(&Contact::new(sender_id, sender));
        self.id
    }

    /// Store `value` under `key`, silently overwriting.
    pub fn rpc_store(&self, sender: SocketAddr, sender_id: NodeId, key: NodeId, value: Vec<u8>) -> bool {
        self.welcome_if_new(&Contact::new(sender_id, sender));
        debug!(parent: &self.span, %sender, key = %key, len = value.len(), "storing value");
        self.storage.lock().set(key, value);
        true
    }

    /// The k nearest known contacts to `target`, excluding the caller.
    pub fn rpc_find_node(&self, sender: SocketAddr, sender_id: NodeId, target: NodeId) -> Vec<Contact> {
        debug!(parent: &self.span, %sender, target = %target, "finding neighbors in local table");
        self.welcome_if_new(&Contact::new(sender_id, sender));
        self.router
            .lock()
            .find_neighbors(&target, Some(&sender_id), self.ksize)
    }

    /// The value under `key` when held locally, otherwise `find_node` behavior.
    pub fn rpc_find_value(&self, sender: SocketAddr, sender_id: NodeId, key: NodeId) -> ValueOrNodes {
        self.welcome_if_new(&Contact::new(sender_id, sender));
        let value = self.storage.lock().get(&key);
        match value {
            Some(value) => ValueOrNodes::Value(value),
            None => ValueOrNodes::Nodes(self.rpc_find_node(sender, sender_id, key)),
        }
    }

    /// Persist a bulk value in the blob store.
    ///
    /// Returns false only when the blob store fails with an I/O error.
    pub async fn rpc_store_blob(
        &self,
        sender: SocketAddr,
        sender_id: NodeId,
        key: NodeId,
        value: Blob,
    ) -> bool {
        self.welcome_if_new(&Contact::new(sender_id, sender));
        debug!(parent: &self.span, %sender, key = %key, len = value.as_bytes().len(), "storing blob");
        match self.blobs.store(&key, &value).await {
            Ok(()) => true,
            Err(err) => {
                warn!(parent: &self.span, key = %key, "blob store failed: {err}");
                false
            }
        }
    }

    /// Look a bulk value up; `None` means not found.
    pub async fn rpc_find_blob(&self, sender: SocketAddr, sender_id: NodeId, key: NodeId) -> Option<Blob> {
        self.welcome_if_new(&Contact::new(sender_id, sender));
        match self.blobs.find(&key).await {
            Ok(lookup) => lookup.into_option(),
            Err(err) => {
                warn!(parent: &self.span, key = %key, "blob lookup failed: {err}");
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound RPCs
    // ─────────────────────────────────────────────────────────────────────

    /// Send `request` and feed the outcome through
    /// [`handle_call_response`](Self::handle_call_response).
    ///
    /// A request that could not be sent is returned as an error and leaves
    /// the routing table untouched.
    async fn call(&self, node_to_ask: &Contact, request: Request) -> Result<CallResult, DhtError> {
        let rpc = request.name();
        match self.transport.call(node_to_ask.addr, request).await {
            Ok(result) => Ok(self.handle_call_response(result, node_to_ask)),
            Err(err) => {
                warn!(parent: &self.span, peer = %node_to_ask, rpc, "request not sent: {err}");
                Err(err)
            }
        }
    }

    pub async fn call_ping(&self, node_to_ask: &Contact) -> Result<CallResult, DhtError> {
        let request = Request::Ping { sender_id: self.id };
        self.call(node_to_ask, request).await
    }

    pub async fn call_store(
        &self,
        node_to_ask: &Contact,
        key: NodeId,
        value: Vec<u8>,
    ) -> Result<CallResult, DhtError> {
        let request = Request::Store {
            sender_id: self.id,
            key,
            value,
        };
        self.call(node_to_ask, request).await
    }

    pub async fn call_find_node(
        &self,
        node_to_ask: &Contact,
        node_to_find: &NodeId,
    ) -> Result<CallResult, DhtError> {
        let request = Request::FindNode {
            sender_id: self.id,
            target: *node_to_find,
        };
        self.call(node_to_ask, request).await
    }

    pub async fn call_find_value(
        &self,
        node_to_ask: &Contact,
        key: &NodeId,
    ) -> Result<CallResult, DhtError> {
        let request = Request::FindValue {
            sender_id: self.id,
            key: *key,
        };
        self.call(node_to_ask, request).await
    }

    pub async fn call_store_blob(
        &self,
        node_to_ask: &Contact,
        key: NodeId,
        value: Blob,
    ) -> Result<CallResult, DhtError> {
        let request = Request::StoreBlob {
            sender_id: self.id,
            key,
            value,
        };
        self.call(node_to_ask, request).await
    }

    pub async fn call_find_blob(
        &self,
        node_to_ask: &Contact,
        key: &NodeId,
    ) -> Result<CallResult, DhtError> {
        let request = Request::FindBlob {
            sender_id: self.id,
            key: *key,
        };
        self.call(node_to_ask, request).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Liveness & Replication
    // ─────────────────────────────────────────────────────────────────────

    /// Feed the outcome of an outbound call back into the routing table.
    ///
    /// A peer that did not answer is removed; one that did is admitted. The
    /// result is returned unchanged.
    pub fn handle_call_response(&self, result: CallResult, node: &Contact) -> CallResult {
        if !result.succeeded {
            warn!(parent: &self.span, peer = %node, "no response, removing from router");
            self.router.lock().remove_contact(&node.id);
            return result;
        }

        debug!(parent: &self.span, peer = %node, "got successful response");
        self.welcome_if_new(node);
        result
    }

    /// Admit a contact, pushing it the keys it should now help store.
    ///
    /// Known contacts are only refreshed, and so are contacts already waiting
    /// in a replacement cache. For a new contact, every locally
    /// stored key is checked against the table as it was *before* admission
    /// (see `should_replicate`), selected keys are sent with detached `store`
    /// calls, and finally the contact is added to the routing table.
    ///
    /// Returns true if the contact was new.
    pub fn welcome_if_new(&self, node: &Contact) -> bool {
        if node.id == self.id {
            return false;
        }

        let (to_replicate, outcome) = {
            let mut router = self.router.lock();
            if !router.is_new_node(node) {
                router.add_contact(node.clone());
                return false;
            }
            if router.is_replacement(&node.id) {
                // Parked behind a full bucket whose head was already pinged.
                router.add_contact(node.clone());
                return false;
            }

            let entries = self.storage.lock().entries();
            let to_replicate: Vec<(NodeId, Vec<u8>)> = entries
                .into_iter()
                .filter(|(key, _)| {
                    let neighbors = router.find_neighbors(key, None, self.ksize);
                    should_replicate(node, &self.id, key, &neighbors)
                })
                .collect();
            let outcome = router.add_contact(node.clone());
            (to_replicate, outcome)
        };

        info!(
            parent: &self.span,
            peer = %node,
            replicating = to_replicate.len(),
            "never seen peer before, adding to router"
        );

        for (key, value) in to_replicate {
            let this = self.clone();
            let target = node.clone();
            self.spawn_detached(async move {
                // Unsendable values are logged by `call`; the newcomer stays.
                let _ = this.call_store(&target, key, value).await;
            });
        }

        if let AddOutcome::Full { head } = outcome {
            // Ping-before-evict: a dead head is removed by handle_call_response,
            // which promotes the newcomer from the replacement cache.
            debug!(parent: &self.span, peer = %node, head = %head, "bucket full, pinging head");
            let this = self.clone();
            self.spawn_detached(async move {
                let _ = this.call_ping(&head).await;
            });
        }
        true
    }

    fn spawn_detached<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        // Reap finished tasks so the set only tracks in-flight work.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task.instrument(self.span.clone()));
    }

    /// Number of detached calls that have not been reaped yet.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait until every detached call, including ones spawned meanwhile, has
    /// completed.
    pub async fn settle(&self) {
        loop {
            let mut pending = {
                let mut tasks = self.tasks.lock();
                std::mem::take(&mut *tasks)
            };
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(err) = joined {
                    warn!(parent: &self.span, "detached call ended abnormally: {err}");
                }
            }
        }
    }
}
