//! UDP transport for DHT RPCs.
//!
//! This module provides the [`UdpTransport`] implementation of the
//! [`Transport`] trait. Every call is one request datagram answered by one
//! response datagram carrying the same message id. Calls that see no answer
//! within the configured timeout resolve to a failed [`CallResult`]; requests
//! that cannot be encoded are returned as errors and never sent.
//!
//! Responses are only delivered while [`crate::server::serve`] is running on
//! the same transport, since that loop owns the receive side of the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::error::DhtError;
use crate::framing::encode_frame;
use crate::node::Transport;
use crate::protocol::{CallResult, Envelope, MessageId, Request, Response};

/// A call waiting for its response.
struct PendingCall {
    /// Address the request went to; replies from anywhere else are ignored.
    to: SocketAddr,
    waiter: oneshot::Sender<Response>,
}

/// Datagram transport over a tokio [`UdpSocket`].
pub struct UdpTransport {
    socket: UdpSocket,
    /// Calls waiting for their response, keyed by message id.
    pending: Mutex<HashMap<MessageId, PendingCall>>,
    /// How long a call waits before it counts as failed.
    timeout: Duration,
}

impl UdpTransport {
    /// Bind a socket on `addr`.
    pub async fn bind(addr: SocketAddr, timeout: Duration) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(addr = %socket.local_addr()?, "udp transport bound");
        Ok(Arc::new(Self {
            socket,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Number of calls still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, id: MessageId, to: SocketAddr) -> oneshot::Receiver<Response> {
        let (waiter, rx) = oneshot::channel();
        self.pending.lock().insert(id, PendingCall { to, waiter });
        rx
    }

    /// Hand a response from `from` to the call waiting on `id`.
    ///
    /// Returns false when no such call is pending (late or unsolicited reply)
    /// or when the reply comes from a different address than the call went
    /// to. A mismatched reply leaves the call pending.
    pub(crate) fn complete(&self, id: &MessageId, from: SocketAddr, response: Response) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(id) {
            Some(call) if call.to == from => {}
            _ => return false,
        }
        match pending.remove(id) {
            Some(call) => call.waiter.send(response).is_ok(),
            None => false,
        }
    }

    pub(crate) async fn send_envelope(&self, to: SocketAddr, envelope: &Envelope) -> Result<(), DhtError> {
        let bytes = encode_frame(envelope)?;
        self.socket.send_to(&bytes, to).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn call(&self, to: SocketAddr, request: Request) -> Result<CallResult, DhtError> {
        let rpc = request.name();
        let envelope = Envelope::request(request);
        // Oversized or unencodable requests never leave the node.
        let bytes = encode_frame(&envelope)?;

        let rx = self.register(envelope.id, to);
        if let Err(err) = self.socket.send_to(&bytes, to).await {
            debug!(%to, rpc, "failed to send request: {err}");
            self.pending.lock().remove(&envelope.id);
            return Ok(CallResult::failure());
        }

        let outcome = timeout(self.timeout, rx).await;
        self.pending.lock().remove(&envelope.id);
        match outcome {
            Ok(Ok(response)) => Ok(CallResult::success(response)),
            Ok(Err(_)) | Err(_) => {
                debug!(%to, rpc, "no response within {:?}", self.timeout);
                Ok(CallResult::failure())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn reply_from_another_address_does_not_complete_call() {
        let transport = UdpTransport::bind(loopback(0), Duration::from_secs(1))
            .await
            .expect("bind");
        let id = [7u8; 20];
        let mut rx = transport.register(id, loopback(4000));

        let spoofed = transport.complete(&id, loopback(4001), Response::Pong(NodeId::ZERO));
        assert!(!spoofed);
        assert_eq!(transport.in_flight(), 1);
        assert!(rx.try_recv().is_err());

        let genuine = transport.complete(&id, loopback(4000), Response::Pong(NodeId::MAX));
        assert!(genuine);
        assert_eq!(rx.await.expect("delivered"), Response::Pong(NodeId::MAX));
        assert_eq!(transport.in_flight(), 0);
    }

    #[tokio::test]
    async fn oversized_request_is_an_error_not_a_failed_call() {
        let transport = UdpTransport::bind(loopback(0), Duration::from_secs(1))
            .await
            .expect("bind");
        let request = Request::Store {
            sender_id: NodeId::ZERO,
            key: NodeId::MAX,
            value: vec![0xAB; crate::framing::MAX_DATAGRAM_SIZE],
        };

        let result = transport.call(loopback(4000), request).await;
        assert!(matches!(result, Err(DhtError::FrameTooLarge(_))));
        assert_eq!(transport.in_flight(), 0);
    }
}
