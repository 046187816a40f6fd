use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::error::DhtError;
use crate::framing::decode_frame;
use crate::net::UdpTransport;
use crate::node::{DhtNode, Transport};
use crate::protocol::{Body, Envelope, Request, Response};
use crate::storage::Storage;

/// Anything that can answer inbound RPCs.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, sender: SocketAddr, request: Request) -> Response;
}

#[async_trait]
impl<T: Transport, S: Storage> RequestHandler for DhtNode<T, S> {
    async fn handle_request(&self, sender: SocketAddr, request: Request) -> Response {
        DhtNode::handle_request(self, sender, request).await
    }
}

/// Upper bound on requests being handled at once by [`serve`].
pub const MAX_CONCURRENT_REQUESTS: usize = 256;

/// Receive loop for a [`UdpTransport`], handling at most
/// [`MAX_CONCURRENT_REQUESTS`] requests at a time.
pub async fn serve<H: RequestHandler>(transport: Arc<UdpTransport>, handler: Arc<H>) -> Result<(), DhtError> {
    serve_with_limit(transport, handler, MAX_CONCURRENT_REQUESTS).await
}

/// Receive loop for a [`UdpTransport`].
///
/// Requests are answered on their own tasks so a slow handler (blob I/O)
/// never stalls the socket. Requests arriving while `max_in_flight` handlers
/// are still running are dropped; the caller sees a timeout. Responses
/// complete the matching pending call when they come from the address the
/// call went to. Malformed datagrams and replies to unknown calls are
/// dropped.
///
/// Runs until the socket fails.
pub async fn serve_with_limit<H: RequestHandler>(
    transport: Arc<UdpTransport>,
    handler: Arc<H>,
    max_in_flight: usize,
) -> Result<(), DhtError> {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let mut buf = vec![0u8; 65_535];
    loop {
        let (len, sender) = match transport.socket().recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP unreachable from an earlier send; the socket is still usable.
            Err(err) if err.kind() == ErrorKind::ConnectionReset => continue,
            Err(err) => return Err(err.into()),
        };

        let envelope = match decode_frame(&buf[..len]) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(%sender, "dropping malformed datagram: {err}");
                continue;
            }
        };

        match envelope.body {
            Body::Response(response) => {
                if !transport.complete(&envelope.id, sender, response) {
                    trace!(%sender, "dropping response to unknown call");
                }
            }
            Body::Request(request) => {
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    debug!(%sender, rpc = request.name(), "too many requests in flight, dropping");
                    continue;
                };
                let transport = transport.clone();
                let handler = handler.clone();
                let id = envelope.id;
                tokio::spawn(async move {
                    let _permit = permit;
                    let rpc = request.name();
                    let response = handler.handle_request(sender, request).await;
                    let reply = Envelope::response(id, response);
                    if let Err(err) = transport.send_envelope(sender, &reply).await {
                        debug!(%sender, rpc, "failed to send reply: {err}");
                    }
                });
            }
        }
    }
}
