//! Peer transport over WebSocket
//!
//! Every node runs a `PeerServer` that answers requests and dials each of
//! its peers with a `PeerClient`. Frames are binary WebSocket messages
//! carrying a borsh [`Envelope`]; responses echo the request id.

use crate::error::NetworkError;
use crate::handlers::Protocol;
use crate::types::{
    Body, Envelope, GossipRequest, GossipResponse, Opcode, QueryRequest, QueryResponse, Request,
    Response, SyncDiffRequest, SyncDiffResponse, SyncViewRequest, SyncViewResponse,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use ledger_state::{Round, Transaction};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};

/// Accepts peer connections and answers their requests
pub struct PeerServer {
    protocol: Arc<Protocol>,
    /// Open inbound connections
    connections: Arc<AtomicUsize>,
}

impl PeerServer {
    pub fn new(protocol: Arc<Protocol>) -> Self {
        Self {
            protocol,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start listening on `addr`, returning the bound address
    pub async fn start(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Peer server listening on {}", local_addr);

        let protocol = self.protocol.clone();
        let connections = self.connections.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::info!("Peer connected from {}", peer_addr);
                        let protocol = protocol.clone();
                        let connections = connections.clone();

                        tokio::spawn(async move {
                            connections.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = handle_connection(stream, peer_addr, protocol).await {
                                tracing::warn!("Peer connection error from {}: {}", peer_addr, e);
                            }
                            connections.fetch_sub(1, Ordering::Relaxed);
                            tracing::info!("Peer {} disconnected", peer_addr);
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Number of open inbound connections
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Receive loop of one inbound connection. Each request is answered on the
/// same connection before the next is read; a failed send ends the loop.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    protocol: Arc<Protocol>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let envelope = match Envelope::from_bytes(&data) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!("Malformed frame from {}: {}", peer_addr, e);
                        continue;
                    }
                };

                let request = match envelope.body {
                    Body::Request(request) => request,
                    Body::Response(response) => {
                        tracing::debug!(
                            "Ignoring unsolicited {:?} from {}",
                            response.opcode(),
                            peer_addr
                        );
                        continue;
                    }
                };

                let response = protocol.dispatch(peer_addr, request);
                let reply = Envelope {
                    request_id: envelope.request_id,
                    body: Body::Response(response),
                };

                ws_sender.send(Message::Binary(reply.to_bytes())).await?;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error from {}: {}", peer_addr, e);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}

type Pending = Arc<DashMap<u64, oneshot::Sender<Response>>>;

/// Outbound connection to one peer
pub struct PeerClient {
    addr: SocketAddr,
    /// Frames for the writer task
    outbound: mpsc::Sender<Vec<u8>>,
    /// Requests waiting for their response, by request id
    pending: Pending,
    next_request_id: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Duration,
}

impl PeerClient {
    /// Dial `addr`. Requests that get no answer within `timeout` fail with
    /// `NetworkError::Timeout`.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, NetworkError> {
        let url = format!("ws://{}", addr);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|source| NetworkError::Connect { addr, source })?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        tracing::info!("Connected to peer at {}", addr);

        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(256);

        // Reader: route responses to their waiting request
        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Envelope::from_bytes(&data) {
                        Ok(Envelope {
                            request_id,
                            body: Body::Response(response),
                        }) => {
                            if let Some((_, waiter)) = reader_pending.remove(&request_id) {
                                let _ = waiter.send(response);
                            } else {
                                tracing::debug!("Late response {} from {}", request_id, addr);
                            }
                        }
                        Ok(_) => {
                            tracing::debug!("Ignoring request on outbound connection to {}", addr);
                        }
                        Err(e) => {
                            tracing::warn!("Malformed frame from {}: {}", addr, e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::warn!("Peer {} closed connection", addr);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }

            reader_closed.store(true, Ordering::Release);
            // Dropping the senders fails every waiting request with Closed
            reader_pending.clear();
        });

        // Writer
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if ws_sender.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            writer_closed.store(true, Ordering::Release);
        });

        Ok(Self {
            addr,
            outbound,
            pending,
            next_request_id: AtomicU64::new(1),
            closed,
            timeout,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send `request` and wait for the matching response
    pub async fn request(&self, request: Request) -> Result<Response, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }

        let expected = request.response_opcode();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, response_rx) = oneshot::channel();
        self.pending.insert(request_id, waiter);

        let frame = Envelope {
            request_id,
            body: Body::Request(request),
        };

        if self.outbound.send(frame.to_bytes()).await.is_err() {
            self.pending.remove(&request_id);
            return Err(NetworkError::Closed);
        }

        let response = match tokio::time::timeout(self.timeout, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(NetworkError::Closed),
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(NetworkError::Timeout);
            }
        };

        if response.opcode() != expected {
            return Err(NetworkError::UnexpectedResponse {
                expected,
                got: response.opcode(),
            });
        }

        Ok(response)
    }

    pub async fn gossip(&self, tx: Transaction) -> Result<GossipResponse, NetworkError> {
        match self.request(Request::Gossip(GossipRequest { tx })).await? {
            Response::Gossip(response) => Ok(response),
            other => Err(unexpected(Opcode::GossipResponse, &other)),
        }
    }

    pub async fn query(&self, tx: Transaction) -> Result<QueryResponse, NetworkError> {
        match self.request(Request::Query(QueryRequest { tx })).await? {
            Response::Query(response) => Ok(response),
            other => Err(unexpected(Opcode::QueryResponse, &other)),
        }
    }

    pub async fn sync_view(&self, root: Round) -> Result<SyncViewResponse, NetworkError> {
        match self.request(Request::SyncView(SyncViewRequest { root })).await? {
            Response::SyncView(response) => Ok(response),
            other => Err(unexpected(Opcode::SyncViewResponse, &other)),
        }
    }

    pub async fn sync_diff(&self, view_id: u64) -> Result<SyncDiffResponse, NetworkError> {
        match self.request(Request::SyncDiff(SyncDiffRequest { view_id })).await? {
            Response::SyncDiff(response) => Ok(response),
            other => Err(unexpected(Opcode::SyncDiffResponse, &other)),
        }
    }
}

fn unexpected(expected: Opcode, got: &Response) -> NetworkError {
    NetworkError::UnexpectedResponse {
        expected,
        got: got.opcode(),
    }
}

/// Connected peers by address
#[derive(Default)]
pub struct PeerSet {
    clients: DashMap<SocketAddr, Arc<PeerClient>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client: PeerClient) -> Arc<PeerClient> {
        let client = Arc::new(client);
        self.clients.insert(client.addr(), client.clone());
        client
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<PeerClient>> {
        self.clients.get(addr).map(|c| c.value().clone())
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<PeerClient>> {
        self.clients.remove(addr).map(|(_, client)| client)
    }

    /// Every peer whose connection is still open. Closed clients are
    /// dropped from the set.
    pub fn connected(&self) -> Vec<Arc<PeerClient>> {
        self.clients.retain(|addr, client| {
            if client.is_closed() {
                tracing::info!("Dropping disconnected peer {}", addr);
                false
            } else {
                true
            }
        });
        self.clients.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
