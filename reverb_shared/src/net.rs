//! Transport endpoints.
//!
//! TCP only. Every message is a 4-byte big-endian length followed by a UTF-8
//! JSON packet body. Concurrency is task-per-socket: the server runs one
//! accept task plus one receive task per connected client, the client runs a
//! single receive task. Decoded packets are dispatched through the side's
//! event registry; an undecodable body is logged and the loop keeps reading,
//! while header errors and EOF tear the connection down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{Packet, CLIENT_DISCONNECTION, SERVER_STOP};
use crate::errors::ReverbError;
use crate::event::{EventRegistry, CLIENT_CONNECTION, CONNECTION, DISCONNECTION};
use crate::world::Side;

/// Handle to one connected socket's write half. Cheap to clone; handlers
/// receive one of these as the originating socket of every event.
#[derive(Debug, Clone)]
pub struct Peer {
    addr: SocketAddr,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            addr,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Encodes and writes one packet to this peer.
    pub async fn send(&self, packet: &Packet) -> Result<(), ReverbError> {
        let frame = packet.encode_frame()?;
        self.send_frame(&frame).await.map_err(ReverbError::from)
    }

    async fn send_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Outbound packet lane handed to the world and to replicated objects.
///
/// Pushes are non-blocking; a single pump task owned by the side's wiring
/// drains the queue, so send order between ticks, despawns and remote calls
/// is the push order.
#[derive(Debug, Clone)]
pub struct NetHandle {
    side: Side,
    local_port: u16,
    tx: mpsc::UnboundedSender<Packet>,
}

impl NetHandle {
    pub fn new(side: Side, local_port: u16, tx: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            side,
            local_port,
            tx,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The local socket's ephemeral port. On a client this is what owner
    /// tags are matched against.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn send(&self, packet: Packet) {
        if self.tx.send(packet).is_err() {
            warn!(side = %self.side, "transport is gone; dropping outbound packet");
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Listening side of the transport. Accepted sockets land in a map keyed by
/// peer address; `client_connection` fires inline on accept and
/// `client_disconnection` fires inline before a socket is torn down, so
/// catch-up and cleanup complete while the peer entry is still coherent.
#[derive(Clone)]
pub struct ServerEndpoint {
    local_addr: SocketAddr,
    clients: Arc<Mutex<HashMap<SocketAddr, Peer>>>,
    online: Arc<AtomicBool>,
    accept_task: Arc<JoinHandle<()>>,
}

impl ServerEndpoint {
    pub async fn bind(addr: &str, events: Arc<EventRegistry>) -> Result<Self, ReverbError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let clients: Arc<Mutex<HashMap<SocketAddr, Peer>>> = Arc::default();
        let online = Arc::new(AtomicBool::new(true));

        info!(%local_addr, "server online, waiting for clients");

        let accept_task = {
            let clients = clients.clone();
            let online = online.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, addr) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(e) => {
                            if online.load(Ordering::SeqCst) {
                                warn!(error = %e, "accept failed");
                            }
                            break;
                        }
                    };
                    let (reader, writer) = stream.into_split();
                    let peer = Peer::new(addr, writer);
                    lock_clients(&clients).insert(addr, peer.clone());
                    info!(client = %addr, "client connected");

                    events
                        .trigger(CLIENT_CONNECTION, peer.clone(), Vec::new(), true)
                        .await;

                    tokio::spawn(serve_client(
                        peer,
                        reader,
                        clients.clone(),
                        events.clone(),
                        online.clone(),
                    ));
                }
                debug!("server stopped listening for new clients");
            })
        };

        Ok(Self {
            local_addr,
            clients,
            online,
            accept_task: Arc::new(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        lock_clients(&self.clients).len()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Encodes once and writes to every connected client. A write failure
    /// marks that peer gone and the broadcast carries on; only an encoding
    /// failure aborts, before anything has been written.
    pub async fn send_to_all(&self, packet: &Packet) -> Result<(), ReverbError> {
        let frame = packet.encode_frame()?;
        let peers: Vec<Peer> = lock_clients(&self.clients).values().cloned().collect();
        for peer in peers {
            if let Err(e) = peer.send_frame(&frame).await {
                warn!(client = %peer.addr(), error = %e, "broadcast write failed; peer considered gone");
            }
        }
        Ok(())
    }

    /// Notifies every client with `server_stop`, then closes all sockets and
    /// stops accepting.
    pub async fn stop(&self) {
        if !self.online.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.send_to_all(&Packet::new(SERVER_STOP, Vec::new())).await;
        self.accept_task.abort();
        lock_clients(&self.clients).clear();
        info!("server closed");
    }
}

fn lock_clients(
    clients: &Arc<Mutex<HashMap<SocketAddr, Peer>>>,
) -> MutexGuard<'_, HashMap<SocketAddr, Peer>> {
    clients.lock().expect("client table poisoned")
}

/// Per-client receive task. Runs until the peer leaves, the socket fails or
/// the endpoint goes offline.
async fn serve_client(
    peer: Peer,
    mut reader: OwnedReadHalf,
    clients: Arc<Mutex<HashMap<SocketAddr, Peer>>>,
    events: Arc<EventRegistry>,
    online: Arc<AtomicBool>,
) {
    let addr = peer.addr();
    let mut notified = false;

    while online.load(Ordering::SeqCst) {
        let body = match read_frame(&mut reader).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(client = %addr, "peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(client = %addr, error = %e, "read failed; dropping client");
                break;
            }
        };

        let packet = match Packet::decode(&body) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(client = %addr, error = %e, "ignoring packet");
                continue;
            }
        };

        if packet.name == CLIENT_DISCONNECTION {
            events
                .trigger(&packet.name, peer.clone(), packet.contents, true)
                .await;
            notified = true;
            break;
        }

        events
            .trigger(&packet.name, peer.clone(), packet.contents, false)
            .await;
    }

    if !notified && online.load(Ordering::SeqCst) {
        events
            .trigger(CLIENT_DISCONNECTION, peer.clone(), Vec::new(), true)
            .await;
    }
    lock_clients(&clients).remove(&addr);
    info!(client = %addr, "client disconnected");
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Connecting side of the transport. A `server_stop` packet or any read
/// failure ends the receive task; every disconnect path sends a best-effort
/// leave notice and fires `disconnection`.
pub struct ClientEndpoint {
    server: Peer,
    local_addr: SocketAddr,
    connected: Arc<AtomicBool>,
    events: Arc<EventRegistry>,
    reader: Mutex<Option<OwnedReadHalf>>,
}

impl ClientEndpoint {
    /// Opens the connection. The receive loop does not run until [`start`]
    /// is called, so the owning side can finish its wiring first; frames
    /// arriving in between wait in the socket.
    ///
    /// [`start`]: ClientEndpoint::start
    pub async fn connect(addr: &str, events: Arc<EventRegistry>) -> Result<Self, ReverbError> {
        let stream = TcpStream::connect(addr).await?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let server = Peer::new(peer_addr, writer);
        let connected = Arc::new(AtomicBool::new(true));

        info!(server = %peer_addr, port = local_addr.port(), "connected to server");
        events
            .trigger(CONNECTION, server.clone(), Vec::new(), false)
            .await;

        Ok(Self {
            server,
            local_addr,
            connected,
            events,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Spawns the receive task. Idempotent.
    pub fn start(&self) {
        let Some(reader) = self
            .reader
            .lock()
            .expect("reader slot poisoned")
            .take()
        else {
            debug!("receive loop already started");
            return;
        };
        tokio::spawn(listen_to_server(
            self.server.clone(),
            reader,
            self.connected.clone(),
            self.events.clone(),
        ));
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server.addr()
    }

    /// The ephemeral port this client connected from; doubles as its
    /// membership tag in owner checks.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), ReverbError> {
        if !self.is_connected() {
            debug!(packet = %packet.name, "not connected; dropping packet");
            return Ok(());
        }
        self.server.send(packet).await
    }

    pub async fn disconnect(&self) {
        leave(&self.server, &self.connected, &self.events).await;
    }
}

async fn listen_to_server(
    server: Peer,
    mut reader: OwnedReadHalf,
    connected: Arc<AtomicBool>,
    events: Arc<EventRegistry>,
) {
    while connected.load(Ordering::SeqCst) {
        let body = match read_frame(&mut reader).await {
            Ok(body) => body,
            Err(e) => {
                if connected.load(Ordering::SeqCst) {
                    warn!(error = %e, "connection to server lost");
                }
                break;
            }
        };

        let packet = match Packet::decode(&body) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "ignoring packet");
                continue;
            }
        };

        if packet.name == SERVER_STOP {
            info!("server stopped");
            break;
        }

        events
            .trigger(&packet.name, server.clone(), packet.contents, false)
            .await;
    }

    leave(&server, &connected, &events).await;
}

async fn leave(server: &Peer, connected: &Arc<AtomicBool>, events: &Arc<EventRegistry>) {
    if !connected.swap(false, Ordering::SeqCst) {
        return;
    }
    let notice = Packet::new(
        CLIENT_DISCONNECTION,
        vec![json!([server.addr().ip().to_string(), server.addr().port()])],
    );
    if let Err(e) = server.send(&notice).await {
        debug!(error = %e, "could not deliver the leave notice");
    }
    events
        .trigger(DISCONNECTION, server.clone(), Vec::new(), false)
        .await;
    info!("client disconnected");
}
