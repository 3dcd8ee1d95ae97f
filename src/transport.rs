/// TCP transport: connection lifecycle, per-connection read loop, and the
/// stream barrier that couples the decoder to the message handler.
///
/// Each connection runs one read loop task. Control frames are decoded
/// into [`Rpc`] records and pushed onto the transport's output channel;
/// stream frames hand the connection over to whichever task solicited the
/// body. Two per-peer signals make that hand-off safe:
///
/// - `incoming_stream`: the read loop has consumed the stream tag, the
///   body is next on the wire. Consumers wait on this before reading, so
///   they can never swallow the tag themselves.
/// - `close_stream`: the consumer has drained the body. The read loop
///   waits on this before decoding the next frame, so it can never
///   misread body bytes as a frame tag.
///
/// Both are capacity-one done-signals; a connection carries at most one
/// stream hand-off at a time.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};
use tracing::{debug, error, info};

use crate::error::{MeshError, MeshResult};
use crate::protocol::{self, DecodeError, Rpc};

/// Pluggable connection handshake, run before a peer is admitted. The
/// default accepts everything.
pub type HandshakeFn = Arc<dyn Fn(&TcpPeer) -> MeshResult<()> + Send + Sync>;

/// Admission callback; the file server uses it to register the peer.
pub type OnPeerFn = Arc<dyn Fn(TcpPeer) -> MeshResult<()> + Send + Sync>;

/// Invoked with the remote address when a connection terminates.
pub type OnDisconnectFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Handshake that admits every dialer.
pub fn nop_handshake(_peer: &TcpPeer) -> MeshResult<()> {
    Ok(())
}

/// Handle on one established connection to a remote node.
///
/// Cloning is cheap; all clones share the underlying connection halves
/// and stream signals.
#[derive(Clone)]
pub struct TcpPeer {
    remote: SocketAddr,
    outbound: bool,
    reader: Arc<Mutex<BufReader<OwnedReadHalf>>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    stream_ready: Arc<Notify>,
    stream_done: Arc<Notify>,
}

impl TcpPeer {
    fn new(conn: TcpStream, outbound: bool) -> MeshResult<Self> {
        let remote = conn.peer_addr()?;
        let (read_half, write_half) = conn.into_split();
        Ok(Self {
            remote,
            outbound,
            reader: Arc::new(Mutex::new(BufReader::new(read_half))),
            writer: Arc::new(Mutex::new(write_half)),
            stream_ready: Arc::new(Notify::new()),
            stream_done: Arc::new(Notify::new()),
        })
    }

    /// Remote address of the underlying connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// True when this side dialed the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Send one buffer to the peer. Callers must not interleave the bytes
    /// of two logical frames; each frame goes out as one `send`.
    pub async fn send(&self, bytes: &[u8]) -> MeshResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Exclusive access to the connection's read half, for draining a
    /// stream body. Only take this after [`incoming_stream`] resolved.
    ///
    /// [`incoming_stream`]: TcpPeer::incoming_stream
    pub async fn reader(&self) -> MutexGuard<'_, BufReader<OwnedReadHalf>> {
        self.reader.lock().await
    }

    /// Exclusive access to the write half, for streaming a file out.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Resolves once the read loop has consumed a stream tag on this
    /// connection; the body is the next thing on the wire.
    pub async fn incoming_stream(&self) {
        self.stream_ready.notified().await;
    }

    /// Release the read loop after fully draining a stream body.
    pub fn close_stream(&self) {
        self.stream_done.notify_one();
    }

    pub(crate) fn announce_stream(&self) {
        self.stream_ready.notify_one();
    }

    pub(crate) async fn wait_stream_closed(&self) {
        self.stream_done.notified().await;
    }

    /// Shut down the write half; the remote read loop observes EOF.
    pub async fn close(&self) -> MeshResult<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

pub struct TcpTransportConfig {
    /// Address to bind, e.g. `127.0.0.1:3999`.
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub on_peer: Option<OnPeerFn>,
    pub on_disconnect: Option<OnDisconnectFn>,
}

impl TcpTransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(nop_handshake),
            on_peer: None,
            on_disconnect: None,
        }
    }
}

/// TCP implementation of the node-to-node transport.
pub struct TcpTransport {
    config: TcpTransportConfig,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: StdMutex<Option<mpsc::Receiver<Rpc>>>,
    shutdown: watch::Sender<bool>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Arc<Self> {
        // Capacity 1 keeps producers coupled to the event loop the way
        // an unbuffered hand-off would.
        let (rpc_tx, rpc_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            rpc_tx,
            rpc_rx: StdMutex::new(Some(rpc_rx)),
            shutdown,
            local_addr: StdMutex::new(None),
        })
    }

    /// The bound listen address once listening, the configured one before.
    pub fn addr(&self) -> String {
        self.local_addr
            .lock()
            .unwrap()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.config.listen_addr.clone())
    }

    /// Take the receiving end of the RPC channel. Yields `Some` exactly
    /// once; the event loop is the single consumer.
    pub fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.rpc_rx.lock().unwrap().take()
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn listen_and_accept(self: &Arc<Self>) -> MeshResult<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| MeshError::Listen {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(local);
        info!(addr = %local, "transport listening");

        let transport = Arc::clone(self);
        tokio::spawn(transport.accept_loop(listener));
        Ok(())
    }

    /// Open an outbound connection and run it like an accepted one.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> MeshResult<()> {
        let conn = TcpStream::connect(addr).await?;
        debug!(peer = %addr, "dialed outbound connection");
        let transport = Arc::clone(self);
        tokio::spawn(transport.handle_conn(conn, true));
        Ok(())
    }

    /// Signal every loop owned by this transport to stop.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, addr)) => {
                        debug!(peer = %addr, "new incoming connection");
                        let transport = Arc::clone(&self);
                        tokio::spawn(transport.handle_conn(conn, false));
                    }
                    Err(err) => error!(%err, "tcp accept failed"),
                },
            }
        }
        debug!(addr = %self.addr(), "accept loop stopped");
    }

    async fn handle_conn(self: Arc<Self>, conn: TcpStream, outbound: bool) {
        let peer = match TcpPeer::new(conn, outbound) {
            Ok(peer) => peer,
            Err(err) => {
                error!(%err, "failed to set up connection");
                return;
            }
        };
        let remote = peer.remote_addr().to_string();

        if let Err(err) = (self.config.handshake)(&peer) {
            error!(peer = %remote, %err, "handshake failed, dropping connection");
            let _ = peer.close().await;
            return;
        }
        if let Some(on_peer) = &self.config.on_peer {
            if let Err(err) = on_peer(peer.clone()) {
                error!(peer = %remote, %err, "peer rejected, dropping connection");
                let _ = peer.close().await;
                return;
            }
        }
        debug!(peer = %remote, outbound = peer.is_outbound(), "connection ready");

        self.read_loop(&peer, &remote).await;

        // Every exit path closes the connection and unregisters the peer.
        if let Some(on_disconnect) = &self.config.on_disconnect {
            on_disconnect(&remote);
        }
        let _ = peer.close().await;
        debug!(peer = %remote, "dropping peer connection");
    }

    async fn read_loop(&self, peer: &TcpPeer, remote: &str) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        let mut rpc = Rpc::default();
        loop {
            let decoded = {
                let mut reader = peer.reader().await;
                tokio::select! {
                    _ = shutdown.changed() => return,
                    res = protocol::decode_frame(&mut *reader, &mut rpc) => res,
                }
            };
            match decoded {
                Ok(()) => {}
                Err(DecodeError::Closed) => return,
                Err(err) => {
                    error!(peer = %remote, %err, "frame decode failed");
                    continue;
                }
            }

            rpc.from = remote.to_owned();
            let stream = rpc.stream;
            if stream {
                // Tag consumed; whoever solicited the body may now read it.
                peer.announce_stream();
            }
            if self.rpc_tx.send(std::mem::take(&mut rpc)).await.is_err() {
                // Consumer gone: the transport is shutting down.
                return;
            }
            if stream {
                // Do not decode the next frame until the body is drained.
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = peer.wait_stream_closed() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listens_and_reports_bound_addr() {
        let transport = TcpTransport::new(TcpTransportConfig::new("127.0.0.1:0"));
        transport.listen_and_accept().await.unwrap();
        let addr = transport.addr();
        assert!(addr.starts_with("127.0.0.1:"));
        assert_ne!(addr, "127.0.0.1:0", "an ephemeral port was assigned");
        transport.close();
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let first = TcpTransport::new(TcpTransportConfig::new("127.0.0.1:0"));
        first.listen_and_accept().await.unwrap();

        // Binding the same port again fails, and the error names the addr.
        let second = TcpTransport::new(TcpTransportConfig::new(first.addr()));
        let err = second.listen_and_accept().await.unwrap_err();
        assert!(matches!(err, MeshError::Listen { .. }));
        first.close();
    }

    #[tokio::test]
    async fn consume_yields_the_channel_once() {
        let transport = TcpTransport::new(TcpTransportConfig::new("127.0.0.1:0"));
        assert!(transport.consume().is_some());
        assert!(transport.consume().is_none());
    }
}
