/// The file server: peer registry, bootstrap dialing, the event loop that
/// consumes framed records off the transport, and the store/get
/// orchestration.
///
/// A node answers the same four operations locally and over the mesh:
/// `store` writes to its own disk and fan-outs the encrypted stream to
/// every connected peer; `get` falls back to broadcasting a query and
/// draining whichever peers respond. Replicas keep the ciphertext exactly
/// as received, so data fetched from the network is decrypted on the way
/// back to disk.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::crypto::{self, IV_SIZE, KEY_SIZE};
use crate::error::{MeshError, MeshResult};
use crate::protocol::{Message, INCOMING_MESSAGE, INCOMING_STREAM};
use crate::storage::{cas_path_transform, Storage, StorageConfig};
use crate::transport::{
    nop_handshake, HandshakeFn, OnDisconnectFn, OnPeerFn, TcpPeer, TcpTransport,
    TcpTransportConfig,
};

/// Pause between a `StoreFile` announcement and its stream frame, so
/// receivers move through the message frame first.
const STORE_PACING: Duration = Duration::from_millis(5);
/// Pause between a `GetFile` broadcast and draining responses.
const GET_PACING: Duration = Duration::from_millis(500);
/// How long `get` waits for any given peer to start streaming before
/// deciding that peer does not hold the key.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// How long an inbound store handler waits for the announced stream. This
/// bounds how long one peer can stall the (serialized) event loop.
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FileServerConfig {
    /// Node identifier, hex. Generated when absent.
    pub id: Option<String>,
    /// Shared cluster encryption key.
    pub encryption_key: [u8; KEY_SIZE],
    /// Filesystem root for this node's storage.
    pub storage_root: PathBuf,
    /// Address to listen on, e.g. `127.0.0.1:3999`.
    pub listen_addr: String,
    /// Addresses dialed at startup to join the mesh.
    pub bootstrap_nodes: Vec<String>,
    /// Connection handshake; defaults to accepting everyone.
    pub handshake: Option<HandshakeFn>,
}

/// One node of the storage mesh.
pub struct FileServer {
    id: String,
    enc_key: [u8; KEY_SIZE],
    bootstrap_nodes: Vec<String>,
    storage: Storage,
    transport: Arc<TcpTransport>,
    peers: Arc<StdMutex<HashMap<String, TcpPeer>>>,
    quit: watch::Sender<bool>,
}

impl FileServer {
    pub fn new(config: FileServerConfig) -> Arc<Self> {
        let id = config
            .id
            .unwrap_or_else(|| hex::encode(crypto::generate_id()));

        let peers: Arc<StdMutex<HashMap<String, TcpPeer>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        // Admission: register the peer under its remote address. A
        // duplicate address replaces the previous entry.
        let on_peer: OnPeerFn = {
            let peers = Arc::clone(&peers);
            Arc::new(move |peer: TcpPeer| {
                let addr = peer.remote_addr().to_string();
                info!(peer = %addr, "connected with remote peer");
                peers.lock().unwrap().insert(addr, peer);
                Ok(())
            })
        };
        let on_disconnect: OnDisconnectFn = {
            let peers = Arc::clone(&peers);
            Arc::new(move |addr: &str| {
                peers.lock().unwrap().remove(addr);
            })
        };

        let transport = TcpTransport::new(TcpTransportConfig {
            listen_addr: config.listen_addr,
            handshake: config.handshake.unwrap_or_else(|| Arc::new(nop_handshake)),
            on_peer: Some(on_peer),
            on_disconnect: Some(on_disconnect),
        });

        let storage = Storage::new(StorageConfig {
            root: config.storage_root,
            path_transform: cas_path_transform,
        });

        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            id,
            enc_key: config.encryption_key,
            bootstrap_nodes: config.bootstrap_nodes,
            storage,
            transport,
            peers,
            quit,
        })
    }

    /// This node's hex identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The transport's listen address.
    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    /// Direct access to the local store, mainly for inspection in tests.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Number of peers currently registered.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Start listening, dial the bootstrap nodes, and run the event loop
    /// until [`stop`] is called.
    ///
    /// [`stop`]: FileServer::stop
    pub async fn start(&self) -> MeshResult<()> {
        self.transport.listen_and_accept().await?;
        self.bootstrap_network();
        self.run().await
    }

    /// Ask the event loop to exit; the transport closes behind it.
    pub fn stop(&self) {
        self.quit.send_replace(true);
    }

    /// Store `reader` under `key` locally and replicate the encrypted
    /// stream to every connected peer. Returns the local (plaintext)
    /// size.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> MeshResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // Buffer the payload: it is written to the local disk and then
        // replayed through the encrypt pipeline for the peers.
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain).await?;
        let size = self.storage.write(&self.id, key, plain.as_slice()).await?;

        let msg = Message::StoreFile {
            id: self.id.clone(),
            key: key.to_owned(),
            size: size + IV_SIZE as u64,
        };
        self.broadcast(&msg).await?;

        // Let receivers move their decoders past the announcement before
        // the stream tag lands on the same connections.
        sleep(STORE_PACING).await;

        // Encrypt once; every replica receives identical ciphertext with
        // a shared IV.
        let mut ciphertext = Vec::with_capacity(plain.len() + IV_SIZE);
        crypto::copy_encrypt(&self.enc_key, &mut plain.as_slice(), &mut ciphertext).await?;

        let peers = self.peer_snapshot();
        for peer in &peers {
            // Tag and body under one writer lock: the frame must not
            // interleave with any other write to this peer.
            let sent: MeshResult<()> = async {
                let mut writer = peer.writer().await;
                writer.write_all(&[INCOMING_STREAM]).await?;
                writer.write_all(&ciphertext).await?;
                writer.flush().await?;
                Ok(())
            }
            .await;
            if let Err(err) = sent {
                warn!(peer = %peer.remote_addr(), %err, "replica stream failed");
            }
        }
        info!(bytes = size, key, replicas = peers.len(), "stored file");
        Ok(size)
    }

    /// Fetch `key`, from local disk when present, otherwise from the
    /// mesh. Returns the file size and a reader over the plaintext.
    pub async fn get(&self, key: &str) -> MeshResult<(u64, fs::File)> {
        if self.storage.has(&self.id, key).await {
            info!(key, "serving file from local disk");
            return self.storage.read(&self.id, key).await;
        }

        info!(key, "not held locally, fetching from the network");
        let msg = Message::GetFile {
            id: self.id.clone(),
            key: key.to_owned(),
        };
        self.broadcast(&msg).await?;
        sleep(GET_PACING).await;

        for peer in self.peer_snapshot() {
            let addr = peer.remote_addr().to_string();
            // Peers that do not hold the key never answer; skip them
            // after the response window instead of blocking forever.
            if timeout(RESPONSE_TIMEOUT, peer.incoming_stream())
                .await
                .is_err()
            {
                debug!(peer = %addr, key, "no response");
                continue;
            }
            let drained: MeshResult<u64> = async {
                let mut reader = peer.reader().await;
                let size = reader.read_i64_le().await? as u64;
                let n = self
                    .storage
                    .write_decrypt(&self.enc_key, &self.id, key, (&mut *reader).take(size))
                    .await?;
                Ok(n)
            }
            .await;
            match drained {
                Ok(n) => info!(bytes = n, peer = %addr, key, "received file from peer"),
                Err(err) => warn!(peer = %addr, %err, key, "fetch from peer failed"),
            }
            peer.close_stream();
        }

        if !self.storage.has(&self.id, key).await {
            return Err(MeshError::KeyNotFound(key.to_owned()));
        }
        self.storage.read(&self.id, key).await
    }

    /// True iff this node holds `key` locally.
    pub async fn has(&self, key: &str) -> bool {
        self.storage.has(&self.id, key).await
    }

    /// Remove the local copy of `key`. Deletion is not propagated to
    /// replicas.
    pub async fn delete(&self, key: &str) -> MeshResult<()> {
        info!(key, "deleting local copy");
        self.storage.delete(&self.id, key).await
    }

    fn bootstrap_network(&self) {
        for addr in self.bootstrap_nodes.iter().filter(|a| !a.is_empty()) {
            let addr = addr.clone();
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                debug!(node = %addr, "attempting to connect with remote node");
                if let Err(err) = transport.dial(&addr).await {
                    error!(node = %addr, %err, "bootstrap dial failed");
                }
            });
        }
    }

    /// The event loop: consumes framed records until asked to quit. One
    /// handler runs at a time, which is what keeps a stream drain from
    /// interleaving with other traffic on the same connection.
    async fn run(&self) -> MeshResult<()> {
        let mut rpc_rx = self.transport.consume().ok_or_else(|| {
            MeshError::Transport("rpc channel already consumed; start a server only once".into())
        })?;
        let mut quit = self.quit.subscribe();
        info!(addr = %self.transport.addr(), id = %self.id, "file server started");

        while !*quit.borrow() {
            tokio::select! {
                _ = quit.changed() => break,
                received = rpc_rx.recv() => {
                    let Some(rpc) = received else { break };
                    if rpc.stream {
                        // Raw stream bodies are drained by the task that
                        // solicited them; nothing to dispatch.
                        continue;
                    }
                    match Message::decode(&rpc.payload) {
                        Ok(msg) => {
                            if let Err(err) = self.handle_message(&rpc.from, msg).await {
                                error!(from = %rpc.from, %err, "message handling failed");
                            }
                        }
                        Err(err) => error!(from = %rpc.from, %err, "failed to decode message"),
                    }
                }
            }
        }

        self.transport.close();
        info!(id = %self.id, "file server stopped");
        Ok(())
    }

    async fn handle_message(&self, from: &str, msg: Message) -> MeshResult<()> {
        match msg {
            Message::StoreFile { id, key, size } => {
                self.handle_store_file(from, &id, &key, size).await
            }
            Message::GetFile { id, key } => self.handle_get_file(from, &id, &key).await,
        }
    }

    /// An origin node announced a file; drain exactly `size` bytes of the
    /// stream that follows and keep them as received. Replicas hold the
    /// ciphertext at rest.
    async fn handle_store_file(&self, from: &str, id: &str, key: &str, size: u64) -> MeshResult<()> {
        let peer = self.peer(from)?;
        timeout(STREAM_READY_TIMEOUT, peer.incoming_stream())
            .await
            .map_err(|_| {
                MeshError::Transport(format!("peer {from} announced a store but sent no stream"))
            })?;

        let n = {
            let mut reader = peer.reader().await;
            self.storage.write(id, key, (&mut *reader).take(size)).await?
        };
        peer.close_stream();
        info!(bytes = n, key, from, "stored replica from the network");
        Ok(())
    }

    /// A peer asked for a file. Missing keys are an error here and are
    /// not answered; the requester's response window covers that case.
    async fn handle_get_file(&self, from: &str, id: &str, key: &str) -> MeshResult<()> {
        if !self.storage.has(id, key).await {
            return Err(MeshError::KeyNotFound(format!(
                "{key} requested by {from} is not held here"
            )));
        }

        info!(key, from, "serving file over the network");
        let (size, mut file) = self.storage.read(id, key).await?;
        let peer = self.peer(from)?;

        // Stream tag, size prefix and body under one writer lock; the
        // whole response is one logical frame.
        let mut header = Vec::with_capacity(1 + 8);
        header.push(INCOMING_STREAM);
        header.extend_from_slice(&(size as i64).to_le_bytes());
        let n = {
            let mut writer = peer.writer().await;
            writer.write_all(&header).await?;
            let n = tokio::io::copy(&mut file, &mut *writer).await?;
            writer.flush().await?;
            n
        };
        info!(bytes = n, key, to = from, "served file bytes");
        Ok(())
    }

    async fn broadcast(&self, msg: &Message) -> MeshResult<()> {
        let payload = msg.encode()?;
        // Tag and payload in a single write, to match the decoder's
        // one-read policy on the receiving side.
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(INCOMING_MESSAGE);
        frame.extend_from_slice(&payload);

        for peer in self.peer_snapshot() {
            if let Err(err) = peer.send(&frame).await {
                warn!(peer = %peer.remote_addr(), %err, "broadcast send failed");
            }
        }
        Ok(())
    }

    fn peer(&self, addr: &str) -> MeshResult<TcpPeer> {
        self.peers
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or_else(|| MeshError::PeerNotFound(addr.to_owned()))
    }

    fn peer_snapshot(&self) -> Vec<TcpPeer> {
        self.peers.lock().unwrap().values().cloned().collect()
    }
}
