//! The gateway: peer map ownership, the accept loop, and the peer
//! manager that keeps the node well connected.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock as StdRwLock, Weak};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crest_types::{BlockId, NetAddress, Network};

use crate::config::Config;
use crate::error::Error;
use crate::handshake::{self, InstanceId, ProtocolVersion, VersionHeader, CONN_STD_DEADLINE};
use crate::mux;
use crate::nodes::NodeTable;
use crate::peer::{self, Peer, PeerInfo};
use crate::rpc::{self, InitRpc, Registry, RpcHandler};
use crate::wire;

/// Protocol version this gateway speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 2);

/// Most node addresses a single `ShareNodes` reply may carry.
const MAX_SHARED_NODES: usize = 10;

/// Upper bound on an encoded `ShareNodes` reply.
const MAX_NODE_LIST_LEN: u32 = 4096;

/// Upper bound on the host string a `DiscoverIP` reply carries.
const MAX_HOST_LEN: usize = 64;

const NODES_FILE: &str = "nodes.dat";

struct Inner {
    config: Config,
    genesis_id: BlockId,
    unique_id: InstanceId,
    /// Filled in once the listener is bound.
    advertised_port: OnceLock<u16>,
    peers: RwLock<HashMap<NetAddress, Peer>>,
    nodes: Mutex<NodeTable>,
    handlers: Arc<StdRwLock<Registry>>,
    cancellation: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn version_header(&self, want_conn: bool) -> VersionHeader {
        VersionHeader {
            version: PROTOCOL_VERSION,
            genesis_id: self.genesis_id,
            unique_id: self.unique_id,
            want_conn,
        }
    }

    fn dialback_port(&self) -> u16 {
        self.advertised_port
            .get()
            .copied()
            .unwrap_or_else(|| self.config.listen.port())
    }

    /// Local peers are shielded from kicking. On setups that admit
    /// local addresses into the mesh, loopback is the norm and would
    /// shield everyone, so the shield is dropped there.
    fn is_local_peer(&self, address: &NetAddress) -> bool {
        !self.config.allow_local_addresses && address.is_local()
    }

    async fn outbound_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| !peer.inbound)
            .count()
    }

    /// Sleep, waking early on shutdown. Returns false when shutting down.
    async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancellation.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// A peer-to-peer overlay endpoint.
///
/// Cheap to clone; all clones drive the same gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Create a gateway for `network`, loading the persisted node list
    /// from the configured data directory and seeding the bootstrap
    /// addresses. Call [`Gateway::run`] to start serving.
    pub fn new(config: Config, network: Network) -> Result<Self, Error> {
        if !config.data_dir.exists() {
            std::fs::create_dir_all(&config.data_dir)?;
        }

        let mut table = NodeTable::load(
            config.data_dir.join(NODES_FILE),
            config.max_nodes,
            config.persist_interval,
            config.allow_local_addresses,
        )?;
        for address in &config.bootstrap {
            if let Err(err) = table.add(address.clone()) {
                warn!("skipping bootstrap address {address}: {err}");
            }
        }

        let inner = Arc::new(Inner {
            genesis_id: network.genesis_block_id(),
            unique_id: InstanceId::random(),
            advertised_port: OnceLock::new(),
            peers: RwLock::new(HashMap::new()),
            nodes: Mutex::new(table),
            handlers: Arc::new(StdRwLock::new(Registry::default())),
            cancellation: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        });

        let gateway = Self { inner };
        gateway.register_rpc(
            "ShareNodes",
            Arc::new(ShareNodesHandler {
                inner: Arc::downgrade(&gateway.inner),
            }),
        );
        gateway.register_rpc("DiscoverIP", Arc::new(DiscoverIpHandler));
        gateway.register_init_rpc(
            "ShareNodes",
            Arc::new(ShareNodesInit {
                inner: Arc::downgrade(&gateway.inner),
            }),
        );

        Ok(gateway)
    }

    /// Identity of this gateway instance.
    pub fn unique_id(&self) -> InstanceId {
        self.inner.unique_id
    }

    /// Register a stream handler. The first registration of a name wins.
    pub fn register_rpc(&self, name: &str, handler: Arc<dyn RpcHandler>) {
        self.inner
            .handlers
            .write()
            .expect("rpc registry poisoned")
            .register(name, handler);
    }

    /// Register an RPC to fire against every new outbound peer.
    pub fn register_init_rpc(&self, name: &str, rpc: Arc<dyn InitRpc>) {
        self.inner
            .handlers
            .write()
            .expect("rpc registry poisoned")
            .register_init(name, rpc);
    }

    /// Bind the listener and start the accept loop and the peer manager.
    /// Returns the bound address.
    pub async fn run(&self) -> Result<std::net::SocketAddr, Error> {
        let listener = TcpListener::bind(self.inner.config.listen).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.inner.advertised_port.set(
            self.inner
                .config
                .advertised_port
                .unwrap_or_else(|| local_addr.port()),
        );
        info!("gateway listening on {local_addr}");

        self.inner
            .tracker
            .spawn(run_accept_loop(self.inner.clone(), listener));
        self.inner.tracker.spawn(run_peer_manager(self.inner.clone()));

        Ok(local_addr)
    }

    /// Dial `address`, handshake, and add it as an outbound peer. On
    /// success the address is recorded in the node table with the
    /// outbound flag and all init-RPCs are fired against the new peer.
    pub async fn connect(&self, address: NetAddress) -> Result<(), Error> {
        connect_to(&self.inner, address).await
    }

    /// Drop a connected peer.
    pub async fn disconnect(&self, address: &NetAddress) -> Result<(), Error> {
        let peer = self
            .inner
            .peers
            .write()
            .await
            .remove(address)
            .ok_or(Error::PeerNotConnected)?;
        peer.close();
        info!("disconnected from {address}");
        Ok(())
    }

    /// Snapshot of the connected peers.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .peers
            .read()
            .await
            .values()
            .map(Peer::info)
            .collect()
    }

    /// Number of outbound peers currently connected.
    pub async fn outbound_count(&self) -> usize {
        self.inner.outbound_count().await
    }

    /// Open a stream to a connected peer and write the RPC preamble.
    /// The returned stream is ready for handler-defined traffic.
    pub async fn open_rpc(
        &self,
        address: &NetAddress,
        name: &str,
    ) -> Result<mux::Stream, Error> {
        let session = {
            let peers = self.inner.peers.read().await;
            peers
                .get(address)
                .ok_or(Error::PeerNotConnected)?
                .session
                .clone()
        };

        let mut stream = session.open_stream()?;
        rpc::write_name(&mut stream, name).await?;
        Ok(stream)
    }

    /// Ask a connected peer which host it observes us as.
    pub async fn discover_address(&self, address: &NetAddress) -> Result<String, Error> {
        let mut stream = self.open_rpc(address, "DiscoverIP").await?;
        wire::read_short_string(&mut stream, MAX_HOST_LEN).await
    }

    /// Shut the gateway down: cancel all loops, close every session,
    /// persist the node table, and wait for every task to exit.
    pub async fn close(&self) {
        self.inner.cancellation.cancel();

        {
            let mut peers = self.inner.peers.write().await;
            for (_, peer) in peers.drain() {
                peer.close();
            }
        }

        if let Err(err) = self.inner.nodes.lock().await.persist_now() {
            warn!("failed to persist node table during shutdown: {err}");
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("gateway closed");
    }
}

async fn connect_to(inner: &Arc<Inner>, address: NetAddress) -> Result<(), Error> {
    if inner.cancellation.is_cancelled() {
        return Err(Error::TransportClosed);
    }
    if !inner.config.allow_local_addresses {
        address.validate_remote()?;
    }
    if inner.peers.read().await.contains_key(&address) {
        return Err(Error::PeerAlreadyConnected);
    }

    let mut conn = timeout(CONN_STD_DEADLINE, TcpStream::connect(address.to_string()))
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

    let local_header = inner.version_header(true);
    let handshake_res = timeout(
        CONN_STD_DEADLINE,
        handshake::exchange_as_dialer(&mut conn, &local_header, inner.dialback_port()),
    )
    .await
    .map_err(|_| Error::HandshakeTimeout)?;

    let remote = match handshake_res {
        Ok(remote) => remote,
        Err(Error::SelfDial) => {
            // That address is us; forget it ever was a node.
            inner.nodes.lock().await.remove(&address);
            return Err(Error::SelfDial);
        }
        Err(err) => return Err(err),
    };

    let session = mux::Session::client(conn, inner.config.mux.clone());
    let peer = Peer::new(
        address.clone(),
        false,
        inner.is_local_peer(&address),
        remote.version,
        session.clone(),
    );

    {
        let mut peers = inner.peers.write().await;
        if peers.contains_key(&address) {
            session.close();
            return Err(Error::PeerAlreadyConnected);
        }
        peers.insert(address.clone(), peer);
    }
    {
        let mut nodes = inner.nodes.lock().await;
        let _ = nodes.add(address.clone());
        nodes.mark_outbound(&address);
    }

    info!("connected to {address} (version {})", remote.version);
    spawn_peer_tasks(inner.clone(), address.clone(), session.clone());

    // Bootstrap RPCs run concurrently; their failures never undo the
    // connection.
    let init_rpcs = inner
        .handlers
        .read()
        .expect("rpc registry poisoned")
        .init_rpcs();
    for (name, init) in init_rpcs {
        let session = session.clone();
        let address = address.clone();
        inner.tracker.spawn(async move {
            let res = async {
                let mut stream = session.open_stream()?;
                rpc::write_name(&mut stream, &name).await?;
                init.call(stream, address.clone()).await
            }
            .await;

            if let Err(err) = res {
                debug!("init rpc {name} against {address} failed: {err}");
            }
        });
    }

    Ok(())
}

fn spawn_peer_tasks(inner: Arc<Inner>, address: NetAddress, session: mux::Session) {
    let handlers = inner.handlers.clone();
    let tracker = inner.tracker.clone();
    let cancellation = inner.cancellation.clone();

    inner.tracker.clone().spawn(async move {
        peer::run_listener(
            session,
            address.clone(),
            handlers,
            tracker,
            cancellation,
        )
        .await;

        // The session is gone; retire the peer. The address may already
        // belong to a fresh reconnect, which must be left alone.
        let mut peers = inner.peers.write().await;
        if peers
            .get(&address)
            .map_or(false, |peer| peer.session.is_closed())
        {
            peers.remove(&address);
            debug!("peer {address} disconnected");
        }
    });
}

async fn run_accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let (conn, socket_addr) = tokio::select! {
            _ = inner.cancellation.cancelled() => return,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept failed: {err}");
                    if !inner.sleep(inner.config.accept_interval).await {
                        return;
                    }
                    continue;
                }
            },
        };

        trace!("incoming connection from {socket_addr}");
        inner
            .tracker
            .clone()
            .spawn(handle_inbound(inner.clone(), conn, socket_addr));

        // Throttle the inbound accept rate.
        if !inner.sleep(inner.config.accept_interval).await {
            return;
        }
    }
}

async fn handle_inbound(
    inner: Arc<Inner>,
    mut conn: TcpStream,
    socket_addr: std::net::SocketAddr,
) {
    let local_header = inner.version_header(true);
    let handshake_res = timeout(
        CONN_STD_DEADLINE,
        handshake::exchange_as_acceptor(&mut conn, &local_header),
    )
    .await;

    let (remote, dialback_port) = match handshake_res {
        Ok(Ok(exchange)) => exchange,
        Ok(Err(err)) => {
            debug!("inbound handshake with {socket_addr} failed: {err}");
            return;
        }
        Err(_) => {
            debug!("inbound handshake with {socket_addr} timed out");
            return;
        }
    };

    // Re-derive a dialable address from the observed host and the port
    // the dialer claims to listen on. Building it from the observed host
    // guarantees the port field cannot smuggle in a different host.
    let observed: NetAddress = socket_addr.into();
    let address = match observed.with_port(dialback_port) {
        Ok(address) => address,
        Err(err) => {
            debug!("inbound peer {socket_addr} sent an unusable dial-back port: {err}");
            return;
        }
    };

    let session = mux::Session::server(conn, inner.config.mux.clone());
    let peer = Peer::new(
        address.clone(),
        true,
        inner.is_local_peer(&address),
        remote.version,
        session.clone(),
    );

    if let Err(err) = accept_peer(&inner, peer).await {
        debug!("rejecting inbound peer {address}: {err}");
        session.close();
        return;
    }

    {
        let mut nodes = inner.nodes.lock().await;
        if let Err(err) = nodes.add(address.clone()) {
            trace!("not recording inbound peer {address} as node: {err}");
        }
    }

    info!("accepted inbound peer {address} (version {})", remote.version);
    spawn_peer_tasks(inner.clone(), address, session);
}

/// Add an inbound peer to the map, kicking someone if the gateway is
/// fully connected. Outbound and local peers are never kicked; with no
/// eligible victim the peer is accepted anyway.
async fn accept_peer(inner: &Arc<Inner>, peer: Peer) -> Result<(), Error> {
    let mut peers = inner.peers.write().await;

    if peers.contains_key(&peer.address) {
        return Err(Error::PeerAlreadyConnected);
    }

    if peers.len() >= inner.config.fully_connected_threshold {
        let same_host = peers
            .values()
            .filter(|p| p.inbound && !p.local)
            .find(|p| p.address.host() == peer.address.host())
            .map(|p| p.address.clone());

        let victim = same_host.or_else(|| {
            let kickable: Vec<NetAddress> = peers
                .values()
                .filter(|p| p.inbound && !p.local)
                .map(|p| p.address.clone())
                .collect();
            if kickable.is_empty() {
                None
            } else {
                Some(kickable[fastrand::usize(..kickable.len())].clone())
            }
        });

        if let Some(victim) = victim {
            if let Some(kicked) = peers.remove(&victim) {
                info!("kicking peer {victim} to make room for {}", peer.address);
                kicked.close();
            }
        }
    }

    peers.insert(peer.address.clone(), peer);
    Ok(())
}

/// Keep at least the configured number of outbound peers, preferring
/// addresses that have served as outbound peers before.
async fn run_peer_manager(inner: Arc<Inner>) {
    loop {
        if inner.cancellation.is_cancelled() {
            return;
        }

        if inner.outbound_count().await >= inner.config.well_connected_threshold {
            if !inner.sleep(inner.config.well_connected_delay).await {
                return;
            }
            continue;
        }

        let candidates = inner.nodes.lock().await.snapshot_outbound_first();
        if candidates.is_empty() {
            if !inner.sleep(inner.config.no_nodes_delay).await {
                return;
            }
            continue;
        }

        for address in candidates {
            if inner.cancellation.is_cancelled() {
                return;
            }
            if inner.outbound_count().await >= inner.config.well_connected_threshold {
                break;
            }
            if inner.peers.read().await.contains_key(&address) {
                continue;
            }

            match connect_to(&inner, address.clone()).await {
                Ok(()) => debug!("peer manager connected to {address}"),
                Err(err) => trace!("peer manager could not connect to {address}: {err}"),
            }

            if !inner.sleep(inner.config.accept_interval).await {
                return;
            }
        }
    }
}

/// Serves the `ShareNodes` RPC: a random sample of known nodes.
struct ShareNodesHandler {
    inner: Weak<Inner>,
}

#[async_trait]
impl RpcHandler for ShareNodesHandler {
    async fn handle(&self, mut stream: mux::Stream, _remote: NetAddress) -> Result<(), Error> {
        let inner = self.inner.upgrade().ok_or(Error::TransportClosed)?;

        let sample = inner.nodes.lock().await.sample(MAX_SHARED_NODES);
        wire::write_cbor(&mut stream, &sample, MAX_NODE_LIST_LEN).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Dialer side of `ShareNodes`: feed the reply into the node table.
struct ShareNodesInit {
    inner: Weak<Inner>,
}

#[async_trait]
impl InitRpc for ShareNodesInit {
    async fn call(&self, mut stream: mux::Stream, remote: NetAddress) -> Result<(), Error> {
        let shared: Vec<NetAddress> = wire::read_cbor(&mut stream, MAX_NODE_LIST_LEN).await?;
        if shared.len() > MAX_SHARED_NODES {
            return Err(Error::Decode(format!(
                "peer shared {} nodes, bound is {MAX_SHARED_NODES}",
                shared.len()
            )));
        }

        let inner = self.inner.upgrade().ok_or(Error::TransportClosed)?;
        let mut nodes = inner.nodes.lock().await;
        for address in shared {
            match nodes.add(address.clone()) {
                Ok(true) => trace!("learned node {address} from {remote}"),
                Ok(false) => {}
                Err(err) => trace!("discarding node {address} shared by {remote}: {err}"),
            }
        }
        Ok(())
    }
}

/// Serves `DiscoverIP`: tell the caller which host we see it as.
struct DiscoverIpHandler;

#[async_trait]
impl RpcHandler for DiscoverIpHandler {
    async fn handle(&self, mut stream: mux::Stream, remote: NetAddress) -> Result<(), Error> {
        wire::write_short_string(&mut stream, remote.host(), MAX_HOST_LEN).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
