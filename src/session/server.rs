use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::session::beacon::BeaconBroadcaster;
use crate::session::channel::{Channel, ChannelRegistry, CheckMode, DataChannel, Qos};
use crate::session::config::SessionConfig;
use crate::session::heartbeat;
use crate::session::peer::{Peer, PeerGroup, PeerRegistry};
use crate::session::{build_frame, CallbackExecutor, ConnectionHandler, InlineExecutor};
use crate::transport::buffer_pool::BufferPool;
use crate::transport::tcp::{TcpConnection, TcpServerTransport};
use crate::transport::udp::UdpTransport;
use crate::transport::{DatagramHandler, StreamHandler};
use crate::wire::codec::{StringCodec, U8Codec};
use crate::wire::compress::Compression;
use crate::wire::frame::{try_next_frame, ChannelId};


/// The server half of a session: accepts any number of clients, tracks them in the peer
///  registry, probes their liveness and routes per-channel traffic over the transport the
///  channel's QoS selects. Lifecycle is `Closed -> Open -> Closed`; both transitions are
///  idempotent.
pub struct SessionServer {
    core: Arc<ServerCore>,
    state: tokio::sync::Mutex<Option<OpenState>>,
    is_open: AtomicBool,
}

struct OpenState {
    udp: Arc<UdpTransport>,
    tcp: Arc<TcpServerTransport>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServerCore {
    config: Arc<SessionConfig>,
    channels: ChannelRegistry,
    peers: Arc<PeerRegistry>,
    executor: Arc<dyn CallbackExecutor>,
    beacon: Arc<BeaconBroadcaster>,
    buffer_pool: Arc<BufferPool>,
    on_connected: Arc<Mutex<Option<ConnectionHandler>>>,
    on_disconnected: Mutex<Option<ConnectionHandler>>,
    /// present while the session is open; the unreliable send path and the beacon one-shots
    ///  go through here
    udp: Mutex<Option<Arc<UdpTransport>>>,
}

impl SessionServer {
    pub fn new(config: SessionConfig) -> anyhow::Result<SessionServer> {
        Self::with_executor(config, Arc::new(InlineExecutor))
    }

    pub fn with_executor(
        config: SessionConfig,
        executor: Arc<dyn CallbackExecutor>,
    ) -> anyhow::Result<SessionServer> {
        let config = Arc::new(config);
        let on_connected: Arc<Mutex<Option<ConnectionHandler>>> = Arc::new(Mutex::new(None));

        let core = Arc::new(ServerCore {
            config: config.clone(),
            channels: ChannelRegistry::new(),
            peers: Arc::new(PeerRegistry::new()),
            executor,
            beacon: Arc::new(BeaconBroadcaster::new()),
            buffer_pool: BufferPool::new(config.buffer_size, config.max_pooled_buffers),
            on_connected: on_connected.clone(),
            on_disconnected: Mutex::new(None),
            udp: Mutex::new(None),
        });

        // the login channel completes the handshake: it delivers the peer's display name,
        // and only then does the application learn about the connection
        core.channels.register(Arc::new(DataChannel::new(
            config.reserved_channels.login,
            Qos::Reliable,
            Compression::None,
            StringCodec,
            move |peer: Option<Arc<Peer>>, name: String| {
                if let Some(peer) = peer {
                    peer.set_name(name);
                    info!("login completed: {:?}", peer);
                    let handler = on_connected.lock().expect("handler lock poisoned").clone();
                    if let Some(handler) = handler {
                        handler(peer);
                    }
                }
            },
        )))?;

        core.channels.register(Arc::new(DataChannel::new(
            config.reserved_channels.health,
            Qos::Unreliable,
            Compression::None,
            U8Codec,
            |_, _: u8| {},
        )))?;

        Ok(SessionServer {
            core,
            state: tokio::sync::Mutex::new(None),
            is_open: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn set_on_connected(&self, handler: impl Fn(Arc<Peer>) + Send + Sync + 'static) {
        *self.core.on_connected.lock().expect("handler lock poisoned") = Some(Arc::new(handler));
    }

    pub fn set_on_disconnected(&self, handler: impl Fn(Arc<Peer>) + Send + Sync + 'static) {
        *self.core.on_disconnected.lock().expect("handler lock poisoned") = Some(Arc::new(handler));
    }

    pub fn add_channel<T: Send + 'static>(&self, channel: DataChannel<T>) -> anyhow::Result<()> {
        if self.core.config.reserved_channels.is_reserved(channel.id()) {
            anyhow::bail!("channel id {:?} is reserved for session-internal traffic", channel.id());
        }
        self.core.channels.register(Arc::new(channel))
    }

    pub fn remove_channel(&self, id: ChannelId) -> anyhow::Result<()> {
        if self.core.config.reserved_channels.is_reserved(id) {
            anyhow::bail!("channel id {:?} is reserved for session-internal traffic", id);
        }
        self.core.channels.deregister(id)
    }

    pub fn get_peer(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.core.peers.find(addr)
    }

    /// Binds both transports, starts the liveness monitor and the beacon task. A no-op if
    ///  the session is already open.
    pub async fn open(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let config = &self.core.config;
        let udp = Arc::new(UdpTransport::bind(config.listen_port, self.core.buffer_pool.clone()).await?);
        let tcp = Arc::new(TcpServerTransport::bind(config.listen_port).await?);
        *self.core.udp.lock().expect("transport lock poisoned") = Some(udp.clone());

        let mut tasks = Vec::new();
        {
            let udp = udp.clone();
            let handler: Arc<dyn DatagramHandler> = self.core.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = udp.recv_loop(handler).await {
                    error!("datagram receive loop failed: {}", e);
                }
            }));
        }
        {
            let tcp = tcp.clone();
            let encoding = config.channel_id_encoding;
            let pool = self.core.buffer_pool.clone();
            let handler: Arc<dyn StreamHandler> = self.core.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = tcp.accept_loop(encoding, pool, handler).await {
                    error!("accept loop failed: {}", e);
                }
            }));
        }
        tasks.push(tokio::spawn(heartbeat::server_heartbeat_loop(
            config.clone(),
            self.core.peers.clone(),
            udp.clone(),
        )));
        {
            let beacon = self.core.beacon.clone();
            let udp = udp.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move {
                beacon.announce_loop(udp, config).await;
            }));
        }

        info!("server session open, listening on port {}", config.listen_port);
        *state = Some(OpenState { udp, tcp, tasks });
        self.is_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Disconnects every peer, stops all transports and timers. A no-op if already closed.
    pub async fn close(&self) {
        let state = self.state.lock().await.take();
        let Some(state) = state else {
            return;
        };
        self.is_open.store(false, Ordering::SeqCst);
        self.core.beacon.stop();

        for peer in self.core.peers.all() {
            peer.connection().disconnect();
        }

        state.tcp.cancel();
        state.udp.cancel();
        for task in state.tasks {
            task.abort();
        }
        *self.core.udp.lock().expect("transport lock poisoned") = None;

        info!("server session closed");
    }

    /// Forcibly drops one peer's connection; the regular disconnect path removes it from
    ///  the registry and fires the disconnected callback. `false` if the peer is not (or no
    ///  longer) registered.
    pub fn disconnect(&self, peer: &Arc<Peer>) -> bool {
        if !self.core.peers.contains(peer.addr()) {
            return false;
        }
        peer.connection().disconnect();
        true
    }

    /// Sends one value to one peer, routed by the channel's QoS class. `false` is a
    ///  delivery failure (unknown channel, unregistered peer, lost connection), not a fatal
    ///  error.
    pub async fn send<T: 'static>(&self, peer: &Arc<Peer>, channel_id: ChannelId, value: &T) -> bool {
        if !self.core.peers.contains(peer.addr()) {
            return false;
        }
        let Some(channel) = self.core.channels.get(channel_id) else {
            return false;
        };

        let frame = match build_frame(self.core.config.channel_id_encoding, channel.as_ref(), value) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode value for {:?}: {}", channel_id, e);
                return false;
            }
        };
        self.core.route(&channel, peer, &frame).await
    }

    /// Fan-out of one value to a peer group, encoded once. Members that have left the
    ///  registry (or equal `exclude`) are skipped. `false` only for an unknown channel.
    pub async fn broadcast<T: 'static>(
        &self,
        group: &PeerGroup,
        channel_id: ChannelId,
        value: &T,
        exclude: Option<&Arc<Peer>>,
    ) -> bool {
        let Some(channel) = self.core.channels.get(channel_id) else {
            return false;
        };
        let frame = match build_frame(self.core.config.channel_id_encoding, channel.as_ref(), value) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode value for {:?}: {}", channel_id, e);
                return false;
            }
        };

        for peer in group.members() {
            if let Some(excluded) = exclude {
                if peer.addr() == excluded.addr() {
                    continue;
                }
            }
            if !self.core.peers.contains(peer.addr()) {
                continue;
            }
            self.core.route(&channel, &peer, &frame).await;
        }
        true
    }

    // --- discovery ---

    pub fn add_beacon_target(&self, addr: IpAddr) {
        self.core.beacon.add_target(addr);
    }

    pub fn remove_beacon_target(&self, addr: IpAddr) {
        self.core.beacon.remove_target(addr);
    }

    pub fn set_beacon_announcement(&self, f: impl Fn() -> String + Send + Sync + 'static) {
        self.core.beacon.set_announcement(f);
    }

    pub fn beacon_start(&self) {
        self.core.beacon.start();
    }

    pub fn beacon_stop(&self) {
        self.core.beacon.stop();
    }

    /// One-shot directed announcement, e.g. to invite a known host outside the regular
    ///  beacon target list.
    pub async fn send_connect_beacon(&self, to: IpAddr) -> anyhow::Result<()> {
        let udp = self.core.udp()
            .ok_or_else(|| anyhow::anyhow!("session is not open"))?;
        self.core.beacon.send_connect_beacon(&udp, &self.core.config, to).await
    }
}

impl ServerCore {
    fn udp(&self) -> Option<Arc<UdpTransport>> {
        self.udp.lock().expect("transport lock poisoned").clone()
    }

    async fn route(&self, channel: &Arc<dyn Channel>, peer: &Arc<Peer>, frame: &[u8]) -> bool {
        match channel.qos() {
            Qos::Reliable => match peer.connection().send(frame).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("reliable send to {:?} failed: {}", peer, e);
                    false
                }
            },
            Qos::Unreliable => match self.udp() {
                Some(udp) => {
                    udp.send_to(SocketAddr::new(peer.addr(), self.config.send_port), frame).await;
                    true
                }
                None => false,
            },
        }
    }

    fn fire_disconnected(&self, peer: Arc<Peer>) {
        let handler = self.on_disconnected.lock().expect("handler lock poisoned").clone();
        if let Some(handler) = handler {
            self.executor.run(Box::new(move || handler(peer)));
        }
    }

    /// The shared dispatch path for both transports. Stream frames always carry peer
    ///  identity; datagram frames only go through peer lookup for `Verified` channels.
    async fn dispatch_frame(&self, from: IpAddr, channel_id: ChannelId, payload: &[u8], from_stream: bool) {
        let reserved = &self.config.reserved_channels;

        if channel_id == reserved.beacon {
            // servers announce, they do not listen
            return;
        }

        let Some(channel) = self.channels.get(channel_id) else {
            return;
        };

        let verified = from_stream || channel.check_mode() == CheckMode::Verified;
        let result = if verified {
            match self.peers.find(from) {
                Some(peer) => {
                    peer.reset_health();
                    channel.dispatch(Some(peer), payload, self.executor.as_ref())
                }
                None => {
                    debug!("dropping frame on {:?} from unknown sender {}", channel_id, from);
                    Ok(())
                }
            }
        }
        else {
            channel.dispatch(None, payload, self.executor.as_ref())
        };

        if let Err(e) = result {
            warn!("failed to dispatch frame on {:?} from {}: {}", channel_id, from, e);
        }
    }
}

#[async_trait::async_trait]
impl DatagramHandler for ServerCore {
    async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
        let mut remaining = buf;
        loop {
            // a fresh frame view per iteration: the scan state lives in `remaining` alone
            match try_next_frame(&mut remaining, self.config.channel_id_encoding) {
                Ok(Some(frame)) => {
                    self.dispatch_frame(from.ip(), frame.channel_id, frame.payload, false).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("malformed datagram from {}: {} - discarding rest of buffer", from, e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl StreamHandler for ServerCore {
    async fn on_connected(&self, connection: Arc<TcpConnection>) {
        let peer = Arc::new(Peer::new(connection.peer_ip(), connection.clone()));
        match self.peers.add(peer) {
            Ok(()) => {
                debug!("connection from {}", connection.peer_addr());
                // the connected callback fires once the login frame arrives
            }
            Err(e) => {
                warn!("rejecting connection from {}: {}", connection.peer_addr(), e);
                connection.disconnect();
            }
        }
    }

    async fn on_disconnected(&self, connection: Arc<TcpConnection>) {
        // remove only the peer owning this connection: a rejected duplicate connection's
        // teardown must not evict the original peer at the same address
        let removed = match self.peers.find(connection.peer_ip()) {
            Some(peer) if Arc::ptr_eq(peer.connection(), &connection) => {
                self.peers.remove(connection.peer_ip())
            }
            _ => None,
        };

        if let Some(peer) = removed {
            info!("peer {:?} disconnected", peer);
            self.fire_disconnected(peer);
        }
    }

    async fn on_frame(&self, connection: Arc<TcpConnection>, channel_id: ChannelId, payload: &[u8]) {
        self.dispatch_frame(connection.peer_ip(), channel_id, payload, true).await;
    }
}
