use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::session::beacon::parse_beacon;
use crate::session::channel::{Channel, ChannelRegistry, CheckMode, DataChannel, Qos};
use crate::session::config::SessionConfig;
use crate::session::heartbeat;
use crate::session::peer::Peer;
use crate::session::{build_frame, CallbackExecutor, ConnectionHandler, InlineExecutor};
use crate::transport::buffer_pool::BufferPool;
use crate::transport::tcp::{self, TcpConnection};
use crate::transport::udp::UdpTransport;
use crate::transport::{DatagramHandler, StreamHandler};
use crate::wire::codec::{StringCodec, U8Codec};
use crate::wire::compress::Compression;
use crate::wire::frame::{try_next_frame, ChannelId};

pub type BeaconAcceptFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;


/// The client half of a session: connects to exactly one server at a time, either
///  explicitly or in response to an accepted discovery beacon, and exchanges per-channel
///  traffic with it. Lifecycle is `Closed -> Open -> Closed`; connecting and disconnecting
///  happen any number of times while open.
pub struct SessionClient {
    core: Arc<ClientCore>,
    state: tokio::sync::Mutex<Option<OpenState>>,
    is_open: AtomicBool,
}

struct OpenState {
    udp: Arc<UdpTransport>,
    tasks: Vec<JoinHandle<()>>,
}

struct ClientCore {
    /// for spawning connection attempts from handler context
    me: Weak<ClientCore>,
    config: Arc<SessionConfig>,
    channels: ChannelRegistry,
    executor: Arc<dyn CallbackExecutor>,
    buffer_pool: Arc<BufferPool>,
    display_name: Mutex<String>,
    accept_beacon: AtomicBool,
    beacon_accept: Mutex<BeaconAcceptFn>,
    on_connected: Mutex<Option<ConnectionHandler>>,
    on_disconnected: Mutex<Option<ConnectionHandler>>,
    /// guards against concurrent connection attempts (explicit and beacon-triggered alike)
    connecting: AtomicBool,
    server_peer: Mutex<Option<Arc<Peer>>>,
    health_lost: Arc<AtomicU32>,
    udp: Mutex<Option<Arc<UdpTransport>>>,
}

impl SessionClient {
    pub fn new(config: SessionConfig) -> anyhow::Result<SessionClient> {
        Self::with_executor(config, Arc::new(InlineExecutor))
    }

    pub fn with_executor(
        config: SessionConfig,
        executor: Arc<dyn CallbackExecutor>,
    ) -> anyhow::Result<SessionClient> {
        let config = Arc::new(config);

        let core = Arc::new_cyclic(|me| ClientCore {
            me: me.clone(),
            config: config.clone(),
            channels: ChannelRegistry::new(),
            executor,
            buffer_pool: BufferPool::new(config.buffer_size, config.max_pooled_buffers),
            display_name: Mutex::new("".to_string()),
            accept_beacon: AtomicBool::new(false),
            beacon_accept: Mutex::new(Arc::new(|_: &str| true) as BeaconAcceptFn),
            on_connected: Mutex::new(None),
            on_disconnected: Mutex::new(None),
            connecting: AtomicBool::new(false),
            server_peer: Mutex::new(None),
            health_lost: Arc::new(AtomicU32::new(0)),
            udp: Mutex::new(None),
        });

        // clients send their login, they never receive one
        core.channels.register(Arc::new(DataChannel::new(
            config.reserved_channels.login,
            Qos::Reliable,
            Compression::None,
            StringCodec,
            |_, _: String| {},
        )))?;

        // client side health goes over the reliable transport: the client may sit behind
        // NAT, where unsolicited datagrams from the server would not arrive
        let health_lost = core.health_lost.clone();
        core.channels.register(Arc::new(DataChannel::new(
            config.reserved_channels.health,
            Qos::Reliable,
            Compression::None,
            U8Codec,
            move |_, _: u8| {
                health_lost.store(0, Ordering::SeqCst);
            },
        )))?;

        Ok(SessionClient {
            core,
            state: tokio::sync::Mutex::new(None),
            is_open: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.core.server_peer().is_some()
    }

    pub fn server_peer(&self) -> Option<Arc<Peer>> {
        self.core.server_peer()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        *self.core.display_name.lock().expect("name lock poisoned") = name.into();
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

    /// While set, beacons passing the acceptance predicate trigger a connection attempt
    ///  to the announcing server. Beacons are ignored while connecting or connected.
    pub fn set_accept_beacon(&self, accept: bool) {
        self.core.accept_beacon.store(accept, Ordering::SeqCst);
    }

    pub fn set_beacon_accept(&self, f: impl Fn(&str) -> bool + Send + Sync + 'static) {
        *self.core.beacon_accept.lock().expect("beacon lock poisoned") = Arc::new(f);
    }

    /// Binds the datagram transport and starts listening for beacons and unreliable
    ///  traffic. A no-op if the session is already open.
    pub async fn open(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let config = &self.core.config;
        let udp = Arc::new(UdpTransport::bind(config.listen_port, self.core.buffer_pool.clone()).await?);
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

        info!("client session open, listening on port {}", config.listen_port);
        *state = Some(OpenState { udp, tasks });
        self.is_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Disconnects from the server (if connected) and stops the transports. A no-op if
    ///  already closed.
    pub async fn close(&self) {
        let state = self.state.lock().await.take();
        let Some(state) = state else {
            return;
        };
        self.is_open.store(false, Ordering::SeqCst);
        self.disconnect();

        state.udp.cancel();
        for task in state.tasks {
            task.abort();
        }
        *self.core.udp.lock().expect("transport lock poisoned") = None;

        info!("client session closed");
    }

    /// Starts a connection attempt to a server. `false` if the session is closed or a
    ///  connection exists or is being established; the attempt itself runs asynchronously,
    ///  and its outcome is reported through the connected callback (or not at all, on
    ///  failure, leaving the client free for the next attempt).
    pub fn connect(&self, server: IpAddr) -> bool {
        if !self.is_open() || self.is_connected() {
            return false;
        }
        if self.core.connecting.swap(true, Ordering::SeqCst) {
            return false;
        }
        let core = self.core.clone();
        tokio::spawn(async move {
            core.run_connect(server).await;
        });
        true
    }

    /// Drops the server connection. `false` if there was none.
    pub fn disconnect(&self) -> bool {
        match self.core.server_peer() {
            Some(peer) => {
                peer.connection().disconnect();
                true
            }
            None => false,
        }
    }

    /// Sends one value to the server, routed by the channel's QoS class. `false` is a
    ///  delivery failure (not connected, unknown channel, lost connection).
    pub async fn send<T: 'static>(&self, channel_id: ChannelId, value: &T) -> bool {
        let Some(peer) = self.core.server_peer() else {
            return false;
        };
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
        self.core.route(&channel, &peer, &frame).await
    }
}

impl ClientCore {
    fn server_peer(&self) -> Option<Arc<Peer>> {
        self.server_peer.lock().expect("peer lock poisoned").clone()
    }

    /// Clears the stored peer only if it owns this connection, so a stale teardown from a
    ///  previous connection cannot tear down the current one.
    fn clear_server_peer(&self, connection: &Arc<TcpConnection>) -> Option<Arc<Peer>> {
        let mut server_peer = self.server_peer.lock().expect("peer lock poisoned");
        match &*server_peer {
            Some(peer) if Arc::ptr_eq(peer.connection(), connection) => server_peer.take(),
            _ => None,
        }
    }

    fn udp(&self) -> Option<Arc<UdpTransport>> {
        self.udp.lock().expect("transport lock poisoned").clone()
    }

    async fn route(&self, channel: &Arc<dyn Channel>, peer: &Arc<Peer>, frame: &[u8]) -> bool {
        match channel.qos() {
            Qos::Reliable => match peer.connection().send(frame).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("reliable send failed: {}", e);
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

    async fn run_connect(self: Arc<Self>, server: IpAddr) {
        let to = SocketAddr::new(server, self.config.send_port);
        let handler: Arc<dyn StreamHandler> = self.clone();

        let connection = match tcp::connect(
            to,
            self.config.channel_id_encoding,
            self.buffer_pool.clone(),
            handler,
        ).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("connecting to {} failed: {}", to, e);
                self.connecting.store(false, Ordering::SeqCst);
                return;
            }
        };

        let peer = Arc::new(Peer::new(server, connection.clone()));
        *self.server_peer.lock().expect("peer lock poisoned") = Some(peer.clone());
        self.health_lost.store(0, Ordering::SeqCst);

        // the read loop may already have torn the connection down (the server rejects
        // duplicate addresses by disconnecting at once), and close() may have raced with
        // the attempt; either way the stored peer must not outlive the connection
        if connection.is_disconnected() || self.udp().is_none() {
            debug!("connection to {} died during the attempt", to);
            connection.disconnect();
            self.clear_server_peer(&connection);
            self.connecting.store(false, Ordering::SeqCst);
            return;
        }

        // handshake: the login frame announces this client's display name
        if !self.send_login(&peer).await {
            warn!("sending login to {} failed", to);
            connection.disconnect();
            self.clear_server_peer(&connection);
            self.connecting.store(false, Ordering::SeqCst);
            return;
        }
        self.connecting.store(false, Ordering::SeqCst);
        info!("connected to server {}", to);

        let handler = self.on_connected.lock().expect("handler lock poisoned").clone();
        if let Some(handler) = handler {
            let peer = peer.clone();
            self.executor.run(Box::new(move || handler(peer)));
        }

        tokio::spawn(heartbeat::client_heartbeat_loop(
            self.config.clone(),
            connection,
            self.health_lost.clone(),
        ));
    }

    async fn send_login(&self, peer: &Arc<Peer>) -> bool {
        let Some(channel) = self.channels.get(self.config.reserved_channels.login) else {
            return false;
        };
        let name = self.display_name.lock().expect("name lock poisoned").clone();

        match build_frame(self.config.channel_id_encoding, channel.as_ref(), &name) {
            Ok(frame) => peer.connection().send(&frame).await.is_ok(),
            Err(e) => {
                warn!("failed to encode login: {}", e);
                false
            }
        }
    }

    fn on_beacon(&self, from: IpAddr, payload: &[u8]) {
        if !self.accept_beacon.load(Ordering::SeqCst) {
            return;
        }
        if self.server_peer().is_some() || self.connecting.load(Ordering::SeqCst) {
            return;
        }

        let announcement = match parse_beacon(payload) {
            Ok(announcement) => announcement,
            Err(e) => {
                debug!("malformed beacon from {}: {}", from, e);
                return;
            }
        };

        let accept = self.beacon_accept.lock().expect("beacon lock poisoned").clone();
        if !accept(&announcement) {
            debug!("beacon from {} rejected: {:?}", from, announcement);
            return;
        }

        if self.connecting.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("beacon from {} accepted, connecting", from);
        if let Some(core) = self.me.upgrade() {
            tokio::spawn(async move {
                core.run_connect(from).await;
            });
        }
    }

    /// The shared dispatch path for both transports. The client trusts exactly one remote;
    ///  verified frames must come from the connected server's address.
    async fn dispatch_frame(&self, from: IpAddr, channel_id: ChannelId, payload: &[u8], from_stream: bool) {
        let reserved = &self.config.reserved_channels;

        if channel_id == reserved.beacon {
            if !from_stream {
                self.on_beacon(from, payload);
            }
            return;
        }

        let Some(channel) = self.channels.get(channel_id) else {
            return;
        };

        let verified = from_stream || channel.check_mode() == CheckMode::Verified;
        let result = if verified {
            match self.server_peer() {
                Some(peer) if peer.addr() == from => {
                    channel.dispatch(Some(peer), payload, self.executor.as_ref())
                }
                _ => {
                    debug!("dropping frame on {:?} from unexpected sender {}", channel_id, from);
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
impl DatagramHandler for ClientCore {
    async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
        let mut remaining = buf;
        loop {
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
impl StreamHandler for ClientCore {
    async fn on_connected(&self, _connection: Arc<TcpConnection>) {
        // the peer is created by the connect path, which also owns the callback
    }

    async fn on_disconnected(&self, connection: Arc<TcpConnection>) {
        let removed = self.clear_server_peer(&connection);

        if let Some(peer) = removed {
            info!("disconnected from server {:?}", peer);
            let handler = self.on_disconnected.lock().expect("handler lock poisoned").clone();
            if let Some(handler) = handler {
                self.executor.run(Box::new(move || handler(peer)));
            }
        }
    }

    async fn on_frame(&self, connection: Arc<TcpConnection>, channel_id: ChannelId, payload: &[u8]) {
        self.dispatch_frame(connection.peer_ip(), channel_id, payload, true).await;
    }
}
