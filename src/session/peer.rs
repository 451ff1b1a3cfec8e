use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;
use tracing::debug;


/// One connected remote endpoint. Created when its reliable connection completes, destroyed
///  when that connection drops or the heartbeat monitor evicts it. The [PeerRegistry] is the
///  sole owner; everything else holds `Arc` references that stay valid across removal.
pub struct Peer {
    addr: IpAddr,
    name: Mutex<String>,
    health_lost_count: AtomicU32,
    connection: Arc<crate::transport::tcp::TcpConnection>,
}

impl Peer {
    pub fn new(addr: IpAddr, connection: Arc<crate::transport::tcp::TcpConnection>) -> Peer {
        Peer {
            addr,
            name: Mutex::new(String::new()),
            health_lost_count: AtomicU32::new(0),
            connection,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn name(&self) -> String {
        self.name.lock().expect("peer name lock poisoned").clone()
    }

    /// set once the login handshake delivers the peer's display name
    pub fn set_name(&self, name: String) {
        *self.name.lock().expect("peer name lock poisoned") = name;
    }

    pub fn connection(&self) -> &Arc<crate::transport::tcp::TcpConnection> {
        &self.connection
    }

    pub fn reset_health(&self) {
        self.health_lost_count.store(0, Ordering::SeqCst);
    }

    /// increments the miss counter and returns the new value
    pub fn bump_health_lost(&self) -> u32 {
        self.health_lost_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn health_lost_count(&self) -> u32 {
        self.health_lost_count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer[{}@{}]", self.name(), self.addr)
    }
}


/// The address -> peer map, shared between accept/disconnect callbacks, the heartbeat task
///  and application send calls. All of those run in independent tasks, so every access goes
///  through the one registry lock; critical sections are short and never block.
///
/// Peers are keyed by IP address only: the unreliable transport's source port is ephemeral,
///  correlating its traffic to a session peer works by address, with ports paired by
///  deployment convention.
pub struct PeerRegistry {
    peers: Mutex<FxHashMap<IpAddr, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        PeerRegistry {
            peers: Mutex::new(FxHashMap::default()),
        }
    }

    /// At most one peer per address: adding a second one for the same address is an error,
    ///  the previous peer must be removed first.
    pub fn add(&self, peer: Arc<Peer>) -> anyhow::Result<()> {
        let mut peers = self.peers.lock().expect("peer registry lock poisoned");
        match peers.entry(peer.addr()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(anyhow::anyhow!("a peer for address {} is already registered", peer.addr()))
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(peer);
                Ok(())
            }
        }
    }

    pub fn remove(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.peers.lock().expect("peer registry lock poisoned")
            .remove(&addr)
    }

    pub fn find(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.peers.lock().expect("peer registry lock poisoned")
            .get(&addr)
            .cloned()
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.peers.lock().expect("peer registry lock poisoned")
            .contains_key(&addr)
    }

    /// snapshot for iteration outside the lock
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().expect("peer registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}


/// A named, ordered collection of peers used for broadcast fan-out. Membership is explicit
///  and non-owning: a member that has left the registry is skipped (and pruned) at fan-out
///  time rather than kept alive.
pub struct PeerGroup {
    name: String,
    members: Mutex<Vec<Weak<Peer>>>,
}

impl PeerGroup {
    pub fn new(name: impl Into<String>) -> PeerGroup {
        PeerGroup {
            name: name.into(),
            members: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, peer: &Arc<Peer>) {
        self.members.lock().expect("peer group lock poisoned")
            .push(Arc::downgrade(peer));
    }

    pub fn remove(&self, addr: IpAddr) {
        self.members.lock().expect("peer group lock poisoned")
            .retain(|member| match member.upgrade() {
                Some(peer) => peer.addr() != addr,
                None => false,
            });
    }

    /// live members, in insertion order; drops members whose peers are gone
    pub fn members(&self) -> Vec<Arc<Peer>> {
        let mut members = self.members.lock().expect("peer group lock poisoned");

        let before = members.len();
        members.retain(|member| member.upgrade().is_some());
        if members.len() != before {
            debug!("pruned {} stale members from group {}", before - members.len(), self.name);
        }

        members.iter()
            .filter_map(|member| member.upgrade())
            .collect()
    }
}


#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use crate::transport::buffer_pool::BufferPool;
    use crate::transport::tcp::{self, TcpServerTransport, TcpConnection};
    use crate::transport::StreamHandler;
    use crate::wire::frame::{ChannelId, ChannelIdEncoding};
    use super::*;

    struct NullHandler;
    #[async_trait::async_trait]
    impl StreamHandler for NullHandler {
        async fn on_connected(&self, _connection: Arc<TcpConnection>) {}
        async fn on_disconnected(&self, _connection: Arc<TcpConnection>) {}
        async fn on_frame(&self, _connection: Arc<TcpConnection>, _channel_id: ChannelId, _payload: &[u8]) {}
    }

    async fn test_peer(unique: u8) -> Arc<Peer> {
        // a real loopback connection so peers carry a live connection handle
        let pool = BufferPool::new(256, 2);
        let listener = Arc::new(TcpServerTransport::bind(0).await.unwrap());
        let port = listener.local_addr().unwrap().port();

        let accept_listener = listener.clone();
        let accept_pool = pool.clone();
        tokio::spawn(async move {
            accept_listener.accept_loop(ChannelIdEncoding::Fixed, accept_pool, Arc::new(NullHandler)).await
        });

        let connection = tcp::connect(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            ChannelIdEncoding::Fixed,
            pool,
            Arc::new(NullHandler),
        ).await.unwrap();

        Arc::new(Peer::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, unique)), connection))
    }

    #[tokio::test]
    async fn test_add_same_address_twice_fails() {
        let registry = PeerRegistry::new();
        let peer = test_peer(1).await;

        registry.add(peer.clone()).unwrap();
        assert!(registry.add(peer.clone()).is_err());

        registry.remove(peer.addr()).unwrap();
        assert!(registry.find(peer.addr()).is_none());

        // after removal the address is free again
        registry.add(peer.clone()).unwrap();
    }

    #[tokio::test]
    async fn test_find_returns_registered_peer() {
        let registry = PeerRegistry::new();
        let peer = test_peer(2).await;
        registry.add(peer.clone()).unwrap();

        let found = registry.find(peer.addr()).unwrap();
        assert_eq!(found.addr(), peer.addr());
        assert!(registry.find(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99))).is_none());
    }

    #[tokio::test]
    async fn test_health_counter() {
        let peer = test_peer(3).await;

        assert_eq!(peer.bump_health_lost(), 1);
        assert_eq!(peer.bump_health_lost(), 2);
        peer.reset_health();
        assert_eq!(peer.health_lost_count(), 0);
    }

    #[tokio::test]
    async fn test_group_skips_removed_peers() {
        let registry = PeerRegistry::new();
        let group = PeerGroup::new("lobby");

        let a = test_peer(4).await;
        let b = test_peer(5).await;
        registry.add(a.clone()).unwrap();
        registry.add(b.clone()).unwrap();
        group.add(&a);
        group.add(&b);
        assert_eq!(group.members().len(), 2);

        let b_addr = b.addr();
        registry.remove(b_addr);
        drop(b);
        assert_eq!(group.members().iter().map(|p| p.addr()).collect::<Vec<_>>(), vec![a.addr()]);

        group.remove(a.addr());
        assert!(group.members().is_empty());
    }
}
