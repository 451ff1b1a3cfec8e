use std::time::Duration;

use crate::wire::frame::{ChannelId, ChannelIdEncoding};


/// Ids of the session-internal channels. These are deployment constants: all peers of one
///  deployment must use the same values, and application channels must not collide with them.
///  The defaults sit at the top of the id range to keep the low ids free for applications.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReservedChannelIds {
    /// reliable; carries the peer's display name, completes the session handshake
    pub login: ChannelId,
    /// liveness probes; payload is a single ignored byte
    pub health: ChannelId,
    /// discovery announcements; a wire-level marker, never a registered channel
    pub beacon: ChannelId,
}

impl Default for ReservedChannelIds {
    fn default() -> Self {
        ReservedChannelIds {
            login: ChannelId(0xFFFF),
            health: ChannelId(0xFFFE),
            beacon: ChannelId(0xFFFD),
        }
    }
}

impl ReservedChannelIds {
    pub fn is_reserved(&self, id: ChannelId) -> bool {
        id == self.login || id == self.health || id == self.beacon
    }
}


/// Configuration for one session endpoint (server or client).
///
/// Ports come in pairs by convention: each side listens on its own `listen_port` (TCP and
///  UDP alike) and addresses the peer at `send_port`. The defaults pair a server at 59901
///  with clients at 59902; a client config must mirror the server's pair.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub listen_port: u16,
    pub send_port: u16,

    /// Size of pooled transport buffers, and with that the per-frame size limit on
    ///  receive. Not negotiated: an inbound frame larger than this is skipped, so a peer
    ///  configured with a bigger limit loses those frames but keeps its connection.
    pub buffer_size: usize,
    pub max_pooled_buffers: usize,

    /// must be identical on both ends of a deployment
    pub channel_id_encoding: ChannelIdEncoding,
    pub reserved_channels: ReservedChannelIds,

    pub heartbeat_interval: Duration,
    /// liveness probes a peer may miss before it is evicted
    pub max_health_lost_count: u32,

    pub beacon_interval: Duration,
}

impl SessionConfig {
    pub fn server_default() -> SessionConfig {
        SessionConfig {
            listen_port: 59901,
            send_port: 59902,
            buffer_size: 8192,
            max_pooled_buffers: 16,
            channel_id_encoding: ChannelIdEncoding::Varint,
            reserved_channels: ReservedChannelIds::default(),
            heartbeat_interval: Duration::from_millis(500),
            max_health_lost_count: 5,
            beacon_interval: Duration::from_secs(1),
        }
    }

    pub fn client_default() -> SessionConfig {
        SessionConfig {
            listen_port: 59902,
            send_port: 59901,
            ..Self::server_default()
        }
    }
}
