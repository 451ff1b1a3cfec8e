use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::session::config::SessionConfig;
use crate::session::peer::PeerRegistry;
use crate::transport::tcp::TcpConnection;
use crate::transport::udp::UdpTransport;
use crate::wire::frame::write_frame;


/// One liveness probe: a health frame with a single ignored payload byte.
pub(crate) fn build_health_frame(config: &SessionConfig) -> anyhow::Result<BytesMut> {
    let mut frame = BytesMut::with_capacity(8);
    write_frame(
        &mut frame,
        config.channel_id_encoding,
        config.reserved_channels.health,
        &[0],
    )?;
    Ok(frame)
}

/// The server's liveness monitor, spawned while the session is open. Every interval it
///  probes each registered peer (unreliably, losing a probe just costs one count) and bumps
///  its miss counter; any inbound verified traffic from the peer resets the counter. A peer
///  over the threshold gets its connection dropped, which runs the regular disconnect path:
///  registry removal and the disconnected callback, exactly once.
pub(crate) async fn server_heartbeat_loop(
    config: Arc<SessionConfig>,
    peers: Arc<PeerRegistry>,
    udp: Arc<UdpTransport>,
) {
    let frame = match build_health_frame(&config) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("cannot build health frame, liveness monitoring disabled: {}", e);
            return;
        }
    };

    let mut timer = interval(config.heartbeat_interval);
    loop {
        timer.tick().await;

        let mut evicted = Vec::new();
        for peer in peers.all() {
            udp.send_to(SocketAddr::new(peer.addr(), config.send_port), &frame).await;

            if peer.bump_health_lost() > config.max_health_lost_count {
                evicted.push(peer);
            }
        }

        for peer in evicted {
            warn!("peer {:?} missed more than {} liveness probes - evicting", peer, config.max_health_lost_count);
            peer.connection().disconnect();
        }
    }
}

/// The client's liveness monitor, spawned per established connection and stopping when that
///  connection ends. Probes go over the reliable transport; the counter is reset whenever a
///  health frame from the server arrives.
pub(crate) async fn client_heartbeat_loop(
    config: Arc<SessionConfig>,
    connection: Arc<TcpConnection>,
    health_lost: Arc<AtomicU32>,
) {
    let frame = match build_health_frame(&config) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("cannot build health frame, liveness monitoring disabled: {}", e);
            return;
        }
    };

    let mut timer = interval(config.heartbeat_interval);
    loop {
        timer.tick().await;

        if connection.is_disconnected() {
            debug!("connection closed, stopping liveness monitor");
            return;
        }
        if let Err(e) = connection.send(&frame).await {
            debug!("sending liveness probe failed: {}", e);
            return;
        }

        let missed = health_lost.fetch_add(1, Ordering::SeqCst) + 1;
        if missed > config.max_health_lost_count {
            warn!("server missed more than {} liveness probes - disconnecting", config.max_health_lost_count);
            connection.disconnect();
            return;
        }
    }
}


#[cfg(test)]
mod test {
    use crate::wire::frame::{try_next_frame, ChannelIdEncoding};
    use super::*;

    #[test]
    fn test_health_frame_shape() {
        let config = SessionConfig::server_default();
        let frame = build_health_frame(&config).unwrap();

        let mut r: &[u8] = frame.as_ref();
        let parsed = try_next_frame(&mut r, config.channel_id_encoding).unwrap().unwrap();
        assert_eq!(parsed.channel_id, config.reserved_channels.health);
        assert_eq!(parsed.payload, &[0]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_health_frame_fixed_encoding() {
        let mut config = SessionConfig::server_default();
        config.channel_id_encoding = ChannelIdEncoding::Fixed;

        let frame = build_health_frame(&config).unwrap();
        assert_eq!(frame.as_ref(), b"\0\x01\xff\xfe\0");
    }
}
