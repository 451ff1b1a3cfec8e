use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::time::interval;
use tracing::{debug, trace};

use crate::session::config::SessionConfig;
use crate::transport::udp::UdpTransport;
use crate::util::buf::{put_string, try_get_string};
use crate::wire::frame::{write_frame, ChannelId, ChannelIdEncoding};


/// Builds one announcement frame: reserved beacon channel id, payload = the announcement
///  string. Sent unreliably; clients that are not connected may pick it up and initiate a
///  connection to the sender.
pub fn build_beacon(
    encoding: ChannelIdEncoding,
    beacon_id: ChannelId,
    announcement: &str,
) -> anyhow::Result<BytesMut> {
    let mut payload = BytesMut::new();
    put_string(&mut payload, announcement);

    let mut frame = BytesMut::with_capacity(payload.len() + 5);
    write_frame(&mut frame, encoding, beacon_id, &payload)?;
    Ok(frame)
}

pub fn parse_beacon(payload: &[u8]) -> anyhow::Result<String> {
    let mut payload = payload;
    try_get_string(&mut payload)
}


pub type AnnouncementFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Server-side discovery: a list of explicit broadcast destinations and an interval task
///  that announces to all of them while started. There is no subnet scanning; destinations
///  are managed by the application.
pub struct BeaconBroadcaster {
    targets: Mutex<Vec<IpAddr>>,
    announcement: Mutex<AnnouncementFn>,
    running: AtomicBool,
}

impl BeaconBroadcaster {
    pub fn new() -> BeaconBroadcaster {
        BeaconBroadcaster {
            targets: Mutex::new(Vec::new()),
            announcement: Mutex::new(Arc::new(|| "muxlink".to_string())),
            running: AtomicBool::new(false),
        }
    }

    pub fn add_target(&self, addr: IpAddr) {
        self.targets.lock().expect("beacon target lock poisoned")
            .push(addr);
    }

    pub fn remove_target(&self, addr: IpAddr) {
        self.targets.lock().expect("beacon target lock poisoned")
            .retain(|t| *t != addr);
    }

    pub fn set_announcement(&self, f: impl Fn() -> String + Send + Sync + 'static) {
        *self.announcement.lock().expect("beacon announcement lock poisoned") = Arc::new(f);
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn current_announcement(&self) -> String {
        let f = self.announcement.lock().expect("beacon announcement lock poisoned").clone();
        f()
    }

    /// One-shot directed announcement, independent of the interval timer.
    pub async fn send_connect_beacon(
        &self,
        udp: &UdpTransport,
        config: &SessionConfig,
        to: IpAddr,
    ) -> anyhow::Result<()> {
        let frame = build_beacon(
            config.channel_id_encoding,
            config.reserved_channels.beacon,
            &self.current_announcement(),
        )?;
        udp.send_to(SocketAddr::new(to, config.send_port), &frame).await;
        Ok(())
    }

    /// The announcement task, spawned while the server session is open. Ticks continuously;
    ///  whether anything is sent on a tick is governed by [BeaconBroadcaster::start]/
    ///  [BeaconBroadcaster::stop] and the target list.
    pub async fn announce_loop(&self, udp: Arc<UdpTransport>, config: Arc<SessionConfig>) {
        let mut timer = interval(config.beacon_interval);
        loop {
            timer.tick().await;

            if !self.is_running() {
                continue;
            }
            let targets = self.targets.lock().expect("beacon target lock poisoned").clone();
            if targets.is_empty() {
                continue;
            }

            let frame = match build_beacon(
                config.channel_id_encoding,
                config.reserved_channels.beacon,
                &self.current_announcement(),
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("failed to build beacon frame: {}", e);
                    continue;
                }
            };

            trace!("announcing to {} beacon targets", targets.len());
            for target in targets {
                udp.send_to(SocketAddr::new(target, config.send_port), &frame).await;
            }
        }
    }
}
