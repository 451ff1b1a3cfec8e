use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::transport::buffer_pool::BufferPool;
use crate::transport::DatagramHandler;


/// Connectionless, best-effort transport: one socket, bound to the session's listen port,
///  used both for inbound datagrams and outbound sends. Delivery and ordering are not
///  guaranteed; peer correlation happens one layer up.
pub struct UdpTransport {
    socket: UdpSocket,
    buffer_pool: Arc<BufferPool>,
    shutdown: Notify,
}

impl UdpTransport {
    pub async fn bind(listen_port: u16, buffer_pool: Arc<BufferPool>) -> anyhow::Result<UdpTransport> {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port);
        Ok(UdpTransport {
            socket: UdpSocket::bind(bind_addr).await?,
            buffer_pool,
            shutdown: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Fire-and-forget: a failed send is logged and dropped, it never surfaces to the caller.
    pub async fn send_to(&self, to: SocketAddr, buf: &[u8]) {
        if let Err(e) = self.socket.send_to(buf, to).await {
            debug!("error sending datagram to {}: {}", to, e);
        }
    }

    /// Runs until [UdpTransport::cancel] is called, handing every inbound datagram to the
    ///  handler. The receive buffer comes from the pool and is reissued for the next receive
    ///  once the handler returns.
    pub async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        loop {
            let mut buf = self.buffer_pool.check_out();
            buf.resize(self.buffer_pool.buf_size(), 0);

            select! {
                _ = self.shutdown.notified() => {
                    info!("shutting down datagram receive loop");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buf[..]) => {
                    let (len, from) = result?;
                    handler.on_datagram(from, &buf[..len]).await;
                }
            }
        }
    }

    pub fn cancel(&self) {
        self.shutdown.notify_one();
    }
}


#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    struct Recorder {
        received: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
        seen: Notify,
    }
    #[async_trait::async_trait]
    impl DatagramHandler for Recorder {
        async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
            self.received.lock().unwrap().push((from, buf.to_vec()));
            self.seen.notify_one();
        }
    }

    #[tokio::test]
    async fn test_send_receive_datagram() {
        let pool = BufferPool::new(1024, 4);
        let receiver = Arc::new(UdpTransport::bind(0, pool.clone()).await.unwrap());
        let sender = UdpTransport::bind(0, pool).await.unwrap();

        let mut to = receiver.local_addr().unwrap();
        to.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let recorder = Arc::new(Recorder {
            received: Mutex::new(Vec::new()),
            seen: Notify::new(),
        });

        let loop_transport = receiver.clone();
        let loop_recorder = recorder.clone();
        let handle = tokio::spawn(async move {
            loop_transport.recv_loop(loop_recorder).await
        });

        sender.send_to(to, b"hello datagram").await;

        tokio::time::timeout(Duration::from_secs(5), recorder.seen.notified()).await.unwrap();
        assert_eq!(recorder.received.lock().unwrap()[0].1, b"hello datagram");

        receiver.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recv_loop_hands_datagram_to_handler() {
        let pool = BufferPool::new(1024, 4);
        let receiver = Arc::new(UdpTransport::bind(0, pool.clone()).await.unwrap());
        let sender = UdpTransport::bind(0, pool).await.unwrap();

        let mut to = receiver.local_addr().unwrap();
        to.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let seen = Arc::new(Notify::new());
        let expected = b"probe".to_vec();
        let mut handler = crate::transport::MockDatagramHandler::new();
        let notify_seen = seen.clone();
        handler.expect_on_datagram()
            .once()
            .withf(move |_, buf| buf == expected.as_slice())
            .returning(move |_, _| notify_seen.notify_one());
        let handler = Arc::new(handler);

        let loop_transport = receiver.clone();
        let loop_handler = handler.clone();
        let handle = tokio::spawn(async move {
            loop_transport.recv_loop(loop_handler).await
        });

        sender.send_to(to, b"probe").await;
        tokio::time::timeout(Duration::from_secs(5), seen.notified()).await.unwrap();

        receiver.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unreachable_is_silent() {
        let pool = BufferPool::new(1024, 4);
        let sender = UdpTransport::bind(0, pool).await.unwrap();

        // no listener on the far side: must neither error nor panic
        sender.send_to("127.0.0.1:9".parse().unwrap(), b"dropped").await;
    }
}
