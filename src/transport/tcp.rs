use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::transport::buffer_pool::BufferPool;
use crate::transport::StreamHandler;
use crate::wire::frame::{ChannelId, ChannelIdEncoding};


/// One established, reliable, ordered connection. Frames written through [TcpConnection::send]
///  arrive at the peer complete and in order for as long as the connection is open.
///
/// The receive side runs as a separate task (see [run_read_loop]); this struct only carries
///  what both sides share: the write half, the peer's address, and the shutdown signal.
pub struct TcpConnection {
    peer_addr: SocketAddr,
    write_half: Mutex<OwnedWriteHalf>,
    shutdown: Notify,
    disconnected: AtomicBool,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> anyhow::Result<(Arc<TcpConnection>, OwnedReadHalf)> {
        // small frames, latency matters more than throughput
        stream.set_nodelay(true)?;

        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let connection = Arc::new(TcpConnection {
            peer_addr,
            write_half: Mutex::new(write_half),
            shutdown: Notify::new(),
            disconnected: AtomicBool::new(false),
        });
        Ok((connection, read_half))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Writes one complete, pre-framed message. Serialized per connection, so concurrent
    ///  senders cannot interleave partial frames.
    pub async fn send(&self, frame: &[u8]) -> anyhow::Result<()> {
        if self.is_disconnected() {
            anyhow::bail!("connection to {} is closed", self.peer_addr);
        }
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(frame).await?;
        Ok(())
    }

    /// Idempotent, non-blocking, safe to call from any context including a disconnect
    ///  callback. Unblocks an in-flight read promptly; the read loop performs the actual
    ///  teardown and fires `on_disconnected` exactly once.
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
    }
}


/// Drives one connection's receive side until the peer closes, a read fails, or
///  [TcpConnection::disconnect] is called. Fires `on_disconnected` exactly once, whichever
///  way the loop ends.
pub(crate) async fn run_read_loop(
    connection: Arc<TcpConnection>,
    mut read_half: OwnedReadHalf,
    encoding: ChannelIdEncoding,
    buffer_pool: Arc<BufferPool>,
    handler: Arc<dyn StreamHandler>,
) {
    let result = select! {
        _ = connection.shutdown.notified() => Ok(()),
        result = read_frames(&connection, &mut read_half, encoding, &buffer_pool, &handler) => result,
    };

    if let Err(e) = result {
        debug!("connection to {} broke: {}", connection.peer_addr, e);
    }

    if !connection.disconnected.swap(true, Ordering::SeqCst) {
        // send FIN so the remote read loop sees a clean close
        let _ = connection.write_half.lock().await.shutdown().await;
        handler.on_disconnected(connection.clone()).await;
    }
}

async fn read_frames(
    connection: &Arc<TcpConnection>,
    read_half: &mut OwnedReadHalf,
    encoding: ChannelIdEncoding,
    buffer_pool: &Arc<BufferPool>,
    handler: &Arc<dyn StreamHandler>,
) -> anyhow::Result<()> {
    loop {
        let payload_len = match try_read_len_prefix(read_half).await? {
            Some(len) => len as usize,
            None => {
                debug!("peer {} closed the connection", connection.peer_addr);
                return Ok(());
            }
        };
        let channel_id = read_channel_id(read_half, encoding).await?;

        if payload_len > buffer_pool.buf_size() {
            // the limit is per-endpoint config, a mismatched peer must not cost the
            // whole connection: drain the payload and stay in sync for the next frame
            warn!("skipping frame of {} bytes on {:?}, exceeds the receive buffer size", payload_len, channel_id);
            drain(read_half, payload_len, buffer_pool).await?;
            continue;
        }

        let mut buf = buffer_pool.check_out();
        buf.resize(payload_len, 0);
        read_half.read_exact(&mut buf[..]).await?;

        handler.on_frame(connection.clone(), channel_id, &buf[..]).await;
        // `buf` goes back to the pool here, not before the handler is done with it
    }
}

/// Reads and discards `len` payload bytes of a frame too large for the buffer pool.
async fn drain(
    read_half: &mut OwnedReadHalf,
    len: usize,
    buffer_pool: &Arc<BufferPool>,
) -> anyhow::Result<()> {
    let mut buf = buffer_pool.check_out();
    buf.resize(buffer_pool.buf_size(), 0);

    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(buf.len());
        read_half.read_exact(&mut buf[..chunk]).await?;
        remaining -= chunk;
    }
    Ok(())
}

/// Reads the 2-byte length prefix; a clean EOF at a frame boundary is a normal close and
///  reported as `None`.
async fn try_read_len_prefix(read_half: &mut OwnedReadHalf) -> anyhow::Result<Option<u16>> {
    let mut len_buf = [0u8; 2];
    match read_half.read_exact(&mut len_buf).await {
        Ok(_) => Ok(Some(u16::from_be_bytes(len_buf))),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_channel_id(
    read_half: &mut OwnedReadHalf,
    encoding: ChannelIdEncoding,
) -> anyhow::Result<ChannelId> {
    match encoding {
        ChannelIdEncoding::Fixed => {
            let mut id_buf = [0u8; 2];
            read_half.read_exact(&mut id_buf).await?;
            Ok(ChannelId(u16::from_be_bytes(id_buf)))
        }
        ChannelIdEncoding::Varint => {
            let mut raw: u32 = 0;
            let mut shift = 0;
            loop {
                let byte = read_half.read_u8().await?;
                raw |= ((byte & 0x7f) as u32) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
                if shift > 14 {
                    anyhow::bail!("malformed varint channel id");
                }
            }
            if raw > u16::MAX as u32 {
                anyhow::bail!("varint channel id {} out of range", raw);
            }
            Ok(ChannelId(raw as u16))
        }
    }
}


/// Server side of the stream transport: accepts connections indefinitely, spawning one read
///  loop task per accepted connection.
pub struct TcpServerTransport {
    listener: TcpListener,
    shutdown: Notify,
}

impl TcpServerTransport {
    pub async fn bind(listen_port: u16) -> anyhow::Result<TcpServerTransport> {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port);
        Ok(TcpServerTransport {
            listener: TcpListener::bind(bind_addr).await?,
            shutdown: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept_loop(
        &self,
        encoding: ChannelIdEncoding,
        buffer_pool: Arc<BufferPool>,
        handler: Arc<dyn StreamHandler>,
    ) -> anyhow::Result<()> {
        loop {
            select! {
                _ = self.shutdown.notified() => {
                    info!("shutting down accept loop");
                    return Ok(());
                }
                result = self.listener.accept() => {
                    let (stream, addr) = result?;
                    debug!("accepted connection from {}", addr);

                    match TcpConnection::new(stream) {
                        Ok((connection, read_half)) => {
                            handler.on_connected(connection.clone()).await;
                            tokio::spawn(run_read_loop(
                                connection,
                                read_half,
                                encoding,
                                buffer_pool.clone(),
                                handler.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!("failed to set up connection from {}: {}", addr, e);
                        }
                    }
                }
            }
        }
    }

    pub fn cancel(&self) {
        self.shutdown.notify_one();
    }
}


/// Client side: one outbound connection. The returned handle is live, its read loop already
///  running; a failed connect is reported to the caller, who may retry.
pub async fn connect(
    to: SocketAddr,
    encoding: ChannelIdEncoding,
    buffer_pool: Arc<BufferPool>,
    handler: Arc<dyn StreamHandler>,
) -> anyhow::Result<Arc<TcpConnection>> {
    let stream = TcpStream::connect(to).await?;
    let (connection, read_half) = TcpConnection::new(stream)?;

    tokio::spawn(run_read_loop(
        connection.clone(),
        read_half,
        encoding,
        buffer_pool,
        handler,
    ));
    Ok(connection)
}


#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::sync::mpsc;

    use crate::wire::frame::write_frame;
    use super::*;

    #[derive(Debug)]
    enum Event {
        Connected(SocketAddr),
        Disconnected(SocketAddr),
        Frame(ChannelId, Vec<u8>),
    }

    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
    }
    #[async_trait::async_trait]
    impl StreamHandler for Recorder {
        async fn on_connected(&self, connection: Arc<TcpConnection>) {
            let _ = self.events.send(Event::Connected(connection.peer_addr()));
        }
        async fn on_disconnected(&self, connection: Arc<TcpConnection>) {
            let _ = self.events.send(Event::Disconnected(connection.peer_addr()));
        }
        async fn on_frame(&self, _connection: Arc<TcpConnection>, channel_id: ChannelId, payload: &[u8]) {
            let _ = self.events.send(Event::Frame(channel_id, payload.to_vec()));
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), events.recv()).await
            .expect("timeout waiting for event")
            .expect("event stream ended")
    }

    fn frame(channel_id: ChannelId, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, ChannelIdEncoding::Fixed, channel_id, payload).unwrap();
        buf
    }

    struct Fixture {
        server: Arc<TcpServerTransport>,
        server_events: mpsc::UnboundedReceiver<Event>,
        client_events: mpsc::UnboundedReceiver<Event>,
        client_conn: Arc<TcpConnection>,
        accept_task: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    async fn connected_fixture() -> Fixture {
        connected_fixture_with_buf_size(1024).await
    }

    async fn connected_fixture_with_buf_size(buf_size: usize) -> Fixture {
        let pool = BufferPool::new(buf_size, 4);

        let server = Arc::new(TcpServerTransport::bind(0).await.unwrap());
        let server_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            server.local_addr().unwrap().port(),
        );

        let (server_tx, server_events) = mpsc::unbounded_channel();
        let accept_server = server.clone();
        let accept_pool = pool.clone();
        let accept_task = tokio::spawn(async move {
            accept_server.accept_loop(
                ChannelIdEncoding::Fixed,
                accept_pool,
                Arc::new(Recorder { events: server_tx }),
            ).await
        });

        let (client_tx, client_events) = mpsc::unbounded_channel();
        let client_conn = connect(
            server_addr,
            ChannelIdEncoding::Fixed,
            pool,
            Arc::new(Recorder { events: client_tx }),
        ).await.unwrap();

        Fixture { server, server_events, client_events, client_conn, accept_task }
    }

    #[tokio::test]
    async fn test_connect_send_frames_both_ways() {
        let mut fixture = connected_fixture().await;

        let Event::Connected(_) = next_event(&mut fixture.server_events).await else {
            panic!("expected connected event");
        };

        fixture.client_conn.send(&frame(ChannelId(3), b"to server")).await.unwrap();
        match next_event(&mut fixture.server_events).await {
            Event::Frame(channel_id, payload) => {
                assert_eq!(channel_id, ChannelId(3));
                assert_eq!(payload, b"to server");
            }
            other => panic!("expected frame event, got {:?}", other),
        }

        fixture.server.cancel();
        let _ = fixture.accept_task.await;
    }

    #[tokio::test]
    async fn test_concatenated_frames_dispatch_in_order() {
        let mut fixture = connected_fixture().await;
        let _ = next_event(&mut fixture.server_events).await;

        let mut buf = frame(ChannelId(1), b"first");
        buf.extend_from_slice(&frame(ChannelId(2), b"second"));
        fixture.client_conn.send(&buf).await.unwrap();

        match next_event(&mut fixture.server_events).await {
            Event::Frame(channel_id, payload) => {
                assert_eq!((channel_id, payload.as_slice()), (ChannelId(1), b"first" as &[u8]));
            }
            other => panic!("expected frame event, got {:?}", other),
        }
        match next_event(&mut fixture.server_events).await {
            Event::Frame(channel_id, payload) => {
                assert_eq!((channel_id, payload.as_slice()), (ChannelId(2), b"second" as &[u8]));
            }
            other => panic!("expected frame event, got {:?}", other),
        }

        fixture.server.cancel();
        let _ = fixture.accept_task.await;
    }

    #[tokio::test]
    async fn test_oversized_frame_skipped_connection_survives() {
        let mut fixture = connected_fixture_with_buf_size(64).await;
        let _ = next_event(&mut fixture.server_events).await;

        // payload larger than the receiver's buffer size, followed by a regular frame
        let mut buf = frame(ChannelId(1), &[7u8; 200]);
        buf.extend_from_slice(&frame(ChannelId(2), b"still here"));
        fixture.client_conn.send(&buf).await.unwrap();

        match next_event(&mut fixture.server_events).await {
            Event::Frame(channel_id, payload) => {
                assert_eq!(channel_id, ChannelId(2));
                assert_eq!(payload, b"still here");
            }
            other => panic!("expected frame event, got {:?}", other),
        }
        assert!(!fixture.client_conn.is_disconnected());

        fixture.server.cancel();
        let _ = fixture.accept_task.await;
    }

    #[tokio::test]
    async fn test_local_disconnect_fires_both_sides_once() {
        let mut fixture = connected_fixture().await;
        let _ = next_event(&mut fixture.server_events).await;

        fixture.client_conn.disconnect();
        fixture.client_conn.disconnect(); // idempotent

        match next_event(&mut fixture.client_events).await {
            Event::Disconnected(_) => {}
            other => panic!("expected disconnected event, got {:?}", other),
        }
        match next_event(&mut fixture.server_events).await {
            Event::Disconnected(_) => {}
            other => panic!("expected disconnected event, got {:?}", other),
        }

        assert!(fixture.client_conn.is_disconnected());
        assert!(fixture.client_conn.send(&frame(ChannelId(1), b"late")).await.is_err());

        // no second disconnect event on either side
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fixture.client_events.try_recv().is_err());
        assert!(fixture.server_events.try_recv().is_err());

        fixture.server.cancel();
        let _ = fixture.accept_task.await;
    }
}
