pub mod buffer_pool;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(test)] use mockall::automock;

use crate::transport::tcp::TcpConnection;
use crate::wire::frame::ChannelId;


/// Decouples the datagram receive loop from what happens to a received datagram. The buffer
///  is only valid for the duration of the call; the handler must not retain it.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, from: SocketAddr, buf: &[u8]);
}


/// Callbacks from the stream transport: connection lifecycle plus one call per complete
///  inbound frame. `on_frame`'s payload buffer is drawn from the connection's buffer pool
///  and is reused for the next read as soon as the call returns.
#[async_trait::async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn on_connected(&self, connection: Arc<TcpConnection>);

    async fn on_disconnected(&self, connection: Arc<TcpConnection>);

    async fn on_frame(&self, connection: Arc<TcpConnection>, channel_id: ChannelId, payload: &[u8]);
}
