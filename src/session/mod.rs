pub mod beacon;
pub mod channel;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod peer;
pub mod server;

use std::sync::Arc;

use crate::session::peer::Peer;


/// How application callbacks are invoked. The session engine never calls a handler
///  directly; it goes through this capability, so a host that needs callbacks on a
///  particular thread (a render loop, say) can inject an executor that posts them there.
pub trait CallbackExecutor: Send + Sync + 'static {
    fn run(&self, task: Box<dyn FnOnce() + Send>);
}

/// Default executor: runs the callback inline on the receiving task.
pub struct InlineExecutor;
impl CallbackExecutor for InlineExecutor {
    fn run(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}


/// connected / disconnected notification for session engines
pub type ConnectionHandler = Arc<dyn Fn(Arc<Peer>) + Send + Sync>;


/// Encodes a typed value through its channel and wraps it in a complete wire frame, ready
///  for either transport.
pub(crate) fn build_frame(
    encoding: crate::wire::frame::ChannelIdEncoding,
    channel: &dyn channel::Channel,
    value: &dyn std::any::Any,
) -> anyhow::Result<bytes::BytesMut> {
    let mut payload = bytes::BytesMut::new();
    channel.encode_value(value, &mut payload)?;

    let mut frame = bytes::BytesMut::with_capacity(payload.len() + 5);
    crate::wire::frame::write_frame(&mut frame, encoding, channel.id(), &payload)?;
    Ok(frame)
}
