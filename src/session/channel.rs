use std::any::Any;
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};

use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::session::peer::Peer;
use crate::session::CallbackExecutor;
use crate::util::buf::{put_byte_array, try_get_byte_array};
use crate::wire::codec::Codec;
use crate::wire::compress::{Compression, Compressor, Lz4Compressor};
use crate::wire::frame::ChannelId;


/// Delivery guarantee class, deciding which transport a channel's traffic takes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Qos {
    /// ordered and lossless, stream-backed
    Reliable = 0,
    /// best effort, datagram-backed; messages may be lost or reordered
    Unreliable = 1,
}

/// Whether inbound traffic on a channel must originate from a registered peer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CheckMode {
    /// frames from unknown senders are dropped before dispatch
    Verified = 0,
    /// dispatched with no peer identity attached, accepted from anyone
    Unchecked = 1,
}


/// The non-generic face of a registered channel. Type erasure stays behind this trait and
///  inside the registry: callers hand in `&dyn Any` for sending and raw payload bytes for
///  dispatch, and never see the erased form themselves.
pub trait Channel: Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    fn qos(&self) -> Qos;

    fn check_mode(&self) -> CheckMode;

    /// Encodes a typed value into payload bytes, applying the channel's compression. Fails
    ///  if the value's type does not match the channel's registered type.
    fn encode_value(&self, value: &dyn Any, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Decodes the payload and hands the typed value to the channel's receive callback via
    ///  the executor. The payload buffer is not retained past this call.
    fn dispatch(
        &self,
        peer: Option<Arc<Peer>>,
        payload: &[u8],
        executor: &dyn CallbackExecutor,
    ) -> anyhow::Result<()>;
}


pub type ReceivedHandler<T> = Arc<dyn Fn(Option<Arc<Peer>>, T) + Send + Sync>;

/// A typed channel: id, QoS class, compression mode, check mode, codec and receive callback,
///  all bound at registration time and immutable for the session's open lifetime.
pub struct DataChannel<T: Send + 'static> {
    id: ChannelId,
    qos: Qos,
    compression: Compression,
    check_mode: CheckMode,
    codec: Arc<dyn Codec<T>>,
    compressor: Arc<dyn Compressor>,
    on_received: ReceivedHandler<T>,
}

impl<T: Send + 'static> DataChannel<T> {
    pub fn new(
        id: ChannelId,
        qos: Qos,
        compression: Compression,
        codec: impl Codec<T>,
        on_received: impl Fn(Option<Arc<Peer>>, T) + Send + Sync + 'static,
    ) -> DataChannel<T> {
        DataChannel {
            id,
            qos,
            compression,
            check_mode: CheckMode::Verified,
            codec: Arc::new(codec),
            compressor: Arc::new(Lz4Compressor),
            on_received: Arc::new(on_received),
        }
    }

    pub fn with_check_mode(mut self, check_mode: CheckMode) -> DataChannel<T> {
        self.check_mode = check_mode;
        self
    }

    /// swap in a different compressor implementation for this channel
    pub fn with_compressor(mut self, compressor: impl Compressor) -> DataChannel<T> {
        self.compressor = Arc::new(compressor);
        self
    }
}

impl<T: Send + 'static> Channel for DataChannel<T> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn qos(&self) -> Qos {
        self.qos
    }

    fn check_mode(&self) -> CheckMode {
        self.check_mode
    }

    fn encode_value(&self, value: &dyn Any, buf: &mut BytesMut) -> anyhow::Result<()> {
        let value = value.downcast_ref::<T>()
            .ok_or_else(|| anyhow::anyhow!("value type does not match channel {:?}", self.id))?;

        match self.compression {
            Compression::None => {
                self.codec.encode(value, buf);
            }
            Compression::Lz4 => {
                let mut raw = BytesMut::with_capacity(self.codec.data_size(value));
                self.codec.encode(value, &mut raw);

                let compressed = self.compressor.compress(&raw)?;
                put_byte_array(buf, &compressed);
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        peer: Option<Arc<Peer>>,
        payload: &[u8],
        executor: &dyn CallbackExecutor,
    ) -> anyhow::Result<()> {
        let mut payload = payload;

        let value = match self.compression {
            Compression::None => self.codec.try_decode(&mut payload)?,
            Compression::Lz4 => {
                let compressed = try_get_byte_array(&mut payload)?;
                let raw = self.compressor.decompress(&compressed)?;
                self.codec.try_decode(&mut raw.as_slice())?
            }
        };

        let handler = self.on_received.clone();
        executor.run(Box::new(move || handler(peer, value)));
        Ok(())
    }
}


/// Maps channel ids to registered channels. Owned by each session endpoint; lookups happen
///  on every inbound frame, registration only during setup.
pub struct ChannelRegistry {
    channels: RwLock<FxHashMap<ChannelId, Arc<dyn Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> ChannelRegistry {
        ChannelRegistry {
            channels: RwLock::new(FxHashMap::default()),
        }
    }

    /// Registering a duplicate id is a hard setup error, not a recoverable condition.
    pub fn register(&self, channel: Arc<dyn Channel>) -> anyhow::Result<()> {
        match self.channels.write().expect("channel registry lock poisoned")
            .entry(channel.id())
        {
            Entry::Occupied(_) => {
                Err(anyhow::anyhow!("a channel with id {:?} is already registered", channel.id()))
            }
            Entry::Vacant(e) => {
                e.insert(channel);
                Ok(())
            }
        }
    }

    pub fn deregister(&self, id: ChannelId) -> anyhow::Result<()> {
        let prev = self.channels.write().expect("channel registry lock poisoned")
            .remove(&id);
        if prev.is_none() {
            return Err(anyhow::anyhow!("deregistering channel {:?} which was not registered", id));
        }
        Ok(())
    }

    /// `None` for an unknown id: the frame is skipped, which keeps a session compatible
    ///  with peers running additional channels.
    pub fn get(&self, id: ChannelId) -> Option<Arc<dyn Channel>> {
        let result = self.channels.read().expect("channel registry lock poisoned")
            .get(&id)
            .cloned();
        if result.is_none() {
            debug!("no channel registered for {:?} - skipping frame", id);
        }
        result
    }
}


#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use rstest::rstest;

    use crate::session::InlineExecutor;
    use crate::wire::codec::{StringCodec, U8Codec};
    use super::*;

    fn recorder_channel(
        id: ChannelId,
        compression: Compression,
    ) -> (DataChannel<String>, Arc<Mutex<Vec<String>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let channel = DataChannel::new(
            id,
            Qos::Reliable,
            compression,
            StringCodec,
            move |_peer, value: String| sink.lock().unwrap().push(value),
        );
        (channel, received)
    }

    #[rstest]
    #[case::uncompressed(Compression::None)]
    #[case::lz4(Compression::Lz4)]
    fn test_encode_dispatch_round_trip(#[case] compression: Compression) {
        let (channel, received) = recorder_channel(ChannelId(9), compression);

        let mut payload = BytesMut::new();
        let value = "payload that is long enough to be worth compressing, ".repeat(4);
        channel.encode_value(&value, &mut payload).unwrap();

        channel.dispatch(None, payload.as_ref(), &InlineExecutor).unwrap();
        assert_eq!(received.lock().unwrap().as_slice(), &[value]);
    }

    #[test]
    fn test_encode_wrong_type_fails() {
        let (channel, _) = recorder_channel(ChannelId(9), Compression::None);

        let mut buf = BytesMut::new();
        assert!(channel.encode_value(&42u32, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_dispatch_malformed_payload_fails() {
        let (channel, received) = recorder_channel(ChannelId(9), Compression::None);

        // varint length prefix claims more bytes than present
        assert!(channel.dispatch(None, &[0x20, b'x'], &InlineExecutor).is_err());
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn test_register_duplicate_id_fails() {
        let registry = ChannelRegistry::new();

        let (first, _) = recorder_channel(ChannelId(1), Compression::None);
        let (second, _) = recorder_channel(ChannelId(1), Compression::None);

        registry.register(Arc::new(first)).unwrap();
        assert!(registry.register(Arc::new(second)).is_err());
    }

    #[test]
    fn test_deregister() {
        let registry = ChannelRegistry::new();
        let channel = DataChannel::new(ChannelId(2), Qos::Unreliable, Compression::None, U8Codec, |_, _| {});

        registry.register(Arc::new(channel)).unwrap();
        assert!(registry.get(ChannelId(2)).is_some());

        registry.deregister(ChannelId(2)).unwrap();
        assert!(registry.get(ChannelId(2)).is_none());
        assert!(registry.deregister(ChannelId(2)).is_err());
    }
}
