use num_enum::{IntoPrimitive, TryFromPrimitive};


/// Per-channel payload compression mode. Both ends of a deployment must configure the same
///  mode for a given channel id.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}


/// Opaque compression capability: a compressed channel's payload is the compressor's output,
///  wrapped in a varint length-prefixed byte array on the wire.
pub trait Compressor: Send + Sync + 'static {
    fn compress(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn decompress(&self, compressed: &[u8]) -> anyhow::Result<Vec<u8>>;
}


/// LZ4 block compression with the uncompressed size prepended, so decompression does not
///  need out-of-band size information.
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(lz4::block::compress(raw, None, true)?)
    }

    fn decompress(&self, compressed: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(lz4::block::decompress(compressed, None)?)
    }
}
