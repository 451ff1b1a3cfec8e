use bytes::{BufMut, BytesMut};

use crate::util::buf::{put_byte_array, put_string, try_get_byte_array, try_get_string, varint_len};


/// A typed value serializer bound to a channel at registration time. The wire layer treats
///  the encoding as opaque: it only needs to turn a value into bytes and back, and to know
///  the encoded size up front so buffers can be dimensioned without re-encoding.
pub trait Codec<T>: Send + Sync + 'static {
    fn data_size(&self, value: &T) -> usize;

    fn encode(&self, value: &T, buf: &mut BytesMut);

    fn try_decode(&self, buf: &mut &[u8]) -> anyhow::Result<T>;
}


/// varint length prefix followed by UTF-8 bytes
pub struct StringCodec;
impl Codec<String> for StringCodec {
    fn data_size(&self, value: &String) -> usize {
        varint_len(value.len() as u64) + value.len()
    }

    fn encode(&self, value: &String, buf: &mut BytesMut) {
        put_string(buf, value);
    }

    fn try_decode(&self, buf: &mut &[u8]) -> anyhow::Result<String> {
        try_get_string(buf)
    }
}


/// varint length prefix followed by the raw bytes
pub struct BytesCodec;
impl Codec<Vec<u8>> for BytesCodec {
    fn data_size(&self, value: &Vec<u8>) -> usize {
        varint_len(value.len() as u64) + value.len()
    }

    fn encode(&self, value: &Vec<u8>, buf: &mut BytesMut) {
        put_byte_array(buf, value);
    }

    fn try_decode(&self, buf: &mut &[u8]) -> anyhow::Result<Vec<u8>> {
        try_get_byte_array(buf)
    }
}


/// single byte, used by the liveness probe payload
pub struct U8Codec;
impl Codec<u8> for U8Codec {
    fn data_size(&self, _value: &u8) -> usize {
        1
    }

    fn encode(&self, value: &u8, buf: &mut BytesMut) {
        buf.put_u8(*value);
    }

    fn try_decode(&self, buf: &mut &[u8]) -> anyhow::Result<u8> {
        if buf.is_empty() {
            anyhow::bail!("buffer underflow decoding u8");
        }
        let value = buf[0];
        *buf = &buf[1..];
        Ok(value)
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("".to_string())]
    #[case::hello("hello".to_string())]
    fn test_string_codec(#[case] value: String) {
        let codec = StringCodec;
        let mut buf = BytesMut::new();
        codec.encode(&value, &mut buf);
        assert_eq!(buf.len(), codec.data_size(&value));

        let mut r: &[u8] = buf.as_ref();
        assert_eq!(codec.try_decode(&mut r).unwrap(), value);
        assert!(r.is_empty());
    }

    #[test]
    fn test_bytes_codec() {
        let codec = BytesCodec;
        let value = vec![1u8, 2, 3, 4];
        let mut buf = BytesMut::new();
        codec.encode(&value, &mut buf);
        assert_eq!(buf.len(), codec.data_size(&value));

        let mut r: &[u8] = buf.as_ref();
        assert_eq!(codec.try_decode(&mut r).unwrap(), value);
    }

    #[test]
    fn test_u8_codec() {
        let codec = U8Codec;
        let mut buf = BytesMut::new();
        codec.encode(&7, &mut buf);
        assert_eq!(buf.as_ref(), &[7]);

        let mut r: &[u8] = buf.as_ref();
        assert_eq!(codec.try_decode(&mut r).unwrap(), 7);
        assert!(codec.try_decode(&mut r).is_err());
    }
}
