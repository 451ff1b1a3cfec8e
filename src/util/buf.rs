use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        anyhow::bail!("string length {} exceeds remaining buffer", len);
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(String::from_utf8(result)?)
}

pub fn put_byte_array(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_byte_array(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        anyhow::bail!("byte array length {} exceeds remaining buffer", len);
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

/// number of bytes a value occupies in varint encoding
pub fn varint_len(value: u64) -> usize {
    let mut n = value;
    let mut len = 1;
    while n >= 0x80 {
        n >>= 7;
        len += 1;
    }
    len
}
