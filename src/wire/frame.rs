use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;


/// A [ChannelId] is sent in every frame's header to identify the channel for decoding and
///  dispatch on the receiving side.
///
/// Ids are plain u16 values. A deployment assigns them application-wide; a few ids near the
///  top of the range are reserved for session-internal traffic (login, liveness, discovery),
///  see `ReservedChannelIds`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub u16);

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

impl ChannelId {
    pub fn write(&self, buf: &mut BytesMut, encoding: ChannelIdEncoding) {
        match encoding {
            ChannelIdEncoding::Fixed => buf.put_u16(self.0),
            ChannelIdEncoding::Varint => buf.put_u16_varint(self.0),
        }
    }

    pub fn try_read(buf: &mut impl Buf, encoding: ChannelIdEncoding) -> anyhow::Result<ChannelId> {
        let raw = match encoding {
            ChannelIdEncoding::Fixed => buf.try_get_u16()?,
            ChannelIdEncoding::Varint => buf.try_get_u16_varint()?,
        };
        Ok(ChannelId(raw))
    }

    pub fn encoded_len(&self, encoding: ChannelIdEncoding) -> usize {
        match encoding {
            ChannelIdEncoding::Fixed => 2,
            ChannelIdEncoding::Varint => crate::util::buf::varint_len(self.0 as u64),
        }
    }
}


/// How channel ids are encoded on the wire. This is fixed per deployment (both ends must be
///  configured identically), it is not negotiated at runtime.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelIdEncoding {
    /// fixed two bytes, big endian
    Fixed,
    /// varint, one to three bytes for a u16
    Varint,
}


/// One decoded frame header plus a view on its payload bytes. The view borrows from the
///  receive buffer, so it must be consumed before the buffer is reused.
#[derive(Debug, Eq, PartialEq)]
pub struct Frame<'a> {
    pub channel_id: ChannelId,
    pub payload: &'a [u8],
}

pub const FRAME_LEN_PREFIX_SIZE: usize = 2;

/// Appends one frame to `buf`: u16 payload length (big endian), channel id, payload bytes.
///  The length counts the payload only, not the channel id.
pub fn write_frame(
    buf: &mut BytesMut,
    encoding: ChannelIdEncoding,
    channel_id: ChannelId,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > u16::MAX as usize {
        anyhow::bail!("frame payload of {} bytes exceeds the u16 length prefix", payload.len());
    }
    buf.put_u16(payload.len() as u16);
    channel_id.write(buf, encoding);
    buf.put_slice(payload);
    Ok(())
}

/// Consumes the next frame from the front of `buf`, advancing it past the frame. A transport
///  buffer may hold any number of concatenated frames; callers scan by calling this until it
///  returns `None`.
///
/// A length prefix that would read past the end of the buffer is a framing error: the caller
///  is expected to discard the rest of the buffer and carry on with the next one.
pub fn try_next_frame<'a>(
    buf: &mut &'a [u8],
    encoding: ChannelIdEncoding,
) -> anyhow::Result<Option<Frame<'a>>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let payload_len = TryGetFixedSupport::try_get_u16(buf)? as usize;
    let channel_id = ChannelId::try_read(buf, encoding)?;

    if buf.len() < payload_len {
        anyhow::bail!("frame payload length {} overruns buffer ({} bytes left)", payload_len, buf.len());
    }

    let (payload, rest) = buf.split_at(payload_len);
    *buf = rest;
    Ok(Some(Frame { channel_id, payload }))
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::fixed(ChannelIdEncoding::Fixed, ChannelId(5), b"\0\x03\0\x05abc" as &[u8])]
    #[case::fixed_high(ChannelIdEncoding::Fixed, ChannelId(0xFFFE), b"\0\x03\xff\xfeabc" as &[u8])]
    #[case::varint_short(ChannelIdEncoding::Varint, ChannelId(5), b"\0\x03\x05abc" as &[u8])]
    #[case::varint_long(ChannelIdEncoding::Varint, ChannelId(300), b"\0\x03\xac\x02abc" as &[u8])]
    fn test_write_frame(#[case] encoding: ChannelIdEncoding, #[case] channel_id: ChannelId, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, encoding, channel_id, b"abc").unwrap();
        assert_eq!(buf.as_ref(), expected);

        assert_eq!(buf.len(), FRAME_LEN_PREFIX_SIZE + channel_id.encoded_len(encoding) + 3);
    }

    #[rstest]
    #[case::fixed(ChannelIdEncoding::Fixed)]
    #[case::varint(ChannelIdEncoding::Varint)]
    fn test_frame_round_trip(#[case] encoding: ChannelIdEncoding) {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, encoding, ChannelId(7), b"payload").unwrap();

        let mut r: &[u8] = buf.as_ref();
        let frame = try_next_frame(&mut r, encoding).unwrap().unwrap();
        assert_eq!(frame.channel_id, ChannelId(7));
        assert_eq!(frame.payload, b"payload");
        assert!(try_next_frame(&mut r, encoding).unwrap().is_none());
    }

    #[rstest]
    #[case::fixed(ChannelIdEncoding::Fixed)]
    #[case::varint(ChannelIdEncoding::Varint)]
    fn test_concatenated_frames(#[case] encoding: ChannelIdEncoding) {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, encoding, ChannelId(1), b"").unwrap();
        write_frame(&mut buf, encoding, ChannelId(300), b"xy").unwrap();
        write_frame(&mut buf, encoding, ChannelId(3), &[9u8; 500]).unwrap();

        let mut r: &[u8] = buf.as_ref();
        let mut seen = Vec::new();
        while let Some(frame) = try_next_frame(&mut r, encoding).unwrap() {
            seen.push((frame.channel_id, frame.payload.len()));
        }
        assert_eq!(seen, vec![(ChannelId(1), 0), (ChannelId(300), 2), (ChannelId(3), 500)]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_overrun_is_framing_error() {
        // claims 10 payload bytes, delivers 3
        let mut r: &[u8] = b"\0\x0a\0\x01abc";
        assert!(try_next_frame(&mut r, ChannelIdEncoding::Fixed).is_err());
    }

    #[test]
    fn test_truncated_header_is_framing_error() {
        let mut r: &[u8] = b"\0";
        assert!(try_next_frame(&mut r, ChannelIdEncoding::Fixed).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected_on_write() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(write_frame(&mut buf, ChannelIdEncoding::Fixed, ChannelId(1), &payload).is_err());
    }
}
