//! Framed codec for multipart envelopes.
//!
//! Uses LengthDelimitedCodec for framing. Each frame body is a part count
//! followed by length-prefixed parts:
//!
//! ```text
//! [parts: u32 BE] ([len: u32 BE][bytes])*
//! ```
//!
//! Works over any AsyncRead/AsyncWrite.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Multipart;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Codec that frames multipart messages with a length prefix.
pub struct MultipartCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Decoder for MultipartCodec {
    type Item = Multipart;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let mut frame = frame.freeze();

        if frame.remaining() < 4 {
            return Err(invalid("frame missing part count"));
        }
        let count = frame.get_u32() as usize;
        // Every part needs at least its 4-byte length prefix.
        let mut parts = Vec::with_capacity(count.min(frame.remaining() / 4));
        for _ in 0..count {
            if frame.remaining() < 4 {
                return Err(invalid("frame truncated before part length"));
            }
            let len = frame.get_u32() as usize;
            if frame.remaining() < len {
                return Err(invalid("part length exceeds frame"));
            }
            parts.push(frame.split_to(len));
        }
        if frame.has_remaining() {
            return Err(invalid("trailing bytes after last part"));
        }

        Ok(Some(Multipart::new(parts)))
    }
}

impl Encoder<Multipart> for MultipartCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Multipart, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let parts = item.into_parts();
        let body_len = 4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
        if body_len > MAX_FRAME_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", body_len),
            ));
        }

        let mut body = BytesMut::with_capacity(body_len);
        body.put_u32(parts.len() as u32);
        for part in &parts {
            body.put_u32(part.len() as u32);
            body.put_slice(part);
        }
        tracing::trace!(parts = parts.len(), frame_size_bytes = body_len, "Encoding frame");
        self.inner.encode(Bytes::from(body), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Multipart {
        Multipart::new(vec![
            Bytes::from_static(b"token"),
            Bytes::from_static(b"pid-7"),
            Bytes::new(),
            Bytes::from_static(b"payload"),
        ])
    }

    #[test]
    fn preserves_parts_including_empty() {
        let mut codec = MultipartCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(sample(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = MultipartCodec::new();
        let mut full = BytesMut::new();
        codec.encode(sample(), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), sample());
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = MultipartCodec::new();
        let mut buf = BytesMut::new();
        let second = Multipart::new(vec![Bytes::from_static(b"only")]);

        codec.encode(sample(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), sample());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn part_length_past_frame_end_is_invalid() {
        let mut body = BytesMut::new();
        body.put_u32(1);
        body.put_u32(100);
        body.put_slice(b"short");

        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(body.freeze(), &mut buf)
            .unwrap();

        let err = MultipartCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn trailing_bytes_are_invalid() {
        let mut body = BytesMut::new();
        body.put_u32(0);
        body.put_slice(b"junk");

        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(body.freeze(), &mut buf)
            .unwrap();

        let err = MultipartCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
