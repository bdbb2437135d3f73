// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Null-byte framing for the ingestion stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::LogMessage;
use super::IngestError;

const DELIMITER: u8 = 0;

/// Splits a byte stream on `\0`.
///
/// A frame longer than `max_frame` is reported once and then skipped up to its
/// delimiter; decoding resumes cleanly at the next frame. Empty frames are ignored.
#[derive(Debug)]
pub struct NullFrameCodec {
    max_frame: usize,
    /// Bytes already scanned without finding a delimiter.
    scanned: usize,
    discarding: bool,
}

impl NullFrameCodec {
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame: max_frame.max(1), scanned: 0, discarding: false }
    }
}

impl Decoder for NullFrameCodec {
    type Item = Bytes;
    type Error = IngestError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, IngestError> {
        loop {
            let Some(offset) = buf[self.scanned..].iter().position(|b| *b == DELIMITER) else {
                if self.discarding {
                    buf.clear();
                    self.scanned = 0;
                    return Ok(None);
                }
                if buf.len() > self.max_frame {
                    buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Err(IngestError::FrameTooLarge { max: self.max_frame });
                }
                self.scanned = buf.len();
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            if self.discarding {
                buf.advance(end + 1);
                self.discarding = false;
                continue;
            }
            let frame = buf.split_to(end + 1).freeze().slice(..end);
            if frame.is_empty() {
                continue;
            }
            if frame.len() > self.max_frame {
                return Err(IngestError::FrameTooLarge { max: self.max_frame });
            }
            return Ok(Some(frame));
        }
    }

    /// A trailing frame without delimiter is incomplete and dropped.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, IngestError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                buf.clear();
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<&LogMessage> for NullFrameCodec {
    type Error = IngestError;

    fn encode(&mut self, msg: &LogMessage, dst: &mut BytesMut) -> Result<(), IngestError> {
        let json = serde_json::to_vec(msg).map_err(|e| IngestError::Decode(e.to_string()))?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut NullFrameCodec, buf: &mut BytesMut) -> Vec<Result<Bytes, String>> {
        let mut out = Vec::new();
        loop {
            match codec.decode(buf) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => return out,
                Err(e) => out.push(Err(e.to_string())),
            }
        }
    }

    #[test]
    fn test_splits_on_null() {
        let mut codec = NullFrameCodec::new(1024);
        let mut buf = BytesMut::from(&b"one\0two\0thr"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![Ok(Bytes::from_static(b"one")), Ok(Bytes::from_static(b"two"))]);

        buf.extend_from_slice(b"ee\0");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"three")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_frames_are_skipped() {
        let mut codec = NullFrameCodec::new(1024);
        let mut buf = BytesMut::from(&b"\0\0a\0"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"a")));
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut codec = NullFrameCodec::new(4);
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(IngestError::FrameTooLarge { max: 4 })));

        buf.extend_from_slice(b"ij\0ok\0");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"ok")));
    }

    #[test]
    fn test_oversized_complete_frame_is_rejected() {
        let mut codec = NullFrameCodec::new(4);
        let mut buf = BytesMut::from(&b"toolong\0ok\0"[..]);
        assert!(codec.decode(&mut buf).is_err());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"ok")));
    }

    #[test]
    fn test_partial_frame_dropped_at_eof() {
        let mut codec = NullFrameCodec::new(1024);
        let mut buf = BytesMut::from(&b"done\0partial"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Bytes::from_static(b"done")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_then_decode_message() {
        let mut codec = NullFrameCodec::new(1 << 20);
        let msg = LogMessage::new("hello", 6, "token", 0, false);
        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&0));

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let decoded: LogMessage = serde_json::from_slice(&frame).unwrap();
        assert_eq!(decoded.text(), "hello");
    }
}
