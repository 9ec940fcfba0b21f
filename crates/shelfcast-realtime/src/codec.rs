//! Newline framing for the stream transport.
//!
//! Works on raw bytes so that a line which is not UTF-8, or one longer than
//! the configured cap, is surfaced as an item instead of a decoder error.
//! `FramedRead` stops at the first error, and a bad line must not end the
//! connection.

use bytes::{Buf, BytesMut};
use shelfcast_types::{StreamFrame, MAX_LINE_SIZE};
use tokio_util::codec::Decoder;

/// Newline-delimited decoder yielding [`StreamFrame`]s.
#[derive(Debug, Clone)]
pub(crate) struct LineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline.
    next_index: usize,
    /// Skipping the rest of an over-long line.
    discarding: bool,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_SIZE)
    }
}

impl LineCodec {
    pub(crate) fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Decoder for LineCodec {
    type Item = StreamFrame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<StreamFrame>, Self::Error> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');

            if self.discarding {
                match newline {
                    Some(offset) => {
                        buf.advance(self.next_index + offset + 1);
                        self.next_index = 0;
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        buf.clear();
                        self.next_index = 0;
                        return Ok(None);
                    }
                }
            }

            return match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    if end > self.max_length {
                        return Ok(Some(overlong(self.max_length)));
                    }
                    Ok(Some(StreamFrame::decode(&line[..end])))
                }
                None if buf.len() > self.max_length => {
                    buf.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    Ok(Some(overlong(self.max_length)))
                }
                None => {
                    self.next_index = buf.len();
                    Ok(None)
                }
            };
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<StreamFrame>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if buf.is_empty() || self.discarding {
            buf.clear();
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(StreamFrame::decode(&line)))
    }
}

fn overlong(max_length: usize) -> StreamFrame {
    StreamFrame::Malformed(format!("line exceeds {max_length} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_splits_lines_across_reads() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"PI"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"NG\r\nPONG\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![StreamFrame::Ping, StreamFrame::Pong]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_malformed_and_stream_continues() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"\xff\xfe\nPING\n"[..]);

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], StreamFrame::Malformed(_)));
        assert_eq!(frames[1], StreamFrame::Ping);
    }

    #[test]
    fn test_overlong_line_is_reported_once_then_resyncs() {
        let mut codec = LineCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(StreamFrame::Malformed(_))
        ));
        assert!(buf.is_empty());

        // Still inside the same line: nothing is buffered or reported.
        buf.extend_from_slice(b"abcdefghijklmnop");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"tail\nPING\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec![StreamFrame::Ping]);
    }

    #[test]
    fn test_overlong_line_with_newline_in_one_read() {
        let mut codec = LineCodec::new(4);
        let mut buf = BytesMut::from(&b"PONG\n0123456789\nPING\n"[..]);

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], StreamFrame::Pong);
        assert!(matches!(frames[1], StreamFrame::Malformed(_)));
        assert_eq!(frames[2], StreamFrame::Ping);
    }

    #[test]
    fn test_trailing_line_without_newline_at_eof() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"PING"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(StreamFrame::Ping));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
